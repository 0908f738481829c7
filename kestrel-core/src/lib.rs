//! Kestrel core - logging, profiling bootstrap, command line and collections.

pub mod cli;
pub mod collections;
pub mod log;
pub mod profile;
