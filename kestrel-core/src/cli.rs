use std::path::PathBuf;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

/// Log level options for command-line argument.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Graphics backend requested on the command line.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum BackendArg {
    /// Pick the best backend available on this machine.
    #[default]
    Auto,
    Vulkan,
    Metal,
    #[value(name = "d3d12")]
    Direct3D12,
    Software,
}

/// Common command-line arguments for Kestrel applications.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct EngineArgs {
    /// Set the log verbosity level
    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Graphics backend to initialize
    #[arg(short = 'b', long = "backend", value_enum, default_value_t = BackendArg::Auto)]
    pub backend: BackendArg,

    /// Directory holding persisted pipeline caches
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,

    /// Enable backend validation layers
    #[arg(long = "validation")]
    pub validation: bool,

    /// Number of frames to run before shutting down
    #[arg(short = 'f', long = "frames", default_value_t = 120)]
    pub frames: u32,

    /// Record puffin profiling scopes
    #[arg(long = "profile")]
    pub profile: bool,

    /// Additional positional arguments passed to the application
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

impl EngineArgs {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_and_frames() {
        let args = EngineArgs::parse_from(["sandbox", "--backend", "software", "-f", "3"]);
        assert_eq!(args.backend, BackendArg::Software);
        assert_eq!(args.frames, 3);
        assert!(args.cache_dir.is_none());
    }

    #[test]
    fn d3d12_value_name() {
        let args = EngineArgs::parse_from(["sandbox", "-b", "d3d12"]);
        assert_eq!(args.backend, BackendArg::Direct3D12);
    }
}
