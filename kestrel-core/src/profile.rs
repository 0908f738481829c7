/// Turn puffin scope collection on or off.
///
/// Scopes are only recorded while enabled; the `profiling` macros are cheap otherwise.
pub fn initialize(enabled: bool) -> Result<(), anyhow::Error> {
    profiling::puffin::set_scopes_on(enabled);
    Ok(())
}

#[inline]
pub fn finish_frame() {
    profiling::finish_frame!();
}
