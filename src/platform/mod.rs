mod toplevel_export;
mod wayland;

use anyhow::Result;
use scrcomp::{CaptureMode, CaptureSession, GeoBox};

use self::wayland::PlatformWayland;

pub trait Platform {
    /// The session holding every capture record, in discovery order.
    fn session(&self) -> &CaptureSession;

    /// Capture what the session's mode asks for and wait until the compositor copied all of it.
    /// Outputs are limited to those intersecting `region` (all outputs without one). Returns the
    /// number of captured records.
    fn capture(&mut self, region: Option<GeoBox>, overlay_cursor: bool) -> Result<usize>;
}

pub fn create_platform(mode: CaptureMode) -> Result<Box<dyn Platform>> {
    Ok(Box::new(PlatformWayland::new(mode)?))
}
