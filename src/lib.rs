//! Composition of captured Wayland outputs into a single image.
//!
//! Outputs are described by [`OutputCaptureRecord`]s, filled in by a capture backend through a
//! [`CaptureSession`]. Once every capture is ready, [`render`] turns the records into one
//! [`Canvas`] covering a region of the logical layout.

pub mod buffer;
pub mod format;
pub mod geometry;
pub mod layout;
pub mod record;
pub mod render;
pub mod session;
pub mod transform;

pub use buffer::{BufferError, PixelBuffer};
pub use format::PixelFormat;
pub use geometry::{GeoBox, ParseError};
pub use layout::LayoutError;
pub use record::{CaptureError, CaptureState, OutputCaptureRecord};
pub use render::{render, Canvas, Filter, RenderError};
pub use session::{CaptureEvent, CaptureMode, CaptureSession};
pub use transform::Transform;
