use std::fmt;

use log::debug;
use thiserror::Error;

use crate::buffer::PixelBuffer;
use crate::geometry::GeoBox;
use crate::transform::Transform;

/// Lifecycle of one output capture.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Discovered,
    GeometryKnown,
    BufferAllocated,
    CaptureRequested,
    /// Compositor sent a Ready event for the copy.
    Ready,
    /// Compositor sent a Failed event for the copy.
    Failed,
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to capture output {0}")]
    CaptureFailed(String),
    #[error("output {output} can not go from {from:?} to {to:?}")]
    InvalidTransition {
        output: String,
        from: CaptureState,
        to: CaptureState,
    },
    #[error("buffer of output {output} is {buffer_width}x{buffer_height}, expected {width}x{height}")]
    BufferMismatch {
        output: String,
        buffer_width: u32,
        buffer_height: u32,
        width: u32,
        height: u32,
    },
    #[error("no output with index {0}")]
    UnknownRecord(usize),
}

/// Everything known about one output (or the captured window) and its framebuffer.
#[derive(Debug)]
pub struct OutputCaptureRecord {
    pub physical_geometry: GeoBox,
    pub transform: Transform,
    pub output_scale: i32,
    pub logical_geometry: GeoBox,
    pub logical_scale: f64,
    pub name: Option<String>,
    buffer: Option<PixelBuffer>,
    state: CaptureState,
}

impl Default for OutputCaptureRecord {
    fn default() -> Self {
        Self {
            physical_geometry: GeoBox::default(),
            transform: Transform::Normal,
            output_scale: 1,
            logical_geometry: GeoBox::default(),
            logical_scale: 1.0,
            name: None,
            buffer: None,
            state: CaptureState::Discovered,
        }
    }
}

impl fmt::Display for OutputCaptureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("<unknown>"))
    }
}

impl OutputCaptureRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == CaptureState::Ready
    }

    pub fn buffer(&self) -> Option<&PixelBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut PixelBuffer> {
        self.buffer.as_mut()
    }

    fn transition(&mut self, allowed: &[CaptureState], to: CaptureState) -> Result<(), CaptureError> {
        if !allowed.contains(&self.state) {
            return Err(CaptureError::InvalidTransition {
                output: self.to_string(),
                from: self.state,
                to,
            });
        }
        debug!("Output {}: {:?} -> {:?}", self, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Record the physical size of the output's current mode.
    pub fn set_mode(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        self.transition(
            &[CaptureState::Discovered, CaptureState::GeometryKnown],
            CaptureState::GeometryKnown,
        )?;
        self.physical_geometry.width = width;
        self.physical_geometry.height = height;
        Ok(())
    }

    /// Attach the buffer the compositor will copy into, replacing (and releasing) any previous one.
    pub fn attach_buffer(&mut self, buffer: PixelBuffer) -> Result<(), CaptureError> {
        self.transition(&[CaptureState::GeometryKnown], CaptureState::BufferAllocated)?;
        self.buffer = Some(buffer);
        Ok(())
    }

    pub fn mark_capture_requested(&mut self) -> Result<(), CaptureError> {
        self.transition(&[CaptureState::BufferAllocated], CaptureState::CaptureRequested)
    }

    /// The compositor finished copying. The buffer has to match the physical size.
    pub fn mark_ready(&mut self) -> Result<(), CaptureError> {
        let (width, height) = (self.physical_geometry.width, self.physical_geometry.height);
        let (buffer_width, buffer_height) = self
            .buffer
            .as_ref()
            .map(|buffer| (buffer.width(), buffer.height()))
            .unwrap_or_default();
        if (buffer_width, buffer_height) != (width, height) {
            return Err(CaptureError::BufferMismatch {
                output: self.to_string(),
                buffer_width,
                buffer_height,
                width,
                height,
            });
        }
        self.transition(&[CaptureState::CaptureRequested], CaptureState::Ready)
    }

    pub fn mark_failed(&mut self) -> Result<(), CaptureError> {
        self.transition(
            &[
                CaptureState::Discovered,
                CaptureState::GeometryKnown,
                CaptureState::BufferAllocated,
                CaptureState::CaptureRequested,
            ],
            CaptureState::Failed,
        )
    }

    /// Drop the buffer. Does nothing when there is none.
    pub fn release_buffer(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            debug!("Release {} byte buffer of output {}", buffer.len(), self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn record_with_mode(width: u32, height: u32) -> OutputCaptureRecord {
        let mut record = OutputCaptureRecord::new();
        record.name = Some("DP-1".into());
        record.set_mode(width, height).unwrap();
        record
    }

    #[test]
    fn walks_through_the_lifecycle() {
        let mut record = record_with_mode(4, 2);
        assert_eq!(record.state(), CaptureState::GeometryKnown);

        let buffer = PixelBuffer::allocate(PixelFormat::Argb8888, 4, 2, 16).unwrap();
        record.attach_buffer(buffer).unwrap();
        record.mark_capture_requested().unwrap();
        record.mark_ready().unwrap();
        assert!(record.is_ready());
        assert!(record.buffer().is_some());
    }

    #[test]
    fn ready_requires_matching_buffer() {
        let mut record = record_with_mode(4, 2);
        let buffer = PixelBuffer::allocate(PixelFormat::Argb8888, 2, 2, 8).unwrap();
        record.attach_buffer(buffer).unwrap();
        record.mark_capture_requested().unwrap();

        let err = record.mark_ready().unwrap_err();
        assert!(matches!(err, CaptureError::BufferMismatch { width: 4, .. }));
        assert_eq!(record.state(), CaptureState::CaptureRequested);
    }

    #[test]
    fn rejects_out_of_order_events() {
        let mut record = OutputCaptureRecord::new();
        assert!(matches!(
            record.mark_capture_requested(),
            Err(CaptureError::InvalidTransition { .. })
        ));

        record.mark_failed().unwrap();
        assert_eq!(record.state(), CaptureState::Failed);
        assert!(record.mark_failed().is_err());
        assert!(record.set_mode(1, 1).is_err());
    }

    #[test]
    fn release_is_idempotent() {
        let mut record = record_with_mode(1, 1);
        record.release_buffer();
        let buffer = PixelBuffer::allocate(PixelFormat::Xrgb8888, 1, 1, 4).unwrap();
        record.attach_buffer(buffer).unwrap();
        record.release_buffer();
        record.release_buffer();
        assert!(record.buffer().is_none());
    }
}
