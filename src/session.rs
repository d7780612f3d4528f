//! The capture session: one context owning every output record of a run.
//!
//! The protocol layer never touches records directly. It sends [`CaptureEvent`]s tagged with the
//! record index, and the session applies them in order. [`CaptureSession::is_complete`] is the
//! barrier that has to pass before anything is rendered.

use log::{debug, error, warn};

use crate::buffer::PixelBuffer;
use crate::geometry::GeoBox;
use crate::layout::{self, LayoutError};
use crate::record::{CaptureError, CaptureState, OutputCaptureRecord};
use crate::transform::Transform;

/// What the run captures, chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    /// Capture outputs. Either the named output, an explicit region, or the whole layout.
    ScreenOutput {
        output: Option<String>,
        geometry: Option<GeoBox>,
    },
    /// Capture a single application window, addressed by the handle the compositor gave it.
    Window { address: u64 },
}

impl Default for CaptureMode {
    fn default() -> Self {
        CaptureMode::ScreenOutput {
            output: None,
            geometry: None,
        }
    }
}

/// One protocol event for one record.
#[derive(Debug)]
pub enum CaptureEvent {
    Geometry {
        x: i32,
        y: i32,
        transform: Transform,
    },
    Mode {
        width: u32,
        height: u32,
    },
    Scale(i32),
    Name(String),
    LogicalPosition {
        x: i32,
        y: i32,
    },
    LogicalSize {
        width: u32,
        height: u32,
    },
    /// All logical geometry has been sent.
    LogicalDone,
    /// Size of an exported window frame. The window record takes it as its whole geometry.
    FrameSize {
        width: u32,
        height: u32,
    },
    BufferAttached(PixelBuffer),
    /// Frame flags. A y-inverted buffer stores the bottom row first.
    Flags {
        y_invert: bool,
    },
    CaptureRequested,
    Ready,
    Failed,
}

#[derive(Debug, Default)]
pub struct CaptureSession {
    mode: CaptureMode,
    records: Vec<OutputCaptureRecord>,
    /// Indices of the records a capture was started for.
    pending: Vec<usize>,
}

impl CaptureSession {
    pub fn new(mode: CaptureMode) -> Self {
        Self {
            mode,
            records: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn mode(&self) -> &CaptureMode {
        &self.mode
    }

    /// Append a record and return its index. Records keep their discovery order.
    pub fn add_record(&mut self, record: OutputCaptureRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    /// Add the synthetic record standing in for the captured window. It has no output behind it:
    /// scale 1, no transform, and its geometry arrives with the frame.
    pub fn add_window_record(&mut self) -> usize {
        let mut record = OutputCaptureRecord::new();
        record.output_scale = 1;
        record.transform = Transform::Normal;
        if let CaptureMode::Window { address } = self.mode {
            record.name = Some(format!("window {:#x}", address));
        }
        self.add_record(record)
    }

    pub fn records(&self) -> &[OutputCaptureRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Result<&OutputCaptureRecord, CaptureError> {
        self.records
            .get(index)
            .ok_or(CaptureError::UnknownRecord(index))
    }

    pub fn record_mut(&mut self, index: usize) -> Result<&mut OutputCaptureRecord, CaptureError> {
        self.records
            .get_mut(index)
            .ok_or(CaptureError::UnknownRecord(index))
    }

    /// Mark a record as one the barrier waits for.
    pub fn expect_capture(&mut self, index: usize) -> Result<(), CaptureError> {
        self.record(index)?;
        if !self.pending.contains(&index) {
            self.pending.push(index);
        }
        Ok(())
    }

    pub fn pending(&self) -> &[usize] {
        &self.pending
    }

    pub fn apply(&mut self, index: usize, event: CaptureEvent) -> Result<(), CaptureError> {
        let record = self.record_mut(index)?;
        match event {
            CaptureEvent::Geometry { x, y, transform } => {
                record.physical_geometry.x = x;
                record.physical_geometry.y = y;
                record.transform = transform;
            }
            CaptureEvent::Mode { width, height } => record.set_mode(width, height)?,
            CaptureEvent::Scale(factor) => record.output_scale = factor.max(1),
            CaptureEvent::Name(name) => record.name = Some(name),
            CaptureEvent::LogicalPosition { x, y } => {
                record.logical_geometry.x = x;
                record.logical_geometry.y = y;
            }
            CaptureEvent::LogicalSize { width, height } => {
                record.logical_geometry.width = width;
                record.logical_geometry.height = height;
            }
            CaptureEvent::LogicalDone => {
                if let Err(err) = layout::resolve_logical_scale(record) {
                    warn!("{}, guessing the logical geometry of {}", err, record);
                    layout::guess_logical_geometry(record);
                }
            }
            CaptureEvent::FrameSize { width, height } => {
                record.set_mode(width, height)?;
                layout::guess_logical_geometry(record);
            }
            CaptureEvent::BufferAttached(buffer) => record.attach_buffer(buffer)?,
            CaptureEvent::Flags { y_invert } => {
                if y_invert {
                    debug!("Buffer of output {} is y-inverted", record);
                    record.transform = record.transform.compose(Transform::Flipped180);
                }
            }
            CaptureEvent::CaptureRequested => record.mark_capture_requested()?,
            CaptureEvent::Ready => record.mark_ready()?,
            CaptureEvent::Failed => {
                error!("Capture of output {} failed", record);
                record.mark_failed()?
            }
        }
        Ok(())
    }

    /// The ready barrier. `Ok(true)` once every expected capture is ready, an error as soon as
    /// one of them failed.
    pub fn is_complete(&self) -> Result<bool, CaptureError> {
        let mut done = 0;
        for index in &self.pending {
            let record = self.record(*index)?;
            match record.state() {
                CaptureState::Ready => done += 1,
                CaptureState::Failed => {
                    return Err(CaptureError::CaptureFailed(record.to_string()));
                }
                _ => (),
            }
        }
        debug!("{} of {} captures done", done, self.pending.len());
        Ok(done == self.pending.len())
    }

    /// The region asked for by the capture mode, `None` for the whole layout. A window is always
    /// captured whole.
    pub fn requested_region(&self) -> Result<Option<GeoBox>, LayoutError> {
        match &self.mode {
            CaptureMode::ScreenOutput {
                output: Some(name), ..
            } => layout::find_output(&self.records, name).map(Some),
            CaptureMode::ScreenOutput { geometry, .. } => Ok(*geometry),
            CaptureMode::Window { .. } => Ok(None),
        }
    }

    pub fn ready_records(&self) -> impl Iterator<Item = &OutputCaptureRecord> {
        self.records.iter().filter(|record| record.is_ready())
    }

    /// Release every buffer. Called when the session is torn down.
    pub fn release(&mut self) {
        for record in &mut self.records {
            record.release_buffer();
        }
        self.pending.clear();
    }
}
