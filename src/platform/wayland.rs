use std::cell::RefCell;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};

use super::toplevel_export::{
    hyprland_toplevel_export_frame_v1::{self, HyprlandToplevelExportFrameV1},
    hyprland_toplevel_export_manager_v1::HyprlandToplevelExportManagerV1,
};
use super::Platform;
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use scrcomp::layout;
use scrcomp::{
    CaptureEvent, CaptureMode, CaptureSession, GeoBox, OutputCaptureRecord, PixelBuffer,
    PixelFormat, Transform,
};
use wayland_client::{
    global_filter,
    protocol::{
        wl_buffer::WlBuffer,
        wl_output::{self, WlOutput},
        wl_shm::{self, WlShm},
    },
    DispatchData, Display, EventQueue, GlobalManager, Main,
};
use wayland_protocols::{
    unstable::xdg_output::v1::client::{
        zxdg_output_manager_v1::ZxdgOutputManagerV1,
        zxdg_output_v1::{self, ZxdgOutputV1},
    },
    wlr::unstable::screencopy::v1::client::{
        zwlr_screencopy_frame_v1::{self, ZwlrScreencopyFrameV1},
        zwlr_screencopy_manager_v1::ZwlrScreencopyManagerV1,
    },
};

const WL_OUTPUT_VERSION: u32 = 4;
const SCREENCOPY_VERSION: u32 = 3;
const TOPLEVEL_EXPORT_VERSION: u32 = 1;

/// Index of the synthetic record in window mode.
const WINDOW: usize = 0;
/// Bit of the toplevel export flags event marking a y-inverted buffer.
const TOPLEVEL_Y_INVERT: u32 = 1;

/// A buffer layout offered by the compositor for one frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct FrameDescription {
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: u32,
}

/// What the protocol callbacks hand over to the platform, tagged with the record index.
#[derive(Debug)]
enum Message {
    /// Goes straight into the session.
    Output(CaptureEvent),
    Buffer(FrameDescription),
    /// All buffer layouts were sent, time to allocate and copy.
    BufferDone,
}

/// A frame of either capture protocol.
#[derive(Debug, Clone)]
enum Frame {
    Output(Main<ZwlrScreencopyFrameV1>),
    Toplevel(Main<HyprlandToplevelExportFrameV1>),
}

impl Frame {
    fn copy(&self, buffer: &WlBuffer) {
        match self {
            Frame::Output(frame) => frame.copy(buffer),
            // Always copy the whole window, damaged or not.
            Frame::Toplevel(frame) => frame.copy(buffer, 1),
        }
    }

    fn destroy(&self) {
        match self {
            Frame::Output(frame) => frame.destroy(),
            Frame::Toplevel(frame) => frame.destroy(),
        }
    }
}

/// Protocol objects backing one record. The window record has no output.
#[derive(Debug, Default)]
struct CaptureTarget {
    wl_output: Option<Main<WlOutput>>,
    xdg_output: Option<Main<ZxdgOutputV1>>,
    frame: Option<Frame>,
    wl_buffer: Option<Main<WlBuffer>>,
    formats: Vec<FrameDescription>,
}

impl CaptureTarget {
    fn output(wl_output: Main<WlOutput>, xdg_output: Option<Main<ZxdgOutputV1>>) -> Self {
        Self {
            wl_output: Some(wl_output),
            xdg_output,
            ..Self::default()
        }
    }
}

pub struct PlatformWayland {
    display: Display,
    event_queue: EventQueue,
    _globals: GlobalManager,
    shm: Main<WlShm>,
    screencopy_manager: Main<ZwlrScreencopyManagerV1>,
    xdg_output_manager: Option<Main<ZxdgOutputManagerV1>>,
    toplevel_export_manager: Option<Main<HyprlandToplevelExportManagerV1>>,
    targets: Vec<CaptureTarget>,
    session: CaptureSession,
    sender: Sender<(usize, Message)>,
    receiver: Receiver<(usize, Message)>,
}

impl PlatformWayland {
    pub fn new(mode: CaptureMode) -> Result<Self> {
        // Connect to the server
        let display = Display::connect_to_env().context("Could not connect to Wayland server")?;
        let mut event_queue = display.create_event_queue();
        let attached_display = (*display).clone().attach(event_queue.token());

        let (sender, receiver) = mpsc::channel();
        let wl_outputs = Rc::new(RefCell::new(Vec::<Main<WlOutput>>::new()));
        let window_mode = matches!(mode, CaptureMode::Window { .. });

        let globals = GlobalManager::new_with_cb(
            &attached_display,
            global_filter!([WlOutput, WL_OUTPUT_VERSION, {
                let wl_outputs = wl_outputs.clone();
                let sender = sender.clone();
                move |wl_output: Main<WlOutput>, _: DispatchData| {
                    // A window has no outputs, and their indices would clash with its record.
                    if window_mode {
                        return;
                    }
                    // Outputs showing up later get an index without a record and are ignored.
                    let index = wl_outputs.borrow().len();
                    debug!("Discovered output {}", index);

                    let sender = sender.clone();
                    wl_output.quick_assign(move |_, event, _| {
                        if let Some(event) = output_event(event) {
                            send(&sender, index, Message::Output(event));
                        }
                    });
                    wl_outputs.borrow_mut().push(wl_output);
                }
            }]),
        );

        // A roundtrip synchronization to make sure the server received our registry
        // creation and sent us the global list
        event_queue.sync_roundtrip(&mut (), |_, _, _| ())?;

        // Init outputs
        event_queue.sync_roundtrip(&mut (), |_, _, _| ())?;

        let shm = globals
            .instantiate_exact::<WlShm>(1)
            .context("Failed to bind wl_shm")?;

        let screencopy_manager = globals
            .instantiate_exact::<ZwlrScreencopyManagerV1>(SCREENCOPY_VERSION)
            .context(
                "Failed to create screencopy manager. Does your compositor implement ZwlrScreencopy?",
            )?;

        let xdg_output_manager = match globals.instantiate_range::<ZxdgOutputManagerV1>(1, 3) {
            Ok(manager) => Some(manager),
            Err(err) => {
                warn!(
                    "No xdg output manager ({:?}), assuming logical and physical pixels match",
                    err
                );
                None
            }
        };

        let toplevel_export_manager = if window_mode {
            Some(
                globals
                    .instantiate_exact::<HyprlandToplevelExportManagerV1>(TOPLEVEL_EXPORT_VERSION)
                    .context(
                        "Failed to create toplevel export manager. Does your compositor implement hyprland_toplevel_export_v1?",
                    )?,
            )
        } else {
            None
        };

        let discovered: Vec<Main<WlOutput>> = wl_outputs.borrow().clone();
        if discovered.is_empty() && !window_mode {
            bail!("No outputs found");
        }

        let mut session = CaptureSession::new(mode);
        let mut targets = Vec::with_capacity(discovered.len().max(1));
        if window_mode {
            session.add_window_record();
            targets.push(CaptureTarget::default());
        }
        for (index, wl_output) in discovered.into_iter().enumerate() {
            session.add_record(OutputCaptureRecord::new());

            let xdg_output = xdg_output_manager.as_ref().map(|manager| {
                let xdg_output = manager.get_xdg_output(&wl_output);
                let sender = sender.clone();
                xdg_output.quick_assign(move |_, event, _| {
                    if let Some(event) = xdg_output_event(event) {
                        send(&sender, index, Message::Output(event));
                    }
                });
                xdg_output
            });
            targets.push(CaptureTarget::output(wl_output, xdg_output));
        }

        // Logical geometry
        event_queue.sync_roundtrip(&mut (), |_, _, _| ())?;

        let mut platform = PlatformWayland {
            display,
            event_queue,
            _globals: globals,
            shm,
            screencopy_manager,
            xdg_output_manager,
            toplevel_export_manager,
            targets,
            session,
            sender,
            receiver,
        };
        platform.pump()?;

        for index in 0..platform.targets.len() {
            if platform.targets[index].wl_output.is_none() {
                continue;
            }
            if platform.xdg_output_manager.is_some() {
                platform.session.apply(index, CaptureEvent::LogicalDone)?;
            } else {
                layout::guess_logical_geometry(platform.session.record_mut(index)?);
            }
            info!("Found output: {:?}", platform.session.record(index)?);
        }

        Ok(platform)
    }

    /// Apply every message the callbacks queued up so far.
    fn pump(&mut self) -> Result<()> {
        while let Ok((index, message)) = self.receiver.try_recv() {
            if index >= self.targets.len() {
                debug!("Ignoring event of output {} discovered too late", index);
                continue;
            }

            match message {
                Message::Output(event) => self.session.apply(index, event)?,
                Message::Buffer(description) => {
                    debug!("Target {} offers {:?}", index, description);
                    self.targets[index].formats.push(description);
                }
                Message::BufferDone => self.start_copy(index)?,
            }
        }
        Ok(())
    }

    /// Allocate a buffer in the first format we can read and let the compositor copy into it.
    fn start_copy(&mut self, index: usize) -> Result<()> {
        let target = &self.targets[index];
        let frame = target
            .frame
            .clone()
            .context("Buffer done event without a frame")?;

        let description = target
            .formats
            .iter()
            .find(|description| description.format.is_supported())
            .copied();
        debug!("Selected frame buffer format: {:?}", description);

        let description = match description {
            Some(description) => description,
            None => {
                let offered = target
                    .formats
                    .iter()
                    .map(|description| description.format.to_string())
                    .collect::<Vec<_>>();
                bail!(
                    "No suitable frame format found for {}, offered: {}",
                    self.session.record(index)?,
                    offered.join(", ")
                );
            }
        };

        let wl_format = wl_shm::Format::from_raw(description.format.to_wl_shm())
            .with_context(|| format!("wl_shm does not know {}", description.format))?;
        let buffer = PixelBuffer::allocate_shm(
            description.format,
            description.width,
            description.height,
            description.stride,
        )?;
        let fd = buffer
            .shm_fd()
            .context("Frame buffer is not backed by shared memory")?;
        let size = i32::try_from(buffer.len()).context("Frame buffer too large for wl_shm")?;

        let shm_pool = self.shm.create_pool(fd, size);
        let wl_buffer = shm_pool.create_buffer(
            0,
            description.width as i32,
            description.height as i32,
            description.stride as i32,
            wl_format,
        );
        shm_pool.destroy();

        self.session
            .apply(index, CaptureEvent::BufferAttached(buffer))?;

        // Copy the pixel data advertised by the compositor into the buffer we just created.
        frame.copy(&wl_buffer);
        self.session.apply(index, CaptureEvent::CaptureRequested)?;
        self.targets[index].wl_buffer = Some(wl_buffer);

        Ok(())
    }

    /// Start a screencopy frame for every output intersecting `region`.
    fn capture_outputs(&mut self, region: Option<GeoBox>, overlay_cursor: bool) -> Result<usize> {
        let targets = layout::intersecting(self.session.records(), region)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        if targets.is_empty() {
            bail!("Supplied geometry did not intersect with any outputs");
        }

        for &index in &targets {
            debug!(
                "Taking screenshot of output {}",
                self.session.record(index)?
            );
            let wl_output = self.targets[index]
                .wl_output
                .as_ref()
                .context("Output record without a wl_output")?;
            let frame = self
                .screencopy_manager
                .capture_output(overlay_cursor as i32, wl_output);

            let sender = self.sender.clone();
            frame.quick_assign(move |_, event, _| {
                if let Some(message) = frame_message(event) {
                    send(&sender, index, message);
                }
            });
            self.targets[index].frame = Some(Frame::Output(frame));
            self.session.expect_capture(index)?;
        }

        Ok(targets.len())
    }

    /// Start a toplevel export frame for the window at `address`.
    fn capture_window(&mut self, address: u64, overlay_cursor: bool) -> Result<usize> {
        let manager = self
            .toplevel_export_manager
            .as_ref()
            .context("Toplevel export manager is not bound")?;
        debug!("Taking screenshot of window {:#x}", address);

        // The compositor matches the low 32 bits of the address.
        let frame = manager.capture_toplevel(overlay_cursor as i32, address as u32);
        let sender = self.sender.clone();
        frame.quick_assign(move |_, event, _| {
            for message in toplevel_messages(event) {
                send(&sender, WINDOW, message);
            }
        });
        self.targets[WINDOW].frame = Some(Frame::Toplevel(frame));
        self.session.expect_capture(WINDOW)?;

        Ok(1)
    }
}

impl Platform for PlatformWayland {
    fn session(&self) -> &CaptureSession {
        &self.session
    }

    fn capture(&mut self, region: Option<GeoBox>, overlay_cursor: bool) -> Result<usize> {
        let mode = self.session.mode().clone();
        let captured = match mode {
            CaptureMode::Window { address } => self.capture_window(address, overlay_cursor)?,
            CaptureMode::ScreenOutput { .. } => self.capture_outputs(region, overlay_cursor)?,
        };

        // Dispatch until the compositor copied or failed every frame.
        loop {
            self.pump()?;
            if self.session.is_complete()? {
                break;
            }
            debug!("Dispatch event queue and wait for Failed or Ready events");
            self.event_queue.dispatch(&mut (), |_, _, _| ())?;
        }

        Ok(captured)
    }
}

impl Drop for PlatformWayland {
    fn drop(&mut self) {
        for target in &mut self.targets {
            if let Some(frame) = target.frame.take() {
                frame.destroy();
            }
            if let Some(wl_buffer) = target.wl_buffer.take() {
                wl_buffer.destroy();
            }
            if let Some(xdg_output) = target.xdg_output.take() {
                xdg_output.destroy();
            }
            if let Some(wl_output) = target.wl_output.take() {
                wl_output.release();
            }
        }
        if let Some(manager) = self.xdg_output_manager.take() {
            manager.destroy();
        }
        if let Some(manager) = self.toplevel_export_manager.take() {
            manager.destroy();
        }
        self.screencopy_manager.destroy();
        self.session.release();

        if let Err(err) = self.display.flush() {
            warn!("Could not flush the Wayland connection: {}", err);
        }
    }
}

fn send(sender: &Sender<(usize, Message)>, index: usize, message: Message) {
    if sender.send((index, message)).is_err() {
        debug!("Dropped event of target {}, nobody is listening", index);
    }
}

fn output_event(event: wl_output::Event) -> Option<CaptureEvent> {
    match event {
        wl_output::Event::Geometry { x, y, transform, .. } => {
            let transform = Transform::from_wl(transform.to_raw()).unwrap_or_else(|| {
                warn!("Unknown output transform {}", transform.to_raw());
                Transform::Normal
            });
            Some(CaptureEvent::Geometry { x, y, transform })
        }
        wl_output::Event::Mode {
            flags,
            width,
            height,
            ..
        } if flags.contains(wl_output::Mode::Current) => Some(CaptureEvent::Mode {
            width: width.max(0) as u32,
            height: height.max(0) as u32,
        }),
        wl_output::Event::Scale { factor } => Some(CaptureEvent::Scale(factor)),
        wl_output::Event::Name { name } => Some(CaptureEvent::Name(name)),
        _ => None,
    }
}

fn xdg_output_event(event: zxdg_output_v1::Event) -> Option<CaptureEvent> {
    match event {
        zxdg_output_v1::Event::LogicalPosition { x, y } => {
            Some(CaptureEvent::LogicalPosition { x, y })
        }
        zxdg_output_v1::Event::LogicalSize { width, height } => Some(CaptureEvent::LogicalSize {
            width: width.max(0) as u32,
            height: height.max(0) as u32,
        }),
        zxdg_output_v1::Event::Name { name } => Some(CaptureEvent::Name(name)),
        _ => None,
    }
}

fn frame_message(event: zwlr_screencopy_frame_v1::Event) -> Option<Message> {
    use zwlr_screencopy_frame_v1::Event;
    match event {
        Event::Buffer {
            format,
            width,
            height,
            stride,
        } => Some(Message::Buffer(FrameDescription {
            format: PixelFormat::from_wl_shm(format.to_raw()),
            width,
            height,
            stride,
        })),
        Event::Flags { flags } => Some(Message::Output(CaptureEvent::Flags {
            y_invert: flags.contains(zwlr_screencopy_frame_v1::Flags::YInvert),
        })),
        // Sent once every buffer layout was announced.
        Event::BufferDone => Some(Message::BufferDone),
        Event::Ready { .. } => Some(Message::Output(CaptureEvent::Ready)),
        Event::Failed => {
            error!("Compositor failed to copy a frame");
            Some(Message::Output(CaptureEvent::Failed))
        }
        _ => None,
    }
}

fn toplevel_messages(event: hyprland_toplevel_export_frame_v1::Event) -> Vec<Message> {
    use hyprland_toplevel_export_frame_v1::Event;
    match event {
        Event::Buffer {
            format,
            width,
            height,
            stride,
        } => vec![
            // The frame is all we learn about the window geometry.
            Message::Output(CaptureEvent::FrameSize { width, height }),
            Message::Buffer(FrameDescription {
                format: PixelFormat::from_wl_shm(format.to_raw()),
                width,
                height,
                stride,
            }),
        ],
        Event::Flags { flags } => vec![Message::Output(CaptureEvent::Flags {
            y_invert: flags & TOPLEVEL_Y_INVERT != 0,
        })],
        Event::BufferDone => vec![Message::BufferDone],
        Event::Ready { .. } => vec![Message::Output(CaptureEvent::Ready)],
        Event::Failed => {
            error!("Compositor failed to export the window");
            vec![Message::Output(CaptureEvent::Failed)]
        }
        _ => Vec::new(),
    }
}
