use std::collections::VecDeque;
use std::io::Cursor;
use std::mem::size_of;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd;
use pipewire as pw;
use pw::spa::buffer::DataType;
use pw::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use pw::spa::param::format_utils::parse_format;
use pw::spa::param::video::VideoInfoRaw;
use pw::spa::param::ParamType;
use pw::spa::pod::serialize::PodSerializer;
use pw::spa::pod::{self, ChoiceValue, Pod, Property, PropertyFlags};
use pw::spa::sys::{
    spa_buffer_find_meta_data, spa_meta_bitmap, spa_meta_cursor, spa_meta_header,
    spa_pod_find_prop, SPA_FORMAT_VIDEO_modifier, SPA_META_Cursor, SPA_META_Header,
    SPA_PARAM_BUFFERS_buffers, SPA_PARAM_BUFFERS_dataType, SPA_PARAM_META_size,
    SPA_PARAM_META_type,
};
use pw::spa::utils::{Choice, ChoiceEnum, ChoiceFlags, Direction, Fraction, Rectangle, SpaTypes};
use pw::stream::{StreamFlags, StreamRef, StreamState};
use pw::sys as pw_sys;

use super::{
    CaptureError, CursorState, DmaBufFrame, DmaBufPlane, DrmObject, MemoryFrame, PixelFormat,
    Rect, ShareHandle, StreamEvent,
};

/// The remote's buffer pool size. Bounds how many frames can be in flight.
const STREAM_BUFFER_COUNT: i32 = 16;

/// How often the loop thread checks the stop flag.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Marks the moment the PipeWire stream goes away. Release hooks consult it
/// so a frame outliving the stream degrades to a no-op instead of touching a
/// destroyed buffer pool.
pub(crate) struct StreamGuard {
    closed: Mutex<bool>,
}

/// Returns one PipeWire buffer to the stream's free list, exactly once, from
/// whichever thread drops the owning frame last.
pub(crate) struct BufferRelease {
    stream: *mut pw_sys::pw_stream,
    buffer: *mut pw_sys::pw_buffer,
    guard: Arc<StreamGuard>,
}

unsafe impl Send for BufferRelease {}

impl Drop for BufferRelease {
    fn drop(&mut self) {
        let closed = self.guard.closed.lock().unwrap();
        if !*closed {
            unsafe {
                pw_sys::pw_stream_queue_buffer(self.stream, self.buffer);
            }
        }
    }
}

struct Shared {
    events: Mutex<VecDeque<StreamEvent>>,
    event_fd: EventFd,
    stopping: AtomicBool,
    terminal: AtomicBool,
    cursor: Mutex<CursorState>,
    guard: Arc<StreamGuard>,
}

fn enqueue_event(shared: &Shared, event: StreamEvent) {
    shared.events.lock().unwrap().push_back(event);
    let _ = unistd::write(&shared.event_fd, &1u64.to_ne_bytes());
}

fn fail_stream(shared: &Shared) {
    shared.terminal.store(true, Ordering::SeqCst);
    shared.stopping.store(true, Ordering::SeqCst);
    enqueue_event(shared, StreamEvent::Disconnected);
}

/// A receiver for a compositor-shared PipeWire video stream.
///
/// Connects to the node negotiated by the portal, declares the formats and
/// buffer layout it can handle, and turns stream callbacks into
/// [`StreamEvent`]s. The PipeWire main loop runs on a dedicated thread; the
/// consumer polls [`event_fd`](Self::event_fd) and drains
/// [`next_event`](Self::next_event).
pub struct PipeWireCapture {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    disconnected_seen: AtomicBool,
}

impl PipeWireCapture {
    /// Connect to the shared stream. `support_dmabuf` additionally offers a
    /// modifier-aware format so the remote can pick zero-copy delivery.
    pub fn connect(share: ShareHandle, support_dmabuf: bool) -> Result<Self, CaptureError> {
        let event_fd =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
                .map_err(|e| {
                    CaptureError::ProtocolFailed(format!("eventfd creation failed: {e}"))
                })?;
        let shared = Arc::new(Shared {
            events: Mutex::new(VecDeque::new()),
            event_fd,
            stopping: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
            cursor: Mutex::new(CursorState::default()),
            guard: Arc::new(StreamGuard {
                closed: Mutex::new(false),
            }),
        });

        let (ready_tx, ready_rx) = mpsc::channel();
        let loop_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("pipewire-loop".into())
            .spawn(move || stream_loop(share, support_dmabuf, loop_shared, ready_tx))
            .map_err(|e| CaptureError::ProtocolFailed(format!("spawning stream thread: {e}")))?;

        let mut capture = Self {
            shared,
            thread: Some(thread),
            disconnected_seen: AtomicBool::new(false),
        };
        match ready_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(())) => Ok(capture),
            Ok(Err(e)) => {
                capture.join_loop();
                Err(e)
            }
            Err(_) => {
                capture.shared.stopping.store(true, Ordering::SeqCst);
                capture.join_loop();
                Err(CaptureError::ProtocolFailed(
                    "stream thread did not become ready".into(),
                ))
            }
        }
    }

    /// Readable whenever one or more events are queued. Poll it together
    /// with other fds and then drain [`next_event`](Self::next_event) fully.
    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.shared.event_fd.as_fd()
    }

    /// Take the next queued event, if any. Thread-safe. Errors once a
    /// [`StreamEvent::Disconnected`] has already been returned.
    pub fn next_event(&self) -> Result<Option<StreamEvent>, CaptureError> {
        if self.disconnected_seen.load(Ordering::SeqCst) {
            return Err(CaptureError::StreamTerminated);
        }
        let mut events = self.shared.events.lock().unwrap();
        match events.pop_front() {
            Some(event) => {
                if events.is_empty() {
                    // clear the eventfd level
                    let mut buf = [0u8; 8];
                    let _ = unistd::read(&self.shared.event_fd, &mut buf);
                }
                if matches!(event, StreamEvent::Disconnected) {
                    self.disconnected_seen.store(true, Ordering::SeqCst);
                }
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Latest cursor metadata delivered by the remote. Diagnostic only.
    pub fn cursor(&self) -> CursorState {
        self.shared.cursor.lock().unwrap().clone()
    }

    fn drain_events(&self) {
        let mut events = self.shared.events.lock().unwrap();
        events.clear();
        let mut buf = [0u8; 8];
        let _ = unistd::read(&self.shared.event_fd, &mut buf);
    }

    fn join_loop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PipeWireCapture {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        // undelivered frames go back to the pool while the stream is alive
        self.drain_events();
        self.join_loop();
        // events that slipped in before the loop quit; release hooks are
        // no-ops by now
        self.drain_events();
    }
}

/// Per-stream state owned by the loop thread, fed by the listener callbacks.
struct StreamData {
    format: VideoInfoRaw,
    have_dmabuf: bool,
    start: Option<Instant>,
}

impl Default for StreamData {
    fn default() -> Self {
        Self {
            format: VideoInfoRaw::new(),
            have_dmabuf: false,
            start: None,
        }
    }
}

fn stream_loop(
    share: ShareHandle,
    support_dmabuf: bool,
    shared: Arc<Shared>,
    ready: mpsc::Sender<Result<(), CaptureError>>,
) {
    if let Err(e) = stream_loop_run(share, support_dmabuf, &shared, &ready) {
        let _ = ready.send(Err(e));
    }
    // from here on the stream is about to be destroyed together with the
    // loop; outstanding frames must not queue buffers anymore
    *shared.guard.closed.lock().unwrap() = true;
}

fn stream_loop_run(
    share: ShareHandle,
    support_dmabuf: bool,
    shared: &Arc<Shared>,
    ready: &mpsc::Sender<Result<(), CaptureError>>,
) -> Result<(), CaptureError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None)
        .map_err(|e| CaptureError::ProtocolFailed(format!("creating main loop: {e}")))?;
    let context = pw::context::Context::new(&mainloop)
        .map_err(|e| CaptureError::ProtocolFailed(format!("creating context: {e}")))?;
    let core = context
        .connect_fd(share.pipewire_fd, None)
        .map_err(|e| CaptureError::PortalBroken(format!("PipeWire connection failed: {e}")))?;

    let _core_listener = core
        .add_listener_local()
        .info(|info| {
            log::info!(
                "PipeWire core: version {}, connection name: {}",
                info.version(),
                info.name()
            );
        })
        .error({
            let shared = shared.clone();
            move |id, seq, res, message| {
                log::error!("PipeWire error, id = {id}, seq = {seq}, res = {res}: {message}");
                fail_stream(&shared);
            }
        })
        .register();

    let stream = pw::stream::Stream::new(
        &core,
        "wayrec screen capture",
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )
    .map_err(|e| CaptureError::ProtocolFailed(format!("creating stream: {e}")))?;

    let _listener = stream
        .add_local_listener_with_user_data(StreamData::default())
        .state_changed({
            let shared = shared.clone();
            move |_stream, data: &mut StreamData, old, new| {
                log::info!("stream state changed: {old:?} -> {new:?}");
                let was_streaming = old == StreamState::Streaming;
                match &new {
                    StreamState::Streaming if old == StreamState::Paused => {
                        match PixelFormat::from_spa(data.format.format()) {
                            Ok(format) => {
                                let size = data.format.size();
                                data.start = Some(Instant::now());
                                enqueue_event(
                                    &shared,
                                    StreamEvent::Connected {
                                        dimensions: Rect {
                                            w: size.width,
                                            h: size.height,
                                        },
                                        format,
                                        is_dmabuf: data.have_dmabuf,
                                    },
                                );
                            }
                            Err(e) => {
                                log::error!("{e}");
                                fail_stream(&shared);
                            }
                        }
                    }
                    StreamState::Error(message) => {
                        log::error!("stream entered error state: {message}");
                        fail_stream(&shared);
                    }
                    _ if was_streaming => enqueue_event(&shared, StreamEvent::Disconnected),
                    _ => {}
                }
            }
        })
        .param_changed(|stream, data: &mut StreamData, id, param| {
            let Some(param) = param else { return };
            if id != ParamType::Format.as_raw() {
                return;
            }
            let (media_type, media_subtype) = match parse_format(param) {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("error parsing format: {e}");
                    return;
                }
            };
            if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
                return;
            }
            if let Err(e) = data.format.parse(param) {
                log::warn!("error parsing video format: {e}");
                return;
            }

            // a negotiated modifier means the remote will deliver DMA-BUF
            let modifier = unsafe {
                spa_pod_find_prop(
                    param.as_raw_ptr(),
                    std::ptr::null(),
                    SPA_FORMAT_VIDEO_modifier,
                )
            };
            data.have_dmabuf = !modifier.is_null();

            let size = data.format.size();
            let framerate = data.format.framerate();
            log::info!(
                "video format: {:?}, size = {}x{}, framerate = {}/{}, modifier = {:#x}",
                data.format.format(),
                size.width,
                size.height,
                framerate.num,
                framerate.denom,
                data.format.modifier()
            );

            if let Err(e) = answer_format_params(stream, data.have_dmabuf) {
                log::warn!("error updating stream params: {e}");
            }
        })
        .process({
            let shared = shared.clone();
            move |stream, data: &mut StreamData| {
                if shared.stopping.load(Ordering::SeqCst) {
                    // keep the pool cycling, drop the content
                    unsafe {
                        let buffer = stream.dequeue_raw_buffer();
                        if !buffer.is_null() {
                            stream.queue_raw_buffer(buffer);
                        }
                    }
                    return;
                }
                if stream.state() != StreamState::Streaming {
                    return;
                }
                let buffer = unsafe { stream.dequeue_raw_buffer() };
                if buffer.is_null() {
                    // out of buffers
                    return;
                }
                unsafe { deliver_buffer(stream, data, &shared, buffer) };
            }
        })
        .register()
        .map_err(|e| CaptureError::ProtocolFailed(format!("registering stream listener: {e}")))?;

    // one variant that lets the remote pick a zero-copy modifier, one plain
    // fallback; the remote prefers the first it can satisfy
    let mut b1 = Vec::new();
    let pod1 = make_pod(&mut b1, video_format_obj(support_dmabuf))?;
    let mut b2 = Vec::new();
    let pod2 = make_pod(&mut b2, video_format_obj(false))?;

    stream
        .connect(
            Direction::Input,
            Some(share.node_id),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut [pod1, pod2],
        )
        .map_err(|e| CaptureError::ProtocolFailed(format!("stream connect failed: {e}")))?;

    // the stop flag is set from the consumer side; check it periodically so
    // the loop can wind down from its own thread
    let stop_shared = shared.clone();
    let stop_mainloop = mainloop.clone();
    let timer = mainloop.loop_().add_timer(move |_expirations| {
        if stop_shared.stopping.load(Ordering::SeqCst) {
            stop_mainloop.quit();
        }
    });
    timer.update_timer(Some(STOP_POLL_INTERVAL), Some(STOP_POLL_INTERVAL));

    let _ = ready.send(Ok(()));
    mainloop.run();
    Ok(())
}

/// Turn one dequeued buffer into at most one frame event. Any early exit
/// drops `release`, which queues the buffer straight back.
unsafe fn deliver_buffer(
    stream: &StreamRef,
    data: &mut StreamData,
    shared: &Arc<Shared>,
    buffer: *mut pw_sys::pw_buffer,
) {
    let spa_buf = (*buffer).buffer;
    let release = BufferRelease {
        stream: stream as *const StreamRef as *mut pw_sys::pw_stream,
        buffer,
        guard: shared.guard.clone(),
    };

    update_cursor(shared, spa_buf);

    let header = spa_buffer_find_meta_data(spa_buf, SPA_META_Header, size_of::<spa_meta_header>())
        as *mut spa_meta_header;
    let pts = if !header.is_null() {
        Duration::from_nanos((*header).pts.max(0) as u64)
    } else {
        data.start.map(|start| start.elapsed()).unwrap_or_default()
    };

    let n_datas = (*spa_buf).n_datas;
    if n_datas == 0 {
        return;
    }
    let d0 = &*(*spa_buf).datas;
    let chunk = &*d0.chunk;
    let size = data.format.size();

    if d0.type_ == DataType::MemPtr.as_raw() || d0.type_ == DataType::MemFd.as_raw() {
        if n_datas != 1 {
            log::warn!("memory buffer with {n_datas} data blocks, expected 1");
            return;
        }
        if d0.data.is_null() {
            log::warn!("memory buffer without mapped data");
            return;
        }
        let format = match PixelFormat::from_spa(data.format.format()) {
            Ok(format) => format,
            Err(e) => {
                log::error!("{e}");
                fail_stream(shared);
                return;
            }
        };
        log::trace!(
            "memory buffer: size = {:#x}, stride = {:#x}, ptr = {:?}",
            chunk.size,
            chunk.stride,
            d0.data
        );
        enqueue_event(
            shared,
            StreamEvent::MemoryFrameReceived(MemoryFrame {
                width: size.width,
                height: size.height,
                pts,
                format,
                memory: d0.data as *mut u8,
                stride: chunk.stride as usize,
                size: chunk.size as usize,
                offset: chunk.offset as usize,
                release,
            }),
        );
    } else if d0.type_ == DataType::DmaBuf.as_raw() {
        let drm_format = match PixelFormat::from_spa(data.format.format()) {
            Ok(format) => format.drm_format(),
            Err(e) => {
                log::error!("{e}");
                fail_stream(shared);
                return;
            }
        };
        // no DRM format uses more than 4 planes
        let plane_count = n_datas.min(4);
        let mut planes = [DmaBufPlane::default(); 4];
        for (i, plane) in planes.iter_mut().enumerate().take(plane_count as usize) {
            let plane_chunk = &*(*(*spa_buf).datas.add(i)).chunk;
            plane.offset = plane_chunk.offset as usize;
            plane.pitch = plane_chunk.stride as usize;
        }
        log::trace!(
            "DMA-BUF: fd = {}, totalSize = {:#x}, planeCount = {}",
            d0.fd,
            d0.maxsize,
            plane_count
        );
        enqueue_event(
            shared,
            StreamEvent::DmaBufFrameReceived(DmaBufFrame {
                width: size.width,
                height: size.height,
                pts,
                drm_format,
                drm_object: DrmObject {
                    fd: d0.fd as RawFd,
                    total_size: d0.maxsize as usize,
                    modifier: data.format.modifier(),
                },
                plane_count,
                planes,
                release,
            }),
        );
    }
    // any other data type: release drops here and re-queues the buffer
}

/// Stash cursor position and bitmap for diagnostics; the pipeline never
/// renders it.
unsafe fn update_cursor(shared: &Shared, spa_buf: *mut pw::spa::sys::spa_buffer) {
    let meta = spa_buffer_find_meta_data(spa_buf, SPA_META_Cursor, size_of::<spa_meta_cursor>())
        as *mut spa_meta_cursor;
    if meta.is_null() || (*meta).id == 0 {
        return;
    }
    let mut cursor = shared.cursor.lock().unwrap();
    cursor.position = ((*meta).position.x, (*meta).position.y);
    if (*meta).bitmap_offset as usize >= size_of::<spa_meta_cursor>() {
        let bitmap = (meta as *const u8).add((*meta).bitmap_offset as usize) as *const spa_meta_bitmap;
        let width = (*bitmap).size.width;
        let height = (*bitmap).size.height;
        let pixels = (bitmap as *const u8).add((*bitmap).offset as usize);
        cursor.bitmap_size = (width, height);
        cursor.bitmap =
            Some(std::slice::from_raw_parts(pixels, (width * height * 4) as usize).to_vec());
        log::debug!(
            "cursor: ({}, {}) [{}x{}]",
            cursor.position.0,
            cursor.position.1,
            width,
            height
        );
    }
}

fn cursor_meta_size(width: i32, height: i32) -> i32 {
    (size_of::<spa_meta_cursor>() + size_of::<spa_meta_bitmap>()) as i32 + width * height * 4
}

/// Serialize a pod object into `buffer` and reparse it for the stream API.
/// Fallible so callbacks driven by the PipeWire loop never unwind into it.
fn make_pod<'a>(buffer: &'a mut Vec<u8>, object: pod::Object) -> Result<&'a Pod, CaptureError> {
    PodSerializer::serialize(Cursor::new(&mut *buffer), &pod::Value::Object(object))
        .map_err(|e| CaptureError::ProtocolFailed(format!("serializing pod failed: {e:?}")))?;
    Pod::from_bytes(buffer)
        .ok_or_else(|| CaptureError::ProtocolFailed("parsing serialized pod failed".into()))
}

/// Answer a format negotiation with the metadata requests (cursor bitmap,
/// header pts) and the buffer layout this consumer accepts.
fn answer_format_params(stream: &StreamRef, have_dmabuf: bool) -> Result<(), CaptureError> {
    let mut buffer_types = 1u32 << DataType::MemPtr.as_raw();
    if have_dmabuf {
        buffer_types |= 1 << DataType::DmaBuf.as_raw();
    }

    let cursor_obj = pod::object!(
        SpaTypes::ObjectParamMeta,
        ParamType::Meta,
        Property::new(
            SPA_PARAM_META_type,
            pod::Value::Id(pw::spa::utils::Id(SPA_META_Cursor)),
        ),
        Property::new(
            SPA_PARAM_META_size,
            pod::Value::Choice(ChoiceValue::Int(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Range {
                    default: cursor_meta_size(24, 24),
                    min: cursor_meta_size(1, 1),
                    max: cursor_meta_size(256, 256),
                },
            ))),
        ),
    );
    let header_obj = pod::object!(
        SpaTypes::ObjectParamMeta,
        ParamType::Meta,
        Property::new(
            SPA_PARAM_META_type,
            pod::Value::Id(pw::spa::utils::Id(SPA_META_Header)),
        ),
        Property::new(
            SPA_PARAM_META_size,
            pod::Value::Int(size_of::<spa_meta_header>() as i32),
        ),
    );
    let buffers_obj = pod::object!(
        SpaTypes::ObjectParamBuffers,
        ParamType::Buffers,
        Property::new(SPA_PARAM_BUFFERS_buffers, pod::Value::Int(STREAM_BUFFER_COUNT)),
        Property::new(
            SPA_PARAM_BUFFERS_dataType,
            pod::Value::Choice(ChoiceValue::Int(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Flags {
                    default: buffer_types as i32,
                    flags: vec![buffer_types as i32],
                },
            ))),
        ),
    );

    let mut b1 = Vec::new();
    let pod1 = make_pod(&mut b1, cursor_obj)?;
    let mut b2 = Vec::new();
    let pod2 = make_pod(&mut b2, header_obj)?;
    let mut b3 = Vec::new();
    let pod3 = make_pod(&mut b3, buffers_obj)?;
    stream
        .update_params(&mut [pod1, pod2, pod3])
        .map_err(|e| CaptureError::ProtocolFailed(format!("updating stream params: {e}")))
}

/// The format menu offered to the remote: raw video in one of five layouts,
/// any size up to 4096x4096, any rate up to 240 Hz. With `with_modifiers`
/// the remote must additionally pick a DRM modifier (zero-copy delivery).
fn video_format_obj(with_modifiers: bool) -> pod::Object {
    use pw::spa::param::video::VideoFormat;

    let mut obj = pod::object!(
        SpaTypes::ObjectParamFormat,
        ParamType::EnumFormat,
        pod::property!(FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
        pod::property!(
            FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            VideoFormat::NV12,
            VideoFormat::NV12,
            VideoFormat::RGBx,
            VideoFormat::BGRx,
            VideoFormat::BGRA,
            VideoFormat::RGBA
        ),
        pod::property!(
            FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            Rectangle {
                width: 1280,
                height: 720
            },
            Rectangle {
                width: 1,
                height: 1
            },
            Rectangle {
                width: 4096,
                height: 4096
            }
        ),
        pod::property!(
            FormatProperties::VideoFramerate,
            Choice,
            Range,
            Fraction,
            Fraction { num: 30, denom: 1 },
            Fraction { num: 0, denom: 1 },
            Fraction { num: 240, denom: 1 }
        ),
    );
    if with_modifiers {
        let alternatives = dmabuf_modifiers();
        obj.properties.push(Property {
            key: FormatProperties::VideoModifier.as_raw(),
            flags: PropertyFlags::MANDATORY | PropertyFlags::DONT_FIXATE,
            value: pod::Value::Choice(ChoiceValue::Long(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Enum {
                    default: alternatives[0],
                    alternatives,
                },
            ))),
        });
    }
    obj
}

/// AMD DRM format modifiers are parameterized rather than enumerated in
/// drm_fourcc.h; build the handful of codes that cover common GFX9/GFX10
/// tilings, with and without DCC compression.
mod amd {
    const VENDOR: u64 = 0x02;

    pub const TILE_VER_GFX9: u64 = 1;
    pub const TILE_VER_GFX10: u64 = 2;
    pub const TILE_VER_GFX10_RBPLUS: u64 = 3;
    pub const TILE_GFX9_64K_S: u64 = 9;
    pub const TILE_GFX9_64K_R_X: u64 = 27;

    const TILE_VERSION_SHIFT: u64 = 0;
    const TILE_SHIFT: u64 = 8;
    const DCC_SHIFT: u64 = 13;
    const DCC_RETILE_SHIFT: u64 = 14;
    const DCC_INDEPENDENT_128B_SHIFT: u64 = 17;
    const DCC_MAX_COMPRESSED_BLOCK_SHIFT: u64 = 18;
    const DCC_CONSTANT_ENCODE_SHIFT: u64 = 20;
    const PIPE_XOR_BITS_SHIFT: u64 = 21;
    const PACKERS_SHIFT: u64 = 27;
    const DCC_BLOCK_128B: u64 = 1;

    pub const fn tiled(tile_version: u64, tile: u64) -> u64 {
        (VENDOR << 56) | (tile_version << TILE_VERSION_SHIFT) | (tile << TILE_SHIFT)
    }

    pub const fn tiled_xor(tile_version: u64, tile: u64, pipe_xor_bits: u64, packers: u64) -> u64 {
        tiled(tile_version, tile) | (pipe_xor_bits << PIPE_XOR_BITS_SHIFT) | (packers << PACKERS_SHIFT)
    }

    pub const fn tiled_dcc(
        tile_version: u64,
        tile: u64,
        dcc_retile: u64,
        pipe_xor_bits: u64,
        packers: u64,
    ) -> u64 {
        tiled_xor(tile_version, tile, pipe_xor_bits, packers)
            | (1 << DCC_SHIFT)
            | (dcc_retile << DCC_RETILE_SHIFT)
            | (1 << DCC_INDEPENDENT_128B_SHIFT)
            | (DCC_BLOCK_128B << DCC_MAX_COMPRESSED_BLOCK_SHIFT)
            | (1 << DCC_CONSTANT_ENCODE_SHIFT)
    }
}

/// Modifiers offered for zero-copy negotiation: linear, the common Intel
/// tilings, common AMD tilings, and INVALID as the implicit-modifier
/// fallback.
fn dmabuf_modifiers() -> Vec<i64> {
    use drm_fourcc::DrmModifier;

    let mut modifiers: Vec<i64> = [
        DrmModifier::Linear,
        DrmModifier::I915_x_tiled,
        DrmModifier::I915_y_tiled,
        DrmModifier::I915_yf_tiled,
        DrmModifier::I915_y_tiled_ccs,
        DrmModifier::I915_yf_tiled_ccs,
    ]
    .into_iter()
    .map(|m| u64::from(m) as i64)
    .collect();

    modifiers.push(amd::tiled(0, 0) as i64);
    modifiers.push(amd::tiled(amd::TILE_VER_GFX9, amd::TILE_GFX9_64K_S) as i64);
    modifiers.push(amd::tiled(amd::TILE_VER_GFX10, amd::TILE_GFX9_64K_S) as i64);
    modifiers.push(amd::tiled_xor(amd::TILE_VER_GFX10_RBPLUS, amd::TILE_GFX9_64K_R_X, 4, 3) as i64);
    modifiers
        .push(amd::tiled_dcc(amd::TILE_VER_GFX10_RBPLUS, amd::TILE_GFX9_64K_R_X, 1, 4, 3) as i64);
    modifiers
        .push(amd::tiled_dcc(amd::TILE_VER_GFX10_RBPLUS, amd::TILE_GFX9_64K_R_X, 0, 4, 3) as i64);
    modifiers.push(u64::from(DrmModifier::Invalid) as i64);
    modifiers
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm_fourcc::DrmModifier;

    #[test]
    fn modifier_menu_prefers_linear_and_falls_back_to_invalid() {
        let mods = dmabuf_modifiers();
        assert_eq!(mods[0], u64::from(DrmModifier::Linear) as i64);
        assert_eq!(*mods.last().unwrap(), u64::from(DrmModifier::Invalid) as i64);
    }

    #[test]
    fn modifier_menu_has_no_duplicates() {
        let mods = dmabuf_modifiers();
        let mut deduped = mods.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), mods.len());
    }

    #[test]
    fn amd_codes_carry_the_vendor_tag() {
        for m in [
            amd::tiled(amd::TILE_VER_GFX9, amd::TILE_GFX9_64K_S),
            amd::tiled_xor(amd::TILE_VER_GFX10_RBPLUS, amd::TILE_GFX9_64K_R_X, 4, 3),
            amd::tiled_dcc(amd::TILE_VER_GFX10_RBPLUS, amd::TILE_GFX9_64K_R_X, 1, 4, 3),
        ] {
            assert_eq!(m >> 56, 0x02);
        }
    }

    #[test]
    fn cursor_meta_size_scales_with_bitmap() {
        let base = cursor_meta_size(1, 1);
        assert_eq!(cursor_meta_size(2, 1) - base, 4);
        assert!(cursor_meta_size(256, 256) > cursor_meta_size(24, 24));
    }

    #[test]
    fn format_menu_offers_modifiers_only_when_asked() {
        let with = video_format_obj(true);
        let without = video_format_obj(false);
        assert_eq!(with.properties.len(), without.properties.len() + 1);
        let modifier_prop = with
            .properties
            .iter()
            .find(|p| p.key == FormatProperties::VideoModifier.as_raw())
            .expect("modifier property present");
        assert!(modifier_prop.flags.contains(PropertyFlags::MANDATORY));
        assert!(modifier_prop.flags.contains(PropertyFlags::DONT_FIXATE));
    }
}
