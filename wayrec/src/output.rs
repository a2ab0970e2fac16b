//! The downstream half of the pipeline: DRM/VA-API devices, the scaler and
//! encoder workers, and the muxer wired behind the encoder.
//!
//! Capture frames are wrapped into ffmpeg frames whose buffer refs carry the
//! release hook, so a frame dropped anywhere downstream hands its PipeWire
//! buffer back to the stream's pool.

use std::ffi::c_void;

use av_pipe::{
    Codec, EncoderStage, HwDeviceCtx, Muxer, Rect, ScalerStage, VaapiEncoder, VaapiScaler,
    VideoFrame,
};
use ffmpeg_next::ffi::{
    av_buffer_create, AVDRMFrameDescriptor, AVPixelFormat, AV_BUFFER_FLAG_READONLY,
};
use ffmpeg_next::Dictionary;

use crate::capture::{DmaBufFrame, MemoryFrame, PixelFormat};

pub struct SinkConfig<'a> {
    pub source: Rect,
    pub source_format: PixelFormat,
    pub source_is_dmabuf: bool,
    pub target: Rect,
    pub codec: Codec,
    pub codec_options: &'a [(String, String)],
    pub device_path: &'a str,
    pub output_url: &'a str,
    pub container_format: &'a str,
}

/// The `scaler -> encoder -> muxer` chain for one connected stream.
///
/// Built leaves-first: the muxer needs the opened encoder's parameters, the
/// encoder worker owns the muxer, the scaler feeds the encoder. Dropping the
/// sink unwinds in the same dependency order (fields drop top to bottom):
/// scaler, then encoder (which writes the trailer through the muxer it
/// owns), then the device handles.
pub struct CaptureSink {
    scaler: ScalerStage,
    _encoder: EncoderStage,
    _vaapi_device: HwDeviceCtx,
    _drm_device: HwDeviceCtx,
}

impl CaptureSink {
    pub fn new(config: &SinkConfig) -> anyhow::Result<Self> {
        let drm_device = HwDeviceCtx::new_drm(config.device_path)?;
        let vaapi_device = drm_device.derive_vaapi()?;

        let mut options = Dictionary::new();
        for (key, value) in config.codec_options {
            options.set(key, value);
        }
        let encoder = VaapiEncoder::new(config.target, config.codec, options, &vaapi_device)?;
        let mut muxer = Muxer::new(config.output_url, config.container_format, &encoder)?;
        let encoder_stage =
            EncoderStage::spawn(encoder, move |mut packet| muxer.write_packet(&mut packet));

        let scaler = VaapiScaler::new(
            config.source,
            config.source_format.to_av(),
            config.target,
            &drm_device,
            &vaapi_device,
            config.source_is_dmabuf,
        )?;
        let encoder_handle = encoder_stage.handle();
        let scaler_stage = ScalerStage::spawn(scaler, move |frame| encoder_handle.enqueue(frame));

        Ok(Self {
            scaler: scaler_stage,
            _encoder: encoder_stage,
            _vaapi_device: vaapi_device,
            _drm_device: drm_device,
        })
    }

    /// Submit one captured frame. Drops it silently when the scaler queue is
    /// full; re-raises a pending worker failure.
    pub fn push_frame(&self, frame: VideoFrame) -> av_pipe::Result<()> {
        self.scaler.enqueue(frame)
    }
}

unsafe extern "C" fn release_memory_frame(opaque: *mut c_void, _data: *mut u8) {
    drop(Box::from_raw(opaque as *mut MemoryFrame));
}

/// Wrap a mapped PipeWire frame without copying its pixels. The frame's
/// buffer ref owns the [`MemoryFrame`]; freeing it runs the release hook.
pub fn wrap_memory_frame(frame: MemoryFrame) -> VideoFrame {
    let mut av = ffmpeg_next::frame::Video::empty();
    unsafe {
        let raw = av.as_mut_ptr();
        (*raw).width = frame.width as i32;
        (*raw).height = frame.height as i32;
        (*raw).format = AVPixelFormat::from(frame.format.to_av()) as i32;
        (*raw).pts = frame.pts.as_micros() as i64;
        (*raw).data[0] = frame.memory.add(frame.offset);
        (*raw).linesize[0] = frame.stride as i32;
        let base = frame.memory;
        let size = frame.size;
        let owner = Box::into_raw(Box::new(frame));
        // a buffer ref that never frees the pixels it does not own
        (*raw).buf[0] = av_buffer_create(
            base,
            size as _,
            Some(release_memory_frame),
            owner as *mut c_void,
            AV_BUFFER_FLAG_READONLY as i32,
        );
    }
    VideoFrame::from(av)
}

struct DmaBufHolder {
    descriptor: AVDRMFrameDescriptor,
    _frame: DmaBufFrame,
}

unsafe extern "C" fn release_dmabuf_frame(opaque: *mut c_void, _data: *mut u8) {
    drop(Box::from_raw(opaque as *mut DmaBufHolder));
}

/// Wrap a DMA-BUF frame as a DRM PRIME ffmpeg frame. The descriptor and the
/// owning [`DmaBufFrame`] live in one allocation freed by the buffer ref.
pub fn wrap_dmabuf_frame(frame: DmaBufFrame) -> VideoFrame {
    let mut descriptor: AVDRMFrameDescriptor = unsafe { std::mem::zeroed() };
    descriptor.nb_objects = 1;
    descriptor.objects[0].fd = frame.drm_object.fd;
    descriptor.objects[0].size = frame.drm_object.total_size as _;
    descriptor.objects[0].format_modifier = frame.drm_object.modifier;
    descriptor.nb_layers = 1;
    descriptor.layers[0].format = frame.drm_format;
    descriptor.layers[0].nb_planes = frame.plane_count as i32;
    for i in 0..frame.plane_count as usize {
        descriptor.layers[0].planes[i].object_index = 0;
        descriptor.layers[0].planes[i].offset = frame.planes[i].offset as _;
        descriptor.layers[0].planes[i].pitch = frame.planes[i].pitch as _;
    }

    let width = frame.width;
    let height = frame.height;
    let pts = frame.pts;
    let holder = Box::into_raw(Box::new(DmaBufHolder {
        descriptor,
        _frame: frame,
    }));

    let mut av = ffmpeg_next::frame::Video::empty();
    unsafe {
        let raw = av.as_mut_ptr();
        (*raw).format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME as i32;
        (*raw).width = width as i32;
        (*raw).height = height as i32;
        (*raw).pts = pts.as_micros() as i64;
        (*raw).data[0] = &mut (*holder).descriptor as *mut AVDRMFrameDescriptor as *mut u8;
        (*raw).buf[0] = av_buffer_create(
            (*raw).data[0],
            0,
            Some(release_dmabuf_frame),
            holder as *mut c_void,
            AV_BUFFER_FLAG_READONLY as i32,
        );
    }
    VideoFrame::from(av)
}
