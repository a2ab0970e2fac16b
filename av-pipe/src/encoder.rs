use ffmpeg_next::ffi::{AVColorRange, AVRational};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{codec, Dictionary, Rational};

use crate::error::{AvError, Result};
use crate::frame::VideoFrame;
use crate::hw::HwDeviceCtx;
use crate::packet::EncodedPacket;
use crate::worker::{Stage, Worker, WorkerHandle};
use crate::Rect;

/// Input queue depth of the encoder worker.
pub const ENCODER_QUEUE_DEPTH: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
    Vp9,
}

impl Codec {
    pub fn encoder_name(self) -> &'static str {
        match self {
            Codec::H264 => "h264_vaapi",
            Codec::Hevc => "hevc_vaapi",
            Codec::Vp9 => "vp9_vaapi",
        }
    }

    pub fn codec_id(self) -> codec::Id {
        match self {
            Codec::H264 => codec::Id::H264,
            Codec::Hevc => codec::Id::HEVC,
            Codec::Vp9 => codec::Id::VP9,
        }
    }
}

/// A VA-API video encoder bound to an NV12 GPU frame pool.
///
/// Timestamps are in microseconds (time base 1/1_000_000) with a variable
/// frame rate; extradata goes out-of-band for the muxer (GLOBAL_HEADER).
pub struct VaapiEncoder {
    encoder: ffmpeg_next::encoder::Video,
    kind: Codec,
    time_base: Rational,
}

impl VaapiEncoder {
    pub fn new(
        target: Rect,
        kind: Codec,
        options: Dictionary,
        vaapi_device: &HwDeviceCtx,
    ) -> Result<Self> {
        let codec = ffmpeg_next::encoder::find_by_name(kind.encoder_name()).ok_or_else(|| {
            AvError::Other(format!("no encoder named {:?} found", kind.encoder_name()))
        })?;

        let frames = vaapi_device.create_frame_ctx(Pixel::VAAPI, Pixel::NV12, target)?;

        let context = codec::Context::new_with_codec(codec);
        let mut encoder = context
            .encoder()
            .video()
            .map_err(AvError::gpu_init("opening video encoder context"))?;
        encoder.set_width(target.w);
        encoder.set_height(target.h);
        encoder.set_format(Pixel::VAAPI);
        encoder.set_time_base(Rational(1, 1_000_000));
        encoder.set_frame_rate(Some(Rational(0, 1)));
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        unsafe {
            let raw = encoder.as_mut_ptr();
            (*raw).sample_aspect_ratio = AVRational { num: 1, den: 1 };
            (*raw).color_range = AVColorRange::AVCOL_RANGE_JPEG;
            (*raw).hw_frames_ctx = frames.ref_raw();
        }

        let opened = encoder
            .open_with(options)
            .map_err(AvError::gpu_init(format!("opening {}", kind.encoder_name())))?;
        let time_base: Rational = unsafe { (*opened.0.as_ptr()).time_base.into() };

        Ok(Self {
            encoder: opened,
            kind,
            time_base,
        })
    }

    pub fn kind(&self) -> Codec {
        self.kind
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// The opened codec, for copying parameters into an output stream.
    pub fn codec(&self) -> &ffmpeg_next::encoder::Video {
        &self.encoder
    }

    /// Submit one GPU frame and drain every packet that became ready.
    pub fn encode(
        &mut self,
        frame: VideoFrame,
        on_encoded: &mut dyn FnMut(EncodedPacket) -> Result<()>,
    ) -> Result<()> {
        self.encoder
            .send_frame(frame.inner())
            .map_err(AvError::encode("submitting frame"))?;
        self.drain(on_encoded)
    }

    /// Signal end of stream and drain the delayed packets.
    pub fn finish(
        &mut self,
        on_encoded: &mut dyn FnMut(EncodedPacket) -> Result<()>,
    ) -> Result<()> {
        self.encoder
            .send_eof()
            .map_err(AvError::encode("submitting end of stream"))?;
        self.drain(on_encoded)
    }

    fn drain(&mut self, on_encoded: &mut dyn FnMut(EncodedPacket) -> Result<()>) -> Result<()> {
        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    log::trace!("packet ready, pts: {:?}", packet.pts());
                    on_encoded(EncodedPacket::from((packet, self.time_base)))?;
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    break;
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(e) => return Err(AvError::encode("extracting packet from encoder")(e)),
            }
        }
        Ok(())
    }
}

struct EncodeWork {
    encoder: VaapiEncoder,
    on_encoded: Box<dyn FnMut(EncodedPacket) -> Result<()> + Send>,
}

impl Stage for EncodeWork {
    type Input = VideoFrame;

    fn process(&mut self, input: VideoFrame) -> Result<()> {
        self.encoder.encode(input, &mut self.on_encoded)
    }

    fn finish(&mut self) -> Result<()> {
        self.encoder.finish(&mut self.on_encoded)
    }
}

/// The encoder behind its worker thread and bounded input queue.
///
/// `on_encoded` typically owns the muxer, which ties the muxer's lifetime to
/// this stage: the trailer is written when the worker winds down.
pub struct EncoderStage {
    worker: Worker<VideoFrame>,
}

impl EncoderStage {
    pub fn spawn<F>(encoder: VaapiEncoder, on_encoded: F) -> Self
    where
        F: FnMut(EncodedPacket) -> Result<()> + Send + 'static,
    {
        let worker = Worker::spawn(
            "vaapi-encoder",
            ENCODER_QUEUE_DEPTH,
            EncodeWork {
                encoder,
                on_encoded: Box::new(on_encoded),
            },
        );
        Self { worker }
    }

    pub fn enqueue(&self, frame: VideoFrame) -> Result<()> {
        self.worker.enqueue(frame)
    }

    pub fn handle(&self) -> WorkerHandle<VideoFrame> {
        self.worker.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_names_are_vaapi_variants() {
        assert_eq!(Codec::H264.encoder_name(), "h264_vaapi");
        assert_eq!(Codec::Hevc.encoder_name(), "hevc_vaapi");
        assert_eq!(Codec::Vp9.encoder_name(), "vp9_vaapi");
    }

    #[test]
    fn codec_ids_match() {
        assert_eq!(Codec::H264.codec_id(), codec::Id::H264);
        assert_eq!(Codec::Hevc.codec_id(), codec::Id::HEVC);
        assert_eq!(Codec::Vp9.codec_id(), codec::Id::VP9);
    }
}
