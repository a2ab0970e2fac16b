/// Registers all FFmpeg components. Call once at startup before opening any
/// device, filter graph or encoder.
pub fn init() -> Result<()> {
    ffmpeg_next::init().map_err(AvError::Init)
}

/// Width and height in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub w: u32,
    pub h: u32,
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

pub mod encoder;
pub mod error;
pub mod frame;
pub mod hw;
pub mod muxer;
pub mod packet;
pub mod queue;
pub mod scaler;
pub mod worker;

pub use encoder::{Codec, EncoderStage, VaapiEncoder, ENCODER_QUEUE_DEPTH};
pub use error::{AvError, Result};
pub use frame::VideoFrame;
pub use hw::HwDeviceCtx;
pub use muxer::Muxer;
pub use packet::EncodedPacket;
pub use queue::BoundedQueue;
pub use scaler::{ScalerStage, VaapiScaler, SCALER_QUEUE_DEPTH};
pub use worker::{Stage, Worker, WorkerHandle};
