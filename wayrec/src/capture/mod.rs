//! PipeWire screen capture for Wayland.
//!
//! The compositor hands out frames through a PipeWire node obtained from the
//! xdg-desktop-portal. [`stream::PipeWireCapture`] runs the PipeWire main
//! loop on a dedicated thread (the bindings are not `Send`) and converts
//! stream callbacks into [`StreamEvent`]s behind a pollable eventfd.

pub mod stream;

use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

use ffmpeg_next::format::Pixel;
use pipewire::spa::param::video::VideoFormat;
use thiserror::Error;

pub use av_pipe::Rect;
pub use stream::PipeWireCapture;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("portal returned unusable screencast handles: {0}")]
    PortalBroken(String),

    #[error("PipeWire stream setup failed: {0}")]
    ProtocolFailed(String),

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(VideoFormat),

    #[error("stream already terminated")]
    StreamTerminated,
}

/// Connection handles for a compositor-shared screencast node, as returned
/// by the portal. The portal session itself must stay alive for as long as
/// the node is used.
pub struct ShareHandle {
    pub pipewire_fd: OwnedFd,
    pub node_id: u32,
}

/// Packed 32-bit layouts delivered by compositors. The X variants carry a
/// defined but ignored fourth channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra,
    Rgba,
    Bgrx,
    Rgbx,
}

impl PixelFormat {
    pub(crate) fn from_spa(format: VideoFormat) -> Result<Self, CaptureError> {
        match format {
            VideoFormat::BGRA => Ok(PixelFormat::Bgra),
            VideoFormat::RGBA => Ok(PixelFormat::Rgba),
            VideoFormat::BGRx => Ok(PixelFormat::Bgrx),
            VideoFormat::RGBx => Ok(PixelFormat::Rgbx),
            other => Err(CaptureError::UnsupportedFormat(other)),
        }
    }

    /// The ffmpeg pixel format describing this layout. The X variants map to
    /// the opaque-alpha formats.
    pub fn to_av(self) -> Pixel {
        match self {
            PixelFormat::Bgra => Pixel::BGRA,
            PixelFormat::Rgba => Pixel::RGBA,
            PixelFormat::Bgrx => Pixel::BGRZ,
            PixelFormat::Rgbx => Pixel::RGBZ,
        }
    }

    /// DRM fourcc of the same layout, as used in DMA-BUF frame descriptors.
    pub(crate) fn drm_format(self) -> u32 {
        use drm_fourcc::DrmFourcc;
        let fourcc = match self {
            PixelFormat::Bgra => DrmFourcc::Argb8888,
            PixelFormat::Bgrx => DrmFourcc::Xrgb8888,
            PixelFormat::Rgba => DrmFourcc::Abgr8888,
            PixelFormat::Rgbx => DrmFourcc::Xbgr8888,
        };
        fourcc as u32
    }
}

/// One frame whose pixels live in process-addressable memory mapped by
/// PipeWire. Exclusively owned; dropping it queues the underlying buffer
/// back to the stream's pool, exactly once.
pub struct MemoryFrame {
    pub width: u32,
    pub height: u32,
    /// stream-relative presentation timestamp
    pub pts: Duration,
    pub format: PixelFormat,
    /// base of the mapped region, valid until this frame is dropped
    pub memory: *mut u8,
    pub stride: usize,
    pub size: usize,
    /// offset from `memory` to the first pixel
    pub offset: usize,
    pub(crate) release: stream::BufferRelease,
}

// The mapped region stays valid until the release hook runs and is only
// accessed by the one downstream owner at a time.
unsafe impl Send for MemoryFrame {}

/// A single DRM object shared by all planes of a [`DmaBufFrame`].
#[derive(Clone, Copy, Debug)]
pub struct DrmObject {
    /// borrowed from the PipeWire buffer; valid until the frame is dropped
    pub fd: RawFd,
    pub total_size: usize,
    pub modifier: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DmaBufPlane {
    pub offset: usize,
    pub pitch: usize,
}

/// One frame whose pixels live in GPU-importable memory referenced by a file
/// descriptor. Ownership mirrors [`MemoryFrame`].
pub struct DmaBufFrame {
    pub width: u32,
    pub height: u32,
    pub pts: Duration,
    pub drm_format: u32,
    pub drm_object: DrmObject,
    /// 1 to 4; no DRM format uses more planes
    pub plane_count: u32,
    pub planes: [DmaBufPlane; 4],
    pub(crate) release: stream::BufferRelease,
}

unsafe impl Send for DmaBufFrame {}

/// Everything the capture stream reports to its consumer. Delivered through
/// [`PipeWireCapture::next_event`], signalled on the event fd.
pub enum StreamEvent {
    /// First event once the stream reaches the streaming state. Build the
    /// frame consumer from it: all subsequent frames have these properties.
    Connected {
        dimensions: Rect,
        format: PixelFormat,
        is_dmabuf: bool,
    },
    /// The stream left the streaming state or failed remotely. No more
    /// frames will follow.
    Disconnected,
    MemoryFrameReceived(MemoryFrame),
    DmaBufFrameReceived(DmaBufFrame),
}

/// Latest cursor metadata seen on the stream. Diagnostic only.
#[derive(Clone, Default)]
pub struct CursorState {
    pub position: (i32, i32),
    pub bitmap_size: (u32, u32),
    pub bitmap: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spa_format_mapping() {
        assert_eq!(PixelFormat::from_spa(VideoFormat::BGRA).unwrap(), PixelFormat::Bgra);
        assert_eq!(PixelFormat::from_spa(VideoFormat::RGBx).unwrap(), PixelFormat::Rgbx);
        assert!(matches!(
            PixelFormat::from_spa(VideoFormat::NV12),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn x_formats_declare_opaque_alpha() {
        assert_eq!(PixelFormat::Bgrx.to_av(), Pixel::BGRZ);
        assert_eq!(PixelFormat::Rgbx.to_av(), Pixel::RGBZ);
        assert_eq!(PixelFormat::Bgra.to_av(), Pixel::BGRA);
    }

    #[test]
    fn drm_formats_swap_channel_order() {
        // packed little-endian: BGRA in memory is ARGB as a DRM fourcc
        assert_eq!(PixelFormat::Bgra.drm_format(), drm_fourcc::DrmFourcc::Argb8888 as u32);
        assert_eq!(PixelFormat::Rgbx.drm_format(), drm_fourcc::DrmFourcc::Xbgr8888 as u32);
    }
}
