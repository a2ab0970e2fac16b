use ffmpeg_next::format::Pixel;

/// One video frame travelling through the pipeline, together with its pts
/// (microseconds, stream-relative, stored on the frame itself).
///
/// Before the scaler this wraps externally-allocated pixels (a mapped
/// PipeWire buffer or a DRM PRIME descriptor) whose release hook hangs off
/// the frame's buffer ref; after the scaler it wraps a VAAPI surface.
/// Ownership is exclusive: dropping the frame runs the release hook.
pub struct VideoFrame {
    inner: ffmpeg_next::frame::Video,
}

impl VideoFrame {
    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn format(&self) -> Pixel {
        self.inner.format()
    }

    pub fn pts(&self) -> Option<i64> {
        self.inner.pts()
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.inner.set_pts(pts);
    }

    pub fn inner(&self) -> &ffmpeg_next::frame::Video {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut ffmpeg_next::frame::Video {
        &mut self.inner
    }
}

impl From<ffmpeg_next::frame::Video> for VideoFrame {
    fn from(inner: ffmpeg_next::frame::Video) -> Self {
        Self { inner }
    }
}
