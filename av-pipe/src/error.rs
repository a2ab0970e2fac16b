use thiserror::Error;

pub type Result<T> = std::result::Result<T, AvError>;

#[derive(Debug, Error)]
pub enum AvError {
    #[error("ffmpeg init failed: {0}")]
    Init(#[source] ffmpeg_next::Error),

    #[error("GPU init failed: {context}: {source}")]
    GpuInit {
        context: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("scaling failed: {context}: {source}")]
    Scale {
        context: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("encoding failed: {context}: {source}")]
    Encode {
        context: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("muxer setup failed: {context}: {source}")]
    MuxInit {
        context: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("container write failed: {0}")]
    MuxWrite(#[source] ffmpeg_next::Error),

    #[error("{0}")]
    Other(String),
}

impl AvError {
    pub(crate) fn gpu_init(context: impl Into<String>) -> impl FnOnce(ffmpeg_next::Error) -> AvError {
        let context = context.into();
        move |source| AvError::GpuInit { context, source }
    }

    pub(crate) fn scale(context: impl Into<String>) -> impl FnOnce(ffmpeg_next::Error) -> AvError {
        let context = context.into();
        move |source| AvError::Scale { context, source }
    }

    pub(crate) fn encode(context: impl Into<String>) -> impl FnOnce(ffmpeg_next::Error) -> AvError {
        let context = context.into();
        move |source| AvError::Encode { context, source }
    }

    pub(crate) fn mux_init(context: impl Into<String>) -> impl FnOnce(ffmpeg_next::Error) -> AvError {
        let context = context.into();
        move |source| AvError::MuxInit { context, source }
    }
}
