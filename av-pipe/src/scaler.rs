use ffmpeg_next::ffi::{
    av_buffersrc_parameters_alloc, av_buffersrc_parameters_set, av_free, AVPixelFormat,
};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::{filter, frame};

use crate::error::{AvError, Result};
use crate::frame::VideoFrame;
use crate::hw::HwDeviceCtx;
use crate::worker::{Stage, Worker, WorkerHandle};
use crate::Rect;

/// Input queue depth of the scaler worker. Small enough to bound capture
/// latency, large enough to absorb typical GPU-call jitter.
pub const SCALER_QUEUE_DEPTH: usize = 4;

/// Scales and color-converts frames to NV12 on the GPU.
///
/// DRM PRIME input frames are mapped directly to VA-API memory (`hwmap`);
/// host-memory frames are uploaded first (`hwupload`). Either way the graph
/// ends in `scale_vaapi` targeting the requested size, NV12, full range.
pub struct VaapiScaler {
    graph: filter::Graph,
    rewrite_bgra: bool,
}

// The filter graph is only ever driven from the worker thread after
// construction; the raw AVFilterGraph pointers are not shared.
unsafe impl Send for VaapiScaler {}

impl VaapiScaler {
    pub fn new(
        source: Rect,
        source_format: Pixel,
        target: Rect,
        drm_device: &HwDeviceCtx,
        vaapi_device: &HwDeviceCtx,
        input_is_dmabuf: bool,
    ) -> Result<Self> {
        let mut graph = filter::Graph::new();
        let hw_filter = if input_is_dmabuf { "hwmap" } else { "hwupload" };

        let mut source_format = source_format;
        if !input_is_dmabuf && source_format == Pixel::BGRA {
            // libva-intel rejects BGRA on the upload path but accepts the
            // same layout as BGR0, even though it imports BGRA via DMA-BUF.
            source_format = Pixel::BGRZ;
        }

        let in_format = if input_is_dmabuf {
            AVPixelFormat::AV_PIX_FMT_DRM_PRIME
        } else {
            AVPixelFormat::from(source_format)
        };
        let args = format!(
            "video_size={}x{}:pix_fmt={}:time_base=1/1000000:pixel_aspect=1/1",
            source.w, source.h, in_format as i32
        );
        let buffersrc = filter::find("buffer")
            .ok_or_else(|| AvError::Other("buffer filter not found".into()))?;
        graph
            .add(&buffersrc, "in", &args)
            .map_err(AvError::scale("creating filter graph input"))?;

        let buffersink = filter::find("buffersink")
            .ok_or_else(|| AvError::Other("buffersink filter not found".into()))?;
        graph
            .add(&buffersink, "out", "")
            .map_err(AvError::scale("creating filter graph output"))?;
        graph.get("out").unwrap().set_pixel_format(Pixel::VAAPI);

        if input_is_dmabuf {
            // DRM PRIME frames need a hardware frames context that associates
            // them with the DRM device before they can be mapped.
            let frames = drm_device.create_frame_ctx(Pixel::DRM_PRIME, source_format, source)?;
            unsafe {
                let params = av_buffersrc_parameters_alloc();
                (*params).hw_frames_ctx = frames.as_ptr();
                let ret = av_buffersrc_parameters_set(
                    graph.get("in").unwrap().as_mut_ptr(),
                    params,
                );
                av_free(params as *mut _);
                if ret < 0 {
                    return Err(AvError::scale("attaching DRM frames context")(
                        ffmpeg_next::Error::from(ret),
                    ));
                }
            }
        }

        let description = format!(
            "{},scale_vaapi=w={}:h={}:format=nv12:out_range=full",
            hw_filter, target.w, target.h
        );
        graph
            .output("in", 0)
            .map_err(AvError::scale("connecting filter graph input"))?
            .input("out", 0)
            .map_err(AvError::scale("connecting filter graph output"))?
            .parse(&description)
            .map_err(AvError::scale("parsing filter graph"))?;

        // the upload/map node needs the VA-API device to move frames onto it
        let hw_filter_name = format!("Parsed_{hw_filter}_0");
        let mut hw_node = graph
            .get(&hw_filter_name)
            .ok_or_else(|| AvError::Other(format!("{hw_filter_name} missing from graph")))?;
        unsafe {
            (*hw_node.as_mut_ptr()).hw_device_ctx = vaapi_device.ref_raw();
        }

        graph
            .validate()
            .map_err(AvError::scale("configuring filter graph"))?;

        Ok(Self {
            graph,
            rewrite_bgra: !input_is_dmabuf,
        })
    }

    /// Run one frame through the graph, handing each produced GPU frame to
    /// `on_scaled`. The graph may buffer, so zero or more outputs per input.
    pub fn scale(
        &mut self,
        frame: VideoFrame,
        on_scaled: &mut dyn FnMut(VideoFrame) -> Result<()>,
    ) -> Result<()> {
        self.graph
            .get("in")
            .unwrap()
            .source()
            .add(frame.inner())
            .map_err(AvError::scale("inserting frame into filter"))?;
        self.drain(on_scaled)
    }

    /// Flush the graph and drain any remaining frames.
    pub fn flush(&mut self, on_scaled: &mut dyn FnMut(VideoFrame) -> Result<()>) -> Result<()> {
        self.graph
            .get("in")
            .unwrap()
            .source()
            .flush()
            .map_err(AvError::scale("flushing filter"))?;
        self.drain(on_scaled)
    }

    fn drain(&mut self, on_scaled: &mut dyn FnMut(VideoFrame) -> Result<()>) -> Result<()> {
        loop {
            let mut scaled = frame::Video::empty();
            match self.graph.get("out").unwrap().sink().frame(&mut scaled) {
                Ok(()) => on_scaled(VideoFrame::from(scaled))?,
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    break;
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(e) => return Err(AvError::scale("extracting frame from filter")(e)),
            }
        }
        Ok(())
    }
}

struct ScaleWork {
    scaler: VaapiScaler,
    on_scaled: Box<dyn FnMut(VideoFrame) -> Result<()> + Send>,
}

impl Stage for ScaleWork {
    type Input = VideoFrame;

    fn process(&mut self, input: VideoFrame) -> Result<()> {
        self.scaler.scale(input, &mut self.on_scaled)
    }

    fn finish(&mut self) -> Result<()> {
        self.scaler.flush(&mut self.on_scaled)
    }
}

/// The scaler behind its worker thread and bounded input queue.
pub struct ScalerStage {
    worker: Worker<VideoFrame>,
    rewrite_bgra: bool,
}

impl ScalerStage {
    pub fn spawn<F>(scaler: VaapiScaler, on_scaled: F) -> Self
    where
        F: FnMut(VideoFrame) -> Result<()> + Send + 'static,
    {
        let rewrite_bgra = scaler.rewrite_bgra;
        let worker = Worker::spawn(
            "vaapi-scaler",
            SCALER_QUEUE_DEPTH,
            ScaleWork {
                scaler,
                on_scaled: Box::new(on_scaled),
            },
        );
        Self { worker, rewrite_bgra }
    }

    /// Queue a frame for scaling, or drop it when the queue is full.
    /// A failure from the worker thread is re-raised here.
    pub fn enqueue(&self, mut frame: VideoFrame) -> Result<()> {
        if self.rewrite_bgra && frame.format() == Pixel::BGRA {
            // keep the frame format in line with the graph's declared input
            unsafe {
                (*frame.inner_mut().as_mut_ptr()).format =
                    AVPixelFormat::AV_PIX_FMT_BGR0 as i32;
            }
        }
        self.worker.enqueue(frame)
    }

    pub fn handle(&self) -> WorkerHandle<VideoFrame> {
        self.worker.handle()
    }
}
