use std::ffi::CString;

use ffmpeg_next::ffi::{
    av_strdup, avformat_alloc_output_context2, avio_open, AVCodecParameters, AVPixelFormat,
    AVFMT_NOFILE, AVIO_FLAG_WRITE,
};
use ffmpeg_next::format::context::Output;
use ffmpeg_next::Rational;

use crate::encoder::VaapiEncoder;
use crate::error::{AvError, Result};
use crate::packet::EncodedPacket;

/// Writes encoded packets into a container (file or network URL).
///
/// The container header is written during construction; the trailer on drop.
/// Packets arrive in the encoder's time base and are rescaled to the output
/// stream's. Runs synchronously inside the encoder worker.
pub struct Muxer {
    octx: Output,
    stream_index: usize,
    codec_time_base: Rational,
    header_written: bool,
    trailer_written: bool,
    last_dts: Option<i64>,
}

/// Allocate an output context for the named container format without opening
/// any byte stream. Header-only muxers (AVFMT_NOFILE, e.g. rtsp) open the URL
/// themselves in write_header.
fn alloc_output(url: &str, format: &str) -> Result<Output> {
    let url_c = CString::new(url)
        .map_err(|_| AvError::Other(format!("output url contains NUL: {url:?}")))?;
    let format_c = CString::new(format)
        .map_err(|_| AvError::Other(format!("container format contains NUL: {format:?}")))?;
    unsafe {
        let mut ptr = std::ptr::null_mut();
        match avformat_alloc_output_context2(
            &mut ptr,
            std::ptr::null_mut(),
            format_c.as_ptr(),
            url_c.as_ptr(),
        ) {
            0 => Ok(Output::wrap(ptr)),
            e => Err(AvError::mux_init(format!(
                "allocating output context for {format:?}"
            ))(ffmpeg_next::Error::from(e))),
        }
    }
}

impl Muxer {
    pub fn new(url: &str, container_format: &str, encoder: &VaapiEncoder) -> Result<Self> {
        let mut octx = alloc_output(url, container_format)?;

        let nofile = unsafe { ((*(*octx.as_ptr()).oformat).flags & AVFMT_NOFILE as i32) != 0 };
        let url_c = CString::new(url)
            .map_err(|_| AvError::Other(format!("output url contains NUL: {url:?}")))?;
        if nofile {
            // the muxer opens the URL itself; it only needs to know it
            unsafe {
                (*octx.as_mut_ptr()).url = av_strdup(url_c.as_ptr());
            }
        } else {
            unsafe {
                let ret = avio_open(
                    &mut (*octx.as_mut_ptr()).pb,
                    url_c.as_ptr(),
                    AVIO_FLAG_WRITE as i32,
                );
                if ret < 0 {
                    return Err(AvError::mux_init(format!("opening output {url:?}"))(
                        ffmpeg_next::Error::from(ret),
                    ));
                }
            }
        }

        let stream_index;
        {
            let mut stream = octx
                .add_stream(ffmpeg_next::encoder::find(encoder.kind().codec_id()))
                .map_err(AvError::mux_init("adding video stream"))?;
            stream.set_parameters(encoder.codec());
            stream_index = stream.index();
            // VA-API/NV12 surfaces carry YUV420P content as far as the
            // container is concerned
            unsafe {
                let params = stream.parameters().as_ptr() as *mut AVCodecParameters;
                (*params).format = AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            ffmpeg_next::format::context::output::dump(&octx, 0, Some(url));
        }

        octx.write_header()
            .map_err(AvError::mux_init("writing container header"))?;

        Ok(Self {
            octx,
            stream_index,
            codec_time_base: encoder.time_base(),
            header_written: true,
            trailer_written: false,
            last_dts: None,
        })
    }

    pub fn write_packet(&mut self, packet: &mut EncodedPacket) -> Result<()> {
        let p = packet.get_mut();
        p.set_stream(self.stream_index);
        p.set_position(-1);
        let out_time_base = self.octx.stream(self.stream_index).unwrap().time_base();
        p.rescale_ts(self.codec_time_base, out_time_base);

        // muxers require monotonically increasing DTS
        let dts = p.dts().unwrap_or(0);
        let new_dts = next_monotonic_dts(self.last_dts, dts);
        if new_dts != dts {
            p.set_dts(Some(new_dts));
            if p.pts().map(|pts| pts < new_dts).unwrap_or(true) {
                p.set_pts(Some(new_dts));
            }
        }
        self.last_dts = Some(new_dts);

        log::debug!("write_packet: pts={:?}, dts={:?}", p.pts(), p.dts());
        p.write_interleaved(&mut self.octx).map_err(AvError::MuxWrite)
    }

    /// Write the trailer once. Safe to call after partial initialization and
    /// called again from drop.
    pub fn finish(&mut self) -> Result<()> {
        if self.header_written && !self.trailer_written {
            self.trailer_written = true;
            self.octx.write_trailer().map_err(AvError::MuxWrite)?;
        }
        Ok(())
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("writing container trailer failed: {e}");
        }
    }
}

fn next_monotonic_dts(last: Option<i64>, dts: i64) -> i64 {
    match last {
        Some(last) if dts <= last => last + 1,
        _ => dts,
    }
}

#[cfg(test)]
mod tests {
    use super::next_monotonic_dts;

    #[test]
    fn first_dts_passes_through() {
        assert_eq!(next_monotonic_dts(None, 0), 0);
        assert_eq!(next_monotonic_dts(None, -7), -7);
    }

    #[test]
    fn increasing_dts_is_untouched() {
        assert_eq!(next_monotonic_dts(Some(10), 11), 11);
        assert_eq!(next_monotonic_dts(Some(10), 500), 500);
    }

    #[test]
    fn stalled_or_backwards_dts_is_bumped() {
        assert_eq!(next_monotonic_dts(Some(10), 10), 11);
        assert_eq!(next_monotonic_dts(Some(10), 3), 11);
    }
}
