use av_pipe::{Codec, Rect};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Record a Wayland screen through PipeWire into a VA-API encoded container", long_about = None)]
pub struct Args {
    /// ask the compositor to embed the cursor into the captured frames
    #[clap(short = 'c', long = "cursor")]
    pub cursor: bool,

    /// container format recognized by ffmpeg (e.g. matroska, mpegts, rtsp)
    #[clap(short = 'f', long = "format")]
    pub format: String,

    /// output path or URL
    #[clap(short = 'o', long = "output")]
    pub output: String,

    /// DRM render node, e.g. /dev/dri/renderD128
    #[clap(short = 'd', long = "device")]
    pub device: String,

    /// hardware encoder to use
    #[clap(long, value_enum, default_value_t)]
    pub codec: CodecArg,

    /// extra codec option as key=value, may be given multiple times
    /// (e.g. --codec-option low_power=1)
    #[clap(long = "codec-option", value_parser = parse_key_value)]
    pub codec_options: Vec<(String, String)>,

    /// encoded video size, WxH
    #[clap(long, value_parser = parse_size, default_value = "1920x1080")]
    pub size: Rect,

    /// enable verbose logging, including libav internals
    #[clap(short = 'v', long)]
    pub verbose: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default)]
pub enum CodecArg {
    #[default]
    H264,
    Hevc,
    Vp9,
}

impl From<CodecArg> for Codec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::H264 => Codec::H264,
            CodecArg::Hevc => Codec::Hevc,
            CodecArg::Vp9 => Codec::Vp9,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid codec option {s:?}, expected key=value"))?;
    if key.is_empty() {
        return Err(format!("invalid codec option {s:?}, empty key"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_size(s: &str) -> Result<Rect, String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("invalid size {s:?}, expected WxH"))?;
    let w: u32 = w.parse().map_err(|_| format!("invalid width {w:?}"))?;
    let h: u32 = h.parse().map_err(|_| format!("invalid height {h:?}"))?;
    if w == 0 || h == 0 {
        return Err("size dimensions must be nonzero".into());
    }
    Ok(Rect { w, h })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("wayrec").chain(args.iter().copied()))
    }

    #[test]
    fn all_required_flags_parse() {
        let args = parse(&["-f", "matroska", "-o", "out.mkv", "-d", "/dev/dri/renderD128"]).unwrap();
        assert_eq!(args.format, "matroska");
        assert_eq!(args.output, "out.mkv");
        assert_eq!(args.device, "/dev/dri/renderD128");
        assert!(!args.cursor);
        assert_eq!(args.size, Rect { w: 1920, h: 1080 });
    }

    #[test]
    fn missing_required_flag_is_rejected() {
        assert!(parse(&["-f", "matroska", "-o", "out.mkv"]).is_err());
        assert!(parse(&["-o", "out.mkv", "-d", "/dev/dri/renderD128"]).is_err());
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(parse(&[
            "-f", "matroska", "-o", "out.mkv", "-d", "/dev/dri/renderD128", "--frobnicate"
        ])
        .is_err());
    }

    #[test]
    fn codec_options_accumulate() {
        let args = parse(&[
            "-f",
            "matroska",
            "-o",
            "out.mkv",
            "-d",
            "/dev/dri/renderD128",
            "--codec-option",
            "low_power=1",
            "--codec-option",
            "level=30",
        ])
        .unwrap();
        assert_eq!(
            args.codec_options,
            vec![
                ("low_power".to_string(), "1".to_string()),
                ("level".to_string(), "30".to_string())
            ]
        );
        assert!(parse_key_value("no-equals").is_err());
        assert!(parse_key_value("=value").is_err());
    }

    #[test]
    fn size_parsing_rejects_zero_dimensions() {
        assert!(parse_size("1920x1080").is_ok());
        assert!(parse_size("0x1080").is_err());
        assert!(parse_size("1920x0").is_err());
        assert!(parse_size("1920").is_err());
    }
}
