mod capture;
mod cli;
mod output;
mod portal;

use std::io::IsTerminal;
use std::os::fd::{AsFd, AsRawFd};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context as _;
use ashpd::desktop::screencast::CursorMode;
use clap::Parser;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use capture::{PipeWireCapture, ShareHandle, StreamEvent};
use cli::Args;
use output::{wrap_dmabuf_frame, wrap_memory_frame, CaptureSink, SinkConfig};

/// Logs the achieved capture rate once per second.
struct FpsCounter {
    last_report: Instant,
    frames: u32,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            last_report: Instant::now(),
            frames: 0,
        }
    }

    fn tick(&mut self) {
        self.frames += 1;
        if self.last_report.elapsed().as_secs() >= 1 {
            log::info!("{} fps", self.frames);
            self.last_report = Instant::now();
            self.frames = 0;
        }
    }
}

fn init_logging(verbose: bool) {
    env_logger::Builder::from_default_env()
        .filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            if std::io::stderr().is_terminal() {
                eprintln!("\x1b[1;31m{e:#}\x1b[0m");
            } else {
                eprintln!("{e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    av_pipe::init()?;
    if args.verbose {
        ffmpeg_next::log::set_level(ffmpeg_next::log::Level::Verbose);
    }

    // INT/TERM are blocked process-wide before any thread spawns and
    // delivered through a signalfd polled by the main loop
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
        .context("blocking INT/TERM failed")?;
    let mut signal_fd =
        SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("creating signalfd failed")?;

    let cursor_mode = if args.cursor {
        CursorMode::Embedded
    } else {
        CursorMode::Hidden
    };
    let session = match portal::request_screencast(cursor_mode)? {
        Some(session) => session,
        None => {
            println!("User cancelled request");
            return Ok(ExitCode::SUCCESS);
        }
    };
    log::info!(
        "shared screen: fd = {}, node = {}",
        session.pipewire_fd.as_raw_fd(),
        session.node_id
    );

    let portal_handle = session.handle;
    let capture = PipeWireCapture::connect(
        ShareHandle {
            pipewire_fd: session.pipewire_fd,
            node_id: session.node_id,
        },
        true,
    )?;

    let mut sink: Option<CaptureSink> = None;
    let mut fps = FpsCounter::new();
    let mut failure: Option<anyhow::Error> = None;
    let mut should_stop = false;

    while !should_stop {
        let mut fds = [
            PollFd::new(capture.event_fd(), PollFlags::POLLIN),
            PollFd::new(signal_fd.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                failure = Some(anyhow::anyhow!("poll failed: {e}"));
                break;
            }
        }
        let signal_ready = fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLIN));
        let events_ready = fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN));

        if signal_ready {
            if let Ok(Some(siginfo)) = signal_fd.read_signal() {
                if siginfo.ssi_signo == Signal::SIGINT as u32
                    || siginfo.ssi_signo == Signal::SIGTERM as u32
                {
                    log::info!("received termination signal, stopping");
                    should_stop = true;
                }
            }
        }
        if !events_ready {
            continue;
        }

        loop {
            let event = match capture.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e.into());
                    should_stop = true;
                    break;
                }
            };
            match event {
                StreamEvent::Connected {
                    dimensions,
                    format,
                    is_dmabuf,
                } => {
                    log::info!(
                        "stream connected: {dimensions}, {format:?}, dmabuf = {is_dmabuf}"
                    );
                    match CaptureSink::new(&SinkConfig {
                        source: dimensions,
                        source_format: format,
                        source_is_dmabuf: is_dmabuf,
                        target: args.size,
                        codec: args.codec.into(),
                        codec_options: &args.codec_options,
                        device_path: &args.device,
                        output_url: &args.output,
                        container_format: &args.format,
                    }) {
                        Ok(new_sink) => {
                            sink = Some(new_sink);
                            fps = FpsCounter::new();
                        }
                        Err(e) => {
                            failure = Some(e);
                            should_stop = true;
                            break;
                        }
                    }
                }
                StreamEvent::Disconnected => {
                    log::info!("stream disconnected, stopping");
                    should_stop = true;
                    break;
                }
                StreamEvent::MemoryFrameReceived(frame) => {
                    if let Some(sink) = &sink {
                        if let Err(e) = sink.push_frame(wrap_memory_frame(frame)) {
                            failure = Some(e.into());
                            should_stop = true;
                            break;
                        }
                        fps.tick();
                    }
                }
                StreamEvent::DmaBufFrameReceived(frame) => {
                    if let Some(sink) = &sink {
                        if let Err(e) = sink.push_frame(wrap_dmabuf_frame(frame)) {
                            failure = Some(e.into());
                            should_stop = true;
                            break;
                        }
                        fps.tick();
                    }
                }
            }
        }
    }

    // ordered teardown: the capture producer goes first so every in-flight
    // frame's release hook resolves while its origin is still defined, then
    // the stages drain (scaler, encoder, muxer trailer), then the portal
    // session closes and the node disappears
    drop(capture);
    drop(sink);
    drop(portal_handle);

    match failure {
        Some(e) => Err(e),
        None => Ok(ExitCode::SUCCESS),
    }
}
