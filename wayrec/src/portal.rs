//! Screencast session setup through the xdg-desktop-portal.
//!
//! The ashpd proxy is async, so it runs on a current-thread tokio runtime on
//! a dedicated thread. That thread keeps the D-Bus connection and portal
//! session alive until the returned handle is dropped, which is what keeps
//! the PipeWire node valid for the duration of the capture.

use std::os::fd::OwnedFd;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType, Stream as PortalStream};
use ashpd::desktop::PersistMode;
use ashpd::enumflags2::BitFlags;
use thiserror::Error;

const PORTAL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("xdg-desktop-portal is not available")]
    Unavailable,
    #[error("portal request failed: {0}")]
    RequestFailed(String),
    #[error("portal returned no stream")]
    NoStreams,
    #[error("portal did not answer within {0:?}")]
    Timeout(Duration),
}

/// Keeps the portal thread (and with it the screencast session) alive.
/// Dropping it closes the session, which invalidates the PipeWire node, so
/// it must outlive the capture stream.
pub struct PortalHandle {
    close_tx: mpsc::Sender<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl Drop for PortalHandle {
    fn drop(&mut self) {
        let _ = self.close_tx.send(());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct ScreencastSession {
    pub pipewire_fd: OwnedFd,
    pub node_id: u32,
    pub handle: PortalHandle,
}

struct SessionData {
    pipewire_fd: OwnedFd,
    node_id: u32,
}

/// Ask the user to share a screen. Returns `None` when the request was
/// cancelled in the portal dialog.
pub fn request_screencast(cursor_mode: CursorMode) -> Result<Option<ScreencastSession>, PortalError> {
    let (data_tx, data_rx) = mpsc::channel::<Result<Option<SessionData>, PortalError>>();
    let (close_tx, close_rx) = mpsc::channel::<()>();

    let join_handle = std::thread::Builder::new()
        .name("portal".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = data_tx.send(Err(PortalError::RequestFailed(format!(
                        "creating portal runtime: {e}"
                    ))));
                    return;
                }
            };
            rt.block_on(async {
                match create_session(cursor_mode).await {
                    Ok(Some(resources)) => {
                        if data_tx.send(Ok(Some(resources.data))).is_err() {
                            return;
                        }
                        // hold the session open until the consumer is done
                        let _ = close_rx.recv();
                        log::debug!("closing screencast session");
                        drop(resources.session);
                        drop(resources.proxy);
                    }
                    Ok(None) => {
                        let _ = data_tx.send(Ok(None));
                    }
                    Err(e) => {
                        let _ = data_tx.send(Err(e));
                    }
                }
            });
        })
        .map_err(|e| PortalError::RequestFailed(format!("spawning portal thread: {e}")))?;

    let data = data_rx.recv_timeout(PORTAL_TIMEOUT).map_err(|e| match e {
        mpsc::RecvTimeoutError::Timeout => PortalError::Timeout(PORTAL_TIMEOUT),
        mpsc::RecvTimeoutError::Disconnected => {
            PortalError::RequestFailed("portal thread died".into())
        }
    })??;

    let handle = PortalHandle {
        close_tx,
        join_handle: Some(join_handle),
    };

    Ok(data.map(|data| ScreencastSession {
        pipewire_fd: data.pipewire_fd,
        node_id: data.node_id,
        handle,
    }))
}

struct SessionResources {
    data: SessionData,
    proxy: Screencast<'static>,
    session: ashpd::desktop::Session<'static, Screencast<'static>>,
}

fn user_cancelled<E: std::fmt::Display>(e: &E) -> bool {
    let message = e.to_string();
    message.contains("cancelled") || message.contains("Cancelled")
}

async fn create_session(cursor_mode: CursorMode) -> Result<Option<SessionResources>, PortalError> {
    let proxy = Screencast::new().await.map_err(|e| {
        log::error!("creating Screencast proxy failed: {e}");
        PortalError::Unavailable
    })?;

    let session = proxy
        .create_session()
        .await
        .map_err(|e| PortalError::RequestFailed(format!("CreateSession: {e}")))?;

    let select = proxy
        .select_sources(
            &session,
            cursor_mode,
            BitFlags::from_flag(SourceType::Monitor),
            false,
            None,
            PersistMode::DoNot,
        )
        .await;
    if let Err(e) = select {
        if user_cancelled(&e) {
            return Ok(None);
        }
        return Err(PortalError::RequestFailed(format!("SelectSources: {e}")));
    }

    let response = match proxy.start(&session, None).await {
        Ok(request) => match request.response() {
            Ok(response) => response,
            Err(e) if user_cancelled(&e) => return Ok(None),
            Err(e) => return Err(PortalError::RequestFailed(format!("Start response: {e}"))),
        },
        Err(e) if user_cancelled(&e) => return Ok(None),
        Err(e) => return Err(PortalError::RequestFailed(format!("Start: {e}"))),
    };

    let streams: Vec<&PortalStream> = response.streams().iter().collect();
    let stream = streams.first().ok_or(PortalError::NoStreams)?;
    let node_id = stream.pipe_wire_node_id();
    log::info!("screencast stream: node_id = {}, size = {:?}", node_id, stream.size());

    let pipewire_fd = proxy
        .open_pipe_wire_remote(&session)
        .await
        .map_err(|e| PortalError::RequestFailed(format!("OpenPipeWireRemote: {e}")))?;

    // SAFETY: proxy and session are owned by the portal thread, which keeps
    // them alive until the close signal; the lifetime parameter is erased
    // only to store them across the await point.
    let proxy: Screencast<'static> = unsafe { std::mem::transmute(proxy) };
    let session: ashpd::desktop::Session<'static, Screencast<'static>> =
        unsafe { std::mem::transmute(session) };

    Ok(Some(SessionResources {
        data: SessionData {
            pipewire_fd,
            node_id,
        },
        proxy,
        session,
    }))
}
