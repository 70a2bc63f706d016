//! Live video connection for one device.
//!
//! Frames replace whatever was shown before; control envelopes are handed to
//! the owner. Dropped connections are retried with backoff until the relay is
//! torn down.

mod backoff;
mod frame;
mod message;

pub use backoff::Backoff;
pub use frame::{decode_frame, FrameSlot, VideoFrame};
pub use message::{classify, ControlEnvelope, RelayMessage};

use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::launch::DeviceId;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct RelaySpec {
    pub stream_url: Url,
    pub device: Option<DeviceId>,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl RelaySpec {
    pub fn connect_url(&self) -> Url {
        let mut url = self.stream_url.clone();
        if let Some(device) = &self.device {
            url.query_pairs_mut().append_pair("device_id", device.as_str());
        }
        url
    }
}

pub struct RelayHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RelayHandle {
    /// Closes the socket and stops reconnecting.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Disconnect {
    Cancelled,
    Remote,
}

pub fn spawn<C>(
    spec: RelaySpec,
    parent: &CancellationToken,
    frames: FrameSlot,
    mut on_control: C,
) -> RelayHandle
where
    C: FnMut(ControlEnvelope) + Send + 'static,
{
    let cancel = parent.child_token();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let url = spec.connect_url();
        let mut backoff = Backoff::new(spec.reconnect_initial, spec.reconnect_max);

        loop {
            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(url.as_str()) => result,
                _ = token.cancelled() => break,
            };

            match connected {
                Ok((socket, _response)) => {
                    log_info!("video stream connected: {url}");
                    backoff.reset();
                    match pump(socket, &token, &frames, &mut on_control).await {
                        Disconnect::Cancelled => break,
                        Disconnect::Remote => log_warn!("video stream dropped: {url}"),
                    }
                }
                Err(err) => log_warn!("video stream connect failed ({url}): {err}"),
            }

            let delay = backoff.next_delay();
            log_debug!("reconnecting video stream in {}ms", delay.as_millis());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => break,
            }
        }

        log_debug!("video relay stopped");
    });

    RelayHandle { cancel, handle }
}

async fn pump<C>(
    mut socket: Socket,
    cancel: &CancellationToken,
    frames: &FrameSlot,
    on_control: &mut C,
) -> Disconnect
where
    C: FnMut(ControlEnvelope),
{
    loop {
        let next = tokio::select! {
            next = socket.next() => next,
            _ = cancel.cancelled() => {
                if let Err(err) = socket.close(None).await {
                    log_debug!("video stream close failed: {err}");
                }
                return Disconnect::Cancelled;
            }
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                log_warn!("video stream error: {err}");
                return Disconnect::Remote;
            }
            None => return Disconnect::Remote,
        };

        if message.is_close() {
            return Disconnect::Remote;
        }

        match classify(message) {
            Some(RelayMessage::Control(envelope)) => on_control(envelope),
            Some(RelayMessage::Frame(bytes)) => {
                let received_at = Utc::now();
                let decoded =
                    tokio::task::spawn_blocking(move || decode_frame(&bytes, received_at)).await;
                match decoded {
                    Ok(Ok(frame)) => frames.publish(frame),
                    Ok(Err(err)) => log_debug!("dropping undecodable frame: {err:#}"),
                    Err(err) => log_debug!("frame decode worker failed: {err}"),
                }
            }
            None => {}
        }
    }
}
