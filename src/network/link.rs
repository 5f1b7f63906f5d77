use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::{Error, LinkEndpoint, PeerKey, Result};
use crate::protocol::CallPayload;
use super::GatewayEvent;

/// Inbound link chunks shorter than this are runts and ignored
pub const MIN_LINK_CHUNK: usize = 3;

/// Duplex byte channel between a bound session and the local modem
///
/// A reader task publishes inbound chunks as [`GatewayEvent::LinkData`] and a
/// writer task drains outbound bytes. Both stop when the handle is closed or
/// dropped, which closes the underlying stream.
pub struct LinkHandle {
    key: PeerKey,
    outbound: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl LinkHandle {
    /// Connects to the modem link for the session `key`
    pub async fn open(
        endpoint: &LinkEndpoint,
        key: PeerKey,
        events: mpsc::UnboundedSender<GatewayEvent>,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        match endpoint {
            LinkEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::link(format!("Unable to connect to {}:{}: {}", host, port, e)))?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %key, error = %e, "Unable to disable Nagle on link");
                }
                Ok(Self::from_stream(stream, key, events, shutdown.child_token()))
            }
            #[cfg(unix)]
            LinkEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    Error::link(format!("Unable to connect to socket '{}': {}", path.display(), e))
                })?;
                Ok(Self::from_stream(stream, key, events, shutdown.child_token()))
            }
            #[cfg(not(unix))]
            LinkEndpoint::Unix(path) => Err(Error::link(format!(
                "Unix-domain link '{}' is not supported on this platform",
                path.display()
            ))),
        }
    }

    /// Wraps an already connected stream
    pub fn from_stream<S>(
        stream: S,
        key: PeerKey,
        events: mpsc::UnboundedSender<GatewayEvent>,
        cancel: CancellationToken,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

        let token = cancel.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, BytesCodec::new());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = frames.next() => match next {
                        Some(Ok(chunk)) => {
                            if chunk.len() < MIN_LINK_CHUNK {
                                continue;
                            }
                            let _ = events.send(GatewayEvent::LinkData { key, data: chunk.freeze() });
                        }
                        Some(Err(e)) => {
                            warn!(peer = %key, error = %e, "Link read failed");
                            break;
                        }
                        None => {
                            debug!(peer = %key, "Link closed by the modem side");
                            break;
                        }
                    }
                }
            }
            token.cancel();
        });

        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = outbound_rx.recv() => match chunk {
                        Some(chunk) => {
                            if let Err(e) = writer.write_all(&chunk).await {
                                warn!(peer = %key, error = %e, "Link write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = writer.shutdown().await;
            token.cancel();
        });

        LinkHandle { key, outbound, cancel }
    }

    /// Queues bytes for the modem side
    pub fn send(&self, data: Bytes) -> Result<()> {
        self.outbound
            .send(data)
            .map_err(|_| Error::link(format!("Link of {} is closed", self.key)))
    }

    /// Hands a completed call's data to the modem side
    pub fn deliver(&self, payload: &CallPayload) -> Result<()> {
        if payload.data.is_empty() {
            return Ok(());
        }
        self.send(payload.data.clone())
    }

    /// Stops both link tasks
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
