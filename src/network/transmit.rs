use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::{Error, Result};
use crate::protocol::builder::FRAME_INTERVAL;
use crate::protocol::TxPlan;

/// Paces synthesized calls onto the reflector socket
///
/// Only one call is on the air at a time; a second transmission waits for the
/// first to finish so their frames never interleave.
#[derive(Clone)]
pub struct Transmitter {
    socket: Arc<UdpSocket>,
    on_air: Arc<Mutex<()>>,
}

impl Transmitter {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Transmitter {
            socket,
            on_air: Arc::new(Mutex::new(())),
        }
    }

    /// Sends the header burst then one data packet per frame interval
    ///
    /// `clear` is consulted once the channel is ours; a transmission queued
    /// behind another call is refused with [`Error::Busy`] if the repeater
    /// started talking meanwhile. Returns the number of datagrams that left
    /// the socket. Send failures are logged and skipped, the remote side
    /// copes with lost frames.
    pub async fn send<F>(&self, dest: SocketAddr, plan: &TxPlan, clear: F) -> Result<usize>
    where
        F: FnOnce() -> bool,
    {
        let _on_air = self.on_air.lock().await;
        if !clear() {
            return Err(Error::busy(format!("{} started transmitting", dest)));
        }
        let mut sent = 0;

        for _ in 0..plan.header_repeats {
            sent += self.send_one(dest, &plan.header).await;
        }

        let mut pacer = interval(FRAME_INTERVAL);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Burst);
        for frame in &plan.frames {
            pacer.tick().await;
            sent += self.send_one(dest, frame).await;
        }

        info!(
            %dest,
            stream_id = plan.stream_id,
            frames = plan.frames.len(),
            sent,
            "Transmission complete"
        );
        Ok(sent)
    }

    async fn send_one(&self, dest: SocketAddr, datagram: &[u8]) -> usize {
        match self.socket.send_to(datagram, dest).await {
            Ok(len) if len == datagram.len() => 1,
            Ok(len) => {
                debug!(%dest, len, expected = datagram.len(), "Short datagram write");
                0
            }
            Err(e) => {
                warn!(%dest, error = %e, "Transmit failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Callsign;
    use crate::protocol::{FrameBuilder, OutboundCall, PayloadMode, RadioHeader};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    fn plan() -> TxPlan {
        let call = OutboundCall {
            header: RadioHeader::new(
                Callsign::new("XRFSGW A"),
                Callsign::new("XRFSGW G"),
                Callsign::new("CQCQCQ"),
                Callsign::new("XRFSGW"),
                "",
            ),
            message: None,
            payload: Bytes::from_static(b"hello"),
            mode: PayloadMode::SlowData,
        };
        FrameBuilder::new(0x5151).build(&call)
    }

    #[tokio::test]
    async fn test_transmission_is_paced() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let transmitter = Transmitter::new(socket);
        let plan = plan();

        let started = Instant::now();
        let sent = transmitter.send(dest, &plan, || true).await.unwrap();
        assert_eq!(sent, plan.header_repeats + plan.frames.len());
        assert!(started.elapsed() >= FRAME_INTERVAL * (plan.frames.len() as u32 - 1));

        let mut buf = [0u8; 64];
        for _ in 0..plan.header_repeats {
            let (len, _) = timeout(Duration::from_secs(1), receiver.recv_from(&mut buf)).await.unwrap().unwrap();
            assert_eq!(len, 56);
        }
        for frame in &plan.frames {
            let (len, _) = timeout(Duration::from_secs(1), receiver.recv_from(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf[..len], frame.as_ref());
        }
    }

    #[tokio::test]
    async fn test_gate_checked_after_queueing() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = receiver.local_addr().unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let transmitter = Transmitter::new(socket);
        let plan = plan();

        // Another call holds the channel while the repeater keys up
        let on_air = Arc::clone(&transmitter.on_air);
        let guard = on_air.lock().await;
        let queued = {
            let transmitter = transmitter.clone();
            let plan = plan.clone();
            tokio::spawn(async move { transmitter.send(dest, &plan, || false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        let refused = timeout(Duration::from_secs(1), queued).await.unwrap().unwrap();
        assert!(matches!(refused, Err(Error::Busy(_))));

        let mut buf = [0u8; 64];
        assert!(timeout(Duration::from_millis(100), receiver.recv_from(&mut buf)).await.is_err());
    }
}
