use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::session::SessionTimers;
use super::table::{lock_table, SharedPeerTable, SweepReport};
use super::GatewayEvent;

/// Period of one supervisor tick
pub const TICK: Duration = Duration::from_secs(1);

/// Periodic task that keeps bound repeaters alive and expires silent ones
pub struct KeepaliveSupervisor {
    table: SharedPeerTable,
    socket: Arc<UdpSocket>,
    /// Reflector name padded to 8 bytes, NUL terminated
    payload: [u8; 9],
    timers: SessionTimers,
    events: mpsc::UnboundedSender<GatewayEvent>,
    cancel: CancellationToken,
}

impl KeepaliveSupervisor {
    pub fn new(
        table: SharedPeerTable,
        socket: Arc<UdpSocket>,
        payload: [u8; 9],
        timers: SessionTimers,
        events: mpsc::UnboundedSender<GatewayEvent>,
        cancel: CancellationToken,
    ) -> Self {
        KeepaliveSupervisor {
            table,
            socket,
            payload,
            timers,
            events,
            cancel,
        }
    }

    /// Ticks once per second until cancelled
    pub async fn run(self) {
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
        debug!("Keepalive supervisor stopped");
    }

    /// Runs one sweep and sends the keepalives it calls for
    pub async fn sweep_once(&self) -> SweepReport {
        // The lock is released before any await
        let report = lock_table(&self.table).sweep(&self.timers);

        for &addr in &report.keepalives {
            self.send_keepalive(addr).await;
        }
        for &key in &report.expired {
            let _ = self.events.send(GatewayEvent::PeerExpired { key });
        }
        report
    }

    async fn send_keepalive(&self, addr: SocketAddr) {
        match self.socket.send_to(&self.payload, addr).await {
            Ok(_) => trace!(%addr, "Keepalive sent"),
            Err(e) => debug!(%addr, error = %e, "Keepalive send failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::session::tests::{session, TIMERS};
    use crate::network::PeerTable;
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_keepalive_reaches_peer() {
        let repeater = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let repeater_addr = repeater.local_addr().unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let (peer, _modem) = session(repeater_addr.port());
        let mut table = PeerTable::new();
        table.insert(peer);
        let table: SharedPeerTable = Arc::new(Mutex::new(table));

        let (tx, _rx) = mpsc::unbounded_channel();
        let payload = *b"XRFSGW  \0";
        let supervisor = KeepaliveSupervisor::new(
            Arc::clone(&table),
            socket,
            payload,
            TIMERS,
            tx,
            CancellationToken::new(),
        );

        let mut sent = 0;
        for _ in 0..TIMERS.keepalive_ticks - 1 {
            sent += supervisor.sweep_once().await.keepalives.len();
        }
        assert_eq!(sent, 1);

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(1), repeater.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &payload);
    }

    #[tokio::test]
    async fn test_expiry_is_reported() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (peer, _modem) = session(42001);
        let key = peer.key();
        let mut table = PeerTable::new();
        table.insert(peer);
        let table: SharedPeerTable = Arc::new(Mutex::new(table));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = KeepaliveSupervisor::new(
            Arc::clone(&table),
            socket,
            [0; 9],
            TIMERS,
            tx,
            CancellationToken::new(),
        );

        for _ in 0..=TIMERS.dead_ticks {
            supervisor.sweep_once().await;
        }
        assert!(lock_table(&table).is_empty());

        let mut expired = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let GatewayEvent::PeerExpired { key } = event {
                expired.push(key);
            }
        }
        assert_eq!(expired, vec![key]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let table: SharedPeerTable = Arc::new(Mutex::new(PeerTable::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let supervisor = KeepaliveSupervisor::new(table, socket, [0; 9], TIMERS, tx, cancel.clone());

        let task = tokio::spawn(supervisor.run());
        cancel.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}
