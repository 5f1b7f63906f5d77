use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::core::{Config, Error, LinkEndpoint, PeerKey, Result};
use crate::protocol::frame::{BIND_ANSWER_LEN, MAX_DATAGRAM_LEN};
use crate::protocol::{
    BindRequest, DsvtCodec, FrameBuilder, HeaderPacket, OutboundCall, Packet, VoicePacket,
};
use super::keepalive::KeepaliveSupervisor;
use super::link::LinkHandle;
use super::session::{PeerSession, SessionTimers};
use super::table::{lock_table, PeerTable, SharedPeerTable};
use super::transmit::Transmitter;
use super::GatewayEvent;

/// Pause after a transient receive error
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(1);

/// Consecutive receive failures tolerated before the receive loop gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorBudget {
    capacity: u32,
    remaining: u32,
}

impl ErrorBudget {
    pub fn new(capacity: u32) -> Self {
        ErrorBudget {
            capacity,
            remaining: capacity,
        }
    }

    /// Errors that only mean "try again" and never cost budget
    pub fn is_transient(error: &io::Error) -> bool {
        matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
    }

    /// Charges one failure; returns false once the budget is spent
    pub fn consume(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }

    /// Restores the full budget after a successful receive
    pub fn refill(&mut self) {
        self.remaining = self.capacity;
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// Drop counters of the receive loop
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Datagrams whose length matches no packet kind
    pub malformed: AtomicU64,
    /// Well-sized datagrams rejected by decoding or reassembly
    pub dropped: AtomicU64,
}

/// Shared state between the server and its handles
struct SharedState {
    config: Config,
    endpoint: LinkEndpoint,
    timers: SessionTimers,
    socket: Arc<UdpSocket>,
    table: SharedPeerTable,
    events: mpsc::UnboundedSender<GatewayEvent>,
    cancel: CancellationToken,
    stats: ServerStats,
    transmitter: Transmitter,
}

/// DExtra reflector endpoint bridging bound repeaters to modem links
pub struct ReflectorServer {
    shared: Arc<SharedState>,
}

/// Cloneable control surface of a running server
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<SharedState>,
}

/// Creates the dual-stack datagram socket
fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(false) {
            warn!(%addr, error = %e, "Unable to accept IPv4 on the IPv6 socket");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

impl ReflectorServer {
    /// Binds the reflector socket and returns the server with its event stream
    pub async fn bind(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<GatewayEvent>)> {
        config.validate()?;

        let socket = bind_socket(config.bind_addr)
            .map_err(|e| Error::network(format!("Failed to bind {}: {}", config.bind_addr, e)))?;
        let socket = Arc::new(socket);
        let (events, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SharedState {
            endpoint: config.link_endpoint(),
            timers: SessionTimers::from(&config),
            transmitter: Transmitter::new(Arc::clone(&socket)),
            socket,
            table: Arc::new(Mutex::new(PeerTable::new())),
            events,
            cancel: CancellationToken::new(),
            stats: ServerStats::default(),
            config,
        });

        info!(
            addr = %shared.config.bind_addr,
            link = ?shared.endpoint,
            reflector = %shared.config.reflector_name,
            "Reflector socket bound"
        );
        Ok((ReflectorServer { shared }, events_rx))
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns the local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared.socket.local_addr()
            .map_err(|e| Error::network(format!("Failed to get local address: {}", e)))
    }

    /// Runs the receive loop until shutdown or until the error budget is spent
    pub async fn run(self) -> Result<()> {
        let shared = &self.shared;
        let supervisor = KeepaliveSupervisor::new(
            Arc::clone(&shared.table),
            Arc::clone(&shared.socket),
            shared.config.keepalive_payload(),
            shared.timers,
            shared.events.clone(),
            shared.cancel.child_token(),
        );
        let supervisor = tokio::spawn(supervisor.run());

        let mut buffer = [0u8; MAX_DATAGRAM_LEN];
        let mut budget = ErrorBudget::new(shared.config.error_budget);

        let outcome = loop {
            let received = tokio::select! {
                _ = shared.cancel.cancelled() => break Ok(()),
                received = shared.socket.recv_from(&mut buffer) => received,
            };

            match received {
                Ok((len, addr)) => {
                    budget.refill();
                    self.handle_datagram(&buffer[..len], addr).await;
                }
                Err(e) if ErrorBudget::is_transient(&e) => {
                    sleep(TRANSIENT_BACKOFF).await;
                }
                Err(e) => {
                    warn!(error = %e, remaining = budget.remaining(), "Receive failed");
                    if !budget.consume() {
                        error!("Receive error budget exhausted, giving up");
                        break Err(Error::network(format!("Receive error budget exhausted: {}", e)));
                    }
                }
            }
        };

        shared.cancel.cancel();
        if let Err(e) = supervisor.await {
            warn!(error = %e, "Keepalive supervisor ended abnormally");
        }
        let closed = lock_table(&shared.table).drain();
        info!(
            peers = closed.len(),
            malformed = shared.stats.malformed.load(Ordering::Relaxed),
            "Shutting down"
        );
        outcome
    }

    async fn handle_datagram(&self, datagram: &[u8], addr: SocketAddr) {
        let stats = &self.shared.stats;
        let mut frame = BytesMut::from(datagram);
        let packet = match DsvtCodec::new().decode(&mut frame) {
            Ok(Some(packet)) => packet,
            Ok(None) | Err(Error::Malformed(_)) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                trace!(%addr, len = datagram.len(), "Ignoring datagram of unknown size");
                return;
            }
            Err(e) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                if e.is_packet_drop() {
                    debug!(%addr, error = %e, "Dropping datagram");
                } else {
                    warn!(%addr, error = %e, "Unable to decode datagram");
                }
                return;
            }
        };

        let key = PeerKey::from(addr);
        match packet {
            Packet::Keepalive(_) => {
                if let Some(session) = lock_table(&self.shared.table).get_mut(&key) {
                    session.touch();
                }
            }
            Packet::Bind(request) if request.is_unbind() => self.unbind(key),
            Packet::Bind(request) => self.bind_peer(key, addr, request).await,
            Packet::BindAnswer(_) => trace!(%addr, "Ignoring bind answer"),
            Packet::Header(header) => self.on_header(key, &header),
            Packet::Voice(voice) => self.on_voice(key, &voice),
        }
    }

    async fn bind_peer(&self, key: PeerKey, addr: SocketAddr, request: BindRequest) {
        let shared = &self.shared;
        let known = lock_table(&shared.table).contains(&key);

        if !known {
            // Opening the link awaits, so it happens outside the lock
            let link = match LinkHandle::open(&shared.endpoint, key, shared.events.clone(), &shared.cancel).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(peer = %key, callsign = %request.callsign(), error = %e, "Bind rejected, link unavailable");
                    return;
                }
            };
            let session = PeerSession::new(key, addr, &request, link, shared.timers);
            if lock_table(&shared.table).insert(session) {
                info!(
                    peer = %key,
                    callsign = %request.callsign(),
                    repeater_module = %(request.module() as char),
                    module = %(request.target_module() as char),
                    "Peer bound"
                );
                let _ = shared.events.send(GatewayEvent::PeerBound {
                    key,
                    callsign: request.callsign(),
                    module: request.target_module(),
                });
            }
        } else {
            debug!(peer = %key, "Duplicate bind request");
        }

        let mut ack = BytesMut::with_capacity(BIND_ANSWER_LEN);
        if let Err(e) = DsvtCodec::new().encode(Packet::BindAnswer(request.ack()), &mut ack) {
            warn!(peer = %key, error = %e, "Unable to encode bind acknowledgement");
            return;
        }
        if let Err(e) = shared.socket.send_to(&ack, addr).await {
            debug!(peer = %key, error = %e, "Bind acknowledgement failed");
        }
    }

    fn unbind(&self, key: PeerKey) {
        let removed = lock_table(&self.shared.table).remove(&key);
        if let Some(session) = removed {
            info!(
                peer = %key,
                callsign = %session.callsign(),
                module = %(session.module() as char),
                "Peer unbound"
            );
            let _ = self.shared.events.send(GatewayEvent::PeerUnbound { key });
        }
    }

    fn on_header(&self, key: PeerKey, header: &HeaderPacket) {
        let mut table = lock_table(&self.shared.table);
        if let Some(session) = table.get_mut(&key) {
            session.touch();
            session.begin_call(header);
        }
    }

    fn on_voice(&self, key: PeerKey, voice: &VoicePacket) {
        let shared = &self.shared;
        let completed = {
            let mut table = lock_table(&shared.table);
            let Some(session) = table.get_mut(&key) else {
                return;
            };
            session.touch();
            match session.on_voice(voice) {
                Ok(Some(payload)) => {
                    if let Err(e) = session.link().deliver(&payload) {
                        warn!(peer = %key, error = %e, "Unable to hand call to the link");
                    }
                    payload
                }
                Ok(None) => return,
                Err(e) => {
                    shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %key, stream_id = voice.trunk.call_id, error = %e, "Dropping packet");
                    return;
                }
            }
        };

        info!(
            peer = %key,
            stream_id = completed.stream_id,
            bytes = completed.data.len(),
            message = %completed.message_text(),
            "Call completed"
        );
        let _ = shared.events.send(GatewayEvent::CallCompleted { key, payload: completed });
    }
}

impl ServerHandle {
    /// Stops the receive loop, the supervisor and every link
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn peer_count(&self) -> usize {
        lock_table(&self.shared.table).len()
    }

    pub fn peers(&self) -> Vec<PeerKey> {
        lock_table(&self.shared.table).keys().copied().collect()
    }

    pub fn malformed_count(&self) -> u64 {
        self.shared.stats.malformed.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.stats.dropped.load(Ordering::Relaxed)
    }

    /// Whether the half-duplex gate of `key` is open; false for unknown peers
    pub fn can_transmit(&self, key: &PeerKey) -> bool {
        lock_table(&self.shared.table)
            .get(key)
            .map(PeerSession::can_transmit)
            .unwrap_or(false)
    }

    /// Synthesizes `call` and paces it to the bound repeater `key`
    ///
    /// Returns the stream id used. Fails with [`Error::Busy`] while the
    /// repeater is transmitting or within its inter-frame space.
    pub async fn transmit(&self, key: PeerKey, call: OutboundCall) -> Result<u16> {
        let addr = {
            let table = lock_table(&self.shared.table);
            let session = table
                .get(&key)
                .ok_or_else(|| Error::peer(format!("{} is not bound", key)))?;
            if !session.can_transmit() {
                return Err(Error::busy(format!("{} is receiving", key)));
            }
            session.addr()
        };

        let plan = FrameBuilder::with_random_stream().build(&call);
        info!(peer = %key, stream_id = plan.stream_id, frames = plan.frames.len(), "Transmitting call");
        // The gate is checked again once queued calls ahead of this one are done
        self.shared
            .transmitter
            .send(addr, &plan, || self.can_transmit(&key))
            .await?;
        Ok(plan.stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Callsign;
    use crate::protocol::frame::{TrunkHeader, MGMT_HEADER};
    use crate::protocol::{PayloadMode, RadioHeader};
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        handle: ServerHandle,
        addr: SocketAddr,
        events: mpsc::UnboundedReceiver<GatewayEvent>,
        task: JoinHandle<Result<()>>,
    }

    async fn start(link_port: u16) -> Harness {
        let config = Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            link_addr: "127.0.0.1".to_string(),
            link_port,
            ..Config::default()
        };
        let (server, events) = ReflectorServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        Harness { handle, addr, events, task }
    }

    async fn modem() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn repeater() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let len = timeout(WAIT, socket.recv(&mut buf)).await.unwrap().unwrap();
        buf[..len].to_vec()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn bind_request() -> BindRequest {
        BindRequest::new(Callsign::new("W1AW"), b'B', b'C')
    }

    fn header_packet(stream_id: u16) -> Vec<u8> {
        HeaderPacket {
            trunk: TrunkHeader::stream(stream_id, MGMT_HEADER),
            radio: RadioHeader::new(
                Callsign::new("W1AW   B"),
                Callsign::new("W1AW   G"),
                Callsign::new("CQCQCQ"),
                Callsign::new("N0CALL"),
                "",
            ),
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn test_error_budget_exhaustion() {
        let mut budget = ErrorBudget::new(10);
        for _ in 0..9 {
            assert!(budget.consume());
        }
        assert!(!budget.consume());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_error_budget_refill() {
        let mut budget = ErrorBudget::new(3);
        assert!(budget.consume());
        assert!(budget.consume());
        budget.refill();
        assert_eq!(budget.remaining(), 3);
        assert!(budget.consume());
        assert!(budget.consume());
        assert!(!budget.consume());
    }

    #[test]
    fn test_transient_errors_are_free() {
        assert!(ErrorBudget::is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(ErrorBudget::is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!ErrorBudget::is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!ErrorBudget::is_transient(&io::Error::from(io::ErrorKind::Other)));
    }

    #[tokio::test]
    async fn test_bind_twice_yields_one_session() {
        let (listener, port) = modem().await;
        let harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();

        let request = bind_request();
        client.send(request.as_bytes()).await.unwrap();
        let (_link, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert_eq!(recv(&client).await, request.ack().to_vec());

        client.send(request.as_bytes()).await.unwrap();
        let ack = recv(&client).await;
        assert_eq!(&ack[..10], &request.as_bytes()[..10]);
        assert_eq!(&ack[10..], b"ACK\0");
        assert_eq!(harness.handle.peer_count(), 1);

        harness.handle.shutdown();
        timeout(WAIT, harness.task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unbind() {
        let (listener, port) = modem().await;
        let mut harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();

        // Unknown peer: nothing happens
        let unbind = BindRequest::new(Callsign::new("W1AW"), b'B', b' ');
        client.send(unbind.as_bytes()).await.unwrap();

        client.send(bind_request().as_bytes()).await.unwrap();
        let (mut link, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        recv(&client).await;
        assert_eq!(harness.handle.peer_count(), 1);

        client.send(unbind.as_bytes()).await.unwrap();
        let handle = harness.handle.clone();
        wait_for(|| handle.peer_count() == 0).await;

        // The modem link is closed with the session
        let mut buf = [0u8; 4];
        assert_eq!(timeout(WAIT, link.read(&mut buf)).await.unwrap().unwrap(), 0);

        let mut saw_unbound = false;
        while let Ok(event) = harness.events.try_recv() {
            saw_unbound |= matches!(event, GatewayEvent::PeerUnbound { .. });
        }
        assert!(saw_unbound);
        harness.handle.shutdown();
    }

    #[tokio::test]
    async fn test_link_failure_rejects_bind() {
        // Nothing listens on the reserved port
        let (listener, port) = modem().await;
        drop(listener);
        let harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();

        client.send(bind_request().as_bytes()).await.unwrap();
        let mut buf = [0u8; 32];
        assert!(timeout(Duration::from_millis(300), client.recv(&mut buf)).await.is_err());
        assert_eq!(harness.handle.peer_count(), 0);
        harness.handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_datagrams_counted() {
        let (_listener, port) = modem().await;
        let harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();

        client.send(&[0u8; 5]).await.unwrap();
        client.send(&[0u8; 100]).await.unwrap();
        let handle = harness.handle.clone();
        wait_for(|| handle.malformed_count() == 2).await;
        assert_eq!(harness.handle.peer_count(), 0);
        harness.handle.shutdown();
    }

    #[tokio::test]
    async fn test_call_is_delivered() {
        let (listener, port) = modem().await;
        let mut harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();

        client.send(bind_request().as_bytes()).await.unwrap();
        let (mut link, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        recv(&client).await;
        let key = PeerKey::from(client.local_addr().unwrap());

        let call = OutboundCall {
            header: RadioHeader::new(
                Callsign::new("W1AW   B"),
                Callsign::new("W1AW   G"),
                Callsign::new("CQCQCQ"),
                Callsign::new("N0CALL"),
                "",
            ),
            message: Some("Hello".to_string()),
            payload: Bytes::from_static(b"payload bytes"),
            mode: PayloadMode::SlowData,
        };
        let plan = FrameBuilder::new(0x6060).build(&call);
        client.send(&plan.header).await.unwrap();
        for frame in &plan.frames {
            client.send(frame).await.unwrap();
        }

        let mut buf = [0u8; 13];
        timeout(WAIT, link.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"payload bytes");

        let payload = timeout(WAIT, async {
            loop {
                match harness.events.recv().await {
                    Some(GatewayEvent::CallCompleted { key: from, payload }) => {
                        assert_eq!(from, key);
                        break payload;
                    }
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(payload.stream_id, 0x6060);
        assert_eq!(payload.message_text(), "Hello");

        // Inter-frame space right after the call
        assert!(!harness.handle.can_transmit(&key));
        let refused = harness.handle.transmit(key, call).await;
        assert!(matches!(refused, Err(Error::Busy(_))));
        harness.handle.shutdown();
    }

    #[tokio::test]
    async fn test_transmit_reaches_repeater() {
        let (listener, port) = modem().await;
        let harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();

        client.send(bind_request().as_bytes()).await.unwrap();
        let (_link, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        recv(&client).await;
        let key = PeerKey::from(client.local_addr().unwrap());
        assert!(harness.handle.can_transmit(&key));

        let call = OutboundCall {
            header: RadioHeader::new(
                Callsign::new("XRFSGW C"),
                Callsign::new("XRFSGW G"),
                Callsign::new("W1AW"),
                Callsign::new("XRFSGW"),
                "",
            ),
            message: None,
            payload: Bytes::from_static(b"ok"),
            mode: PayloadMode::SlowData,
        };
        let stream_id = harness.handle.transmit(key, call).await.unwrap();

        let header = recv(&client).await;
        assert_eq!(header.len(), 56);
        assert_eq!(u16::from_be_bytes([header[12], header[13]]), stream_id);
        harness.handle.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_peer_traffic_ignored() {
        let (_listener, port) = modem().await;
        let harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();

        client.send(&header_packet(0x0102)).await.unwrap();
        client.send(&[0u8; 9]).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.handle.peer_count(), 0);
        assert_eq!(harness.handle.malformed_count(), 0);

        let key = PeerKey::from(client.local_addr().unwrap());
        assert!(matches!(
            harness.handle.transmit(key, OutboundCall {
                header: RadioHeader::new(
                    Callsign::new("A"),
                    Callsign::new("B"),
                    Callsign::new("C"),
                    Callsign::new("D"),
                    "",
                ),
                message: None,
                payload: Bytes::new(),
                mode: PayloadMode::SlowData,
            }).await,
            Err(Error::Peer(_))
        ));
        harness.handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_links() {
        let (listener, port) = modem().await;
        let harness = start(port).await;
        let client = repeater().await;
        client.connect(harness.addr).await.unwrap();
        client.send(bind_request().as_bytes()).await.unwrap();
        let (mut link, _): (TcpStream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        recv(&client).await;

        harness.handle.shutdown();
        timeout(WAIT, harness.task).await.unwrap().unwrap().unwrap();
        assert_eq!(harness.handle.peer_count(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(timeout(WAIT, link.read(&mut buf)).await.unwrap().unwrap(), 0);
    }
}
