use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::core::{Callsign, PeerKey, Result};
use crate::protocol::{BindRequest, CallPayload, HeaderPacket, Reassembler, VoicePacket};
use super::link::LinkHandle;

/// Ticks of silence enforced after a call before the gateway may transmit
pub const INTER_FRAME_SPACE_TICKS: u32 = 2;

/// Ticks without traffic after which an unterminated call is abandoned
pub const STALE_CALL_TICKS: u32 = 2;

/// Supervisor timer thresholds, in one-second ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimers {
    pub keepalive_ticks: u32,
    pub dead_ticks: u32,
}

impl From<&crate::core::Config> for SessionTimers {
    fn from(config: &crate::core::Config) -> Self {
        SessionTimers {
            keepalive_ticks: config.keepalive_ticks(),
            dead_ticks: config.dead_ticks(),
        }
    }
}

/// What a supervisor tick decided for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do
    Idle,
    /// A keepalive is due
    Keepalive,
    /// Silent beyond the dead interval
    Dead,
}

/// State of one bound repeater
pub struct PeerSession {
    key: PeerKey,
    addr: SocketAddr,
    callsign: Callsign,
    module: u8,
    link: LinkHandle,
    /// Ticks since the last valid frame
    last_rx: u32,
    /// Ticks until the next keepalive
    ka_ttl: i64,
    /// Ticks of enforced silence left after a call
    ifs_timer: u32,
    /// No call is being received
    rx_idle: bool,
    /// Ticks since the active call last made progress
    call_idle: u32,
    reassembler: Reassembler,
}

impl PeerSession {
    /// Creates the session for an accepted bind request
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        request: &BindRequest,
        link: LinkHandle,
        timers: SessionTimers,
    ) -> Self {
        PeerSession {
            key,
            addr,
            callsign: request.callsign(),
            module: request.target_module(),
            link,
            last_rx: 0,
            ka_ttl: timers.keepalive_ticks as i64 - 1,
            ifs_timer: 0,
            rx_idle: true,
            call_idle: 0,
            reassembler: Reassembler::new(),
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn callsign(&self) -> Callsign {
        self.callsign
    }

    /// Reflector module the repeater bound to
    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    pub fn last_rx(&self) -> u32 {
        self.last_rx
    }

    pub fn is_receiving(&self) -> bool {
        !self.rx_idle
    }

    /// Records that a valid frame arrived
    pub fn touch(&mut self) {
        self.last_rx = 0;
    }

    /// Half-duplex gate: idle and past the inter-frame space
    pub fn can_transmit(&self) -> bool {
        self.rx_idle && self.ifs_timer == 0
    }

    /// Binds the stream of a CRC-valid header; returns whether a new call started
    ///
    /// A header for another stream while a call is active means the active
    /// call lost its end of transmission; it is abandoned for the new one.
    pub fn begin_call(&mut self, header: &HeaderPacket) -> bool {
        let stream_id = header.trunk.call_id;
        if self.reassembler.active_stream() == Some(stream_id) {
            // Repeated header of the current call
            return false;
        }
        if let Some(active) = self.reassembler.active_stream() {
            warn!(
                peer = %self.key,
                stream_id,
                active,
                "Abandoning call without end of transmission for a new stream"
            );
        }
        self.reassembler.begin(stream_id, Some(header.radio));
        self.rx_idle = false;
        self.call_idle = 0;
        debug!(peer = %self.key, stream_id, my = %header.radio.my, "Call started");
        true
    }

    /// Feeds a data packet to the reassembler; returns the payload when the call ends
    pub fn on_voice(&mut self, packet: &VoicePacket) -> Result<Option<CallPayload>> {
        let completed = self.reassembler.push(packet)?;
        self.call_idle = 0;
        if completed.is_some() {
            self.end_call();
        }
        Ok(completed)
    }

    fn end_call(&mut self) {
        self.rx_idle = true;
        self.ifs_timer = INTER_FRAME_SPACE_TICKS;
    }

    /// Advances all timers by one supervisor tick
    pub fn tick(&mut self, timers: &SessionTimers) -> TickOutcome {
        self.last_rx = self.last_rx.saturating_add(1);
        if self.last_rx > timers.dead_ticks {
            return TickOutcome::Dead;
        }

        if self.ifs_timer > 0 {
            self.ifs_timer -= 1;
        }

        if !self.rx_idle {
            self.call_idle += 1;
            if self.call_idle > STALE_CALL_TICKS {
                warn!(
                    peer = %self.key,
                    stream_id = ?self.reassembler.active_stream(),
                    "Abandoning call without end of transmission"
                );
                self.reassembler.abandon();
                self.end_call();
            }
        }

        self.ka_ttl -= 1;
        if self.ka_ttl <= 0 {
            self.ka_ttl = timers.keepalive_ticks as i64;
            return TickOutcome::Keepalive;
        }
        TickOutcome::Idle
    }
}
