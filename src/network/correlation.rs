//! Request/reply correlation
//!
//! A request registers the key of the reply it expects and waits on a
//! single-assignment slot. The receive loop recomputes the key of every
//! inbound packet and completes the matching slot, if any. Each slot is
//! completed exactly once: by a matching packet, by the waiter's deadline,
//! or by the session closing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{lock, StationError, StationResult};
use crate::protocol::headers::{LAN_RAILCOM_DATACHANGED, LAN_X_BUS, X_LOCO_INFO, X_TURNOUT_INFO};
use crate::protocol::{loco_address_from_bytes, Packet};

/// Identity of an expected reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub header: u16,
    /// X-header, for replies tunneled in `LAN_X_BUS`
    pub command: Option<u8>,
    /// DB0, for X-BUS replies that are not address scoped
    pub sub_command: Option<u8>,
    /// Loco, turnout or RailCom decoder address
    pub address: Option<u16>,
}

impl CorrelationKey {
    pub fn lan(header: u16) -> Self {
        Self {
            header,
            command: None,
            sub_command: None,
            address: None,
        }
    }

    pub fn xbus(command: u8, sub_command: u8) -> Self {
        Self {
            header: LAN_X_BUS,
            command: Some(command),
            sub_command: Some(sub_command),
            address: None,
        }
    }

    pub fn loco_info(address: u16) -> Self {
        Self {
            header: LAN_X_BUS,
            command: Some(X_LOCO_INFO),
            sub_command: None,
            address: Some(address),
        }
    }

    pub fn turnout_info(address: u16) -> Self {
        Self {
            header: LAN_X_BUS,
            command: Some(X_TURNOUT_INFO),
            sub_command: None,
            address: Some(address),
        }
    }

    pub fn railcom(address: u16) -> Self {
        Self {
            header: LAN_RAILCOM_DATACHANGED,
            command: None,
            sub_command: None,
            address: Some(address),
        }
    }

    /// Key under which an inbound packet would answer a request
    pub fn for_packet(packet: &Packet) -> Self {
        if let Some(msg) = &packet.xbus {
            return match msg.command {
                X_LOCO_INFO if !msg.data.is_empty() => {
                    Self::loco_info(loco_address_from_bytes(msg.sub_command, msg.data[0]))
                }
                X_TURNOUT_INFO if msg.data.len() >= 2 => {
                    Self::turnout_info(((msg.sub_command as u16) << 8) | msg.data[0] as u16)
                }
                _ => Self::xbus(msg.command, msg.sub_command),
            };
        }

        let payload = packet.payload();
        if packet.header() == LAN_RAILCOM_DATACHANGED && payload.len() >= 2 {
            return Self::railcom(u16::from_le_bytes([payload[0], payload[1]]));
        }

        Self::lan(packet.header())
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.header)?;
        if let Some(command) = self.command {
            write!(f, "/{:#04x}", command)?;
        }
        if let Some(sub) = self.sub_command {
            write!(f, "/{:#04x}", sub)?;
        }
        if let Some(address) = self.address {
            write!(f, "@{}", address)?;
        }
        Ok(())
    }
}

type ReplySlot = oneshot::Sender<StationResult<Packet>>;

struct PendingEntry {
    id: u64,
    slot: ReplySlot,
}

/// Outstanding requests, at most one per key
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<CorrelationKey, PendingEntry>,
    next_id: u64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `key`; fails if one is already waiting
    pub fn register(
        &mut self,
        key: CorrelationKey,
    ) -> StationResult<(u64, oneshot::Receiver<StationResult<Packet>>)> {
        if let Some(existing) = self.entries.get(&key) {
            if !existing.slot.is_closed() {
                return Err(StationError::Conflict(key));
            }
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let (slot, rx) = oneshot::channel();
        self.entries.insert(key, PendingEntry { id, slot });
        Ok((id, rx))
    }

    /// Complete the slot matching `packet`
    ///
    /// Returns the packet when no live waiter claimed it, so it can be
    /// offered to broadcast subscribers instead.
    pub fn resolve(&mut self, packet: Packet) -> Option<Packet> {
        let key = CorrelationKey::for_packet(&packet);
        let Some(entry) = self.entries.remove(&key) else {
            return Some(packet);
        };

        match entry.slot.send(Ok(packet)) {
            Ok(()) => None,
            Err(Ok(packet)) => Some(packet),
            Err(Err(_)) => None,
        }
    }

    /// Remove the entry for `key` if it still belongs to request `id`
    pub fn remove(&mut self, key: &CorrelationKey, id: u64) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.id == id => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Fail every waiter with `Closed`
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.slot.send(Err(StationError::Closed));
        }
        count
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A registered request waiting for its reply
///
/// Dropping it, including when the awaiting future is cancelled, removes the
/// pending entry without any message to the station.
pub struct PendingReply {
    pending: Arc<Mutex<PendingRequests>>,
    key: CorrelationKey,
    id: u64,
    deadline: Instant,
    rx: Option<oneshot::Receiver<StationResult<Packet>>>,
}

impl PendingReply {
    /// Register `key` with a deadline of now + `timeout`
    pub fn register(
        pending: &Arc<Mutex<PendingRequests>>,
        key: CorrelationKey,
        timeout: Duration,
    ) -> StationResult<Self> {
        let (id, rx) = lock(pending).register(key)?;
        Ok(Self {
            pending: pending.clone(),
            key,
            id,
            deadline: Instant::now() + timeout,
            rx: Some(rx),
        })
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait until the reply arrives, the deadline passes, or the session closes
    pub async fn wait(mut self) -> StationResult<Packet> {
        let Some(rx) = self.rx.take() else {
            return Err(StationError::Closed);
        };

        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StationError::Closed),
            Err(_) => {
                tracing::debug!("Request {} timed out", self.key);
                Err(StationError::Timeout(self.key))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.key, self.id);
    }
}
