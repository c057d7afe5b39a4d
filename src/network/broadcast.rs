//! Broadcast classification and subscriber registry
//!
//! Inbound packets that answer no pending request are classified by header
//! and X-header, decoded into a typed [`Broadcast`] and handed to every
//! matching subscription. Unrecognised packets are dropped silently.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::protocol::headers::{
    LAN_RAILCOM_DATACHANGED, LAN_SYSTEMSTATE_DATACHANGED, X_BC_STOPPED, X_BC_TRACK_POWER,
    X_LOCO_INFO, X_TURNOUT_INFO,
};
use crate::protocol::{
    CodecError, LocoInfo, Packet, RailComData, SystemState, TrackPower, TurnoutInfo,
};

/// Broadcast categories subscribers can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    SystemState,
    LocoInfo,
    RailCom,
    TrackPower,
    Turnout,
}

/// A decoded unsolicited packet
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    SystemState(SystemState),
    LocoInfo(LocoInfo),
    RailCom(RailComData),
    TrackPower(TrackPower),
    Turnout(TurnoutInfo),
}

impl Broadcast {
    /// Category of a packet, `None` if it is not a known broadcast
    pub fn classify(packet: &Packet) -> Option<Category> {
        match packet.header() {
            LAN_SYSTEMSTATE_DATACHANGED => Some(Category::SystemState),
            LAN_RAILCOM_DATACHANGED => Some(Category::RailCom),
            _ => {
                let msg = packet.xbus.as_ref()?;
                match msg.command {
                    X_LOCO_INFO => Some(Category::LocoInfo),
                    // A two-byte body is a turnout info request echo, not a report
                    X_TURNOUT_INFO if msg.data.len() == 2 => Some(Category::Turnout),
                    X_BC_TRACK_POWER | X_BC_STOPPED => {
                        TrackPower::from_message(msg).map(|_| Category::TrackPower)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Decode a packet into its typed payload
    pub fn decode(packet: &Packet) -> Result<Option<Self>, CodecError> {
        let Some(category) = Self::classify(packet) else {
            return Ok(None);
        };

        let broadcast = match (category, &packet.xbus) {
            (Category::SystemState, _) => {
                Broadcast::SystemState(SystemState::decode(packet.payload())?)
            }
            (Category::RailCom, _) => Broadcast::RailCom(RailComData::decode(packet.payload())?),
            (Category::LocoInfo, Some(msg)) => {
                Broadcast::LocoInfo(LocoInfo::decode(&msg.data_bytes())?)
            }
            (Category::Turnout, Some(msg)) => {
                Broadcast::Turnout(TurnoutInfo::decode(&msg.data_bytes())?)
            }
            (Category::TrackPower, Some(msg)) => match TrackPower::from_message(msg) {
                Some(power) => Broadcast::TrackPower(power),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        Ok(Some(broadcast))
    }

    pub fn category(&self) -> Category {
        match self {
            Broadcast::SystemState(_) => Category::SystemState,
            Broadcast::LocoInfo(_) => Category::LocoInfo,
            Broadcast::RailCom(_) => Category::RailCom,
            Broadcast::TrackPower(_) => Category::TrackPower,
            Broadcast::Turnout(_) => Category::Turnout,
        }
    }

    /// Address the broadcast is about, for address-scoped categories
    pub fn address(&self) -> Option<u16> {
        match self {
            Broadcast::LocoInfo(info) => Some(info.address),
            Broadcast::RailCom(data) => Some(data.address),
            Broadcast::Turnout(info) => Some(info.address),
            Broadcast::SystemState(_) | Broadcast::TrackPower(_) => None,
        }
    }
}

/// Callback invoked on the receive task for each matching broadcast
pub type BroadcastCallback = Arc<dyn Fn(&Broadcast) + Send + Sync>;

/// Opaque handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    category: Category,
    filter: Option<u16>,
    callback: BroadcastCallback,
    /// Periodic request task feeding this subscription
    poller: Option<JoinHandle<()>>,
}

impl Subscription {
    fn matches(&self, broadcast: &Broadcast) -> bool {
        self.category == broadcast.category()
            && self
                .filter
                .map_or(true, |address| broadcast.address() == Some(address))
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

/// Registered subscriptions, in registration order
#[derive(Default)]
pub struct BroadcastRegistry {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl BroadcastRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        category: Category,
        filter: Option<u16>,
        callback: BroadcastCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription {
            id,
            category,
            filter,
            callback,
            poller: None,
        });
        id
    }

    /// Tie a polling task to a subscription; it is aborted on unsubscribe
    ///
    /// If the subscription is already gone the task is aborted right away.
    pub fn attach_poller(&mut self, id: SubscriptionId, poller: JoinHandle<()>) -> bool {
        match self.subscriptions.iter_mut().find(|s| s.id == id) {
            Some(subscription) => {
                subscription.stop_poller();
                subscription.poller = Some(poller);
                true
            }
            None => {
                poller.abort();
                false
            }
        }
    }

    /// Remove a subscription; returns false if it was already removed
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(index) = self.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        let mut subscription = self.subscriptions.remove(index);
        subscription.stop_poller();
        true
    }

    /// Snapshot of the callbacks interested in `broadcast`
    ///
    /// Callbacks are invoked outside the registry lock, so they may
    /// unsubscribe themselves.
    pub fn matching(&self, broadcast: &Broadcast) -> Vec<BroadcastCallback> {
        self.subscriptions
            .iter()
            .filter(|s| s.matches(broadcast))
            .map(|s| s.callback.clone())
            .collect()
    }

    /// Drop every subscription and stop all pollers
    pub fn clear(&mut self) -> usize {
        let count = self.subscriptions.len();
        for mut subscription in self.subscriptions.drain(..) {
            subscription.stop_poller();
        }
        count
    }

    pub fn count(&self, category: Category) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.category == category)
            .count()
    }

    /// Subscriptions of `category` fed by pushed broadcasts rather than a
    /// poller
    pub fn pushed(&self, category: Category) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.category == category && s.poller.is_none())
            .count()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
