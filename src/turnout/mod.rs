//! Turnout (accessory decoder) controller

use std::sync::Mutex;
use std::time::Duration;

use crate::network::{
    lock, CorrelationKey, Station, StationError, StationResult, SubscriptionId,
};
use crate::protocol::{SubMessage, TurnoutInfo, TurnoutPosition, MAX_TURNOUT_ADDRESS};

/// Activation pulse used by [`SwitchMode::immediate`]
pub const DEFAULT_ACTIVATE_DURATION: Duration = Duration::from_millis(150);

/// How a switch command is timed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwitchMode {
    /// The station queues the command and times the pulse itself
    #[default]
    Queued,
    /// Activate now, wait, then deactivate
    Immediate(Duration),
}

impl SwitchMode {
    pub fn immediate() -> Self {
        SwitchMode::Immediate(DEFAULT_ACTIVATE_DURATION)
    }
}

/// Controller for one turnout address (0..=2047)
pub struct Turnout<'a> {
    station: &'a Station,
    address: u16,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl<'a> Turnout<'a> {
    pub fn new(station: &'a Station, address: u16) -> StationResult<Self> {
        if address > MAX_TURNOUT_ADDRESS {
            return Err(StationError::InvalidArgument(format!(
                "turnout address must be within 0..={}, got {}",
                MAX_TURNOUT_ADDRESS, address
            )));
        }
        Ok(Self {
            station,
            address,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Switch to `P0` or `P1`
    pub async fn switch(&self, position: TurnoutPosition, mode: SwitchMode) -> StationResult<()> {
        let output = position.output().ok_or_else(|| {
            StationError::InvalidArgument(format!("cannot switch to {:?}", position))
        })?;

        tracing::debug!("Switching turnout {} to {:?}", self.address, position);
        match mode {
            SwitchMode::Queued => self.activate(output, true).await,
            SwitchMode::Immediate(duration) => {
                self.activate(output, false).await?;
                tokio::time::sleep(duration).await;
                self.deactivate(output, false).await
            }
        }
    }

    /// Energise output 0 or 1
    pub async fn activate(&self, output: u8, queue: bool) -> StationResult<()> {
        self.set_output(output, true, queue).await
    }

    pub async fn deactivate(&self, output: u8, queue: bool) -> StationResult<()> {
        self.set_output(output, false, queue).await
    }

    async fn set_output(&self, output: u8, activate: bool, queue: bool) -> StationResult<()> {
        if output > 1 {
            return Err(StationError::InvalidArgument(format!(
                "turnout output must be 0 or 1, got {}",
                output
            )));
        }
        self.station
            .send_xbus(&SubMessage::set_turnout(self.address, output, activate, queue))
            .await
    }

    /// Ask the station for the current position
    pub async fn get_state(&self) -> StationResult<TurnoutPosition> {
        let reply = self
            .station
            .request_xbus(
                &SubMessage::turnout_get_info(self.address),
                CorrelationKey::turnout_info(self.address),
            )
            .await?;
        let info = TurnoutInfo::decode(&reply.data_bytes())?;
        Ok(info.position)
    }

    /// Call `callback` whenever the station reports this turnout
    pub fn subscribe_state<F>(&self, callback: F) -> StationResult<SubscriptionId>
    where
        F: Fn(TurnoutPosition) + Send + Sync + 'static,
    {
        let id = self
            .station
            .subscribe_turnout(Some(self.address), move |info| callback(info.position))?;
        lock(&self.subscriptions).push(id);
        Ok(id)
    }
}

impl Drop for Turnout<'_> {
    fn drop(&mut self) {
        for id in lock(&self.subscriptions).drain(..) {
            self.station.unsubscribe(id);
        }
    }
}
