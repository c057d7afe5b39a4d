//! Locomotive controller
//!
//! A [`Loco`] drives one decoder address through a borrowed [`Station`] and
//! keeps a cached [`LocoState`] that follows the station's loco info echoes.

mod speed;

pub use speed::SpeedCommand;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::network::{
    lock, CorrelationKey, Station, StationError, StationResult, SubscriptionId,
};
use crate::protocol::{
    Direction, FunctionAction, FunctionBank, Functions, LocoInfo, RailComData, SpeedStep,
    SubMessage, ThrottleSteps, MAX_LOCO_ADDRESS,
};

/// Function index of the headlights
pub const HEADLIGHTS: u8 = 0;

/// Cached state of a locomotive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocoState {
    pub address: u16,
    /// Signed speed, negative when reversing
    pub speed_percentage: f32,
    pub direction: Direction,
    pub steps: ThrottleSteps,
    pub functions: Functions,
    /// Another client controls the loco
    pub busy: bool,
}

impl LocoState {
    pub fn new(address: u16, steps: ThrottleSteps) -> Self {
        Self {
            address,
            speed_percentage: 0.0,
            direction: Direction::Forward,
            steps,
            functions: Functions::default(),
            busy: false,
        }
    }

    /// Merge a loco info report; fields the report lacks are kept
    pub fn apply(&mut self, info: &LocoInfo) {
        if let Some(busy) = info.busy {
            self.busy = busy;
        }
        if let Some(steps) = info.steps {
            self.steps = steps;
        }
        if let Some(direction) = info.direction {
            self.direction = direction;
        }
        if let Some(percentage) = info.speed_percentage() {
            self.speed_percentage = percentage;
        }
        self.functions.merge(info.functions, info.functions_mask);
    }

    fn apply_speed(&mut self, command: &SpeedCommand) {
        self.direction = command.direction;
        self.speed_percentage = command.percentage;
    }
}

/// Controller for one locomotive address
///
/// Subscriptions made through the controller are removed when it is
/// dropped.
pub struct Loco<'a> {
    station: &'a Station,
    address: u16,
    steps: ThrottleSteps,
    state: Arc<Mutex<LocoState>>,
    railcom: Arc<Mutex<Option<RailComData>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl<'a> Loco<'a> {
    /// Take control of `address` (1..=9999)
    ///
    /// The station only reports locos a client has asked about, so the
    /// loco's state is requested once. A loco that is not on the track
    /// never answers; the timeout is not an error.
    pub async fn control(
        station: &'a Station,
        address: u16,
        steps: ThrottleSteps,
    ) -> StationResult<Self> {
        if !(1..=MAX_LOCO_ADDRESS).contains(&address) {
            return Err(StationError::InvalidArgument(format!(
                "loco address must be within 1..={}, got {}",
                MAX_LOCO_ADDRESS, address
            )));
        }

        let state = Arc::new(Mutex::new(LocoState::new(address, steps)));
        let cache = state.clone();
        let echo = station.subscribe_loco_info(Some(address), move |info| {
            lock(&cache).apply(info);
        })?;

        let loco = Self {
            station,
            address,
            steps,
            state,
            railcom: Arc::new(Mutex::new(None)),
            subscriptions: Mutex::new(vec![echo]),
        };

        match loco.refresh().await {
            Ok(_) => {}
            Err(StationError::Timeout(_)) => {
                tracing::debug!("Loco {} did not report its state", address)
            }
            Err(e) => return Err(e),
        }

        tracing::debug!("Controlling loco {} with {}", address, steps);
        Ok(loco)
    }

    /// Take control using the station's configured throttle steps
    pub async fn control_default(station: &'a Station, address: u16) -> StationResult<Self> {
        Self::control(station, address, station.config().default_steps).await
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Throttle steps used for drive commands
    pub fn steps(&self) -> ThrottleSteps {
        self.steps
    }

    /// Drive at a signed percentage of full speed
    pub async fn drive(&self, percentage: f32) -> StationResult<()> {
        let command = SpeedCommand::from_percentage(self.steps, percentage)?;
        self.send_speed(self.steps, &command).await
    }

    /// Stop using the decoder's braking curve
    pub async fn stop(&self) -> StationResult<()> {
        self.stop_with(SpeedStep::Stop).await
    }

    /// Emergency stop, bypassing the braking curve
    pub async fn halt(&self) -> StationResult<()> {
        self.stop_with(SpeedStep::EmergencyStop).await
    }

    async fn stop_with(&self, step: SpeedStep) -> StationResult<()> {
        let direction = lock(&self.state).direction;
        self.send_speed(self.steps, &SpeedCommand::stopped(direction, step))
            .await
    }

    async fn send_speed(&self, steps: ThrottleSteps, command: &SpeedCommand) -> StationResult<()> {
        let speed_byte = command.speed_byte(steps);
        self.station
            .send_xbus(&SubMessage::loco_drive(self.address, steps, speed_byte))
            .await?;
        lock(&self.state).apply_speed(command);
        Ok(())
    }

    /// Switch function `index` (0..=31) and send its bank's absolute state
    pub async fn set_function(&self, index: u8, action: FunctionAction) -> StationResult<()> {
        let bank = FunctionBank::for_function(index).ok_or_else(|| {
            StationError::InvalidArgument(format!(
                "function index must be within 0..{}, got {}",
                Functions::COUNT,
                index
            ))
        })?;

        let (on, functions) = {
            let state = lock(&self.state);
            let on = match action {
                FunctionAction::On => true,
                FunctionAction::Off => false,
                FunctionAction::Toggle => !state.functions.get(index),
            };
            let mut functions = state.functions;
            functions.set(index, on);
            (on, functions)
        };

        self.station
            .send_xbus(&SubMessage::loco_function_bank(
                self.address,
                bank,
                bank.pack(functions),
            ))
            .await?;
        lock(&self.state).functions.set(index, on);
        Ok(())
    }

    pub async fn function_on(&self, index: u8) -> StationResult<()> {
        self.set_function(index, FunctionAction::On).await
    }

    pub async fn function_off(&self, index: u8) -> StationResult<()> {
        self.set_function(index, FunctionAction::Off).await
    }

    pub async fn function_toggle(&self, index: u8) -> StationResult<()> {
        self.set_function(index, FunctionAction::Toggle).await
    }

    pub async fn set_headlights(&self, on: bool) -> StationResult<()> {
        let action = if on {
            FunctionAction::On
        } else {
            FunctionAction::Off
        };
        self.set_function(HEADLIGHTS, action).await
    }

    /// Snapshot of the cached state
    pub fn get_state(&self) -> LocoState {
        lock(&self.state).clone()
    }

    /// Ask the station for the loco's state and merge it into the cache
    pub async fn refresh(&self) -> StationResult<LocoState> {
        let reply = self
            .station
            .request_xbus(
                &SubMessage::loco_get_info(self.address),
                CorrelationKey::loco_info(self.address),
            )
            .await?;
        let info = LocoInfo::decode(&reply.data_bytes())?;

        let mut state = lock(&self.state);
        state.apply(&info);
        Ok(state.clone())
    }

    /// Call `callback` with the updated state after every loco info echo
    pub fn subscribe_state<F>(&self, callback: F) -> StationResult<SubscriptionId>
    where
        F: Fn(&LocoState) + Send + Sync + 'static,
    {
        let state = self.state.clone();
        let id = self
            .station
            .subscribe_loco_info(Some(self.address), move |_| {
                let snapshot = lock(&state).clone();
                callback(&snapshot);
            })?;
        lock(&self.subscriptions).push(id);
        Ok(id)
    }

    /// Call `callback` for every RailCom reading of this loco
    pub fn subscribe_railcom<F>(&self, callback: F) -> StationResult<SubscriptionId>
    where
        F: Fn(&RailComData) + Send + Sync + 'static,
    {
        let cache = self.railcom.clone();
        let id = self
            .station
            .subscribe_railcom(Some(self.address), move |data| {
                *lock(&cache) = Some(*data);
                callback(data);
            })?;
        lock(&self.subscriptions).push(id);
        Ok(id)
    }

    /// Last RailCom reading seen by this controller
    pub fn railcom(&self) -> Option<RailComData> {
        *lock(&self.railcom)
    }

    /// Request a RailCom reading; times out if the decoder does not answer
    pub async fn get_railcom_data(&self) -> StationResult<RailComData> {
        let data = self.station.get_railcom_data(self.address).await?;
        *lock(&self.railcom) = Some(data);
        Ok(data)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.subscriptions).retain(|s| *s != id);
        self.station.unsubscribe(id)
    }
}

impl Drop for Loco<'_> {
    fn drop(&mut self) {
        for id in lock(&self.subscriptions).drain(..) {
            self.station.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing;
    use crate::protocol::headers::LAN_LOGOFF;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    const TIMEOUT: Duration = Duration::from_millis(300);

    #[test]
    fn test_state_apply_partial_info() {
        let mut state = LocoState::new(3, ThrottleSteps::Steps128);
        state.functions.set(20, true);

        // Only F0..F12 present: F20 must survive
        let info = LocoInfo::decode(&[0x00, 0x03, 0x0C, 0x40, 0x10, 0x00]).unwrap();
        state.apply(&info);

        assert!(state.busy);
        assert_eq!(state.direction, Direction::Reverse);
        assert_eq!(state.speed_percentage, -50.0);
        assert!(state.functions.get(0));
        assert!(state.functions.get(20));
    }

    #[tokio::test]
    async fn test_control_validates_address() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        for bad in [0, 10_000] {
            assert!(matches!(
                Loco::control(&station, bad, ThrottleSteps::Steps128).await,
                Err(StationError::InvalidArgument(_))
            ));
        }
        assert!(fake.try_recv(Duration::from_millis(100)).await.is_none());

        let loco = testing::control(&station, &fake, 9999, ThrottleSteps::Steps28).await;
        let state = loco.get_state();
        assert_eq!(state.speed_percentage, 0.0);
        assert_eq!(state.direction, Direction::Forward);
        assert_eq!(state.steps, ThrottleSteps::Steps28);
        assert!(state.functions.active().is_empty());
    }

    #[tokio::test]
    async fn test_control_requests_loco_info() {
        let (station, fake) = testing::connect(Duration::from_millis(100)).await;

        // No answer: the loco may be off the track
        let loco = assert_ok!(Loco::control(&station, 3, ThrottleSteps::Steps128).await);

        let request = fake.recv().await;
        let xor = 0xE3 ^ 0xF0 ^ 0x00 ^ 0x03;
        assert_eq!(&request.payload[..], &[0xE3, 0xF0, 0x00, 0x03, xor]);
        assert_eq!(loco.get_state(), LocoState::new(3, ThrottleSteps::Steps128));
    }

    #[tokio::test]
    async fn test_control_merges_reported_state() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        let (loco, _) = tokio::join!(Loco::control(&station, 3, ThrottleSteps::Steps28), async {
            fake.recv_xbus().await;
            // 128 steps, busy, reverse step 63, F1 on
            fake.send_xbus(SubMessage::new(0xEF, 0x00, [0x03, 0x0C, 0x40, 0x01]))
                .await;
        });
        let loco = assert_ok!(loco);

        let state = loco.get_state();
        assert!(state.busy);
        assert_eq!(state.steps, ThrottleSteps::Steps128);
        assert_eq!(state.direction, Direction::Reverse);
        assert!(state.functions.get(1));

        // Commands keep the steps the controller was created with
        assert_eq!(loco.steps(), ThrottleSteps::Steps28);
        assert_ok!(loco.stop().await);
        let stop = fake.recv_xbus().await;
        assert_eq!(stop.sub_command, ThrottleSteps::Steps28.drive_db0());
        assert_eq!(stop.data, vec![0x00, 0x03, 0x00]);
    }

    #[tokio::test]
    async fn test_control_on_closed_station() {
        let (station, _fake) = testing::connect(TIMEOUT).await;
        station.close().await;
        assert!(matches!(
            Loco::control(&station, 3, ThrottleSteps::Steps128).await,
            Err(StationError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_drive_stop_close_end_to_end() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        assert_ok!(station.voltage_on().await);
        assert_eq!(&fake.recv().await.payload[..], &[0x21, 0x81, 0xA0]);

        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;
        assert_ok!(loco.drive(50.0).await);

        let drive = fake.recv().await;
        let xor = 0xE4 ^ 0x13 ^ 0x00 ^ 0x03 ^ 0xC0;
        assert_eq!(&drive.payload[..], &[0xE4, 0x13, 0x00, 0x03, 0xC0, xor]);
        assert_eq!(loco.get_state().speed_percentage, 50.0);

        assert_ok!(loco.stop().await);
        let stop = fake.recv_xbus().await;
        assert_eq!(stop.data, vec![0x00, 0x03, 0x80]);
        assert_eq!(loco.get_state().speed_percentage, 0.0);

        drop(loco);
        station.close().await;
        assert_eq!(fake.recv().await.header, LAN_LOGOFF);
    }

    #[tokio::test]
    async fn test_halt_keeps_reverse_direction() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 200, ThrottleSteps::Steps128).await;

        assert_ok!(loco.drive(-100.0).await);
        assert_eq!(fake.recv_xbus().await.data, vec![0xC0, 0xC8, 0x7F]);

        assert_ok!(loco.halt().await);
        assert_eq!(fake.recv_xbus().await.data, vec![0xC0, 0xC8, 0x01]);
        assert_eq!(loco.get_state().direction, Direction::Reverse);
    }

    #[tokio::test]
    async fn test_drive_rejects_before_sending() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;

        assert!(matches!(
            loco.drive(150.0).await,
            Err(StationError::InvalidArgument(_))
        ));
        assert!(matches!(
            loco.set_function(32, FunctionAction::On).await,
            Err(StationError::InvalidArgument(_))
        ));
        assert!(fake.try_recv(Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn test_functions_across_group_boundaries() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;

        let expected = [
            (12u8, 0x22u8, 0x08u8),
            (13, 0x23, 0x01),
            (20, 0x23, 0x81),
            (21, 0x28, 0x01),
            (28, 0x28, 0x81),
            (29, 0x29, 0x01),
        ];
        for (index, db0, bits) in expected {
            assert_ok!(loco.function_on(index).await);
            let msg = fake.recv_xbus().await;
            assert_eq!(msg.command, 0xE4);
            assert_eq!(msg.sub_command, db0, "bank for F{}", index);
            assert_eq!(msg.data, vec![0x00, 0x03, bits], "bits for F{}", index);
        }

        assert_eq!(
            loco.get_state().functions.active(),
            vec![12, 13, 20, 21, 28, 29]
        );
    }

    #[tokio::test]
    async fn test_every_function_reads_back() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;

        for index in 0..Functions::COUNT {
            assert_ok!(loco.function_on(index).await);
            fake.recv().await;
        }
        assert_eq!(loco.get_state().functions.bits(), u32::MAX);

        for index in (0..Functions::COUNT).step_by(2) {
            assert_ok!(loco.function_off(index).await);
            fake.recv().await;
        }
        assert_eq!(loco.get_state().functions.bits(), 0xAAAA_AAAA);
    }

    #[tokio::test]
    async fn test_toggle_and_headlights() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;

        assert_ok!(loco.set_headlights(true).await);
        assert_eq!(fake.recv_xbus().await.data, vec![0x00, 0x03, 0x10]);

        assert_ok!(loco.function_toggle(1).await);
        assert_eq!(fake.recv_xbus().await.data, vec![0x00, 0x03, 0x11]);

        assert_ok!(loco.function_toggle(0).await);
        assert_eq!(fake.recv_xbus().await.data, vec![0x00, 0x03, 0x01]);
        assert_eq!(loco.get_state().functions.active(), vec![1]);
    }

    #[tokio::test]
    async fn test_state_follows_echo() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_ok!(loco.subscribe_state(move |state| {
            let _ = tx.send(state.clone());
        }));

        // Another loco's echo is ignored
        fake.send_xbus(SubMessage::new(0xEF, 0x00, [0x04, 0x04, 0xFF, 0x00]))
            .await;
        // 28 steps, forward step 28, F0 on
        fake.send_xbus(SubMessage::new(0xEF, 0x00, [0x03, 0x02, 0x9F, 0x10]))
            .await;

        let state = rx.recv().await.unwrap();
        assert_eq!(state.steps, ThrottleSteps::Steps28);
        assert_eq!(state.speed_percentage, 100.0);
        assert!(state.functions.get(0));
        assert_eq!(loco.get_state(), state);
    }

    #[tokio::test]
    async fn test_refresh_merges_reply() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;

        let (state, _) = tokio::join!(loco.refresh(), async {
            let request = fake.recv_xbus().await;
            assert_eq!(request, SubMessage::loco_get_info(3));
            fake.send_xbus(SubMessage::new(0xEF, 0x00, [0x03, 0x04, 0xC0, 0x02]))
                .await;
        });

        let state = assert_ok!(state);
        assert_eq!(state.speed_percentage, 50.0);
        assert!(state.functions.get(2));
    }

    #[tokio::test]
    async fn test_railcom_cache() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;
        assert_eq!(loco.railcom(), None);

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_ok!(loco.subscribe_railcom(move |data| {
            let _ = tx.send(data.qos);
        }));

        let reading = vec![0x03, 0x00, 0x05, 0, 0, 0, 0, 0, 0, 0x04, 0, 0x64, 0];
        fake.send(crate::protocol::Frame::new(0x88, reading)).await;

        assert_eq!(rx.recv().await, Some(0x64));
        assert_eq!(loco.railcom().map(|d| d.receive_counter), Some(5));
    }

    #[tokio::test]
    async fn test_railcom_request_times_out() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;

        let result = loco.get_railcom_data().await;
        assert!(matches!(result, Err(StationError::Timeout(_))));
        assert_eq!(fake.recv().await.header, 0x89);
    }

    #[tokio::test]
    async fn test_drop_removes_subscriptions() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let loco = testing::control(&station, &fake, 3, ThrottleSteps::Steps128).await;
            assert_ok!(loco.subscribe_state(move |state| {
                let _ = tx.send(state.address);
            }));
        }

        fake.send_xbus(SubMessage::new(0xEF, 0x00, [0x03, 0x04, 0x80]))
            .await;
        // The callback, and its sender, went away with the controller
        assert_eq!(rx.recv().await, None);
    }
}
