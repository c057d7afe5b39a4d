//! Station session
//!
//! Owns the UDP socket, the receive loop and the keep-alive task. Inbound
//! frames are first offered to the pending requests and, when unclaimed,
//! fanned out to broadcast subscribers.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    lock, resolve_host, Broadcast, BroadcastCallback, BroadcastRegistry, Category,
    CorrelationKey, PendingReply, PendingRequests, StationConfig, StationError, StationResult,
    SubscriptionId,
};
use crate::protocol::headers::*;
use crate::protocol::{
    split_datagram, CodecError, FirmwareVersion, Frame, LocoInfo, Packet, RailComData, SubMessage,
    SystemState, TrackPower, TurnoutInfo, XBusVersion,
};

/// Largest UDP payload; the station may batch many frames in one datagram
const RECV_BUFFER_SIZE: usize = 65_507;

/// RailCom request type for a single decoder
const RAILCOM_TYPE_ADDRESS: u8 = 0x01;
/// RailCom request type walking the station's circular queue
const RAILCOM_TYPE_CIRCULAR: u8 = 0x00;

struct Shared {
    remote: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    pending: Arc<Mutex<PendingRequests>>,
    registry: Mutex<BroadcastRegistry>,
    closed: AtomicBool,
    broadcast_flags: AtomicU32,
}

impl Shared {
    fn socket(&self) -> StationResult<Arc<UdpSocket>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StationError::Closed);
        }
        self.socket
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(StationError::Closed)
    }

    async fn send_frame(&self, frame: &Frame) -> StationResult<()> {
        let socket = self.socket()?;
        tracing::debug!("Sending {}", frame);
        socket.send(&frame.encode()).await?;
        Ok(())
    }

    fn flags_frame(flags: u32) -> Frame {
        Frame::new(LAN_SET_BROADCASTFLAGS, flags.to_le_bytes().to_vec())
    }

    /// Mark the session closed; returns the socket if this call closed it
    fn shutdown(&self) -> Option<Arc<UdpSocket>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }

        let socket = self
            .socket
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let cancelled = lock(&self.pending).cancel_all();
        let subscriptions = lock(&self.registry).clear();
        tracing::debug!(
            "Session to {} shut down ({} pending requests cancelled, {} subscriptions dropped)",
            self.remote,
            cancelled,
            subscriptions
        );
        socket
    }

    /// Handle one inbound datagram
    fn dispatch(&self, datagram: &[u8]) {
        for result in split_datagram(datagram) {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Discarding datagram from {}: {}", self.remote, e);
                    break;
                }
            };

            if !is_known(frame.header) {
                tracing::trace!("Ignoring unknown header {:#06x}", frame.header);
                continue;
            }

            let packet = match Packet::decode(frame) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!("Discarding frame from {}: {}", self.remote, e);
                    continue;
                }
            };
            tracing::debug!("Received {}", packet.frame);

            let unclaimed = lock(&self.pending).resolve(packet);
            if let Some(packet) = unclaimed {
                self.deliver(&packet);
            }
        }
    }

    fn deliver(&self, packet: &Packet) {
        let broadcast = match Broadcast::decode(packet) {
            Ok(Some(broadcast)) => broadcast,
            Ok(None) => {
                tracing::trace!("No subscriber category for {}", packet.frame);
                return;
            }
            Err(e) => {
                tracing::warn!("Discarding broadcast {}: {}", packet.frame, e);
                return;
            }
        };

        let callbacks = lock(&self.registry).matching(&broadcast);
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&broadcast))).is_err() {
                tracing::error!(
                    "Subscriber callback panicked on {:?} broadcast",
                    broadcast.category()
                );
            }
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => shared.dispatch(&buf[..len]),
            // ICMP port unreachable surfaces on the next receive
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tracing::warn!("Station {} refused datagram: {}", shared.remote, e);
            }
            Err(e) => {
                tracing::error!("Receive from {} failed: {}", shared.remote, e);
                shared.shutdown();
                break;
            }
        }
    }
}

/// Re-send the broadcast flags so the station keeps the client registered
async fn keepalive_loop(shared: Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let flags = shared.broadcast_flags.load(Ordering::SeqCst);
        match shared.send_frame(&Shared::flags_frame(flags)).await {
            Ok(()) => {}
            Err(StationError::Closed) => break,
            Err(e) => tracing::warn!("Keep-alive to {} failed: {}", shared.remote, e),
        }
    }
}

/// Send `frame` every `period` until the owning subscription is removed
async fn poll_loop(shared: Weak<Shared>, frame: Frame, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match shared.send_frame(&frame).await {
            Ok(()) => {}
            Err(StationError::Closed) => break,
            Err(e) => tracing::debug!("Poll request to {} failed: {}", shared.remote, e),
        }
    }
}

fn poll_period(freq_hz: f64) -> StationResult<Duration> {
    match Duration::try_from_secs_f64(1.0 / freq_hz) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(StationError::InvalidArgument(format!(
            "unusable polling frequency {} Hz",
            freq_hz
        ))),
    }
}

/// A session with one Z21 command station
///
/// Closing is idempotent. Dropping the session closes it too, sending a
/// best-effort logout without waiting.
pub struct Station {
    shared: Arc<Shared>,
    config: StationConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Station {
    /// Connect to a station with default settings for everything but the
    /// address and timeout
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> StationResult<Self> {
        let config = StationConfig::new(host)
            .with_port(port)
            .with_timeout(timeout);
        Self::connect_with(&config).await
    }

    pub async fn connect_with(config: &StationConfig) -> StationResult<Self> {
        if config.timeout.is_zero() || config.keepalive_interval.is_zero() {
            return Err(StationError::InvalidArgument(
                "timeout and keep-alive interval must be non-zero".to_string(),
            ));
        }

        let remote = resolve_host(&config.host, config.port)
            .await
            .map_err(|e| StationError::Connection(format!("{}: {}", config.host, e)))?;

        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let socket = Arc::new(socket);

        tracing::info!("Connecting to station at {}", remote);

        let shared = Arc::new(Shared {
            remote,
            socket: RwLock::new(Some(socket.clone())),
            pending: Arc::new(Mutex::new(PendingRequests::new())),
            registry: Mutex::new(BroadcastRegistry::new()),
            closed: AtomicBool::new(false),
            broadcast_flags: AtomicU32::new(BROADCAST_LOCO_INFO),
        });

        let receiver = tokio::spawn(receive_loop(shared.clone(), socket));
        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(&shared),
            config.keepalive_interval,
        ));

        let station = Self {
            shared,
            config: config.clone(),
            tasks: Mutex::new(vec![receiver, keepalive]),
        };

        match station.handshake().await {
            Ok(serial) => {
                tracing::info!("Connected to station {} (serial {})", remote, serial);
                Ok(station)
            }
            Err(e) => {
                tracing::warn!("Handshake with {} failed: {}", remote, e);
                station.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> StationResult<u32> {
        self.set_broadcast_flags(BROADCAST_LOCO_INFO).await?;
        self.get_serial_number().await
    }

    /// Log off and release the socket
    ///
    /// Unlike [`Station::logout`] this never fails, and closing twice is
    /// harmless.
    pub async fn close(&self) {
        match self.logout().await {
            Ok(()) | Err(StationError::Closed) => {}
            Err(e) => tracing::debug!("Logout to {} not sent: {}", self.shared.remote, e),
        }
        self.stop_tasks();
    }

    /// Tell the station this client is leaving and end the session
    ///
    /// The keep-alive stops first so the station does not register the
    /// client again.
    pub async fn logout(&self) -> StationResult<()> {
        let socket = self.shared.shutdown().ok_or(StationError::Closed)?;
        self.stop_tasks();
        let result = socket.send(&Frame::header_only(LAN_LOGOFF).encode()).await;
        tracing::info!("Closed connection to {}", self.shared.remote);
        result?;
        Ok(())
    }

    fn stop_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    // Primitives

    /// Send a frame without waiting for a reply
    pub async fn send(&self, frame: &Frame) -> StationResult<()> {
        self.shared.send_frame(frame).await
    }

    pub async fn send_xbus(&self, msg: &SubMessage) -> StationResult<()> {
        self.send(&Frame::xbus(msg)).await
    }

    /// Send a frame and wait for the reply identified by `key`
    pub async fn request(&self, frame: &Frame, key: CorrelationKey) -> StationResult<Packet> {
        self.request_with_timeout(frame, key, self.config.timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        frame: &Frame,
        key: CorrelationKey,
        timeout: Duration,
    ) -> StationResult<Packet> {
        // Registered before sending so a fast reply cannot slip past
        let reply = PendingReply::register(&self.shared.pending, key, timeout)?;
        self.send(frame).await?;
        reply.wait().await
    }

    /// Send an X-BUS command and return the X-BUS reply identified by `key`
    pub async fn request_xbus(
        &self,
        msg: &SubMessage,
        key: CorrelationKey,
    ) -> StationResult<SubMessage> {
        let packet = self.request(&Frame::xbus(msg), key).await?;
        packet.xbus.ok_or_else(|| {
            StationError::Protocol(CodecError::InvalidPayload(format!(
                "reply to {} is not an X-BUS message",
                key
            )))
        })
    }

    // Station information

    pub async fn get_serial_number(&self) -> StationResult<u32> {
        let reply = self
            .request(
                &Frame::header_only(LAN_GET_SERIAL_NUMBER),
                CorrelationKey::lan(LAN_GET_SERIAL_NUMBER),
            )
            .await?;

        match reply.payload() {
            [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
            other => Err(CodecError::InvalidPayload(format!(
                "serial number requires 4 bytes, got {}",
                other.len()
            ))
            .into()),
        }
    }

    pub async fn get_firmware_version(&self) -> StationResult<FirmwareVersion> {
        let reply = self
            .request_xbus(
                &SubMessage::get_firmware_version(),
                CorrelationKey::xbus(X_GET_FIRMWARE_VERSION_REPLY, DB0_FIRMWARE_VERSION),
            )
            .await?;
        Ok(FirmwareVersion::decode(&reply.data)?)
    }

    /// X-BUS protocol version and command station id
    pub async fn get_version(&self) -> StationResult<XBusVersion> {
        let reply = self
            .request_xbus(
                &SubMessage::get_version(),
                CorrelationKey::xbus(X_GET_VERSION_REPLY, DB0_GET_VERSION),
            )
            .await?;
        Ok(XBusVersion::decode(&reply.data)?)
    }

    // Track power

    pub async fn voltage_on(&self) -> StationResult<()> {
        self.send_xbus(&SubMessage::track_power_on()).await
    }

    /// Switch the track voltage off, stopping every locomotive
    pub async fn voltage_off(&self) -> StationResult<()> {
        self.send_xbus(&SubMessage::track_power_off()).await
    }

    // Broadcast flags

    /// Replace the broadcast flags; the keep-alive re-sends them
    pub async fn set_broadcast_flags(&self, flags: u32) -> StationResult<()> {
        self.shared.broadcast_flags.store(flags, Ordering::SeqCst);
        self.send(&Shared::flags_frame(flags)).await
    }

    /// Flags this session asked for
    pub fn broadcast_flags(&self) -> u32 {
        self.shared.broadcast_flags.load(Ordering::SeqCst)
    }

    /// Flags the station has on record for this client
    pub async fn get_broadcast_flags(&self) -> StationResult<u32> {
        let reply = self
            .request(
                &Frame::header_only(LAN_GET_BROADCASTFLAGS),
                CorrelationKey::lan(LAN_GET_BROADCASTFLAGS),
            )
            .await?;

        match reply.payload() {
            [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
            other => Err(CodecError::InvalidPayload(format!(
                "broadcast flags require 4 bytes, got {}",
                other.len()
            ))
            .into()),
        }
    }

    async fn update_broadcast_flags(&self, set: u32, clear: u32) -> StationResult<()> {
        let flags = (self.broadcast_flags() & !clear) | set;
        self.set_broadcast_flags(flags).await
    }

    /// Clear flags without waiting; the keep-alive re-sends them if this
    /// datagram is lost
    fn clear_broadcast_flags_now(&self, clear: u32) {
        let flags = self.shared.broadcast_flags.fetch_and(!clear, Ordering::SeqCst) & !clear;
        let Ok(socket) = self.shared.socket() else {
            return;
        };
        if let Err(e) = socket.try_send(&Shared::flags_frame(flags).encode()) {
            tracing::debug!("Broadcast flags to {} deferred: {}", self.shared.remote, e);
        }
    }

    /// Ask for RailCom broadcasts of every loco, or of subscribed locos only
    pub async fn enable_railcom_broadcasts(&self, all: bool) -> StationResult<()> {
        let flags = if all {
            BROADCAST_RAILCOM_ALL
        } else {
            BROADCAST_RAILCOM_SUBSCRIBED
        };
        self.update_broadcast_flags(flags, 0).await
    }

    pub async fn disable_railcom_broadcasts(&self) -> StationResult<()> {
        self.update_broadcast_flags(0, BROADCAST_RAILCOM_SUBSCRIBED | BROADCAST_RAILCOM_ALL)
            .await
    }

    // RailCom

    /// Request the RailCom reading of one decoder
    pub async fn get_railcom_data(&self, address: u16) -> StationResult<RailComData> {
        let reply = self
            .request(
                &railcom_request(Some(address)),
                CorrelationKey::railcom(address),
            )
            .await?;
        Ok(RailComData::decode(reply.payload())?)
    }

    // Subscriptions

    fn subscribe(
        &self,
        category: Category,
        filter: Option<u16>,
        callback: BroadcastCallback,
    ) -> StationResult<SubscriptionId> {
        let id = {
            // Checked under the registry lock; shutdown clears the registry
            // after marking the session closed
            let mut registry = lock(&self.shared.registry);
            if self.is_closed() {
                return Err(StationError::Closed);
            }
            registry.subscribe(category, filter, callback)
        };
        tracing::debug!("Subscribed {:?} (filter {:?}) as {:?}", category, filter, id);
        Ok(id)
    }

    fn attach_poller(&self, id: SubscriptionId, frame: Frame, period: Duration) {
        let poller = tokio::spawn(poll_loop(Arc::downgrade(&self.shared), frame, period));
        lock(&self.shared.registry).attach_poller(id, poller);
    }

    /// Receive system state updates
    ///
    /// With a positive `freq_hz` the state is polled at that rate; otherwise
    /// the system state broadcast flag is enabled and the station pushes
    /// changes on its own.
    pub async fn subscribe_system_state<F>(
        &self,
        freq_hz: f64,
        callback: F,
    ) -> StationResult<SubscriptionId>
    where
        F: Fn(&SystemState) + Send + Sync + 'static,
    {
        if freq_hz.is_nan() {
            return Err(StationError::InvalidArgument(
                "polling frequency is not a number".to_string(),
            ));
        }
        let period = if freq_hz > 0.0 {
            Some(poll_period(freq_hz)?)
        } else {
            None
        };

        let id = self.subscribe(
            Category::SystemState,
            None,
            Arc::new(move |broadcast: &Broadcast| {
                if let Broadcast::SystemState(state) = broadcast {
                    callback(state);
                }
            }),
        )?;

        match period {
            Some(period) => {
                self.attach_poller(id, Frame::header_only(LAN_SYSTEMSTATE_GETDATA), period)
            }
            None => {
                if let Err(e) = self.update_broadcast_flags(BROADCAST_SYSTEMSTATE, 0).await {
                    self.unsubscribe(id);
                    return Err(e);
                }
            }
        }
        Ok(id)
    }

    /// Receive loco info reports, optionally for one address only
    pub fn subscribe_loco_info<F>(
        &self,
        filter: Option<u16>,
        callback: F,
    ) -> StationResult<SubscriptionId>
    where
        F: Fn(&LocoInfo) + Send + Sync + 'static,
    {
        self.subscribe(
            Category::LocoInfo,
            filter,
            Arc::new(move |broadcast: &Broadcast| {
                if let Broadcast::LocoInfo(info) = broadcast {
                    callback(info);
                }
            }),
        )
    }

    /// Receive RailCom readings pushed by the station
    ///
    /// The station only pushes them once RailCom broadcasts are enabled.
    pub fn subscribe_railcom<F>(
        &self,
        filter: Option<u16>,
        callback: F,
    ) -> StationResult<SubscriptionId>
    where
        F: Fn(&RailComData) + Send + Sync + 'static,
    {
        self.subscribe(Category::RailCom, filter, railcom_callback(callback))
    }

    /// Poll RailCom readings at `freq_hz`
    ///
    /// With an address the decoder is polled directly; without one the
    /// station's circular queue is walked.
    pub fn subscribe_railcom_polled<F>(
        &self,
        address: Option<u16>,
        freq_hz: f64,
        callback: F,
    ) -> StationResult<SubscriptionId>
    where
        F: Fn(&RailComData) + Send + Sync + 'static,
    {
        if freq_hz.is_nan() || freq_hz <= 0.0 {
            return Err(StationError::InvalidArgument(format!(
                "polling frequency must be positive, got {}",
                freq_hz
            )));
        }
        let period = poll_period(freq_hz)?;

        let id = self.subscribe(Category::RailCom, address, railcom_callback(callback))?;
        self.attach_poller(id, railcom_request(address), period);
        Ok(id)
    }

    /// Receive track power changes
    pub fn subscribe_track_power<F>(&self, callback: F) -> StationResult<SubscriptionId>
    where
        F: Fn(TrackPower) + Send + Sync + 'static,
    {
        self.subscribe(
            Category::TrackPower,
            None,
            Arc::new(move |broadcast: &Broadcast| {
                if let Broadcast::TrackPower(power) = broadcast {
                    callback(*power);
                }
            }),
        )
    }

    /// Receive turnout position reports, optionally for one address only
    pub fn subscribe_turnout<F>(
        &self,
        filter: Option<u16>,
        callback: F,
    ) -> StationResult<SubscriptionId>
    where
        F: Fn(&TurnoutInfo) + Send + Sync + 'static,
    {
        self.subscribe(
            Category::Turnout,
            filter,
            Arc::new(move |broadcast: &Broadcast| {
                if let Broadcast::Turnout(info) = broadcast {
                    callback(info);
                }
            }),
        )
    }

    /// Remove a subscription and stop its polling; returns false if it was
    /// already gone
    ///
    /// Removing the last pushed system state subscription turns the system
    /// state broadcast flag off again.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (removed, pushed_before, pushed_after) = {
            let mut registry = lock(&self.shared.registry);
            let before = registry.pushed(Category::SystemState);
            let removed = registry.unsubscribe(id);
            (removed, before, registry.pushed(Category::SystemState))
        };
        if !removed {
            return false;
        }

        tracing::debug!("Unsubscribed {:?}", id);
        if pushed_before > 0
            && pushed_after == 0
            && self.broadcast_flags() & BROADCAST_SYSTEMSTATE != 0
        {
            self.clear_broadcast_flags_now(BROADCAST_SYSTEMSTATE);
        }
        true
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        if let Some(socket) = self.shared.shutdown() {
            let _ = socket.try_send(&Frame::header_only(LAN_LOGOFF).encode());
        }
        self.stop_tasks();
    }
}

fn railcom_request(address: Option<u16>) -> Frame {
    let payload = match address {
        Some(address) => {
            let [lo, hi] = address.to_le_bytes();
            vec![RAILCOM_TYPE_ADDRESS, lo, hi]
        }
        None => vec![RAILCOM_TYPE_CIRCULAR, 0x00, 0x00],
    };
    Frame::new(LAN_RAILCOM_GETDATA, payload)
}

fn railcom_callback<F>(callback: F) -> BroadcastCallback
where
    F: Fn(&RailComData) + Send + Sync + 'static,
{
    Arc::new(move |broadcast: &Broadcast| {
        if let Broadcast::RailCom(data) = broadcast {
            callback(data);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{self, SERIAL};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    const TIMEOUT: Duration = Duration::from_millis(300);

    fn system_state_payload(temperature: i16) -> Vec<u8> {
        let mut payload = vec![0u8; SystemState::SIZE];
        payload[6..8].copy_from_slice(&temperature.to_le_bytes());
        payload
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        assert!(!station.is_closed());
        assert_eq!(station.broadcast_flags(), BROADCAST_LOCO_INFO);

        let (serial, _) = tokio::join!(station.get_serial_number(), async {
            assert_eq!(fake.recv().await.header, LAN_GET_SERIAL_NUMBER);
            fake.send(Frame::new(LAN_GET_SERIAL_NUMBER, SERIAL.to_le_bytes().to_vec()))
                .await;
        });
        assert_eq!(assert_ok!(serial), SERIAL);
    }

    #[tokio::test]
    async fn test_connect_times_out_without_serial() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let result = Station::connect("127.0.0.1", port, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(StationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        let (firmware, serial, _) = tokio::join!(
            station.get_firmware_version(),
            station.get_serial_number(),
            async {
                fake.recv().await;
                fake.recv().await;
                // Answer in the opposite order
                fake.send(Frame::new(LAN_GET_SERIAL_NUMBER, vec![0x39, 0x30, 0, 0]))
                    .await;
                fake.send_xbus(SubMessage::new(0xF3, 0x0A, [0x01, 0x30]))
                    .await;
            }
        );

        assert_eq!(assert_ok!(serial), 12345);
        assert_eq!(assert_ok!(firmware).to_string(), "1.30");
    }

    #[tokio::test]
    async fn test_duplicate_request_conflicts() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        let (first, second, _) = tokio::join!(
            station.get_version(),
            station.get_version(),
            async {
                fake.recv_xbus().await;
                fake.send_xbus(SubMessage::new(0x63, 0x21, [0x36, 0x12]))
                    .await;
            }
        );

        assert_eq!(assert_ok!(first).station_id, 0x12);
        assert!(matches!(second, Err(StationError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (station, _fake) = testing::connect(TIMEOUT).await;

        let start = std::time::Instant::now();
        let result = station.get_version().await;

        assert!(matches!(result, Err(StationError::Timeout(_))));
        assert!(start.elapsed() >= TIMEOUT);

        // The key is free again after the timeout
        let again = station.get_version().await;
        assert!(matches!(again, Err(StationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_loop_survives_bad_datagrams() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        let (serial, _) = tokio::join!(station.get_serial_number(), async {
            fake.recv().await;
            // Truncated envelope
            fake.send_raw(&[0x05, 0x00]).await;
            // Bad X-BUS checksum
            fake.send_raw(&[0x07, 0x00, 0x40, 0x00, 0x61, 0x01, 0x00]).await;
            // Declared length overruns the datagram
            fake.send_raw(&[0x20, 0x00, 0x10, 0x00, 0x01]).await;
            // Unknown header
            fake.send(Frame::new(0x7777, vec![1, 2, 3])).await;
            // Then the real reply
            fake.send(Frame::new(LAN_GET_SERIAL_NUMBER, vec![0xAA, 0xBB, 0, 0]))
                .await;
        });

        assert_eq!(assert_ok!(serial), 0xBBAA);
        assert!(!station.is_closed());
    }

    #[tokio::test]
    async fn test_batched_frames_in_one_datagram() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_ok!(station.subscribe_track_power(move |power| {
            let _ = tx.send(power);
        }));

        let mut batch = bytes::BytesMut::new();
        Frame::xbus(&SubMessage::new(0x61, 0x01, Vec::new())).encode_into(&mut batch);
        Frame::xbus(&SubMessage::new(0x81, 0x00, Vec::new())).encode_into(&mut batch);
        fake.send_raw(&batch).await;

        assert_eq!(rx.recv().await, Some(TrackPower::On));
        assert_eq!(rx.recv().await, Some(TrackPower::EmergencyStop));
    }

    #[tokio::test]
    async fn test_close_cancels_pending() {
        let (station, fake) = testing::connect(Duration::from_secs(5)).await;

        let (result, _) = tokio::join!(station.get_version(), async {
            fake.recv_xbus().await;
            station.close().await;
        });
        assert!(matches!(result, Err(StationError::Closed)));
        assert!(station.is_closed());

        assert_eq!(fake.recv().await.header, LAN_LOGOFF);

        // Idempotent, and no second logout
        station.close().await;
        assert!(fake.try_recv(Duration::from_millis(100)).await.is_none());

        assert!(matches!(
            station.get_serial_number().await,
            Err(StationError::Closed)
        ));
        assert_err!(station.voltage_on().await);
    }

    #[tokio::test]
    async fn test_drop_sends_logout() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        drop(station);
        assert_eq!(fake.recv().await.header, LAN_LOGOFF);
    }

    #[tokio::test]
    async fn test_keepalive_resends_flags() {
        let (station, fake) = testing::connect_with(|config| {
            config
                .with_timeout(TIMEOUT)
                .with_keepalive_interval(Duration::from_millis(150))
        })
        .await;

        let flags = fake.recv().await;
        assert_eq!(flags.header, LAN_SET_BROADCASTFLAGS);
        assert_eq!(&flags.payload[..], &BROADCAST_LOCO_INFO.to_le_bytes());
        assert!(!station.is_closed());
    }

    #[tokio::test]
    async fn test_logout_ends_session() {
        let (station, fake) = testing::connect_with(|config| {
            config
                .with_timeout(TIMEOUT)
                .with_keepalive_interval(Duration::from_millis(150))
        })
        .await;

        assert_ok!(station.logout().await);
        assert_eq!(fake.recv().await.header, LAN_LOGOFF);
        assert!(station.is_closed());

        // No keep-alive registers the client again
        assert!(fake.try_recv(Duration::from_millis(400)).await.is_none());

        assert!(matches!(station.logout().await, Err(StationError::Closed)));
        station.close().await;
        assert!(fake.try_recv(Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_fails() {
        let (station, _fake) = testing::connect(TIMEOUT).await;
        station.close().await;

        assert!(matches!(
            station.subscribe_track_power(|_| {}),
            Err(StationError::Closed)
        ));
        assert!(matches!(
            station.subscribe_loco_info(Some(3), |_| {}),
            Err(StationError::Closed)
        ));
        assert!(matches!(
            station.subscribe_railcom_polled(None, 10.0, |_| {}),
            Err(StationError::Closed)
        ));
        assert!(matches!(
            station.subscribe_system_state(1.0, |_| {}).await,
            Err(StationError::Closed)
        ));
        assert_eq!(lock(&station.shared.registry).len(), 0);
    }

    #[tokio::test]
    async fn test_datagram_larger_than_ethernet_mtu() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_ok!(station.subscribe_track_power(move |power| {
            let _ = tx.send(power);
        }));

        let mut batch = bytes::BytesMut::new();
        for _ in 0..300 {
            Frame::xbus(&SubMessage::new(0x61, 0x01, Vec::new())).encode_into(&mut batch);
        }
        assert!(batch.len() > 1500);
        fake.send_raw(&batch).await;

        for _ in 0..300 {
            assert_eq!(rx.recv().await, Some(TrackPower::On));
        }
    }

    #[tokio::test]
    async fn test_two_subscribers_and_unsubscribe() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let first = assert_ok!(station.subscribe_track_power(move |power| {
            let _ = tx1.send(power);
        }));
        assert_ok!(station.subscribe_track_power(move |power| {
            let _ = tx2.send(power);
        }));

        fake.send_xbus(SubMessage::new(0x61, 0x01, Vec::new())).await;
        assert_eq!(rx1.recv().await, Some(TrackPower::On));
        assert_eq!(rx2.recv().await, Some(TrackPower::On));

        assert!(station.unsubscribe(first));
        assert!(!station.unsubscribe(first));

        fake.send_xbus(SubMessage::new(0x61, 0x00, Vec::new())).await;
        assert_eq!(rx2.recv().await, Some(TrackPower::Off));
        // The removed subscription's sender was dropped with it
        assert_eq!(rx1.recv().await, None);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        assert_ok!(station.subscribe_track_power(|_| panic!("subscriber bug")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_ok!(station.subscribe_track_power(move |power| {
            let _ = tx.send(power);
        }));

        fake.send_xbus(SubMessage::new(0x61, 0x01, Vec::new())).await;
        assert_eq!(rx.recv().await, Some(TrackPower::On));

        fake.send_xbus(SubMessage::new(0x61, 0x00, Vec::new())).await;
        assert_eq!(rx.recv().await, Some(TrackPower::Off));
    }

    #[tokio::test]
    async fn test_system_state_polling() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = assert_ok!(
            station
                .subscribe_system_state(20.0, move |state| {
                    let _ = tx.send(state.temperature);
                })
                .await
        );

        assert_eq!(fake.recv().await.header, LAN_SYSTEMSTATE_GETDATA);
        fake.send(Frame::new(LAN_SYSTEMSTATE_DATACHANGED, system_state_payload(31)))
            .await;
        assert_eq!(rx.recv().await, Some(31));

        station.unsubscribe(id);
        // Drain a poll that may already be on the wire, then expect silence
        while fake.try_recv(Duration::from_millis(100)).await.is_some() {}
        assert!(fake.try_recv(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_system_state_push_mode() {
        let (station, fake) = testing::connect(TIMEOUT).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = assert_ok!(
            station
                .subscribe_system_state(0.0, move |state| {
                    let _ = tx.send(state.temperature);
                })
                .await
        );

        let flags = fake.recv().await;
        assert_eq!(flags.header, LAN_SET_BROADCASTFLAGS);
        assert_eq!(
            &flags.payload[..],
            &(BROADCAST_LOCO_INFO | BROADCAST_SYSTEMSTATE).to_le_bytes()
        );

        fake.send(Frame::new(LAN_SYSTEMSTATE_DATACHANGED, system_state_payload(40)))
            .await;
        assert_eq!(rx.recv().await, Some(40));

        // The last pushed subscriber turns the flag off again
        assert!(station.unsubscribe(id));
        let flags = fake.recv().await;
        assert_eq!(flags.header, LAN_SET_BROADCASTFLAGS);
        assert_eq!(&flags.payload[..], &BROADCAST_LOCO_INFO.to_le_bytes());
        assert_eq!(station.broadcast_flags(), BROADCAST_LOCO_INFO);
    }

    #[tokio::test]
    async fn test_system_state_flag_kept_while_pushed_subscribers_remain() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        let first = assert_ok!(station.subscribe_system_state(0.0, |_| {}).await);
        fake.recv().await;
        let second = assert_ok!(station.subscribe_system_state(-1.0, |_| {}).await);
        fake.recv().await;
        let polled = assert_ok!(station.subscribe_system_state(0.5, |_| {}).await);
        assert_eq!(fake.recv().await.header, LAN_SYSTEMSTATE_GETDATA);

        assert!(station.unsubscribe(first));
        assert!(station.unsubscribe(polled));
        assert!(fake.try_recv(Duration::from_millis(100)).await.is_none());
        assert_ne!(station.broadcast_flags() & BROADCAST_SYSTEMSTATE, 0);

        assert!(station.unsubscribe(second));
        let flags = fake.recv().await;
        assert_eq!(&flags.payload[..], &BROADCAST_LOCO_INFO.to_le_bytes());
    }

    #[tokio::test]
    async fn test_invalid_polling_frequency() {
        let (station, _fake) = testing::connect(TIMEOUT).await;
        assert!(matches!(
            station.subscribe_system_state(f64::NAN, |_| {}).await,
            Err(StationError::InvalidArgument(_))
        ));
        assert!(matches!(
            station.subscribe_railcom_polled(Some(3), 0.0, |_| {}),
            Err(StationError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_railcom_flags_and_request() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        assert_ok!(station.enable_railcom_broadcasts(true).await);
        let flags = fake.recv().await;
        let expected = BROADCAST_LOCO_INFO | BROADCAST_RAILCOM_ALL;
        assert_eq!(&flags.payload[..], &expected.to_le_bytes());

        assert_ok!(station.enable_railcom_broadcasts(false).await);
        let flags = fake.recv().await;
        let expected = BROADCAST_LOCO_INFO | BROADCAST_RAILCOM_ALL | BROADCAST_RAILCOM_SUBSCRIBED;
        assert_eq!(&flags.payload[..], &expected.to_le_bytes());

        assert_ok!(station.disable_railcom_broadcasts().await);
        let flags = fake.recv().await;
        assert_eq!(&flags.payload[..], &BROADCAST_LOCO_INFO.to_le_bytes());

        let (data, _) = tokio::join!(station.get_railcom_data(3), async {
            let request = fake.recv().await;
            assert_eq!(request.header, LAN_RAILCOM_GETDATA);
            assert_eq!(&request.payload[..], &[0x01, 0x03, 0x00]);

            // Another decoder's reading must not satisfy the request
            let mut other = vec![0x05, 0x00];
            other.extend_from_slice(&[0u8; 11]);
            fake.send(Frame::new(LAN_RAILCOM_DATACHANGED, other)).await;

            let reply = vec![0x03, 0x00, 0x0A, 0, 0, 0, 0, 0, 0, 0x01, 0x20, 0, 0];
            fake.send(Frame::new(LAN_RAILCOM_DATACHANGED, reply)).await;
        });

        let data = assert_ok!(data);
        assert_eq!(data.address, 3);
        assert_eq!(data.receive_counter, 10);
        assert_eq!(data.speed, 0x20);
    }

    #[tokio::test]
    async fn test_track_power_commands() {
        let (station, fake) = testing::connect(TIMEOUT).await;

        assert_ok!(station.voltage_on().await);
        assert_eq!(fake.recv_xbus().await, SubMessage::track_power_on());

        assert_ok!(station.voltage_off().await);
        assert_eq!(fake.recv_xbus().await, SubMessage::track_power_off());
    }
}
