//! Fake station used by the session, loco and turnout tests

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::{Station, StationConfig};
use crate::loco::Loco;
use crate::protocol::headers::{LAN_GET_SERIAL_NUMBER, LAN_SET_BROADCASTFLAGS, X_LOCO_INFO};
use crate::protocol::{loco_address_bytes, Frame, SubMessage, ThrottleSteps};

pub(crate) const SERIAL: u32 = 0x0001_E240;

/// The far end of a connected session
pub(crate) struct FakeStation {
    pub socket: UdpSocket,
    pub peer: SocketAddr,
}

impl FakeStation {
    /// Receive the next frame, failing the test after two seconds
    pub async fn recv(&self) -> Frame {
        recv_frame(&self.socket).await.0
    }

    /// Receive the next frame, or `None` if nothing arrives within `wait`
    pub async fn try_recv(&self, wait: Duration) -> Option<Frame> {
        let mut buf = [0u8; 1024];
        match tokio::time::timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(Frame::decode(&buf[..len]).unwrap()),
            _ => None,
        }
    }

    /// Receive the next X-BUS command
    pub async fn recv_xbus(&self) -> SubMessage {
        let frame = self.recv().await;
        SubMessage::decode(&frame.payload).unwrap()
    }

    pub async fn send(&self, frame: Frame) {
        self.send_raw(&frame.encode()).await;
    }

    pub async fn send_xbus(&self, msg: SubMessage) {
        self.send(Frame::xbus(&msg)).await;
    }

    pub async fn send_raw(&self, bytes: &[u8]) {
        self.socket.send_to(bytes, self.peer).await.unwrap();
    }
}

async fn recv_frame(socket: &UdpSocket) -> (Frame, SocketAddr) {
    let mut buf = [0u8; 1024];
    let (len, peer) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no frame from client")
        .unwrap();
    (Frame::decode(&buf[..len]).unwrap(), peer)
}

/// Connect a session to a fake station that answers the handshake
pub(crate) async fn connect(timeout: Duration) -> (Station, FakeStation) {
    connect_with(|config| config.with_timeout(timeout)).await
}

/// Like [`connect`], with the session settings adjusted by `configure`
pub(crate) async fn connect_with(
    configure: impl FnOnce(StationConfig) -> StationConfig,
) -> (Station, FakeStation) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let config = configure(StationConfig::new("127.0.0.1").with_port(port));

    let (station, peer) = tokio::join!(Station::connect_with(&config), async {
        let (flags, peer) = recv_frame(&socket).await;
        assert_eq!(flags.header, LAN_SET_BROADCASTFLAGS);
        let (serial, _) = recv_frame(&socket).await;
        assert_eq!(serial.header, LAN_GET_SERIAL_NUMBER);
        let reply = Frame::new(LAN_GET_SERIAL_NUMBER, SERIAL.to_le_bytes().to_vec());
        socket.send_to(&reply.encode(), peer).await.unwrap();
        peer
    });

    (station.unwrap(), FakeStation { socket, peer })
}

/// Take control of a loco, answering its state request as a stopped loco
pub(crate) async fn control<'a>(
    station: &'a Station,
    fake: &FakeStation,
    address: u16,
    steps: ThrottleSteps,
) -> Loco<'a> {
    let (loco, _) = tokio::join!(Loco::control(station, address, steps), async {
        let request = fake.recv_xbus().await;
        assert_eq!(request, SubMessage::loco_get_info(address));
        let [msb, lsb] = loco_address_bytes(address);
        fake.send_xbus(SubMessage::new(
            X_LOCO_INFO,
            msb,
            [lsb, steps.info_bits(), 0x80],
        ))
        .await;
    });
    loco.unwrap()
}
