//! z21link - Async client for Z21 model railway command stations
//!
//! Talks the Z21 LAN protocol over UDP: track power, locomotive drive and
//! function control, turnouts, RailCom and system state broadcasts.
//!
//! ```no_run
//! use std::time::Duration;
//! use z21link::{Loco, Station};
//! use z21link::protocol::ThrottleSteps;
//!
//! # async fn run() -> z21link::StationResult<()> {
//! let station = Station::connect("192.168.0.111", 21105, Duration::from_secs(2)).await?;
//! station.voltage_on().await?;
//!
//! let loco = Loco::control(&station, 3, ThrottleSteps::Steps128).await?;
//! loco.drive(50.0).await?;
//! loco.set_headlights(true).await?;
//! loco.stop().await?;
//!
//! station.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod loco;
pub mod network;
pub mod protocol;
pub mod turnout;

pub use loco::{Loco, LocoState};
pub use network::{Station, StationConfig, StationError, StationResult, SubscriptionId};
pub use turnout::{SwitchMode, Turnout};
