//! enose_link: transport clients behind the `enose_traits` seams.
//!
//! - `actuator`: persistent WebSocket carrying JSON-RPC 2.0 to the motion
//!   firmware (command scripts, object queries, status notifications).
//! - `sensor`: newline-delimited JSON over a serial link to the gas-sensor
//!   board.
//!
//! Neither client reconnects: a dropped transport marks the link dead and
//! the service manager restarts the process.

pub mod actuator;
pub mod error;
pub mod frames;
pub mod sensor;

pub use actuator::KlipperLink;
pub use error::LinkError;
pub use sensor::{SensorBoardLink, SensorHello};
