pub mod clock;

pub use clock::{Clock, MonotonicClock};

use serde::{Deserialize, Serialize};

/// Single-shot callback for an `objects.query` response. Invoked with the
/// full response payload; never invoked if the response does not arrive.
pub type QueryCallback = Box<dyn FnOnce(&serde_json::Value) + Send>;

/// Outbound link to the motion firmware.
///
/// Commands are fire-and-forget at this layer: submission order is preserved
/// but execution is never acknowledged. Callers that need confirmation must
/// observe weight or sensor feedback instead.
pub trait Actuator: Send + Sync {
    /// Enqueue a G-code-like script for execution. Must not block.
    fn send_command(&self, script: &str, silent: bool);

    /// Enqueue an `objects.query` for `object`; the callback fires with the
    /// full response payload when the matching response arrives.
    fn query_object(&self, object: &str, callback: QueryCallback);

    /// Latest liveness reading of the firmware.
    fn is_firmware_ready(&self) -> bool;
}

/// One gas-sensor reading as reported by the sensor board.
///
/// Field names mirror the wire format (`s`, `v`, `st`, `gi`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPacket {
    #[serde(default)]
    pub tick: u64,
    /// Sensor index within the array.
    #[serde(rename = "s", default)]
    pub sensor_idx: u32,
    #[serde(default)]
    pub id: String,
    /// Primary reading value.
    #[serde(rename = "v", default)]
    pub value: f64,
    /// Sensor type tag: "mox_d" | "mox_a" | "pid".
    #[serde(rename = "st", default)]
    pub sensor_type: String,
    /// Position within the heater profile; wraps to 0 at cycle end.
    #[serde(rename = "gi", default)]
    pub heater_step: u32,
    #[serde(rename = "T", default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(rename = "H", default, skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
    #[serde(rename = "P", default, skip_serializing_if = "Option::is_none")]
    pub pressure_hpa: Option<f64>,
}

/// Inbound stream of gas-sensor packets.
///
/// A subscription only observes packets that arrive after it is created.
pub trait SensorStream: Send + Sync {
    fn subscribe(&self) -> crossbeam_channel::Receiver<SensorPacket>;
}
