//! Test and helper mocks for enose_core.
//!
//! `MockActuator` records every emitted command and answers load-cell
//! queries from a settable weight, which is enough to drive the state
//! machines, the guards and the executors without a firmware.

use crate::consumables::ConsumableSink;
use enose_traits::{Actuator, QueryCallback, SensorPacket, SensorStream};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Records commands; answers `query_object` synchronously from `weight`.
pub struct MockActuator {
    commands: Mutex<Vec<String>>,
    weight: Mutex<f64>,
    ready: AtomicBool,
}

impl Default for MockActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockActuator {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            weight: Mutex::new(0.0),
            ready: AtomicBool::new(true),
        }
    }

    pub fn set_weight(&self, grams: f64) {
        if let Ok(mut w) = self.weight.lock() {
            *w = grams;
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_commands(&self) {
        if let Ok(mut c) = self.commands.lock() {
            c.clear();
        }
    }

    /// Commands containing `needle`, in emission order.
    pub fn commands_matching(&self, needle: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }
}

impl Actuator for MockActuator {
    fn send_command(&self, script: &str, _silent: bool) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(script.to_string());
        }
    }

    fn query_object(&self, object: &str, callback: QueryCallback) {
        let grams = self.weight.lock().map(|w| *w).unwrap_or(0.0);
        let cell = json!({ "raw_sample": grams / 500.0, "force_g": grams });
        let mut status = serde_json::Map::new();
        status.insert(object.to_string(), cell);
        let mut response = serde_json::Map::new();
        response.insert("status".to_string(), serde_json::Value::Object(status));
        callback(&serde_json::Value::Object(response));
    }

    fn is_firmware_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Broadcast sensor stream fed directly by tests.
#[derive(Default)]
pub struct ScriptedSensor {
    subscribers: Mutex<Vec<crossbeam_channel::Sender<SensorPacket>>>,
}

impl ScriptedSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: SensorPacket) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(packet.clone()).is_ok());
        }
    }
}

impl SensorStream for ScriptedSensor {
    fn subscribe(&self) -> crossbeam_channel::Receiver<SensorPacket> {
        let (tx, rx) = crossbeam_channel::unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }
}

/// Minimal data packet with the fields the core consumes.
pub fn sensor_packet(heater_step: u32, value: f64) -> SensorPacket {
    SensorPacket {
        tick: 0,
        sensor_idx: 0,
        id: String::new(),
        value,
        sensor_type: "mox_d".to_string(),
        heater_step,
        temperature_c: None,
        humidity_pct: None,
        pressure_hpa: None,
    }
}

/// In-memory consumable sink for assertions.
#[derive(Default)]
pub struct MemoryConsumables {
    pump_ml: Mutex<BTreeMap<usize, f64>>,
    runtime_s: Mutex<BTreeMap<String, u64>>,
}

impl MemoryConsumables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pump_ml(&self, pump_index: usize) -> f64 {
        self.pump_ml
            .lock()
            .map(|m| m.get(&pump_index).copied().unwrap_or(0.0))
            .unwrap_or(0.0)
    }

    pub fn runtime_s(&self, kind: &str) -> u64 {
        self.runtime_s
            .lock()
            .map(|m| m.get(kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl ConsumableSink for MemoryConsumables {
    fn add_pump_consumption(&self, pump_index: usize, ml: f64) {
        if let Ok(mut m) = self.pump_ml.lock() {
            *m.entry(pump_index).or_insert(0.0) += ml;
        }
    }

    fn add_runtime(&self, kind: &str, seconds: u64) {
        if let Ok(mut m) = self.runtime_s.lock() {
            *m.entry(kind.to_string()).or_insert(0) += seconds;
        }
    }
}
