//! Serial client to the gas-sensor board.
//!
//! Wire format: newline-delimited JSON both ways. Outbound commands carry
//! `{cmd, id, params?}`; the board answers with `ack`/`error`/`status`
//! frames, a one-shot `ready` hello, and a stream of `data` packets while
//! acquisition runs. Only `data` and `ready` are consumed here; the rest is
//! logged.

use crate::error::{LinkError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use enose_traits::{SensorPacket, SensorStream};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One-shot hello reported by the board on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorHello {
    pub sensor_count: u32,
    pub firmware_version: String,
}

struct Shared {
    subscribers: Mutex<Vec<Sender<SensorPacket>>>,
    hello: Mutex<Option<SensorHello>>,
    running: AtomicBool,
}

pub struct SensorBoardLink {
    shared: Arc<Shared>,
    writer: Mutex<Box<dyn serialport::SerialPort>>,
    cmd_id: AtomicU64,
}

impl SensorBoardLink {
    /// Open the serial device and start the reader thread.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| LinkError::Serial(e.to_string()))?;
        let reader_port = port
            .try_clone()
            .map_err(|e| LinkError::Serial(e.to_string()))?;

        let shared = Arc::new(Shared {
            subscribers: Mutex::new(Vec::new()),
            hello: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        let thread_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("sensor-serial".into())
            .spawn(move || read_loop(reader_port, thread_shared))?;

        tracing::info!(device, baud, "sensor link opened");
        Ok(Self {
            shared,
            writer: Mutex::new(port),
            cmd_id: AtomicU64::new(1),
        })
    }

    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }

    /// Hello packet received from the board, if any yet.
    pub fn hello(&self) -> Option<SensorHello> {
        self.shared.hello.lock().ok().and_then(|h| h.clone())
    }

    fn send(&self, cmd: &str, params: Option<Value>) -> Result<()> {
        let id = self.cmd_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = json!({ "cmd": cmd, "id": id });
        if let Some(params) = params {
            frame["params"] = params;
        }
        let mut line = frame.to_string();
        line.push('\n');
        let mut writer = self.writer.lock().map_err(|_| LinkError::NotConnected)?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.send("sync", None)
    }

    pub fn init(&self) -> Result<()> {
        self.send("init", None)
    }

    /// Upload a heater profile: temperature/duration step lists, optionally
    /// restricted to a sensor subset.
    pub fn configure(&self, temps: &[f64], durs: &[f64], sensors: Option<&[u32]>) -> Result<()> {
        let mut params = json!({ "temps": temps, "durs": durs });
        if let Some(sensors) = sensors {
            params["sensors"] = json!(sensors);
        }
        self.send("config", Some(params))
    }

    pub fn start(&self, sensors: Option<&[u32]>) -> Result<()> {
        let params = sensors.map(|s| json!({ "sensors": s }));
        self.send("start", params)
    }

    pub fn halt(&self) -> Result<()> {
        self.send("stop", None)
    }

    pub fn status(&self) -> Result<()> {
        self.send("status", None)
    }

    pub fn reset(&self) -> Result<()> {
        self.send("reset", None)
    }
}

impl SensorStream for SensorBoardLink {
    fn subscribe(&self) -> Receiver<SensorPacket> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }
}

fn read_loop(mut port: Box<dyn serialport::SerialPort>, shared: Arc<Shared>) {
    // Partial lines survive read timeouts in this accumulator.
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 512];

    while shared.running.load(Ordering::Relaxed) {
        match port.read(&mut chunk) {
            Ok(0) => {
                tracing::warn!("sensor serial closed");
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line);
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        handle_line(&shared, trimmed);
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(error = %e, "sensor serial read failed");
                break;
            }
        }
    }
    shared.running.store(false, Ordering::Relaxed);
}

fn handle_line(shared: &Arc<Shared>, line: &str) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, line, "sensor packet parse error");
            return;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("data") => {
            let packet: SensorPacket = match serde_json::from_value(value) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed data packet");
                    return;
                }
            };
            if let Ok(mut subscribers) = shared.subscribers.lock() {
                subscribers.retain(|tx| tx.send(packet.clone()).is_ok());
            }
        }
        Some("ready") => {
            let hello = SensorHello {
                sensor_count: value
                    .get("sensor_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32,
                firmware_version: value
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            tracing::info!(
                sensors = hello.sensor_count,
                version = %hello.firmware_version,
                "sensor board ready"
            );
            if let Ok(mut slot) = shared.hello.lock() {
                *slot = Some(hello);
            }
        }
        Some("error") => tracing::warn!(frame = line, "sensor board error"),
        Some("ack") | Some("status") => tracing::debug!(frame = line, "sensor board reply"),
        _ => tracing::debug!(frame = line, "unrecognised sensor frame"),
    }
}
