//! WebSocket JSON-RPC client to the motion firmware.
//!
//! One background thread owns the socket and multiplexes reads and writes:
//! outbound frames arrive over an internal FIFO, inbound frames are
//! classified and dispatched. Request ids are monotonically increasing;
//! `objects.query` callbacks are single-shot and correlated by id.

use crate::error::{LinkError, Result};
use crate::frames::{self, Inbound};
use crossbeam_channel::{unbounded, Receiver, Sender};
use enose_traits::{Actuator, QueryCallback};
use serde_json::Value;
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

/// Cadence of the `printer.info` liveness probe.
const INFO_POLL_PERIOD: Duration = Duration::from_secs(2);
/// Socket read timeout; bounds outbound-FIFO latency.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

type StatusObserver = Box<dyn Fn(&Value) + Send + Sync>;

struct Shared {
    outbound_tx: Sender<String>,
    rpc_id: AtomicU64,
    pending: Mutex<HashMap<u64, QueryCallback>>,
    info_ids: Mutex<HashMap<u64, ()>>,
    status_observers: Mutex<Vec<StatusObserver>>,
    firmware_ready: AtomicBool,
    shutdown_latched: AtomicBool,
    connected: AtomicBool,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.rpc_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, frame: String) {
        if !self.connected.load(Ordering::Relaxed) {
            tracing::warn!("actuator link not connected, dropping frame");
            return;
        }
        // Unbounded channel: submission never blocks the caller.
        let _ = self.outbound_tx.send(frame);
    }
}

/// Client handle to the motion firmware. Cheap to clone via `Arc`.
pub struct KlipperLink {
    shared: Arc<Shared>,
}

impl KlipperLink {
    /// Connect to `ws://host:port/websocket`, subscribe to the objects of
    /// interest and start the I/O thread.
    pub fn connect(host: &str, port: u16, load_cell_name: &str) -> Result<Self> {
        let url = format!("ws://{host}:{port}/websocket");
        let (socket, _response) =
            tungstenite::connect(url.as_str()).map_err(|e| LinkError::WebSocket(e.to_string()))?;

        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream.set_read_timeout(Some(READ_TIMEOUT))?;
        }

        let (outbound_tx, outbound_rx) = unbounded::<String>();
        let shared = Arc::new(Shared {
            outbound_tx,
            rpc_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            info_ids: Mutex::new(HashMap::new()),
            status_observers: Mutex::new(Vec::new()),
            firmware_ready: AtomicBool::new(false),
            shutdown_latched: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        });

        let link = Self { shared: Arc::clone(&shared) };

        // Subscribe before anything else so pushes start immediately.
        let object_name = format!("load_cell {load_cell_name}");
        let sub_id = shared.next_id();
        shared.enqueue(frames::subscribe_request(
            &["heaters", "display_status", object_name.as_str()],
            sub_id,
        ));

        std::thread::Builder::new()
            .name("klipper-io".into())
            .spawn(move || io_loop(socket, outbound_rx, shared))?;

        tracing::info!(url, "actuator link connected");
        Ok(link)
    }

    /// Register an observer for `notify_status_update` payloads.
    pub fn on_status_update<F>(&self, observer: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if let Ok(mut observers) = self.shared.status_observers.lock() {
            observers.push(Box::new(observer));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}

impl Actuator for KlipperLink {
    fn send_command(&self, script: &str, silent: bool) {
        if !silent {
            tracing::debug!(script, "gcode");
        }
        let id = self.shared.next_id();
        self.shared.enqueue(frames::gcode_request(script, id));
    }

    fn query_object(&self, object: &str, callback: QueryCallback) {
        let id = self.shared.next_id();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, callback);
        }
        self.shared.enqueue(frames::query_request(object, id));
    }

    fn is_firmware_ready(&self) -> bool {
        self.shared.firmware_ready.load(Ordering::Relaxed)
    }
}

fn io_loop(
    mut socket: WebSocket<MaybeTlsStream<TcpStream>>,
    outbound_rx: Receiver<String>,
    shared: Arc<Shared>,
) {
    let mut last_info: Option<Instant> = None;

    loop {
        // Liveness probe on a fixed cadence.
        if last_info.map_or(true, |t| t.elapsed() >= INFO_POLL_PERIOD) {
            last_info = Some(Instant::now());
            let id = shared.next_id();
            if let Ok(mut ids) = shared.info_ids.lock() {
                ids.insert(id, ());
            }
            let _ = shared.outbound_tx.send(frames::info_request(id));
        }

        // Drain the outbound FIFO in submission order.
        while let Ok(frame) = outbound_rx.try_recv() {
            if let Err(e) = socket.send(Message::Text(frame)) {
                tracing::error!(error = %e, "actuator write failed");
                shared.connected.store(false, Ordering::Relaxed);
                shared.firmware_ready.store(false, Ordering::Relaxed);
                return;
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => dispatch(&shared, &text),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Ok(Message::Close(_)) => {
                tracing::warn!("actuator link closed by peer");
                shared.connected.store(false, Ordering::Relaxed);
                shared.firmware_ready.store(false, Ordering::Relaxed);
                return;
            }
            Ok(Message::Frame(_)) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Read timeout: fall through to service the FIFO again.
            }
            Err(e) => {
                tracing::error!(error = %e, "actuator read failed");
                shared.connected.store(false, Ordering::Relaxed);
                shared.firmware_ready.store(false, Ordering::Relaxed);
                return;
            }
        }
    }
}

fn dispatch(shared: &Arc<Shared>, text: &str) {
    match frames::classify(text) {
        Inbound::StatusUpdate(payload) => {
            if let Ok(observers) = shared.status_observers.lock() {
                for observer in observers.iter() {
                    observer(&payload);
                }
            }
        }
        Inbound::KlippyShutdown => {
            tracing::warn!("firmware reported shutdown");
            shared.shutdown_latched.store(true, Ordering::Relaxed);
            shared.firmware_ready.store(false, Ordering::Relaxed);
        }
        Inbound::KlippyReady => {
            shared.shutdown_latched.store(false, Ordering::Relaxed);
        }
        Inbound::Response { id, result } => {
            let is_info = shared
                .info_ids
                .lock()
                .map(|mut ids| ids.remove(&id).is_some())
                .unwrap_or(false);
            if is_info {
                let ready = frames::info_state(&result) == Some("ready")
                    && !shared.shutdown_latched.load(Ordering::Relaxed);
                shared.firmware_ready.store(ready, Ordering::Relaxed);
                return;
            }
            let callback = shared.pending.lock().ok().and_then(|mut p| p.remove(&id));
            if let Some(callback) = callback {
                callback(&result);
            }
        }
        Inbound::Other => {}
    }
}
