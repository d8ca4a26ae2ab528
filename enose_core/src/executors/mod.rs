//! Primitive executors.
//!
//! One executor per hardware primitive (inject, drain, acquire, wash). Each
//! validates its preconditions, wraps the work in a mode transaction and
//! drives a 100 ms feedback loop that tests cancellation first, then the
//! termination condition, then the timeout. Rollback on any non-committed
//! exit is the guard's job.

mod acquire;
mod drain;
mod inject;
mod wash;

pub use acquire::AcquireExecutor;
pub use drain::DrainExecutor;
pub use inject::InjectExecutor;
pub use wash::WashExecutor;

use crate::consumables::ConsumableSink;
use crate::hardware_state::HardwareStateMachine;
use crate::load_cell::LoadCellDriver;
use crate::program::{Step, StepAction};
use crate::system_state::SystemState;
use enose_traits::{Clock, SensorStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Feedback-loop tick; also the longest non-interruptible section.
pub const FEEDBACK_TICK: Duration = Duration::from_millis(100);

/// Fallback heater-cycle length when no sensor stream is available.
pub const ESTIMATED_CYCLE_S: f64 = 26.0;

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub success: bool,
    pub error_message: String,
    pub execution_id: Option<String>,
    pub duration_s: f64,
}

impl ExecuteResult {
    pub fn ok(execution_id: impl Into<String>, duration_s: f64) -> Self {
        let id = execution_id.into();
        Self {
            success: true,
            error_message: String::new(),
            execution_id: if id.is_empty() { None } else { Some(id) },
            duration_s,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            execution_id: None,
            duration_s: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreconditionResult {
    pub satisfied: bool,
    pub failed_conditions: Vec<String>,
}

impl PreconditionResult {
    pub fn ok() -> Self {
        Self { satisfied: true, failed_conditions: Vec::new() }
    }

    pub fn fail(conditions: Vec<String>) -> Self {
        Self { satisfied: false, failed_conditions: conditions }
    }

    pub fn summary(&self) -> String {
        self.failed_conditions.join("; ")
    }
}

/// Pause gate shared between the orchestrator and the executors.
///
/// A paused executor blocks here until the flag clears or a stop request
/// escalates past it.
pub struct PauseGate {
    paused: Mutex<bool>,
    cv: Condvar,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self { paused: Mutex::new(false), cv: Condvar::new() }
    }
}

impl PauseGate {
    pub fn set_paused(&self, paused: bool) {
        if let Ok(mut flag) = self.paused.lock() {
            *flag = paused;
        }
        self.cv.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.lock().map(|g| *g).unwrap_or(false)
    }

    /// Wake all waiters (used by stop so a paused experiment can abort).
    pub fn notify_all(&self) {
        self.cv.notify_all();
    }

    fn wait_while_paused(&self, stop: &AtomicBool) {
        let Ok(mut flag) = self.paused.lock() else {
            return;
        };
        while *flag && !stop.load(Ordering::Relaxed) {
            match self.cv.wait(flag) {
                Ok(guard) => flag = guard,
                Err(_) => return,
            }
        }
    }
}

static EXECUTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-run execution context threaded through every executor.
pub struct ExecCtx {
    pub stop: Arc<AtomicBool>,
    pub pause: Arc<PauseGate>,
    pub clock: Arc<dyn Clock + Send + Sync>,
    pub consumables: Arc<dyn ConsumableSink>,
    /// liquid_id -> pump index, from the loaded program's hardware envelope.
    pub pump_bindings: HashMap<String, usize>,
    log: Arc<dyn Fn(String) + Send + Sync>,
}

impl ExecCtx {
    pub fn new(
        stop: Arc<AtomicBool>,
        pause: Arc<PauseGate>,
        clock: Arc<dyn Clock + Send + Sync>,
        consumables: Arc<dyn ConsumableSink>,
        pump_bindings: HashMap<String, usize>,
        log: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Self {
        Self { stop, pause, clock, consumables, pump_bindings, log }
    }

    /// Stand-alone context for manual primitive runs and tests.
    pub fn detached(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(PauseGate::default()),
            clock,
            consumables: Arc::new(crate::consumables::NullConsumables),
            pump_bindings: HashMap::new(),
            log: Arc::new(|message| tracing::info!("{message}")),
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        (self.log)(message.into());
    }

    /// Returns true when the caller must unwind. Blocks while paused.
    pub fn check_stop_or_pause(&self) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return true;
        }
        if self.pause.is_paused() {
            self.pause.wait_while_paused(&self.stop);
        }
        self.stop.load(Ordering::Relaxed)
    }

    pub fn generate_execution_id(&self, action: &str) -> String {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let counter = EXECUTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{action}_{millis}_{counter}")
    }
}

/// The uniform capability each primitive implements.
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn check_preconditions(&self, step: &Step) -> PreconditionResult;
    fn execute(&self, step: &Step, ctx: &ExecCtx) -> ExecuteResult;
    fn estimate_duration(&self, step: &Step) -> f64;
    fn is_idempotent(&self) -> bool {
        false
    }
    fn required_resources(&self) -> &'static [&'static str];
}

/// Registry: one executor per primitive type, dispatched by step variant.
pub struct ExecutorSet {
    executors: HashMap<&'static str, Box<dyn StepExecutor>>,
}

impl ExecutorSet {
    pub fn new(
        system_state: Arc<SystemState>,
        hardware_state: Option<Arc<HardwareStateMachine>>,
        load_cell: Arc<LoadCellDriver>,
        sensor: Option<Arc<dyn SensorStream>>,
    ) -> Self {
        let mut executors: HashMap<&'static str, Box<dyn StepExecutor>> = HashMap::new();

        let inject = InjectExecutor::new(
            Arc::clone(&system_state),
            hardware_state.clone(),
            Arc::clone(&load_cell),
        );
        let drain = DrainExecutor::new(
            Arc::clone(&system_state),
            hardware_state.clone(),
            Arc::clone(&load_cell),
        );
        let acquire = AcquireExecutor::new(Arc::clone(&system_state), sensor);
        let wash = WashExecutor::new(system_state, load_cell);

        executors.insert(inject.name(), Box::new(inject));
        executors.insert(drain.name(), Box::new(drain));
        executors.insert(acquire.name(), Box::new(acquire));
        executors.insert(wash.name(), Box::new(wash));

        tracing::info!(count = executors.len(), "primitive executors registered");
        Self { executors }
    }

    pub fn get(&self, name: &str) -> Option<&dyn StepExecutor> {
        self.executors.get(name).map(|b| b.as_ref())
    }

    pub fn for_step(&self, step: &Step) -> Option<&dyn StepExecutor> {
        match step.action {
            StepAction::Inject(_)
            | StepAction::Drain(_)
            | StepAction::Acquire(_)
            | StepAction::Wash(_) => self.get(step.action.kind()),
            _ => None,
        }
    }
}

// === Shared wait helpers (used by acquire and the orchestrator's wait) ===

/// Sleep-poll in feedback ticks; false if cancelled.
///
/// Counts active ticks rather than wall clock, so time spent blocked in the
/// pause gate does not run the wait down.
pub(crate) fn wait_for_duration(ctx: &ExecCtx, seconds: f64) -> bool {
    let total = Duration::from_secs_f64(seconds.max(0.0));
    let mut active = Duration::ZERO;
    loop {
        if ctx.check_stop_or_pause() {
            return false;
        }
        if active >= total {
            return true;
        }
        ctx.clock.sleep(FEEDBACK_TICK);
        active += FEEDBACK_TICK;
    }
}

/// Count heater-cycle completions on the sensor stream.
///
/// A completion is a wrap of `heater_step` to zero, counted only after the
/// first decreasing edge has been seen so a mid-cycle start is not counted.
/// Falls back to a pessimistic estimated wait when no stream is available.
pub(crate) fn wait_for_heater_cycles(
    ctx: &ExecCtx,
    sensor: Option<&dyn SensorStream>,
    count: u32,
    timeout_s: f64,
) -> bool {
    let Some(sensor) = sensor else {
        ctx.log("no sensor stream; waiting an estimated cycle time".to_string());
        let estimated = (count as f64 * ESTIMATED_CYCLE_S).min(timeout_s);
        return wait_for_duration(ctx, estimated);
    };

    ctx.log(format!("waiting for {count} heater cycles"));
    let rx = sensor.subscribe();
    let start = ctx.clock.now();
    let deadline = Duration::from_secs_f64(timeout_s.max(0.0));

    let mut completed = 0u32;
    let mut last_step: Option<u32> = None;
    let mut seen_first_cycle = false;

    while completed < count {
        if ctx.check_stop_or_pause() {
            return false;
        }
        if ctx.clock.now().saturating_duration_since(start) >= deadline {
            ctx.log("heater cycle wait timed out".to_string());
            return false;
        }
        match rx.recv_timeout(FEEDBACK_TICK) {
            Ok(packet) => {
                let current = packet.heater_step;
                if let Some(last) = last_step {
                    if last > 0 && current == 0 && seen_first_cycle {
                        completed += 1;
                        ctx.log(format!("heater cycle {completed}/{count} complete"));
                    }
                    if last > current && !seen_first_cycle {
                        seen_first_cycle = true;
                    }
                }
                last_step = Some(current);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                ctx.log("sensor stream ended during heater cycle wait".to_string());
                return false;
            }
        }
    }
    true
}

/// Wait until the sensor value variation over a sliding window falls under
/// the threshold. Needs at least 10 samples in the window before judging.
pub(crate) fn wait_for_sensor_stability(
    ctx: &ExecCtx,
    sensor: Option<&dyn SensorStream>,
    window_s: f64,
    threshold_percent: f64,
    timeout_s: f64,
) -> bool {
    let Some(sensor) = sensor else {
        ctx.log("no sensor stream; waiting the maximum duration".to_string());
        return wait_for_duration(ctx, timeout_s);
    };

    ctx.log(format!(
        "waiting for sensor stability (window {window_s}s, threshold {threshold_percent}%)"
    ));
    let rx = sensor.subscribe();
    let start = ctx.clock.now();
    let deadline = Duration::from_secs_f64(timeout_s.max(0.0));
    let window = Duration::from_secs_f64(window_s.max(0.0));
    let mut readings: std::collections::VecDeque<(std::time::Instant, f64)> =
        std::collections::VecDeque::new();

    loop {
        if ctx.check_stop_or_pause() {
            return false;
        }
        if ctx.clock.now().saturating_duration_since(start) >= deadline {
            ctx.log("sensor stability wait timed out".to_string());
            return false;
        }
        match rx.recv_timeout(FEEDBACK_TICK) {
            Ok(packet) => {
                let now = ctx.clock.now();
                readings.push_back((now, packet.value));
                while let Some((t, _)) = readings.front() {
                    if now.saturating_duration_since(*t) > window {
                        readings.pop_front();
                    } else {
                        break;
                    }
                }
                if readings.len() >= 10 {
                    let mut min = f64::INFINITY;
                    let mut max = f64::NEG_INFINITY;
                    let mut sum = 0.0;
                    for (_, v) in &readings {
                        min = min.min(*v);
                        max = max.max(*v);
                        sum += *v;
                    }
                    let mean = sum / readings.len() as f64;
                    if mean > 0.0 {
                        let variation = (max - min) / mean * 100.0;
                        if variation <= threshold_percent {
                            ctx.log(format!("sensor stable (variation {variation:.2}%)"));
                            return true;
                        }
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                ctx.log("sensor stream ended during stability wait".to_string());
                return false;
            }
        }
    }
}
