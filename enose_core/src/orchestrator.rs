//! Experiment orchestrator.
//!
//! Owns the loaded program, the experiment lifecycle machine and the single
//! executor thread that walks the step sequence. Two mutexes: one over the
//! execution state and logs, one over the event queue. No blocking primitive
//! call is ever made while the state mutex is held, and logging after a
//! transaction happens after the lock is released (adding logs inside locked
//! regions deadlocks, since `add_log` takes the same lock).

use crate::consumables::ConsumableSink;
use crate::error::{ControlError, Result};
use crate::executors::{
    wait_for_duration, wait_for_heater_cycles, ExecCtx, ExecutorSet, PauseGate, FEEDBACK_TICK,
};
use crate::hardware_state::HardwareStateMachine;
use crate::load_cell::LoadCellDriver;
use crate::parser;
use crate::program::{LiquidLevel, Program, Step, StepAction, WaitAction, WaitCondition};
use crate::system_state::{SystemMode, SystemState};
use crate::validator::{ProgramValidator, ValidationReport};
use enose_traits::{Actuator, Clock, SensorStream};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const MAX_LOGS: usize = 100;
/// Subscriber drain poll; bounds disconnect detection latency.
pub const EVENT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentLifecycle {
    Idle,
    Loaded,
    Running,
    Paused,
    Aborting,
    Completed,
    Error,
    Aborted,
}

impl ExperimentLifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentLifecycle::Idle => "IDLE",
            ExperimentLifecycle::Loaded => "LOADED",
            ExperimentLifecycle::Running => "RUNNING",
            ExperimentLifecycle::Paused => "PAUSED",
            ExperimentLifecycle::Aborting => "ABORTING",
            ExperimentLifecycle::Completed => "COMPLETED",
            ExperimentLifecycle::Error => "ERROR",
            ExperimentLifecycle::Aborted => "ABORTED",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentLifecycle::Completed | ExperimentLifecycle::Error | ExperimentLifecycle::Aborted
        )
    }
}

impl std::fmt::Display for ExperimentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentEventType {
    ProgramLoaded,
    ExperimentStarted,
    ExperimentPaused,
    ExperimentResumed,
    ExperimentStopped,
    ExperimentCompleted,
    ExperimentError,
    StepStarted,
    StepCompleted,
    LoopIteration,
    PhaseStarted,
    PhaseEnded,
}

#[derive(Debug, Clone)]
pub struct ExperimentEvent {
    pub timestamp: SystemTime,
    pub event_type: ExperimentEventType,
    pub message: String,
    pub step_name: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExperimentStatus {
    pub lifecycle: ExperimentLifecycle,
    pub program_id: Option<String>,
    pub current_step_index: usize,
    pub current_step_name: String,
    pub loop_iteration: u32,
    pub loop_total: u32,
    pub progress_percent: u32,
    pub elapsed_s: u64,
    pub remaining_s: f64,
    pub logs: Vec<String>,
    pub error_message: Option<String>,
}

/// What `load_program` accepts: authored text or an already-built program.
pub enum ProgramSource {
    Yaml(String),
    Parsed(Program),
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub validation: Option<ValidationReport>,
}

struct ExecState {
    lifecycle: ExperimentLifecycle,
    program: Option<Arc<Program>>,
    validation: Option<ValidationReport>,
    current_step_index: usize,
    current_step_name: String,
    loop_iteration: u32,
    loop_total: u32,
    logs: VecDeque<String>,
    error_message: Option<String>,
    start_time: Option<Instant>,
    gas_pump_running: bool,
    gas_pump_since: Option<Instant>,
}

impl ExecState {
    fn reset_run(&mut self) {
        self.current_step_index = 0;
        self.current_step_name.clear();
        self.loop_iteration = 0;
        self.loop_total = 0;
        self.logs.clear();
        self.error_message = None;
    }
}

struct Inner {
    actuator: Arc<dyn Actuator>,
    system_state: Arc<SystemState>,
    hardware_state: Arc<HardwareStateMachine>,
    load_cell: Arc<LoadCellDriver>,
    sensor: Option<Arc<dyn SensorStream>>,
    executors: ExecutorSet,
    consumables: Arc<dyn ConsumableSink>,
    clock: Arc<dyn Clock + Send + Sync>,
    /// Per-pump inventory bookkeeping for the loaded program, debited as
    /// consumption events come in.
    levels: Arc<Mutex<Vec<LiquidLevel>>>,
    state: Mutex<ExecState>,
    stop: Arc<AtomicBool>,
    pause: Arc<PauseGate>,
    events: Mutex<VecDeque<ExperimentEvent>>,
    events_cv: Condvar,
    subscriber_count: AtomicUsize,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Sits between the executors and the external consumable sink: debits the
/// loaded program's inventory records on every pump-consumption event, warns
/// once a liquid crosses its low threshold, and forwards the event.
struct LevelTrackingSink {
    levels: Arc<Mutex<Vec<LiquidLevel>>>,
    downstream: Arc<dyn ConsumableSink>,
}

impl ConsumableSink for LevelTrackingSink {
    fn add_pump_consumption(&self, pump_index: usize, ml: f64) {
        if let Ok(mut levels) = self.levels.lock() {
            for level in levels.iter_mut() {
                if level.pump_index as usize == pump_index {
                    let was_low = level.is_low();
                    level.consumed_volume_ml += ml;
                    if level.is_low() && !was_low {
                        tracing::warn!(
                            pump_index,
                            liquid = level.liquid_id.as_deref().unwrap_or("?"),
                            remaining_ml = level.remaining_ml(),
                            "liquid inventory low"
                        );
                    }
                }
            }
        }
        self.downstream.add_pump_consumption(pump_index, ml);
    }

    fn add_runtime(&self, kind: &str, seconds: u64) {
        self.downstream.add_runtime(kind, seconds);
    }
}

enum Flow {
    Stopped,
    Failed(String),
}

type StepResult = std::result::Result<(), Flow>;

pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        system_state: Arc<SystemState>,
        hardware_state: Arc<HardwareStateMachine>,
        load_cell: Arc<LoadCellDriver>,
        sensor: Option<Arc<dyn SensorStream>>,
        consumables: Arc<dyn ConsumableSink>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let executors = ExecutorSet::new(
            Arc::clone(&system_state),
            Some(Arc::clone(&hardware_state)),
            Arc::clone(&load_cell),
            sensor.clone(),
        );
        tracing::info!("experiment orchestrator initialized");
        Self {
            inner: Arc::new(Inner {
                actuator,
                system_state,
                hardware_state,
                load_cell,
                sensor,
                executors,
                consumables,
                clock,
                levels: Arc::new(Mutex::new(Vec::new())),
                state: Mutex::new(ExecState {
                    lifecycle: ExperimentLifecycle::Idle,
                    program: None,
                    validation: None,
                    current_step_index: 0,
                    current_step_name: String::new(),
                    loop_iteration: 0,
                    loop_total: 0,
                    logs: VecDeque::new(),
                    error_message: None,
                    start_time: None,
                    gas_pump_running: false,
                    gas_pump_since: None,
                }),
                stop: Arc::new(AtomicBool::new(false)),
                pause: Arc::new(PauseGate::default()),
                events: Mutex::new(VecDeque::new()),
                events_cv: Condvar::new(),
                subscriber_count: AtomicUsize::new(0),
                thread: Mutex::new(None),
            }),
        }
    }

    /// Parse (when textual), validate, and hold the program.
    pub fn load_program(&self, source: ProgramSource) -> LoadOutcome {
        {
            let Ok(state) = self.inner.state.lock() else {
                return LoadOutcome {
                    success: false,
                    error_message: Some("state lock poisoned".to_string()),
                    validation: None,
                };
            };
            if state.lifecycle == ExperimentLifecycle::Running
                || state.lifecycle == ExperimentLifecycle::Paused
            {
                return LoadOutcome {
                    success: false,
                    error_message: Some("an experiment is running; cannot load".to_string()),
                    validation: None,
                };
            }
        }

        let program = match source {
            ProgramSource::Yaml(text) => {
                tracing::info!("loading program from yaml");
                match parser::parse_program(&text) {
                    Ok(program) => program,
                    Err(e) => {
                        return LoadOutcome {
                            success: false,
                            error_message: Some(format!("parse failed: {e}")),
                            validation: None,
                        };
                    }
                }
            }
            ProgramSource::Parsed(program) => program,
        };

        tracing::info!(program = %program.id, "validating and loading program");
        let validation = ProgramValidator::validate(&program);

        if !validation.valid {
            if let Ok(mut state) = self.inner.state.lock() {
                state.lifecycle = ExperimentLifecycle::Idle;
            }
            return LoadOutcome {
                success: false,
                error_message: Some("program validation failed".to_string()),
                validation: Some(validation),
            };
        }

        // Fresh inventory records for this program; consumption events debit
        // them for the rest of the session.
        if let Ok(mut levels) = self.inner.levels.lock() {
            *levels = program
                .hardware
                .liquids
                .iter()
                .map(|liquid| LiquidLevel {
                    pump_index: liquid.pump_index,
                    liquid_id: Some(liquid.id.clone()),
                    initial_volume_ml: liquid.available_ml,
                    consumed_volume_ml: 0.0,
                    low_threshold_ml: liquid.available_ml * 0.1,
                })
                .collect();
        }

        let name = program.name.clone();
        if let Ok(mut state) = self.inner.state.lock() {
            state.program = Some(Arc::new(program));
            state.validation = Some(validation.clone());
            state.lifecycle = ExperimentLifecycle::Loaded;
        }
        self.inner.emit_event(
            ExperimentEventType::ProgramLoaded,
            format!("program loaded: {name}"),
            BTreeMap::new(),
        );

        LoadOutcome {
            success: true,
            error_message: None,
            validation: Some(validation),
        }
    }

    /// Spawn the executor thread. Requires a loaded program.
    pub fn start_experiment(&self) -> Result<ExperimentStatus> {
        let program = {
            let Ok(mut state) = self.inner.state.lock() else {
                return Err(crate::error::Report::new(ControlError::State(
                    "state lock poisoned".to_string(),
                )));
            };
            if state.lifecycle != ExperimentLifecycle::Loaded {
                return Err(crate::error::Report::new(ControlError::State(
                    "a program must be loaded before starting".to_string(),
                )));
            }
            let Some(program) = state.program.clone() else {
                return Err(crate::error::Report::new(ControlError::State(
                    "no program held in LOADED state".to_string(),
                )));
            };

            self.inner.stop.store(false, Ordering::SeqCst);
            self.inner.pause.set_paused(false);
            state.reset_run();
            state.start_time = Some(self.inner.clock.now());
            state.lifecycle = ExperimentLifecycle::Running;
            program
        };

        tracing::info!(program = %program.id, "starting experiment");

        // Queue the start event before the executor thread can emit its own.
        self.inner.emit_event(
            ExperimentEventType::ExperimentStarted,
            "experiment started".to_string(),
            BTreeMap::new(),
        );

        // Reap a previous run's thread before spawning the next.
        if let Ok(mut slot) = self.inner.thread.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
            let inner = Arc::clone(&self.inner);
            let spawn = std::thread::Builder::new()
                .name("experiment-exec".into())
                .spawn(move || run_experiment(inner, program));
            match spawn {
                Ok(handle) => *slot = Some(handle),
                Err(e) => {
                    if let Ok(mut state) = self.inner.state.lock() {
                        state.lifecycle = ExperimentLifecycle::Error;
                        state.error_message = Some(format!("failed to spawn executor: {e}"));
                    }
                    return Err(crate::error::Report::new(ControlError::State(
                        "failed to spawn executor thread".to_string(),
                    )));
                }
            }
        }

        Ok(self.get_experiment_status())
    }

    pub fn pause_experiment(&self) -> ExperimentStatus {
        let paused = {
            let Ok(mut state) = self.inner.state.lock() else {
                return self.get_experiment_status();
            };
            if state.lifecycle != ExperimentLifecycle::Running {
                false
            } else {
                state.lifecycle = ExperimentLifecycle::Paused;
                true
            }
        };
        if paused {
            tracing::info!("experiment paused");
            self.inner.pause.set_paused(true);
            self.inner.emit_event(
                ExperimentEventType::ExperimentPaused,
                "experiment paused".to_string(),
                BTreeMap::new(),
            );
        }
        self.get_experiment_status()
    }

    pub fn resume_experiment(&self) -> ExperimentStatus {
        let resumed = {
            let Ok(mut state) = self.inner.state.lock() else {
                return self.get_experiment_status();
            };
            if state.lifecycle != ExperimentLifecycle::Paused {
                false
            } else {
                state.lifecycle = ExperimentLifecycle::Running;
                true
            }
        };
        if resumed {
            tracing::info!("experiment resumed");
            // Queue the event before releasing the gate so the executor's
            // next emission cannot overtake it.
            self.inner.emit_event(
                ExperimentEventType::ExperimentResumed,
                "experiment resumed".to_string(),
                BTreeMap::new(),
            );
            self.inner.pause.set_paused(false);
        }
        self.get_experiment_status()
    }

    /// Stop is three behaviors in one call: unload a finished/loaded program,
    /// no-op when idle, or abort a running experiment.
    pub fn stop_experiment(&self) -> ExperimentStatus {
        let mut aborting = false;
        {
            let Ok(mut state) = self.inner.state.lock() else {
                return self.get_experiment_status();
            };
            match state.lifecycle {
                lc if lc == ExperimentLifecycle::Loaded || lc.is_terminal() => {
                    tracing::info!(lifecycle = %lc, "unloading program");
                    state.program = None;
                    state.validation = None;
                    if let Ok(mut levels) = self.inner.levels.lock() {
                        levels.clear();
                    }
                    state.reset_run();
                    state.lifecycle = ExperimentLifecycle::Idle;
                    // add_log would retake the state lock; push directly.
                    let line = format!("{} program unloaded", wall_clock_hms());
                    state.logs.push_back(line);
                    while state.logs.len() > MAX_LOGS {
                        state.logs.pop_front();
                    }
                }
                ExperimentLifecycle::Idle => {}
                ExperimentLifecycle::Running
                | ExperimentLifecycle::Paused
                | ExperimentLifecycle::Aborting => {
                    tracing::info!("stopping experiment");
                    state.lifecycle = ExperimentLifecycle::Aborting;
                    aborting = true;
                }
                _ => {}
            }
        }

        if aborting {
            self.inner.stop.store(true, Ordering::SeqCst);
            self.inner.pause.notify_all();
            self.inner.emit_event(
                ExperimentEventType::ExperimentStopped,
                "experiment stopped".to_string(),
                BTreeMap::new(),
            );
        }
        self.get_experiment_status()
    }

    pub fn get_experiment_status(&self) -> ExperimentStatus {
        let Ok(state) = self.inner.state.lock() else {
            return ExperimentStatus {
                lifecycle: ExperimentLifecycle::Error,
                program_id: None,
                current_step_index: 0,
                current_step_name: String::new(),
                loop_iteration: 0,
                loop_total: 0,
                progress_percent: 0,
                elapsed_s: 0,
                remaining_s: 0.0,
                logs: Vec::new(),
                error_message: Some("state lock poisoned".to_string()),
            };
        };

        let total_steps = state.program.as_ref().map(|p| p.steps.len()).unwrap_or(0);
        let progress_percent = if total_steps > 0 {
            (state.current_step_index * 100 / total_steps) as u32
        } else {
            0
        };

        let elapsed_s = match (state.lifecycle, state.start_time) {
            (ExperimentLifecycle::Running | ExperimentLifecycle::Paused, Some(start)) => {
                self.inner.clock.now().saturating_duration_since(start).as_secs()
            }
            _ => 0,
        };

        let remaining_s = match (&state.validation, progress_percent) {
            (Some(validation), p) if p > 0 => {
                validation.estimate.estimated_duration_s * (100 - p.min(100)) as f64 / 100.0
            }
            _ => 0.0,
        };

        ExperimentStatus {
            lifecycle: state.lifecycle,
            program_id: state.program.as_ref().map(|p| p.id.clone()),
            current_step_index: state.current_step_index,
            current_step_name: state.current_step_name.clone(),
            loop_iteration: state.loop_iteration,
            loop_total: state.loop_total,
            progress_percent,
            elapsed_s,
            remaining_s,
            logs: state.logs.iter().cloned().collect(),
            error_message: state.error_message.clone(),
        }
    }

    /// Subscribe to the event queue. Events are drained by whichever
    /// subscriber pops them first; one subscriber is the usual arrangement.
    pub fn subscribe_experiment_events(&self) -> EventSubscription {
        self.inner.subscriber_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!("event subscriber attached");
        EventSubscription { inner: Arc::clone(&self.inner) }
    }

    /// First-class emergency stop: halt the firmware, force L1 into its
    /// EMERGENCY_STOP state (projecting L0 to INITIAL), keep the process up.
    pub fn emergency_stop(&self) {
        tracing::error!("emergency stop requested");
        self.inner.actuator.send_command("M112", false);
        self.inner.hardware_state.emergency_stop();
    }

    /// Recovery pair to `emergency_stop`.
    pub fn firmware_restart(&self) {
        tracing::warn!("firmware restart requested");
        self.inner.actuator.send_command("FIRMWARE_RESTART", false);
        self.inner.hardware_state.recover_from_error();
    }

    pub fn system_state(&self) -> Arc<SystemState> {
        Arc::clone(&self.inner.system_state)
    }

    pub fn hardware_state(&self) -> Arc<HardwareStateMachine> {
        Arc::clone(&self.inner.hardware_state)
    }

    pub fn load_cell(&self) -> Arc<LoadCellDriver> {
        Arc::clone(&self.inner.load_cell)
    }

    /// Snapshot of the loaded program's inventory bookkeeping.
    pub fn liquid_levels(&self) -> Vec<LiquidLevel> {
        self.inner
            .levels
            .lock()
            .map(|levels| levels.clone())
            .unwrap_or_default()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.pause.notify_all();
        self.inner.events_cv.notify_all();
        if let Ok(mut slot) = self.inner.thread.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Handle returned by `subscribe_experiment_events`; drop to disconnect.
pub struct EventSubscription {
    inner: Arc<Inner>,
}

impl EventSubscription {
    /// Pop the next event, waiting up to `timeout`.
    pub fn next(&self, timeout: Duration) -> Option<ExperimentEvent> {
        let deadline = Instant::now() + timeout;
        let Ok(mut events) = self.inner.events.lock() else {
            return None;
        };
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = (deadline - now).min(EVENT_POLL);
            match self.inner.events_cv.wait_timeout(events, wait) {
                Ok((guard, _)) => events = guard,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.inner.subscriber_count.fetch_sub(1, Ordering::SeqCst);
        tracing::info!("event subscriber detached");
    }
}

impl Inner {
    fn add_log(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.logs.push_back(format!("{} {message}", wall_clock_hms()));
            while state.logs.len() > MAX_LOGS {
                state.logs.pop_front();
            }
        }
        tracing::info!(target: "experiment", "{message}");
    }

    fn emit_event(
        &self,
        event_type: ExperimentEventType,
        message: String,
        data: BTreeMap<String, String>,
    ) {
        if self.subscriber_count.load(Ordering::SeqCst) == 0 {
            return;
        }
        let step_name = self
            .state
            .lock()
            .map(|s| s.current_step_name.clone())
            .unwrap_or_default();
        let event = ExperimentEvent {
            timestamp: SystemTime::now(),
            event_type,
            message,
            step_name,
            data,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push_back(event);
        }
        self.events_cv.notify_all();
    }

}

/// Timestamp prefix for human-facing logs (UTC wall clock).
fn wall_clock_hms() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let h = (secs / 3600) % 24;
    let m = (secs / 60) % 60;
    let s = secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

fn run_experiment(inner: Arc<Inner>, program: Arc<Program>) {
    tracing::info!("executor thread started");

    let log_inner = Arc::clone(&inner);
    let consumables: Arc<dyn ConsumableSink> = Arc::new(LevelTrackingSink {
        levels: Arc::clone(&inner.levels),
        downstream: Arc::clone(&inner.consumables),
    });
    let ctx = ExecCtx::new(
        Arc::clone(&inner.stop),
        Arc::clone(&inner.pause),
        Arc::clone(&inner.clock),
        consumables,
        program.pump_bindings(),
        Arc::new(move |message: String| log_inner.add_log(&message)),
    );

    // The thread boundary catches anything unrecoverable; the experiment is
    // marked ERROR and the instrument is still driven back to INITIAL below.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        execute_steps(&inner, &ctx, &program.steps)
    }));

    match outcome {
        Ok(Ok(())) | Ok(Err(Flow::Stopped)) => {
            let was_stopped = inner.stop.load(Ordering::SeqCst);
            if let Ok(mut state) = inner.state.lock() {
                state.lifecycle = if was_stopped {
                    ExperimentLifecycle::Aborted
                } else {
                    ExperimentLifecycle::Completed
                };
            }
            if was_stopped {
                inner.add_log("experiment aborted");
            } else {
                inner.add_log("experiment complete");
                inner.emit_event(
                    ExperimentEventType::ExperimentCompleted,
                    "experiment complete".to_string(),
                    BTreeMap::new(),
                );
            }
        }
        Ok(Err(Flow::Failed(message))) => {
            fail_experiment(&inner, message);
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "executor thread panicked".to_string());
            fail_experiment(&inner, message);
        }
    }

    // Fail-safe: whatever happened above, leave the instrument idle.
    inner.system_state.transition_to(SystemMode::Initial);
    tracing::info!("executor thread finished");
}

fn fail_experiment(inner: &Arc<Inner>, message: String) {
    if let Ok(mut state) = inner.state.lock() {
        state.lifecycle = ExperimentLifecycle::Error;
        state.error_message = Some(message.clone());
    }
    inner.add_log(&format!("experiment error: {message}"));
    inner.emit_event(
        ExperimentEventType::ExperimentError,
        message.clone(),
        BTreeMap::new(),
    );
    tracing::error!(error = %message, "experiment failed");
}

fn execute_steps(inner: &Arc<Inner>, ctx: &ExecCtx, steps: &[Step]) -> StepResult {
    for (i, step) in steps.iter().enumerate() {
        if ctx.check_stop_or_pause() {
            return Err(Flow::Stopped);
        }

        if let Ok(mut state) = inner.state.lock() {
            state.current_step_index = i;
            state.current_step_name = step.name.clone();
        }

        inner.add_log(&format!("step: {}", step.name));
        inner.emit_event(
            ExperimentEventType::StepStarted,
            step.name.clone(),
            BTreeMap::new(),
        );

        execute_step(inner, ctx, step)?;

        inner.emit_event(
            ExperimentEventType::StepCompleted,
            step.name.clone(),
            BTreeMap::new(),
        );
    }
    Ok(())
}

fn execute_step(inner: &Arc<Inner>, ctx: &ExecCtx, step: &Step) -> StepResult {
    match &step.action {
        StepAction::Inject(_) | StepAction::Drain(_) | StepAction::Acquire(_)
        | StepAction::Wash(_) => {
            let Some(executor) = inner.executors.for_step(step) else {
                return Err(Flow::Failed(format!(
                    "no executor registered for '{}'",
                    step.action.kind()
                )));
            };
            let result = executor.execute(step, ctx);
            if !result.success {
                if ctx.stop.load(Ordering::Relaxed) {
                    return Err(Flow::Stopped);
                }
                return Err(Flow::Failed(result.error_message));
            }
            inner.add_log(&format!(
                "{} finished in {:.1}s",
                executor.name(),
                result.duration_s
            ));
            Ok(())
        }
        StepAction::Wait(action) => {
            execute_wait(inner, ctx, action);
            if ctx.stop.load(Ordering::Relaxed) {
                Err(Flow::Stopped)
            } else {
                Ok(())
            }
        }
        StepAction::SetState(action) => {
            inner.add_log(&format!("set state: {}", action.mode));
            inner.system_state.transition_to(action.mode);
            Ok(())
        }
        StepAction::SetGasPump(action) => {
            execute_set_gas_pump(inner, action.pwm_percent);
            Ok(())
        }
        StepAction::PhaseMarker(action) => {
            if action.is_start {
                inner.add_log(&format!("phase start: {}", action.phase_name));
                inner.emit_event(
                    ExperimentEventType::PhaseStarted,
                    action.phase_name.clone(),
                    BTreeMap::new(),
                );
            } else {
                inner.add_log(&format!("phase end: {}", action.phase_name));
                inner.emit_event(
                    ExperimentEventType::PhaseEnded,
                    action.phase_name.clone(),
                    BTreeMap::new(),
                );
            }
            Ok(())
        }
        StepAction::Loop(action) => {
            inner.add_log(&format!("loop start: {} iterations", action.count));
            if let Ok(mut state) = inner.state.lock() {
                state.loop_total = action.count;
            }

            for i in 0..action.count {
                if ctx.check_stop_or_pause() {
                    return Err(Flow::Stopped);
                }
                if let Ok(mut state) = inner.state.lock() {
                    state.loop_iteration = i + 1;
                }
                inner.add_log(&format!("loop iteration {}/{}", i + 1, action.count));
                inner.emit_event(
                    ExperimentEventType::LoopIteration,
                    format!("iteration {}", i + 1),
                    BTreeMap::new(),
                );
                execute_steps(inner, ctx, &action.steps)?;
            }

            if let Ok(mut state) = inner.state.lock() {
                state.loop_iteration = 0;
                state.loop_total = 0;
            }
            inner.add_log("loop end");
            Ok(())
        }
    }
}

fn execute_wait(inner: &Arc<Inner>, ctx: &ExecCtx, action: &WaitAction) {
    match &action.condition {
        Some(WaitCondition::Duration(seconds)) => {
            inner.add_log(&format!("wait: {seconds}s"));
            wait_for_duration(ctx, *seconds);
        }
        Some(WaitCondition::HeaterCycles(count)) => {
            inner.add_log(&format!("wait: {count} heater cycles"));
            wait_for_heater_cycles(ctx, inner.sensor.as_deref(), *count, action.timeout_s);
        }
        Some(WaitCondition::Weight { target_g }) => {
            inner.add_log(&format!("wait: weight >= {target_g} g"));
            let start = ctx.clock.now();
            let deadline = Duration::from_secs_f64(action.timeout_s.max(0.0));
            loop {
                if ctx.check_stop_or_pause() {
                    return;
                }
                if inner.load_cell.filtered_weight() >= *target_g {
                    inner.add_log("weight condition met");
                    return;
                }
                if ctx.clock.now().saturating_duration_since(start) >= deadline {
                    inner.add_log("weight wait timed out");
                    return;
                }
                ctx.clock.sleep(FEEDBACK_TICK);
            }
        }
        Some(WaitCondition::Empty { tolerance_g, stability_window_s }) => {
            inner.add_log("wait: empty bottle");
            let result = inner.load_cell.wait_for_empty_bottle(
                *tolerance_g,
                action.timeout_s,
                *stability_window_s,
                &|| ctx.check_stop_or_pause(),
            );
            if result.success {
                inner.add_log(&format!("empty bottle at {:.2} g", result.empty_weight));
            } else {
                inner.add_log("empty bottle wait timed out");
            }
        }
        None => {
            inner.add_log("wait: no condition; skipping");
        }
    }
}

/// Set the gas pump and account carbon/vacuum filter runtime across
/// on -> off edges.
fn execute_set_gas_pump(inner: &Arc<Inner>, pwm_percent: f64) {
    inner.add_log(&format!("gas pump: {pwm_percent:.0}%"));
    let fraction = (pwm_percent / 100.0).clamp(0.0, 1.0) as f32;
    inner.system_state.set_gas_pump_pwm(fraction);

    let mut stopped_after = None;
    if let Ok(mut state) = inner.state.lock() {
        if fraction > 0.0 && !state.gas_pump_running {
            state.gas_pump_running = true;
            state.gas_pump_since = Some(inner.clock.now());
        } else if fraction == 0.0 && state.gas_pump_running {
            state.gas_pump_running = false;
            if let Some(since) = state.gas_pump_since.take() {
                stopped_after = Some(inner.clock.now().saturating_duration_since(since).as_secs());
            }
        }
    }

    if let Some(seconds) = stopped_after {
        if seconds > 0 {
            inner.consumables.add_runtime("carbon_filter", seconds);
            inner.consumables.add_runtime("vacuum_filter", seconds);
        }
    }
}
