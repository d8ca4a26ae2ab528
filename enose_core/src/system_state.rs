//! Coarse system modes (L0) and the peripheral set-point table.
//!
//! Each mode maps to a fixed `PeripheralState` vector; `MODE_TABLE` is the
//! only definition of what a mode means at the hardware level. A transition
//! emits exactly the field-wise diff between the current vector and the
//! target vector, preceded by a stepper auto-stop when any pump is running.

use enose_traits::{Actuator, Clock};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PUMP_COUNT: usize = 8;

/// Firmware axis letters for the eight coordinated pumps.
const AXIS_LETTERS: [char; PUMP_COUNT] = ['A', 'B', 'C', 'D', 'H', 'I', 'J', 'K'];

/// Soft-start ramp for the wash pump: equal steps at a fixed spacing.
const WASH_RAMP_STEPS: u32 = 10;
const WASH_RAMP_SPACING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Stopped,
    Running,
}

/// Set-points for every controllable peripheral.
///
/// `valve_outlet` uses inverted logic: 0 = open.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralState {
    pub valve_waste: f32,
    pub valve_pinch: f32,
    pub valve_air: f32,
    pub valve_outlet: f32,
    pub membrane_pump_pwm: f32,
    pub wash_pump_pwm: f32,
    pub pumps: [PumpState; PUMP_COUNT],
    pub heater_pwm: f32,
}

const ALL_STOPPED: [PumpState; PUMP_COUNT] = [PumpState::Stopped; PUMP_COUNT];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMode {
    Initial,
    Drain,
    Clean,
    Sample,
    Inject,
}

impl SystemMode {
    pub const ALL: [SystemMode; 5] = [
        SystemMode::Initial,
        SystemMode::Drain,
        SystemMode::Clean,
        SystemMode::Sample,
        SystemMode::Inject,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SystemMode::Initial => "INITIAL",
            SystemMode::Drain => "DRAIN",
            SystemMode::Clean => "CLEAN",
            SystemMode::Sample => "SAMPLE",
            SystemMode::Inject => "INJECT",
        }
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Power-on rest state: everything closed, off and cold.
static INITIAL_DEF: PeripheralState = PeripheralState {
    valve_waste: 0.0,
    valve_pinch: 0.0,
    valve_air: 0.0,
    valve_outlet: 0.0,
    membrane_pump_pwm: 0.0,
    wash_pump_pwm: 0.0,
    pumps: ALL_STOPPED,
    heater_pwm: 0.0,
};

// Waste valve open, outlet sealed, membrane pump pushes the bottle out.
static DRAIN_DEF: PeripheralState = PeripheralState {
    valve_waste: 1.0,
    valve_pinch: 0.0,
    valve_air: 0.0,
    valve_outlet: 1.0,
    membrane_pump_pwm: 1.0,
    wash_pump_pwm: 0.0,
    pumps: ALL_STOPPED,
    heater_pwm: 0.0,
};

// Liquid path selected, wash pump on.
static CLEAN_DEF: PeripheralState = PeripheralState {
    valve_waste: 0.0,
    valve_pinch: 1.0,
    valve_air: 0.0,
    valve_outlet: 0.0,
    membrane_pump_pwm: 0.0,
    wash_pump_pwm: 1.0,
    pumps: ALL_STOPPED,
    heater_pwm: 0.0,
};

// Gas path routed to the chamber for acquisition.
static SAMPLE_DEF: PeripheralState = PeripheralState {
    valve_waste: 0.0,
    valve_pinch: 0.0,
    valve_air: 1.0,
    valve_outlet: 1.0,
    membrane_pump_pwm: 1.0,
    wash_pump_pwm: 0.0,
    pumps: ALL_STOPPED,
    heater_pwm: 0.0,
};

// Same valve routing as CLEAN; the peristaltic pumps do the work.
static INJECT_DEF: PeripheralState = PeripheralState {
    valve_waste: 0.0,
    valve_pinch: 1.0,
    valve_air: 0.0,
    valve_outlet: 0.0,
    membrane_pump_pwm: 0.0,
    wash_pump_pwm: 0.0,
    pumps: ALL_STOPPED,
    heater_pwm: 0.0,
};

/// The mode -> set-point table.
pub fn mode_definition(mode: SystemMode) -> &'static PeripheralState {
    match mode {
        SystemMode::Initial => &INITIAL_DEF,
        SystemMode::Drain => &DRAIN_DEF,
        SystemMode::Clean => &CLEAN_DEF,
        SystemMode::Sample => &SAMPLE_DEF,
        SystemMode::Inject => &INJECT_DEF,
    }
}

/// Per-pump distances and motion profile for a coordinated injection.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionParams {
    pub distances_mm: [f64; PUMP_COUNT],
    /// mm/s
    pub speed: f64,
    /// mm/s^2
    pub accel: f64,
}

impl Default for InjectionParams {
    fn default() -> Self {
        Self {
            distances_mm: [0.0; PUMP_COUNT],
            speed: 10.0,
            accel: 100.0,
        }
    }
}

type ModeObserver = Box<dyn Fn(SystemMode, SystemMode) + Send + Sync>;

struct Inner {
    mode: SystemMode,
    vector: PeripheralState,
}

/// The L0 state machine. All transitions are serialized by the inner mutex;
/// the observer is invoked after the lock is released and only on real
/// changes.
pub struct SystemState {
    actuator: Arc<dyn Actuator>,
    clock: Arc<dyn Clock + Send + Sync>,
    inner: Mutex<Inner>,
    observer: Mutex<Option<ModeObserver>>,
}

impl SystemState {
    pub fn new(actuator: Arc<dyn Actuator>, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            actuator,
            clock,
            inner: Mutex::new(Inner {
                mode: SystemMode::Initial,
                vector: mode_definition(SystemMode::Initial).clone(),
            }),
            observer: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.inner.lock().map(|g| g.mode).unwrap_or(SystemMode::Initial)
    }

    /// Snapshot of the live peripheral vector.
    pub fn peripheral_state(&self) -> PeripheralState {
        self.inner
            .lock()
            .map(|g| g.vector.clone())
            .unwrap_or_else(|_| mode_definition(SystemMode::Initial).clone())
    }

    /// Register the single state-change observer (replaces any previous one).
    pub fn set_mode_observer<F>(&self, observer: F)
    where
        F: Fn(SystemMode, SystemMode) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.observer.lock() {
            *slot = Some(Box::new(observer));
        }
    }

    pub fn start_drain(&self) {
        self.transition_to(SystemMode::Drain);
    }

    pub fn stop_drain(&self) {
        self.transition_to(SystemMode::Initial);
    }

    pub fn start_clean(&self) {
        self.transition_to(SystemMode::Clean);
    }

    pub fn stop_clean(&self) {
        self.transition_to(SystemMode::Initial);
    }

    /// Switch modes, emitting only the peripheral diff.
    pub fn transition_to(&self, target: SystemMode) {
        let old = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            if inner.mode == target {
                tracing::debug!(mode = %target, "already in mode");
                return;
            }
            let old = inner.mode;
            let target_vector = mode_definition(target).clone();

            // Auto-stop before transition: cancel in-flight motion first.
            if inner.vector.pumps.contains(&PumpState::Running) {
                self.actuator.send_command("ENOSE_ASYNC_STOP", false);
                inner.vector.pumps = ALL_STOPPED;
            }

            self.apply_vector(&mut inner.vector, &target_vector);
            inner.mode = target;
            old
        };

        tracing::info!(from = %old, to = %target, "mode transition");
        self.notify(old, target);
    }

    /// Emit one actuator command per changed field, in declaration order.
    fn apply_vector(&self, current: &mut PeripheralState, target: &PeripheralState) {
        if target.valve_waste != current.valve_waste {
            self.set_pin("valve_waste", target.valve_waste);
        }
        if target.valve_pinch != current.valve_pinch {
            self.set_pin("valve_pinch", target.valve_pinch);
            // The inject-area fans are slaved to the pinch valve.
            self.set_pin("fan_inject_0", target.valve_pinch);
            self.set_pin("fan_inject_1", target.valve_pinch);
        }
        if target.valve_air != current.valve_air {
            self.set_pin("valve_air", target.valve_air);
        }
        if target.valve_outlet != current.valve_outlet {
            self.set_pin("valve_outlet", target.valve_outlet);
        }
        if target.membrane_pump_pwm != current.membrane_pump_pwm {
            self.set_pin("membrane_pump", target.membrane_pump_pwm);
        }
        if target.wash_pump_pwm != current.wash_pump_pwm {
            if target.wash_pump_pwm > current.wash_pump_pwm {
                self.ramp_wash_pump(current.wash_pump_pwm, target.wash_pump_pwm);
            } else {
                self.set_pin("wash_pump", target.wash_pump_pwm);
            }
        }
        for (idx, (cur, tgt)) in current.pumps.iter().zip(target.pumps.iter()).enumerate() {
            if *tgt == PumpState::Stopped && *cur == PumpState::Running {
                self.actuator
                    .send_command(&format!("MANUAL_STEPPER STEPPER=pump_{idx} ENABLE=0"), false);
            }
        }
        if target.heater_pwm != current.heater_pwm {
            self.set_pin("heater_chamber", target.heater_pwm);
        }
        *current = target.clone();
    }

    /// Soft-start: raise the wash pump in equal steps to limit inrush.
    fn ramp_wash_pump(&self, from: f32, to: f32) {
        let span = to - from;
        for step in 1..=WASH_RAMP_STEPS {
            let value = from + span * (step as f32) / (WASH_RAMP_STEPS as f32);
            self.set_pin("wash_pump", value);
            if step < WASH_RAMP_STEPS {
                self.clock.sleep(WASH_RAMP_SPACING);
            }
        }
    }

    fn set_pin(&self, pin: &str, value: f32) {
        self.actuator
            .send_command(&format!("SET_PIN PIN={pin} VALUE={value}"), false);
    }

    /// Begin a coordinated multi-pump injection.
    ///
    /// Transitions to INJECT, registers the pumps as axes and issues a single
    /// composite move. Pumps with a non-zero distance are marked RUNNING.
    pub fn start_inject(&self, params: &InjectionParams) {
        self.transition_to(SystemMode::Inject);

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        self.actuator.send_command("REGISTER_PUMPS_TO_AXIS", false);

        let mut command = String::from("G1");
        for (idx, distance) in params.distances_mm.iter().enumerate() {
            if *distance != 0.0 {
                command.push_str(&format!(" {}{:.1}", AXIS_LETTERS[idx], distance));
                inner.vector.pumps[idx] = PumpState::Running;
            }
        }
        // The move wants mm/min; params carry mm/s.
        command.push_str(&format!(" F{:.1}", params.speed * 60.0));
        self.actuator.send_command(&command, false);

        tracing::info!(speed_mm_s = params.speed, accel = params.accel, "injection started");
    }

    /// Immediately stop a running injection and return to INITIAL.
    ///
    /// The async stop zeroes the firmware motion queue, cancels the axis
    /// registration and disables the motors.
    pub fn stop_inject(&self) {
        self.actuator.send_command("ENOSE_ASYNC_STOP", false);
        if let Ok(mut inner) = self.inner.lock() {
            inner.vector.pumps = ALL_STOPPED;
        }
        self.transition_to(SystemMode::Initial);
    }

    /// Free-run a single peristaltic pump, for maintenance and priming.
    ///
    /// Resets the stepper position so the move is relative, then issues an
    /// unsynchronized move. The pump is marked RUNNING so the next mode
    /// transition auto-stops it.
    pub fn run_pump(&self, pump_index: usize, speed: f64, accel: f64, distance_mm: f64) {
        if pump_index >= PUMP_COUNT {
            tracing::warn!(pump_index, "run_pump: index out of range");
            return;
        }
        self.actuator.send_command(
            &format!("MANUAL_STEPPER STEPPER=pump_{pump_index} SET_POSITION=0"),
            false,
        );
        self.actuator.send_command(
            &format!(
                "MANUAL_STEPPER STEPPER=pump_{pump_index} SPEED={speed} ACCEL={accel} MOVE={distance_mm} SYNC=0"
            ),
            false,
        );
        if let Ok(mut inner) = self.inner.lock() {
            inner.vector.pumps[pump_index] = PumpState::Running;
        }
    }

    /// Adjust the membrane (gas) pump duty without a mode change.
    pub fn set_gas_pump_pwm(&self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.set_pin("membrane_pump", fraction);
        if let Ok(mut inner) = self.inner.lock() {
            inner.vector.membrane_pump_pwm = fraction;
        }
    }

    fn notify(&self, old: SystemMode, new: SystemMode) {
        if let Ok(slot) = self.observer.lock() {
            if let Some(observer) = slot.as_ref() {
                observer(old, new);
            }
        }
    }
}
