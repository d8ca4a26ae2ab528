//! Fine-grained hardware state machine (L1).
//!
//! Thirteen phase states refine the five coarse modes. A static table
//! enumerates legal successors; every successful transition projects down to
//! an L0 mode and drives `SystemState`. The machine also observes L0 so that
//! externally-driven mode changes (manual drain, emergency paths) are
//! reflected back up, with the projection check breaking the cycle.
//!
//! Lock discipline: the phase mutex is released before the cross-layer call,
//! so the L0 echo observes a converged state and no lock is ever held across
//! both layers.

use crate::system_state::{SystemMode, SystemState};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    InjectPreparing,
    InjectRunning,
    InjectStabilizing,
    DrainPreparing,
    DrainRunning,
    CleanPreparing,
    CleanFilling,
    CleanDraining,
    SamplePreparing,
    SampleAcquiring,
    Error,
    EmergencyStop,
}

impl PhaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseState::Idle => "IDLE",
            PhaseState::InjectPreparing => "INJECT_PREPARING",
            PhaseState::InjectRunning => "INJECT_RUNNING",
            PhaseState::InjectStabilizing => "INJECT_STABILIZING",
            PhaseState::DrainPreparing => "DRAIN_PREPARING",
            PhaseState::DrainRunning => "DRAIN_RUNNING",
            PhaseState::CleanPreparing => "CLEAN_PREPARING",
            PhaseState::CleanFilling => "CLEAN_FILLING",
            PhaseState::CleanDraining => "CLEAN_DRAINING",
            PhaseState::SamplePreparing => "SAMPLE_PREPARING",
            PhaseState::SampleAcquiring => "SAMPLE_ACQUIRING",
            PhaseState::Error => "ERROR",
            PhaseState::EmergencyStop => "EMERGENCY_STOP",
        }
    }

    /// Total projection onto the coarse mode.
    pub fn project(self) -> SystemMode {
        match self {
            PhaseState::Idle | PhaseState::Error | PhaseState::EmergencyStop => SystemMode::Initial,
            PhaseState::InjectPreparing
            | PhaseState::InjectRunning
            | PhaseState::InjectStabilizing => SystemMode::Inject,
            PhaseState::DrainPreparing | PhaseState::DrainRunning => SystemMode::Drain,
            PhaseState::CleanPreparing | PhaseState::CleanFilling | PhaseState::CleanDraining => {
                SystemMode::Clean
            }
            PhaseState::SamplePreparing | PhaseState::SampleAcquiring => SystemMode::Sample,
        }
    }

    /// Representative phase for an externally-observed coarse mode.
    pub fn representative(mode: SystemMode) -> PhaseState {
        match mode {
            SystemMode::Initial => PhaseState::Idle,
            SystemMode::Inject => PhaseState::InjectRunning,
            SystemMode::Drain => PhaseState::DrainRunning,
            SystemMode::Clean => PhaseState::CleanFilling,
            SystemMode::Sample => PhaseState::SampleAcquiring,
        }
    }

    /// Legal next states.
    pub fn legal_successors(self) -> &'static [PhaseState] {
        use PhaseState::*;
        match self {
            Idle => &[InjectPreparing, DrainPreparing, CleanPreparing, SamplePreparing, Error, EmergencyStop],
            InjectPreparing => &[InjectRunning, Idle, Error, EmergencyStop],
            InjectRunning => &[InjectStabilizing, Idle, Error, EmergencyStop],
            InjectStabilizing => &[Idle, Error, EmergencyStop],
            DrainPreparing => &[DrainRunning, Idle, Error, EmergencyStop],
            DrainRunning => &[Idle, Error, EmergencyStop],
            CleanPreparing => &[CleanFilling, Idle, Error, EmergencyStop],
            CleanFilling => &[CleanDraining, Idle, Error, EmergencyStop],
            // Draining may cycle back to filling within a wash.
            CleanDraining => &[CleanFilling, Idle, Error, EmergencyStop],
            SamplePreparing => &[SampleAcquiring, Idle, Error, EmergencyStop],
            SampleAcquiring => &[Idle, Error, EmergencyStop],
            Error => &[Idle],
            EmergencyStop => &[Idle],
        }
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub success: bool,
    pub error_message: String,
    pub previous: PhaseState,
    pub current: PhaseState,
}

impl TransitionOutcome {
    fn ok(previous: PhaseState, current: PhaseState) -> Self {
        Self { success: true, error_message: String::new(), previous, current }
    }

    fn fail(message: impl Into<String>, state: PhaseState) -> Self {
        Self { success: false, error_message: message.into(), previous: state, current: state }
    }
}

type PhaseObserver = Box<dyn Fn(PhaseState, PhaseState) + Send + Sync>;

pub struct HardwareStateMachine {
    system_state: Arc<SystemState>,
    current: Mutex<PhaseState>,
    observer: Mutex<Option<PhaseObserver>>,
}

impl HardwareStateMachine {
    /// Create the machine and register it as the L0 state observer.
    pub fn new(system_state: Arc<SystemState>) -> Arc<Self> {
        let machine = Arc::new(Self {
            system_state: Arc::clone(&system_state),
            current: Mutex::new(PhaseState::Idle),
            observer: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&machine);
        system_state.set_mode_observer(move |old, new| {
            if let Some(machine) = weak.upgrade() {
                machine.on_mode_changed(old, new);
            }
        });

        tracing::info!("hardware state machine attached to mode observer");
        machine
    }

    pub fn current_state(&self) -> PhaseState {
        self.current.lock().map(|g| *g).unwrap_or(PhaseState::Idle)
    }

    pub fn can_transition_to(&self, target: PhaseState) -> bool {
        let current = self.current_state();
        current == target || current.legal_successors().contains(&target)
    }

    pub fn available_transitions(&self) -> Vec<PhaseState> {
        self.current_state().legal_successors().to_vec()
    }

    /// Guarded transition: succeeds iff `target` is a legal successor.
    pub fn request_transition(&self, target: PhaseState) -> TransitionOutcome {
        let previous = {
            let Ok(mut current) = self.current.lock() else {
                return TransitionOutcome::fail("state lock poisoned", target);
            };
            if *current == target {
                return TransitionOutcome::ok(target, target);
            }
            if !current.legal_successors().contains(&target) {
                let message =
                    format!("invalid transition: {} -> {}", current.as_str(), target.as_str());
                tracing::warn!("{message}");
                return TransitionOutcome::fail(message, *current);
            }
            let previous = *current;
            *current = target;
            previous
        };

        tracing::info!(from = previous.as_str(), to = target.as_str(), "phase transition");
        self.system_state.transition_to(target.project());
        self.notify(previous, target);
        TransitionOutcome::ok(previous, target)
    }

    /// Unguarded transition, used by emergency stop and rollback paths.
    pub fn force_transition(&self, target: PhaseState) -> TransitionOutcome {
        let previous = {
            let Ok(mut current) = self.current.lock() else {
                return TransitionOutcome::fail("state lock poisoned", target);
            };
            let previous = *current;
            *current = target;
            previous
        };

        tracing::warn!(from = previous.as_str(), to = target.as_str(), "forced phase transition");
        self.system_state.transition_to(target.project());
        self.notify(previous, target);
        TransitionOutcome::ok(previous, target)
    }

    pub fn emergency_stop(&self) -> TransitionOutcome {
        tracing::error!("emergency stop triggered");
        self.force_transition(PhaseState::EmergencyStop)
    }

    /// Explicit recovery; only legal from ERROR or EMERGENCY_STOP.
    pub fn recover_from_error(&self) -> TransitionOutcome {
        let previous = {
            let Ok(mut current) = self.current.lock() else {
                return TransitionOutcome::fail("state lock poisoned", PhaseState::Idle);
            };
            if *current != PhaseState::Error && *current != PhaseState::EmergencyStop {
                return TransitionOutcome::fail("not in an error state", *current);
            }
            let previous = *current;
            *current = PhaseState::Idle;
            previous
        };

        tracing::info!(from = previous.as_str(), "recovered to IDLE");
        self.system_state.transition_to(SystemMode::Initial);
        self.notify(previous, PhaseState::Idle);
        TransitionOutcome::ok(previous, PhaseState::Idle)
    }

    pub fn set_state_observer<F>(&self, observer: F)
    where
        F: Fn(PhaseState, PhaseState) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.observer.lock() {
            *slot = Some(Box::new(observer));
        }
    }

    /// Reverse sync: the coarse mode changed underneath us (manual drain RPC,
    /// emergency path). Overwrite the phase with the representative state
    /// unless our projection already matches, which both converges the layers
    /// and suppresses the echo of our own transitions.
    fn on_mode_changed(&self, old: SystemMode, new: SystemMode) {
        let mapped = PhaseState::representative(new);
        let previous = {
            let Ok(mut current) = self.current.lock() else {
                return;
            };
            if current.project() == new {
                return;
            }
            let previous = *current;
            *current = mapped;
            previous
        };

        tracing::info!(
            from = previous.as_str(),
            to = mapped.as_str(),
            l0_from = %old,
            l0_to = %new,
            "phase synced from mode change"
        );
        self.notify(previous, mapped);
    }

    fn notify(&self, old: PhaseState, new: PhaseState) {
        if let Ok(slot) = self.observer.lock() {
            if let Some(observer) = slot.as_ref() {
                observer(old, new);
            }
        }
    }
}
