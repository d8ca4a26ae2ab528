//! Scoped state transactions.
//!
//! Construction records the entry state and optionally requests a transition
//! to a working state; `Drop` forces the machine back to the entry state
//! unless one of the commit methods ran first. This is the rollback
//! guarantee every primitive executor relies on: any exit path that unwinds
//! past the guard (early return, cancellation, panic) restores the entry
//! state.

use crate::hardware_state::{HardwareStateMachine, PhaseState};
use crate::system_state::{SystemMode, SystemState};
use std::sync::Arc;

/// Transaction over the coarse (L0) machine.
pub struct ModeTransaction {
    state: Arc<SystemState>,
    initial: SystemMode,
    action: String,
    committed: bool,
}

impl ModeTransaction {
    pub fn new(state: Arc<SystemState>, target: Option<SystemMode>, action: &str) -> Self {
        let initial = state.mode();
        tracing::debug!(action, initial = %initial, "mode transaction open");
        if let Some(target) = target {
            state.transition_to(target);
        }
        Self {
            state,
            initial,
            action: action.to_string(),
            committed: false,
        }
    }

    /// Commit, leaving the machine wherever it is.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Commit after a final explicit transition.
    pub fn commit_with_state(&mut self, final_state: SystemMode) {
        self.state.transition_to(final_state);
        self.committed = true;
    }

    /// Commit after restoring the entry state. The success path for
    /// primitives that must leave the instrument idle.
    pub fn commit_and_restore(&mut self) {
        self.state.transition_to(self.initial);
        self.committed = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn initial_state(&self) -> SystemMode {
        self.initial
    }

    pub fn current_state(&self) -> SystemMode {
        self.state.mode()
    }
}

impl Drop for ModeTransaction {
    fn drop(&mut self) {
        if self.committed {
            tracing::debug!(action = %self.action, state = %self.state.mode(), "mode transaction committed");
            return;
        }
        tracing::warn!(
            action = %self.action,
            from = %self.state.mode(),
            to = %self.initial,
            "mode transaction rollback"
        );
        self.state.transition_to(self.initial);
    }
}

/// Transaction over the fine-grained (L1) machine.
///
/// Tolerates a missing machine (`None`): the guard is then inert, which lets
/// callers keep one code path whether or not L1 integration is wired.
pub struct PhaseTransaction {
    machine: Option<Arc<HardwareStateMachine>>,
    initial: PhaseState,
    action: String,
    committed: bool,
}

impl PhaseTransaction {
    pub fn new(
        machine: Option<Arc<HardwareStateMachine>>,
        target: Option<PhaseState>,
        action: &str,
    ) -> Self {
        let Some(machine) = machine else {
            tracing::warn!(action, "phase transaction without a machine");
            return Self {
                machine: None,
                initial: PhaseState::Idle,
                action: action.to_string(),
                committed: true,
            };
        };

        let initial = machine.current_state();
        tracing::debug!(action, initial = initial.as_str(), "phase transaction open");
        if let Some(target) = target {
            let outcome = machine.request_transition(target);
            if !outcome.success {
                tracing::warn!(
                    action,
                    target = target.as_str(),
                    error = %outcome.error_message,
                    "phase transaction target refused"
                );
            }
        }
        Self {
            machine: Some(machine),
            initial,
            action: action.to_string(),
            committed: false,
        }
    }

    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn commit_with_state(&mut self, final_state: PhaseState) {
        if let Some(machine) = &self.machine {
            machine.request_transition(final_state);
        }
        self.committed = true;
    }

    /// Rollback paths use a forced transition so legality rules cannot get in
    /// the way of error handling.
    pub fn commit_and_restore(&mut self) {
        if let Some(machine) = &self.machine {
            machine.force_transition(self.initial);
        }
        self.committed = true;
    }

    pub fn is_valid(&self) -> bool {
        self.machine.is_some()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn initial_state(&self) -> PhaseState {
        self.initial
    }

    pub fn current_state(&self) -> PhaseState {
        self.machine
            .as_ref()
            .map(|m| m.current_state())
            .unwrap_or(PhaseState::Idle)
    }
}

impl Drop for PhaseTransaction {
    fn drop(&mut self) {
        let Some(machine) = &self.machine else {
            return;
        };
        if self.committed {
            tracing::debug!(
                action = %self.action,
                state = machine.current_state().as_str(),
                "phase transaction committed"
            );
            return;
        }
        tracing::warn!(
            action = %self.action,
            from = machine.current_state().as_str(),
            to = self.initial.as_str(),
            "phase transaction rollback"
        );
        machine.force_transition(self.initial);
    }
}
