//! Drain: empty the bottle to waste, terminated by the load cell settling at
//! the dynamic empty baseline.

use super::{ExecCtx, ExecuteResult, PreconditionResult, StepExecutor};
use crate::guard::ModeTransaction;
use crate::hardware_state::{HardwareStateMachine, PhaseState};
use crate::load_cell::LoadCellDriver;
use crate::program::{DrainAction, Step, StepAction};
use crate::system_state::{SystemMode, SystemState};
use std::sync::Arc;

pub struct DrainExecutor {
    system_state: Arc<SystemState>,
    hardware_state: Option<Arc<HardwareStateMachine>>,
    load_cell: Arc<LoadCellDriver>,
}

impl DrainExecutor {
    pub fn new(
        system_state: Arc<SystemState>,
        hardware_state: Option<Arc<HardwareStateMachine>>,
        load_cell: Arc<LoadCellDriver>,
    ) -> Self {
        Self { system_state, hardware_state, load_cell }
    }

    fn action(step: &Step) -> Option<&DrainAction> {
        match &step.action {
            StepAction::Drain(action) => Some(action),
            _ => None,
        }
    }
}

impl StepExecutor for DrainExecutor {
    fn name(&self) -> &'static str {
        "drain"
    }

    fn check_preconditions(&self, step: &Step) -> PreconditionResult {
        if Self::action(step).is_none() {
            return PreconditionResult::fail(vec![
                "step does not contain a drain action".to_string()
            ]);
        }

        let mut failures = Vec::new();
        let mode = self.system_state.mode();
        if mode != SystemMode::Initial && mode != SystemMode::Inject {
            failures.push("system must be in INITIAL or INJECT state before drain".to_string());
        }
        if let Some(hs) = &self.hardware_state {
            if !hs.can_transition_to(PhaseState::DrainPreparing) {
                failures.push("cannot transition to DRAIN state".to_string());
            }
        }

        if failures.is_empty() {
            PreconditionResult::ok()
        } else {
            PreconditionResult::fail(failures)
        }
    }

    fn execute(&self, step: &Step, ctx: &ExecCtx) -> ExecuteResult {
        let start = ctx.clock.now();

        let precond = self.check_preconditions(step);
        if !precond.satisfied {
            return ExecuteResult::fail(format!("precondition failed: {}", precond.summary()));
        }
        let Some(action) = Self::action(step) else {
            return ExecuteResult::fail("step does not contain a drain action");
        };

        ctx.log("drain to waste".to_string());
        let mut guard =
            ModeTransaction::new(Arc::clone(&self.system_state), Some(SystemMode::Drain), "drain");

        let result = self.load_cell.wait_for_empty_bottle(
            action.empty_tolerance_g,
            action.timeout_s,
            action.stability_window_s,
            &|| ctx.check_stop_or_pause(),
        );

        if result.success {
            ctx.log(format!("drain complete at {:.2} g", result.empty_weight));
        } else {
            // A timed-out drain still commits: restoring INITIAL from DRAIN
            // is the same motion either way, and the bottle is emptier than
            // when we started.
            ctx.log("drain timed out".to_string());
        }

        guard.commit_and_restore();

        let duration_s = ctx.clock.now().saturating_duration_since(start).as_secs_f64();
        ExecuteResult::ok(ctx.generate_execution_id("drain"), duration_s)
    }

    fn estimate_duration(&self, step: &Step) -> f64 {
        Self::action(step).map(|a| a.timeout_s).unwrap_or(0.0)
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["membrane_pump", "load_cell", "waste_valve"]
    }
}
