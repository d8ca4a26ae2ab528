//! Wash: repeated drain / fill / drain cycles. The transaction guard opens
//! with no target; the phases drive the mode themselves, and the guard's
//! only job is to force INITIAL back on any unwinding path.

use super::{ExecCtx, ExecuteResult, PreconditionResult, StepExecutor, FEEDBACK_TICK};
use crate::guard::ModeTransaction;
use crate::load_cell::LoadCellDriver;
use crate::program::{Step, StepAction, WashAction};
use crate::system_state::{SystemMode, SystemState};
use std::sync::Arc;
use std::time::Duration;

pub struct WashExecutor {
    system_state: Arc<SystemState>,
    load_cell: Arc<LoadCellDriver>,
}

impl WashExecutor {
    pub fn new(system_state: Arc<SystemState>, load_cell: Arc<LoadCellDriver>) -> Self {
        Self { system_state, load_cell }
    }

    fn action(step: &Step) -> Option<&WashAction> {
        match &step.action {
            StepAction::Wash(action) => Some(action),
            _ => None,
        }
    }
}

impl StepExecutor for WashExecutor {
    fn name(&self) -> &'static str {
        "wash"
    }

    fn check_preconditions(&self, step: &Step) -> PreconditionResult {
        let Some(action) = Self::action(step) else {
            return PreconditionResult::fail(vec![
                "step does not contain a wash action".to_string()
            ]);
        };

        let mut failures = Vec::new();
        if action.repeat_count == 0 {
            failures.push("repeat count must be positive".to_string());
        }
        if action.target_weight_g <= 0.0 {
            failures.push("target weight must be positive".to_string());
        }
        if self.system_state.mode() != SystemMode::Initial {
            failures.push("system must be in INITIAL state before wash".to_string());
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
            return ExecuteResult::fail("step does not contain a wash action");
        };

        ctx.log(format!(
            "wash: target gain {:.1} g, {} cycles",
            action.target_weight_g, action.repeat_count
        ));

        let mut guard = ModeTransaction::new(Arc::clone(&self.system_state), None, "wash");

        for cycle in 1..=action.repeat_count {
            if ctx.check_stop_or_pause() {
                return ExecuteResult::fail("wash stopped by user");
            }
            ctx.log(format!("wash cycle {cycle}/{}", action.repeat_count));

            // 1. Drain until the bottle reads empty, sampling the baseline.
            ctx.log("draining to confirm empty bottle".to_string());
            self.system_state.transition_to(SystemMode::Drain);
            let empty = self.load_cell.wait_for_empty_bottle(
                action.empty_tolerance_g,
                action.drain_timeout_s,
                action.empty_stability_window_s,
                &|| ctx.check_stop_or_pause(),
            );
            if !empty.success {
                ctx.log("drain timed out; continuing wash".to_string());
            }
            let baseline = self.load_cell.filtered_weight();
            ctx.log(format!("empty baseline {baseline:.2} g"));

            if ctx.check_stop_or_pause() {
                return ExecuteResult::fail("wash stopped by user");
            }

            // 2. Fill with rinse liquid until the target gain (or timeout).
            ctx.log("filling with rinse liquid".to_string());
            self.system_state.transition_to(SystemMode::Clean);

            let fill_start = ctx.clock.now();
            let fill_timeout = Duration::from_secs_f64(action.fill_timeout_s.max(0.0));
            loop {
                if ctx.check_stop_or_pause() {
                    return ExecuteResult::fail("wash stopped by user");
                }
                let gain = self.load_cell.filtered_weight() - baseline;
                if gain >= action.target_weight_g {
                    ctx.log(format!("target gain reached: {gain:.2} g"));
                    break;
                }
                if ctx.clock.now().saturating_duration_since(fill_start) >= fill_timeout {
                    ctx.log(format!("fill timed out at {gain:.2} g gain"));
                    break;
                }
                ctx.clock.sleep(FEEDBACK_TICK);
            }

            if ctx.check_stop_or_pause() {
                return ExecuteResult::fail("wash stopped by user");
            }

            // 3. Drain the rinse liquid back out.
            ctx.log("draining rinse liquid".to_string());
            self.system_state.transition_to(SystemMode::Drain);
            let drained = self.load_cell.wait_for_empty_bottle(
                action.empty_tolerance_g,
                action.drain_timeout_s,
                action.empty_stability_window_s,
                &|| ctx.check_stop_or_pause(),
            );
            if drained.success {
                ctx.log(format!("drained to {:.2} g", drained.empty_weight));
            } else {
                ctx.log("drain timed out".to_string());
            }
        }

        guard.commit_and_restore();
        ctx.log("wash complete".to_string());

        let duration_s = ctx.clock.now().saturating_duration_since(start).as_secs_f64();
        ExecuteResult::ok(ctx.generate_execution_id("wash"), duration_s)
    }

    fn estimate_duration(&self, step: &Step) -> f64 {
        let Some(action) = Self::action(step) else {
            return 0.0;
        };
        let per_cycle = action.drain_timeout_s + action.fill_timeout_s + action.drain_timeout_s;
        per_cycle * action.repeat_count as f64
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["wash_pump", "membrane_pump", "load_cell", "waste_valve"]
    }
}
