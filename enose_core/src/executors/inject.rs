//! Inject: weighted multi-component dispense through the peristaltic pumps,
//! terminated by load-cell feedback.

use super::{ExecCtx, ExecuteResult, PreconditionResult, StepExecutor, FEEDBACK_TICK};
use crate::guard::ModeTransaction;
use crate::hardware_state::{HardwareStateMachine, PhaseState};
use crate::load_cell::LoadCellDriver;
use crate::program::{InjectAction, Step, StepAction};
use crate::system_state::{InjectionParams, SystemMode, SystemState, PUMP_COUNT};
use std::sync::Arc;
use std::time::Duration;

/// Tubing constant relating pump travel to dispensed volume. Deliberately
/// independent of the load-cell calibration model.
const MM_TO_ML: f64 = 0.1;

/// mm of pump travel per ml of target volume.
const ML_TO_MM: f64 = 1000.0;

pub struct InjectExecutor {
    system_state: Arc<SystemState>,
    hardware_state: Option<Arc<HardwareStateMachine>>,
    load_cell: Arc<LoadCellDriver>,
}

impl InjectExecutor {
    pub fn new(
        system_state: Arc<SystemState>,
        hardware_state: Option<Arc<HardwareStateMachine>>,
        load_cell: Arc<LoadCellDriver>,
    ) -> Self {
        Self { system_state, hardware_state, load_cell }
    }

    fn action(step: &Step) -> Option<&InjectAction> {
        match &step.action {
            StepAction::Inject(action) => Some(action),
            _ => None,
        }
    }

    /// Per-pump travel distances for the action, honoring the liquid->pump
    /// bindings. Weight-only targets go through the calibration inverse.
    fn distances(
        &self,
        action: &InjectAction,
        ctx: &ExecCtx,
    ) -> Result<[f64; PUMP_COUNT], String> {
        let mut distances = [0.0; PUMP_COUNT];
        for comp in &action.components {
            let Some(&pump) = ctx.pump_bindings.get(&comp.liquid_id) else {
                return Err(format!("no pump bound to liquid '{}'", comp.liquid_id));
            };
            if pump >= PUMP_COUNT {
                return Err(format!("pump index {pump} out of range"));
            }
            let mm = match (action.target_volume_ml, action.target_weight_g) {
                (Some(volume), _) => volume * comp.ratio * ML_TO_MM,
                (None, Some(weight)) => self.load_cell.weight_to_mm(weight * comp.ratio),
                (None, None) => 0.0,
            };
            distances[pump] += mm;
        }
        Ok(distances)
    }
}

impl StepExecutor for InjectExecutor {
    fn name(&self) -> &'static str {
        "inject"
    }

    fn check_preconditions(&self, step: &Step) -> PreconditionResult {
        let Some(action) = Self::action(step) else {
            return PreconditionResult::fail(vec![
                "step does not contain an inject action".to_string()
            ]);
        };

        let mut failures = Vec::new();

        let target = action.target_volume_ml.or(action.target_weight_g).unwrap_or(0.0);
        if target <= 0.0 {
            failures.push("target volume must be positive".to_string());
        }
        if action.components.is_empty() {
            failures.push("no liquid components specified".to_string());
        }
        let ratio_sum: f64 = action.components.iter().map(|c| c.ratio).sum();
        if (ratio_sum - 1.0).abs() > 0.01 {
            failures.push("component ratios must sum to 1.0".to_string());
        }
        if self.system_state.mode() != SystemMode::Initial {
            failures.push("system must be in INITIAL state before inject".to_string());
        }
        if let Some(hs) = &self.hardware_state {
            if !hs.can_transition_to(PhaseState::InjectPreparing) {
                failures.push("cannot transition to INJECT state".to_string());
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
            return ExecuteResult::fail("step does not contain an inject action");
        };

        let total_volume = action.target_volume_ml.unwrap_or_else(|| {
            // Weight target with assumed unit density.
            action.target_weight_g.unwrap_or(0.0)
        });
        ctx.log(format!("inject: target {total_volume:.1} ml"));

        let mut guard =
            ModeTransaction::new(Arc::clone(&self.system_state), Some(SystemMode::Inject), "inject");

        let distances = match self.distances(action, ctx) {
            Ok(d) => d,
            Err(message) => return ExecuteResult::fail(message),
        };

        let speed = action.flow_rate_ml_min / 60.0 * ML_TO_MM;
        let params = InjectionParams {
            distances_mm: distances,
            speed,
            accel: speed * 2.0,
        };
        self.system_state.start_inject(&params);

        // Weight feedback is the only confirmation that matters; the motion
        // command itself is fire-and-forget.
        let target_weight = action.target_weight_g.unwrap_or(total_volume);
        let timeout = Duration::from_secs_f64(action.stable_timeout_s.max(0.0));
        let inject_start = ctx.clock.now();

        loop {
            if ctx.check_stop_or_pause() {
                break;
            }
            let weight = self.load_cell.filtered_weight();
            if weight >= target_weight - action.tolerance_g {
                ctx.log(format!("inject complete at {weight:.2} g"));
                break;
            }
            if ctx.clock.now().saturating_duration_since(inject_start) >= timeout {
                ctx.log("inject timed out waiting for weight".to_string());
                break;
            }
            ctx.clock.sleep(FEEDBACK_TICK);
        }

        let elapsed = ctx.clock.now().saturating_duration_since(inject_start);
        let elapsed_s = elapsed.as_secs();

        for (idx, mm) in distances.iter().enumerate() {
            if *mm > 0.0 {
                ctx.consumables.add_pump_consumption(idx, mm * MM_TO_ML);
                if elapsed_s > 0 {
                    ctx.consumables.add_runtime(&format!("pump_tube_{idx}"), elapsed_s);
                }
            }
        }

        guard.commit_and_restore();

        let duration_s = ctx.clock.now().saturating_duration_since(start).as_secs_f64();
        ExecuteResult::ok(ctx.generate_execution_id("inject"), duration_s)
    }

    fn estimate_duration(&self, step: &Step) -> f64 {
        let Some(action) = Self::action(step) else {
            return 0.0;
        };
        let volume = action.target_volume_ml.or(action.target_weight_g).unwrap_or(0.0);
        if action.flow_rate_ml_min > 0.0 {
            (volume / action.flow_rate_ml_min) * 60.0 + 5.0
        } else {
            action.stable_timeout_s
        }
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["stepper_pumps", "load_cell"]
    }
}
