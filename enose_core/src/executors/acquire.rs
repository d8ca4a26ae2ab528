//! Acquire: route gas to the chamber and collect sensor data until the
//! configured termination condition (or the maximum duration) is met.

use super::{
    wait_for_duration, wait_for_heater_cycles, wait_for_sensor_stability, ExecCtx, ExecuteResult,
    PreconditionResult, StepExecutor, ESTIMATED_CYCLE_S,
};
use crate::guard::ModeTransaction;
use crate::program::{AcquireAction, AcquireTermination, Step, StepAction};
use crate::system_state::{SystemMode, SystemState};
use enose_traits::SensorStream;
use std::sync::Arc;

pub struct AcquireExecutor {
    system_state: Arc<SystemState>,
    sensor: Option<Arc<dyn SensorStream>>,
}

impl AcquireExecutor {
    pub fn new(system_state: Arc<SystemState>, sensor: Option<Arc<dyn SensorStream>>) -> Self {
        Self { system_state, sensor }
    }

    fn action(step: &Step) -> Option<&AcquireAction> {
        match &step.action {
            StepAction::Acquire(action) => Some(action),
            _ => None,
        }
    }
}

impl StepExecutor for AcquireExecutor {
    fn name(&self) -> &'static str {
        "acquire"
    }

    fn check_preconditions(&self, step: &Step) -> PreconditionResult {
        let Some(action) = Self::action(step) else {
            return PreconditionResult::fail(vec![
                "step does not contain an acquire action".to_string()
            ]);
        };

        let mut failures = Vec::new();
        if !(0.0..=100.0).contains(&action.gas_pump_pwm) {
            failures.push("gas pump PWM must be between 0 and 100".to_string());
        }
        if self.system_state.mode() != SystemMode::Initial {
            failures.push("system must be in INITIAL state before acquire".to_string());
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
            return ExecuteResult::fail("step does not contain an acquire action");
        };

        ctx.log(format!("acquire: gas pump {:.0}%", action.gas_pump_pwm));
        let mut guard = ModeTransaction::new(
            Arc::clone(&self.system_state),
            Some(SystemMode::Sample),
            "acquire",
        );

        let sensor = self.sensor.as_deref();
        match &action.termination {
            Some(AcquireTermination::Duration(seconds)) => {
                ctx.log(format!("acquire mode: fixed duration {seconds}s"));
                wait_for_duration(ctx, *seconds);
            }
            Some(AcquireTermination::HeaterCycles(count)) => {
                ctx.log(format!("acquire mode: {count} heater cycles"));
                wait_for_heater_cycles(ctx, sensor, *count, action.max_duration_s);
            }
            Some(AcquireTermination::Stability { window_s, threshold_percent }) => {
                ctx.log("acquire mode: stability".to_string());
                wait_for_sensor_stability(
                    ctx,
                    sensor,
                    *window_s,
                    *threshold_percent,
                    action.max_duration_s,
                );
            }
            None => {
                ctx.log(format!("acquire mode: maximum duration {}s", action.max_duration_s));
                wait_for_duration(ctx, action.max_duration_s);
            }
        }

        ctx.log("acquire complete".to_string());
        guard.commit_and_restore();

        let duration_s = ctx.clock.now().saturating_duration_since(start).as_secs_f64();
        ExecuteResult::ok(ctx.generate_execution_id("acquire"), duration_s)
    }

    fn estimate_duration(&self, step: &Step) -> f64 {
        let Some(action) = Self::action(step) else {
            return 0.0;
        };
        match &action.termination {
            Some(AcquireTermination::Duration(seconds)) => *seconds,
            Some(AcquireTermination::HeaterCycles(count)) => *count as f64 * ESTIMATED_CYCLE_S,
            _ => action.max_duration_s,
        }
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["membrane_pump", "sensor_array"]
    }
}
