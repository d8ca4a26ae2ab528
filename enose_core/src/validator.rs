//! Static program validation.
//!
//! A forward simulation of the program against the hardware envelope:
//! reference integrity, per-pump consumption totals, bottle level tracking,
//! duration and heater-cycle estimates, and the overflow / sufficiency
//! safety checks. Diagnostics are structured (path + code + message) and are
//! returned, never raised.

use crate::program::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Structured location, e.g. `steps[2].inject.components[0].liquid_id`.
    pub path: String,
    pub code: &'static str,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default)]
pub struct LiquidConsumption {
    pub liquid_id: String,
    pub liquid_name: String,
    pub pump_index: u32,
    pub required_ml: f64,
    pub available_ml: f64,
    pub sufficient: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceEstimate {
    pub pump_consumption_ml: BTreeMap<u32, f64>,
    pub peak_liquid_level_ml: f64,
    pub estimated_duration_s: f64,
    pub heater_cycles: u32,
    pub liquid_consumption: Vec<LiquidConsumption>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub estimate: ResourceEstimate,
}

/// Seconds charged per heater cycle in wait estimates.
const HEATER_CYCLE_ESTIMATE_S: f64 = 2.5;

pub struct ProgramValidator;

impl ProgramValidator {
    pub fn validate(program: &Program) -> ValidationReport {
        let mut walk = Walk::new(program);
        walk.run();
        walk.into_report()
    }
}

struct Walk<'p> {
    program: &'p Program,
    errors: Vec<Diagnostic>,
    warnings: Vec<Diagnostic>,
    pump_totals: BTreeMap<u32, f64>,
    current_level_ml: f64,
    peak_level_ml: f64,
    total_duration_s: f64,
    total_heater_cycles: u32,
}

impl<'p> Walk<'p> {
    fn new(program: &'p Program) -> Self {
        Self {
            program,
            errors: Vec::new(),
            warnings: Vec::new(),
            pump_totals: BTreeMap::new(),
            current_level_ml: 0.0,
            peak_level_ml: 0.0,
            total_duration_s: 0.0,
            total_heater_cycles: 0,
        }
    }

    fn run(&mut self) {
        tracing::info!(program = %self.program.id, "validating program");
        self.check_hardware();
        self.walk_steps(&self.program.steps, "steps");
        self.check_overflow_risk();
        self.check_aspiration_margin();
        self.check_liquid_sufficiency();
    }

    fn into_report(self) -> ValidationReport {
        let mut estimate = ResourceEstimate {
            pump_consumption_ml: self.pump_totals.clone(),
            peak_liquid_level_ml: self.peak_level_ml,
            estimated_duration_s: self.total_duration_s,
            heater_cycles: self.total_heater_cycles,
            liquid_consumption: Vec::new(),
        };

        for liquid in &self.program.hardware.liquids {
            let required = self.pump_totals.get(&liquid.pump_index).copied().unwrap_or(0.0);
            estimate.liquid_consumption.push(LiquidConsumption {
                liquid_id: liquid.id.clone(),
                liquid_name: liquid.name.clone(),
                pump_index: liquid.pump_index,
                required_ml: required,
                available_ml: liquid.available_ml,
                sufficient: required <= liquid.available_ml,
            });
        }

        let report = ValidationReport {
            valid: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
            estimate,
        };
        tracing::info!(
            valid = report.valid,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "validation finished"
        );
        report
    }

    fn error(&mut self, path: impl Into<String>, code: &'static str, message: impl Into<String>) {
        let d = Diagnostic {
            path: path.into(),
            code,
            message: message.into(),
            severity: Severity::Error,
        };
        tracing::warn!(path = %d.path, code = d.code, "{}", d.message);
        self.errors.push(d);
    }

    fn warning(&mut self, path: impl Into<String>, code: &'static str, message: impl Into<String>) {
        let d = Diagnostic {
            path: path.into(),
            code,
            message: message.into(),
            severity: Severity::Warning,
        };
        tracing::debug!(path = %d.path, code = d.code, "{}", d.message);
        self.warnings.push(d);
    }

    fn check_hardware(&mut self) {
        let hw = &self.program.hardware;

        if hw.bottle_capacity_ml <= 0.0 {
            self.error("hardware", "MISSING_HARDWARE", "hardware envelope is not configured");
            return;
        }

        if !hw.liquids.iter().any(|l| l.liquid_type == LiquidType::Rinse) {
            self.warning(
                "hardware.liquids",
                "NO_RINSE_LIQUID",
                "no rinse liquid declared; wash steps may not work",
            );
        }

        let mut seen_ids: BTreeMap<&str, ()> = BTreeMap::new();
        let mut pump_owner: BTreeMap<u32, &str> = BTreeMap::new();
        for liquid in &hw.liquids {
            if seen_ids.insert(liquid.id.as_str(), ()).is_some() {
                self.error(
                    "hardware.liquids",
                    "DUPLICATE_LIQUID_ID",
                    format!("duplicate liquid id '{}'", liquid.id),
                );
            }
            if let Some(owner) = pump_owner.insert(liquid.pump_index, liquid.id.as_str()) {
                self.error(
                    "hardware.liquids",
                    "DUPLICATE_PUMP_INDEX",
                    format!(
                        "pump {} is claimed by both '{}' and '{}'",
                        liquid.pump_index, owner, liquid.id
                    ),
                );
            }
        }
    }

    fn walk_steps(&mut self, steps: &[Step], path_prefix: &str) {
        for (i, step) in steps.iter().enumerate() {
            let path = format!("{path_prefix}[{i}]");
            self.walk_step(step, &path);
        }
    }

    fn walk_step(&mut self, step: &Step, path: &str) {
        if step.name.is_empty() {
            self.warning(format!("{path}.name"), "EMPTY_STEP_NAME", "step name is empty");
        }

        match &step.action {
            StepAction::Inject(action) => {
                self.check_inject(action, &format!("{path}.inject"));
                self.simulate_inject(action);
            }
            StepAction::Drain(action) => {
                if self.current_level_ml <= 0.0 {
                    self.warning(path, "EMPTY_DRAIN", "draining what is probably an empty bottle");
                }
                self.simulate_drain(action);
            }
            StepAction::Acquire(action) => {
                self.check_acquire(action, &format!("{path}.acquire"));
                self.simulate_acquire(action);
            }
            StepAction::Wash(action) => {
                self.simulate_wash(action);
            }
            StepAction::Wait(action) => {
                self.check_wait(action, &format!("{path}.wait"));
                self.simulate_wait(action);
            }
            StepAction::SetState(_) | StepAction::SetGasPump(_) | StepAction::PhaseMarker(_) => {}
            StepAction::Loop(action) => {
                self.check_loop(action, &format!("{path}.loop"));
            }
        }
    }

    fn check_inject(&mut self, action: &InjectAction, path: &str) {
        for (i, comp) in action.components.iter().enumerate() {
            if self.program.find_liquid(&comp.liquid_id).is_none() {
                self.error(
                    format!("{path}.components[{i}].liquid_id"),
                    "UNKNOWN_LIQUID",
                    format!("unknown liquid id '{}'", comp.liquid_id),
                );
            }
        }

        if action.target_volume_ml.is_none() && action.target_weight_g.is_none() {
            self.error(path, "NO_TARGET", "inject has neither a volume nor a weight target");
        }

        let target = self.inject_volume(action);
        if action.tolerance_g > target * 0.5 {
            self.warning(
                format!("{path}.tolerance"),
                "LARGE_TOLERANCE",
                "tolerance exceeds half the target; precision will suffer",
            );
        }
    }

    fn check_wait(&mut self, action: &WaitAction, path: &str) {
        if action.condition.is_none() {
            self.error(path, "NO_CONDITION", "wait has no condition");
        }
        if action.timeout_s <= 0.0 {
            self.warning(
                format!("{path}.timeout_s"),
                "NO_TIMEOUT",
                "no timeout set; the wait could block forever",
            );
        }
    }

    fn check_acquire(&mut self, action: &AcquireAction, path: &str) {
        if action.termination.is_none() {
            self.error(path, "NO_TERMINATION", "acquire has no termination condition");
        }
        if action.max_duration_s <= 0.0 {
            self.warning(
                format!("{path}.max_duration_s"),
                "NO_MAX_DURATION",
                "no maximum duration; acquisition could run indefinitely",
            );
        }
    }

    /// Simulate the loop body once, then scale the walked-state deltas by the
    /// iteration count.
    fn check_loop(&mut self, action: &LoopAction, path: &str) {
        if action.steps.is_empty() {
            self.error(format!("{path}.steps"), "EMPTY_LOOP", "loop body is empty");
            return;
        }

        let saved_level = self.current_level_ml;
        let saved_duration = self.total_duration_s;
        let saved_cycles = self.total_heater_cycles;
        let saved_pumps = self.pump_totals.clone();

        self.walk_steps(&action.steps, &format!("{path}.steps"));

        let level_delta = self.current_level_ml - saved_level;
        let duration_delta = self.total_duration_s - saved_duration;
        let cycles_delta = self.total_heater_cycles - saved_cycles;
        let count = action.count as f64;

        self.current_level_ml = saved_level + level_delta * count;
        self.total_duration_s = saved_duration + duration_delta * count;
        self.total_heater_cycles = saved_cycles + cycles_delta * action.count;

        let pump_keys: Vec<u32> = self.pump_totals.keys().copied().collect();
        for pump in pump_keys {
            let total = self.pump_totals.get(&pump).copied().unwrap_or(0.0);
            let prev = saved_pumps.get(&pump).copied().unwrap_or(0.0);
            self.pump_totals.insert(pump, prev + (total - prev) * count);
        }

        self.peak_level_ml = self.peak_level_ml.max(self.current_level_ml);
    }

    fn inject_volume(&self, action: &InjectAction) -> f64 {
        action.resolved_volume_ml(|id| self.program.find_liquid(id).map(|l| l.density_g_ml))
    }

    fn simulate_inject(&mut self, action: &InjectAction) {
        let volume = self.inject_volume(action);

        for comp in &action.components {
            if let Some(liquid) = self.program.find_liquid(&comp.liquid_id) {
                *self.pump_totals.entry(liquid.pump_index).or_insert(0.0) += volume * comp.ratio;
            }
        }

        self.current_level_ml += volume;
        self.peak_level_ml = self.peak_level_ml.max(self.current_level_ml);

        if action.flow_rate_ml_min > 0.0 {
            self.total_duration_s += (volume / action.flow_rate_ml_min) * 60.0;
        }
        self.total_duration_s += action.stable_timeout_s;
    }

    fn simulate_drain(&mut self, action: &DrainAction) {
        self.current_level_ml = 0.0;
        self.total_duration_s += action.timeout_s;
    }

    fn simulate_wait(&mut self, action: &WaitAction) {
        match &action.condition {
            Some(WaitCondition::Duration(seconds)) => self.total_duration_s += seconds,
            Some(WaitCondition::HeaterCycles(count)) => {
                self.total_heater_cycles += count;
                self.total_duration_s += *count as f64 * HEATER_CYCLE_ESTIMATE_S;
            }
            // Feedback waits are charged at half the timeout on average.
            Some(WaitCondition::Weight { .. }) | Some(WaitCondition::Empty { .. }) => {
                self.total_duration_s += action.timeout_s * 0.5;
            }
            None => {}
        }
    }

    fn simulate_acquire(&mut self, action: &AcquireAction) {
        match &action.termination {
            Some(AcquireTermination::Duration(seconds)) => self.total_duration_s += seconds,
            Some(AcquireTermination::HeaterCycles(count)) => {
                self.total_heater_cycles += count;
                self.total_duration_s += *count as f64 * HEATER_CYCLE_ESTIMATE_S;
            }
            Some(AcquireTermination::Stability { window_s, .. }) => {
                self.total_duration_s += window_s;
            }
            None => self.total_duration_s += action.max_duration_s,
        }
    }

    fn simulate_wash(&mut self, action: &WashAction) {
        // A wash always ends on a drained bottle.
        self.current_level_ml = 0.0;
        let per_cycle = action.drain_timeout_s + action.fill_timeout_s + action.drain_timeout_s;
        self.total_duration_s += per_cycle * action.repeat_count as f64;
    }

    fn check_overflow_risk(&mut self) {
        let hw = &self.program.hardware;
        if hw.bottle_capacity_ml <= 0.0 {
            return;
        }

        if self.peak_level_ml > hw.max_fill_ml {
            self.error(
                "",
                "OVERFLOW_RISK",
                format!(
                    "peak liquid level {:.1} ml exceeds the maximum safe fill {:.1} ml",
                    self.peak_level_ml, hw.max_fill_ml
                ),
            );
        } else if self.peak_level_ml > hw.max_fill_ml * 0.9 {
            self.warning(
                "",
                "HIGH_FILL_LEVEL",
                "peak liquid level is within 10% of the maximum safe fill",
            );
        }

        if self.peak_level_ml > hw.bottle_capacity_ml {
            self.error(
                "",
                "CAPACITY_EXCEEDED",
                format!(
                    "peak liquid level {:.1} ml exceeds the bottle capacity {:.1} ml",
                    self.peak_level_ml, hw.bottle_capacity_ml
                ),
            );
        }
    }

    fn check_aspiration_margin(&mut self) {
        for liquid in &self.program.hardware.liquids {
            let Some(required) = self.pump_totals.get(&liquid.pump_index).copied() else {
                continue;
            };
            if required > liquid.available_ml * 0.9 && required <= liquid.available_ml {
                self.warnings.push(Diagnostic {
                    path: "hardware.liquids".to_string(),
                    code: "LOW_LIQUID_MARGIN",
                    message: format!(
                        "liquid '{}' has less than 10% margin; top up or reduce usage",
                        liquid.id
                    ),
                    severity: Severity::Warning,
                });
            }
        }
    }

    fn check_liquid_sufficiency(&mut self) {
        let mut shortfalls = Vec::new();
        for liquid in &self.program.hardware.liquids {
            let Some(required) = self.pump_totals.get(&liquid.pump_index).copied() else {
                continue;
            };
            if required > liquid.available_ml {
                shortfalls.push(format!(
                    "liquid '{}' is short: needs {:.1} ml, only {:.1} ml available",
                    liquid.id, required, liquid.available_ml
                ));
            }
        }
        for message in shortfalls {
            self.error("hardware.liquids", "INSUFFICIENT_LIQUID", message);
        }
    }
}
