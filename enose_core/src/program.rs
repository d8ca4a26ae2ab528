//! Internal program representation.
//!
//! A program is immutable once loaded: an id, a hardware envelope describing
//! the bottle and the liquid inventory, and an ordered step sequence. The
//! textual front-end lives in `parser`; everything downstream (validator,
//! orchestrator, executors) works on these types.

use crate::system_state::SystemMode;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    pub hardware: HardwareEnvelope,
    pub steps: Vec<Step>,
}

impl Program {
    /// Liquid record for an id, if declared in the hardware envelope.
    pub fn find_liquid(&self, liquid_id: &str) -> Option<&LiquidInventory> {
        self.hardware.liquids.iter().find(|l| l.id == liquid_id)
    }

    /// liquid_id -> pump_index map used by the inject executor.
    pub fn pump_bindings(&self) -> std::collections::HashMap<String, usize> {
        self.hardware
            .liquids
            .iter()
            .map(|l| (l.id.clone(), l.pump_index as usize))
            .collect()
    }
}

/// Bottle and inventory constraints the validator simulates against.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareEnvelope {
    pub bottle_capacity_ml: f64,
    pub max_fill_ml: f64,
    pub max_gas_pump_pwm: u32,
    pub liquids: Vec<LiquidInventory>,
}

impl Default for HardwareEnvelope {
    fn default() -> Self {
        Self {
            bottle_capacity_ml: 150.0,
            max_fill_ml: 100.0,
            max_gas_pump_pwm: 100,
            liquids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidType {
    Unspecified,
    Sample,
    Rinse,
    Calibration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiquidInventory {
    pub id: String,
    pub name: String,
    /// Peristaltic pump slot, in [0..8).
    pub pump_index: u32,
    pub liquid_type: LiquidType,
    pub available_ml: f64,
    pub density_g_ml: f64,
}

/// Consumable inventory bookkeeping record.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidLevel {
    pub pump_index: u32,
    pub liquid_id: Option<String>,
    pub initial_volume_ml: f64,
    pub consumed_volume_ml: f64,
    pub low_threshold_ml: f64,
}

impl LiquidLevel {
    /// Remaining volume; never negative.
    pub fn remaining_ml(&self) -> f64 {
        (self.initial_volume_ml - self.consumed_volume_ml).max(0.0)
    }

    pub fn is_low(&self) -> bool {
        self.remaining_ml() <= self.low_threshold_ml
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Inject(InjectAction),
    Drain(DrainAction),
    Acquire(AcquireAction),
    Wash(WashAction),
    Wait(WaitAction),
    SetState(SetStateAction),
    SetGasPump(SetGasPumpAction),
    PhaseMarker(PhaseMarkerAction),
    Loop(LoopAction),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Inject(_) => "inject",
            StepAction::Drain(_) => "drain",
            StepAction::Acquire(_) => "acquire",
            StepAction::Wash(_) => "wash",
            StepAction::Wait(_) => "wait",
            StepAction::SetState(_) => "set_state",
            StepAction::SetGasPump(_) => "set_gas_pump",
            StepAction::PhaseMarker(_) => "phase_marker",
            StepAction::Loop(_) => "loop",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InjectComponent {
    pub liquid_id: String,
    /// Fraction of the target, in (0, 1]; all ratios sum to 1.0 +- 0.01.
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InjectAction {
    pub target_volume_ml: Option<f64>,
    pub target_weight_g: Option<f64>,
    pub components: Vec<InjectComponent>,
    pub flow_rate_ml_min: f64,
    pub tolerance_g: f64,
    pub stable_timeout_s: f64,
}

impl InjectAction {
    /// Volume target, deriving from weight via the average component density
    /// when only a weight is given. Densities default to 1.0.
    pub fn resolved_volume_ml(&self, density_of: impl Fn(&str) -> Option<f64>) -> f64 {
        if let Some(volume) = self.target_volume_ml {
            return volume;
        }
        if let Some(weight) = self.target_weight_g {
            let mut density = 0.0;
            let mut known = false;
            for comp in &self.components {
                if let Some(d) = density_of(&comp.liquid_id) {
                    if d > 0.0 {
                        density += d * comp.ratio;
                        known = true;
                    }
                }
            }
            let avg = if known { density } else { 1.0 };
            return weight / avg;
        }
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainAction {
    pub empty_tolerance_g: f64,
    pub stability_window_s: f64,
    pub timeout_s: f64,
    pub gas_pump_pwm: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquireTermination {
    Duration(f64),
    HeaterCycles(u32),
    Stability { window_s: f64, threshold_percent: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquireAction {
    /// Gas pump drive in percent, 0..=100.
    pub gas_pump_pwm: f64,
    pub termination: Option<AcquireTermination>,
    pub max_duration_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WashAction {
    pub repeat_count: u32,
    /// Weight gain over the empty baseline that ends the fill phase.
    pub target_weight_g: f64,
    pub fill_timeout_s: f64,
    pub drain_timeout_s: f64,
    pub empty_tolerance_g: f64,
    pub empty_stability_window_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitCondition {
    Duration(f64),
    HeaterCycles(u32),
    Weight { target_g: f64 },
    Empty { tolerance_g: f64, stability_window_s: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitAction {
    pub condition: Option<WaitCondition>,
    pub timeout_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetStateAction {
    pub mode: SystemMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetGasPumpAction {
    pub pwm_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseMarkerAction {
    pub phase_name: String,
    pub is_start: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopAction {
    pub count: u32,
    pub steps: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_volume_never_goes_negative() {
        let level = LiquidLevel {
            pump_index: 2,
            liquid_id: Some("sample".to_string()),
            initial_volume_ml: 100.0,
            consumed_volume_ml: 130.0,
            low_threshold_ml: 10.0,
        };
        assert_eq!(level.remaining_ml(), 0.0);
        assert!(level.is_low());
    }

    #[test]
    fn weight_target_resolves_through_component_density() {
        let action = InjectAction {
            target_volume_ml: None,
            target_weight_g: Some(40.0),
            components: vec![
                InjectComponent { liquid_id: "heavy".to_string(), ratio: 0.5 },
                InjectComponent { liquid_id: "light".to_string(), ratio: 0.5 },
            ],
            flow_rate_ml_min: 5.0,
            tolerance_g: 0.5,
            stable_timeout_s: 30.0,
        };
        // Average density 0.5*1.6 + 0.5*0.8 = 1.2 g/ml.
        let volume = action.resolved_volume_ml(|id| match id {
            "heavy" => Some(1.6),
            "light" => Some(0.8),
            _ => None,
        });
        assert!((volume - 40.0 / 1.2).abs() < 1e-9);

        // Unknown densities fall back to 1.0.
        let fallback = action.resolved_volume_ml(|_| None);
        assert!((fallback - 40.0).abs() < 1e-9);
    }
}
