//! Textual program front-end.
//!
//! Programs are human-authored YAML documents. Parsing goes through a raw
//! serde layer so that missing fields pick up the documented defaults and
//! every diagnostic can name the offending step. `program_to_yaml` emits the
//! same shape back; `parse(serialize(p)) == p` for any parsed program.

use crate::program::*;
use crate::system_state::SystemMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("program is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("step '{step}' has no recognized action")]
    NoAction { step: String },
    #[error("step '{step}' declares more than one action")]
    MultipleActions { step: String },
    #[error("step '{step}': {message}")]
    BadStep { step: String, message: String },
    #[error("liquid '{0}': pump_index must be in 0..8")]
    BadPumpIndex(String),
}

const DEFAULT_VERSION: &str = "1.0.0";
const DEFAULT_TOLERANCE_G: f64 = 1.0;
const DEFAULT_FLOW_RATE_ML_MIN: f64 = 5.0;
const DEFAULT_STABLE_TIMEOUT_S: f64 = 30.0;
const DEFAULT_WAIT_TIMEOUT_S: f64 = 300.0;
const DEFAULT_DRAIN_TIMEOUT_S: f64 = 60.0;
const DEFAULT_EMPTY_TOLERANCE_G: f64 = 5.0;
const DEFAULT_STABILITY_WINDOW_S: f64 = 5.0;
const DEFAULT_MAX_DURATION_S: f64 = 300.0;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawProgram {
    id: Option<String>,
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hardware: Option<RawHardware>,
    steps: Option<Vec<RawStep>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawHardware {
    bottle_capacity_ml: Option<f64>,
    max_fill_ml: Option<f64>,
    max_gas_pump_pwm: Option<u32>,
    liquids: Option<Vec<RawLiquid>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawLiquid {
    id: Option<String>,
    name: Option<String>,
    pump_index: Option<u32>,
    #[serde(rename = "type")]
    liquid_type: Option<String>,
    available_ml: Option<f64>,
    density_g_ml: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawStep {
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inject: Option<RawInject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    drain: Option<RawDrain>,
    #[serde(skip_serializing_if = "Option::is_none")]
    acquire: Option<RawAcquire>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wash: Option<RawWash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait: Option<RawWait>,
    #[serde(skip_serializing_if = "Option::is_none")]
    set_state: Option<RawSetState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    set_gas_pump: Option<RawSetGasPump>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase_marker: Option<RawPhaseMarker>,
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    repeat: Option<RawLoop>,
    /// Captures unrecognized action keys so they can be reported by name.
    /// Always empty when serializing, so it flattens to nothing.
    #[serde(flatten)]
    unknown: std::collections::BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawInject {
    target_volume_ml: Option<f64>,
    target_weight_g: Option<f64>,
    components: Option<Vec<RawComponent>>,
    flow_rate_ml_min: Option<f64>,
    tolerance: Option<f64>,
    stable_timeout_s: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawComponent {
    liquid_id: Option<String>,
    ratio: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawDrain {
    empty_tolerance_g: Option<f64>,
    stability_window_s: Option<f64>,
    timeout_s: Option<f64>,
    gas_pump_pwm: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawAcquire {
    gas_pump_pwm: Option<f64>,
    duration_s: Option<f64>,
    heater_cycles: Option<u32>,
    stability: Option<RawStability>,
    max_duration_s: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawStability {
    window_s: Option<f64>,
    threshold_percent: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawWash {
    repeat_count: Option<u32>,
    target_weight_g: Option<f64>,
    fill_timeout_s: Option<f64>,
    drain_timeout_s: Option<f64>,
    empty_tolerance_g: Option<f64>,
    empty_stability_window_s: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawWait {
    duration_s: Option<f64>,
    heater_cycles: Option<u32>,
    weight_g: Option<f64>,
    empty: Option<RawEmpty>,
    timeout_s: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawEmpty {
    tolerance_g: Option<f64>,
    stability_window_s: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawSetState {
    state: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawSetGasPump {
    pwm_percent: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawPhaseMarker {
    phase_name: Option<String>,
    is_start: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawLoop {
    count: Option<u32>,
    steps: Option<Vec<RawStep>>,
}

/// Parse a YAML program document into the internal representation.
pub fn parse_program(yaml: &str) -> Result<Program, ParseError> {
    let raw: RawProgram = serde_yaml::from_str(yaml)?;

    let id = raw.id.filter(|s| !s.is_empty()).ok_or(ParseError::MissingField("id"))?;
    let name = raw
        .name
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::MissingField("name"))?;

    let hardware = convert_hardware(raw.hardware)?;
    let raw_steps = raw.steps.ok_or(ParseError::MissingField("steps"))?;
    let steps = convert_steps(raw_steps)?;

    Ok(Program {
        id,
        name,
        description: raw.description.unwrap_or_default(),
        version: raw.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        hardware,
        steps,
    })
}

fn convert_hardware(raw: Option<RawHardware>) -> Result<HardwareEnvelope, ParseError> {
    let raw = raw.unwrap_or_default();
    let mut envelope = HardwareEnvelope {
        bottle_capacity_ml: raw.bottle_capacity_ml.unwrap_or(150.0),
        max_fill_ml: raw.max_fill_ml.unwrap_or(100.0),
        max_gas_pump_pwm: raw.max_gas_pump_pwm.unwrap_or(100),
        liquids: Vec::new(),
    };

    for liquid in raw.liquids.unwrap_or_default() {
        let id = liquid.id.unwrap_or_default();
        let pump_index = liquid.pump_index.unwrap_or(0);
        if pump_index >= crate::system_state::PUMP_COUNT as u32 {
            return Err(ParseError::BadPumpIndex(id));
        }
        envelope.liquids.push(LiquidInventory {
            name: liquid.name.unwrap_or_default(),
            pump_index,
            liquid_type: parse_liquid_type(liquid.liquid_type.as_deref()),
            available_ml: liquid.available_ml.unwrap_or(0.0),
            density_g_ml: liquid.density_g_ml.unwrap_or(1.0),
            id,
        });
    }

    // A program without an inventory still drives the default sample pump.
    if envelope.liquids.is_empty() {
        envelope.liquids.push(LiquidInventory {
            id: "default".to_string(),
            name: "default liquid".to_string(),
            pump_index: 2,
            liquid_type: LiquidType::Sample,
            available_ml: 0.0,
            density_g_ml: 1.0,
        });
    }

    Ok(envelope)
}

fn parse_liquid_type(s: Option<&str>) -> LiquidType {
    match s {
        Some("sample") | Some("LIQUID_SAMPLE") => LiquidType::Sample,
        Some("rinse") | Some("LIQUID_RINSE") => LiquidType::Rinse,
        Some("calibration") | Some("LIQUID_CALIBRATION") => LiquidType::Calibration,
        _ => LiquidType::Unspecified,
    }
}

fn liquid_type_str(t: LiquidType) -> Option<String> {
    match t {
        LiquidType::Sample => Some("sample".to_string()),
        LiquidType::Rinse => Some("rinse".to_string()),
        LiquidType::Calibration => Some("calibration".to_string()),
        LiquidType::Unspecified => None,
    }
}

fn convert_steps(raw: Vec<RawStep>) -> Result<Vec<Step>, ParseError> {
    raw.into_iter().map(convert_step).collect()
}

fn convert_step(raw: RawStep) -> Result<Step, ParseError> {
    let name = raw.name.clone().unwrap_or_default();

    let mut actions: Vec<StepAction> = Vec::new();

    if let Some(inject) = raw.inject {
        let components = inject
            .components
            .unwrap_or_default()
            .into_iter()
            .map(|c| InjectComponent {
                liquid_id: c.liquid_id.unwrap_or_else(|| "default".to_string()),
                ratio: c.ratio.unwrap_or(1.0),
            })
            .collect::<Vec<_>>();
        let components = if components.is_empty() {
            vec![InjectComponent { liquid_id: "default".to_string(), ratio: 1.0 }]
        } else {
            components
        };
        actions.push(StepAction::Inject(InjectAction {
            target_volume_ml: inject.target_volume_ml,
            target_weight_g: inject.target_weight_g,
            components,
            flow_rate_ml_min: inject.flow_rate_ml_min.unwrap_or(DEFAULT_FLOW_RATE_ML_MIN),
            tolerance_g: inject.tolerance.unwrap_or(DEFAULT_TOLERANCE_G),
            stable_timeout_s: inject.stable_timeout_s.unwrap_or(DEFAULT_STABLE_TIMEOUT_S),
        }));
    }
    if let Some(drain) = raw.drain {
        actions.push(StepAction::Drain(DrainAction {
            empty_tolerance_g: drain.empty_tolerance_g.unwrap_or(DEFAULT_EMPTY_TOLERANCE_G),
            stability_window_s: drain.stability_window_s.unwrap_or(DEFAULT_STABILITY_WINDOW_S),
            timeout_s: drain.timeout_s.unwrap_or(DEFAULT_DRAIN_TIMEOUT_S),
            gas_pump_pwm: drain.gas_pump_pwm,
        }));
    }
    if let Some(acquire) = raw.acquire {
        let termination = match (acquire.duration_s, acquire.heater_cycles, acquire.stability) {
            (Some(d), _, _) => Some(AcquireTermination::Duration(d)),
            (None, Some(c), _) => Some(AcquireTermination::HeaterCycles(c)),
            (None, None, Some(s)) => Some(AcquireTermination::Stability {
                window_s: s.window_s.unwrap_or(10.0),
                threshold_percent: s.threshold_percent.unwrap_or(5.0),
            }),
            (None, None, None) => None,
        };
        actions.push(StepAction::Acquire(AcquireAction {
            gas_pump_pwm: acquire.gas_pump_pwm.unwrap_or(0.0),
            termination,
            max_duration_s: acquire.max_duration_s.unwrap_or(DEFAULT_MAX_DURATION_S),
        }));
    }
    if let Some(wash) = raw.wash {
        let repeat_count = wash.repeat_count.unwrap_or(1);
        if repeat_count == 0 {
            return Err(ParseError::BadStep {
                step: name,
                message: "wash repeat_count must be >= 1".to_string(),
            });
        }
        actions.push(StepAction::Wash(WashAction {
            repeat_count,
            target_weight_g: wash.target_weight_g.unwrap_or(0.0),
            fill_timeout_s: wash.fill_timeout_s.unwrap_or(DEFAULT_DRAIN_TIMEOUT_S),
            drain_timeout_s: wash.drain_timeout_s.unwrap_or(DEFAULT_DRAIN_TIMEOUT_S),
            empty_tolerance_g: wash.empty_tolerance_g.unwrap_or(DEFAULT_EMPTY_TOLERANCE_G),
            empty_stability_window_s: wash
                .empty_stability_window_s
                .unwrap_or(DEFAULT_STABILITY_WINDOW_S),
        }));
    }
    if let Some(wait) = raw.wait {
        let condition = match (wait.duration_s, wait.heater_cycles, wait.weight_g, wait.empty) {
            (Some(d), _, _, _) => Some(WaitCondition::Duration(d)),
            (None, Some(c), _, _) => Some(WaitCondition::HeaterCycles(c)),
            (None, None, Some(w), _) => Some(WaitCondition::Weight { target_g: w }),
            (None, None, None, Some(e)) => Some(WaitCondition::Empty {
                tolerance_g: e.tolerance_g.unwrap_or(DEFAULT_EMPTY_TOLERANCE_G),
                stability_window_s: e.stability_window_s.unwrap_or(DEFAULT_STABILITY_WINDOW_S),
            }),
            (None, None, None, None) => None,
        };
        actions.push(StepAction::Wait(WaitAction {
            condition,
            timeout_s: wait.timeout_s.unwrap_or(DEFAULT_WAIT_TIMEOUT_S),
        }));
    }
    if let Some(set_state) = raw.set_state {
        let state = set_state.state.unwrap_or_default();
        let mode = parse_mode(&state).ok_or_else(|| ParseError::BadStep {
            step: name.clone(),
            message: format!("unknown system state '{state}'"),
        })?;
        actions.push(StepAction::SetState(SetStateAction { mode }));
    }
    if let Some(set_gas_pump) = raw.set_gas_pump {
        actions.push(StepAction::SetGasPump(SetGasPumpAction {
            pwm_percent: set_gas_pump.pwm_percent.unwrap_or(0.0),
        }));
    }
    if let Some(marker) = raw.phase_marker {
        actions.push(StepAction::PhaseMarker(PhaseMarkerAction {
            phase_name: marker.phase_name.unwrap_or_default(),
            is_start: marker.is_start.unwrap_or(true),
        }));
    }
    if let Some(repeat) = raw.repeat {
        let count = repeat.count.unwrap_or(0);
        if count == 0 {
            return Err(ParseError::BadStep {
                step: name,
                message: "loop count must be >= 1".to_string(),
            });
        }
        let steps = convert_steps(repeat.steps.unwrap_or_default())?;
        actions.push(StepAction::Loop(LoopAction { count, steps }));
    }

    if let Some(unknown_key) = raw.unknown.keys().find(|k| k.as_str() != "name") {
        return Err(ParseError::BadStep {
            step: name,
            message: format!("unknown action '{unknown_key}'"),
        });
    }

    if actions.len() > 1 {
        return Err(ParseError::MultipleActions { step: name });
    }
    match actions.pop() {
        Some(action) => Ok(Step { name, action }),
        None => Err(ParseError::NoAction { step: name }),
    }
}

fn parse_mode(s: &str) -> Option<SystemMode> {
    match s {
        "INITIAL" | "STATE_INITIAL" => Some(SystemMode::Initial),
        "DRAIN" | "STATE_DRAIN" => Some(SystemMode::Drain),
        "CLEAN" | "STATE_CLEAN" => Some(SystemMode::Clean),
        "SAMPLE" | "STATE_SAMPLE" => Some(SystemMode::Sample),
        "INJECT" | "STATE_INJECT" => Some(SystemMode::Inject),
        _ => None,
    }
}

/// Serialize a program back to YAML in the authored shape.
pub fn program_to_yaml(program: &Program) -> Result<String, ParseError> {
    let raw = RawProgram {
        id: Some(program.id.clone()),
        name: Some(program.name.clone()),
        description: if program.description.is_empty() {
            None
        } else {
            Some(program.description.clone())
        },
        version: Some(program.version.clone()),
        hardware: Some(RawHardware {
            bottle_capacity_ml: Some(program.hardware.bottle_capacity_ml),
            max_fill_ml: Some(program.hardware.max_fill_ml),
            max_gas_pump_pwm: Some(program.hardware.max_gas_pump_pwm),
            liquids: Some(
                program
                    .hardware
                    .liquids
                    .iter()
                    .map(|l| RawLiquid {
                        id: Some(l.id.clone()),
                        name: Some(l.name.clone()),
                        pump_index: Some(l.pump_index),
                        liquid_type: liquid_type_str(l.liquid_type),
                        available_ml: Some(l.available_ml),
                        density_g_ml: Some(l.density_g_ml),
                    })
                    .collect(),
            ),
        }),
        steps: Some(program.steps.iter().map(step_to_raw).collect()),
    };
    Ok(serde_yaml::to_string(&raw)?)
}

fn step_to_raw(step: &Step) -> RawStep {
    let mut raw = RawStep {
        name: Some(step.name.clone()),
        ..RawStep::default()
    };
    match &step.action {
        StepAction::Inject(a) => {
            raw.inject = Some(RawInject {
                target_volume_ml: a.target_volume_ml,
                target_weight_g: a.target_weight_g,
                components: Some(
                    a.components
                        .iter()
                        .map(|c| RawComponent {
                            liquid_id: Some(c.liquid_id.clone()),
                            ratio: Some(c.ratio),
                        })
                        .collect(),
                ),
                flow_rate_ml_min: Some(a.flow_rate_ml_min),
                tolerance: Some(a.tolerance_g),
                stable_timeout_s: Some(a.stable_timeout_s),
            });
        }
        StepAction::Drain(a) => {
            raw.drain = Some(RawDrain {
                empty_tolerance_g: Some(a.empty_tolerance_g),
                stability_window_s: Some(a.stability_window_s),
                timeout_s: Some(a.timeout_s),
                gas_pump_pwm: a.gas_pump_pwm,
            });
        }
        StepAction::Acquire(a) => {
            let mut acquire = RawAcquire {
                gas_pump_pwm: Some(a.gas_pump_pwm),
                max_duration_s: Some(a.max_duration_s),
                ..RawAcquire::default()
            };
            match &a.termination {
                Some(AcquireTermination::Duration(d)) => acquire.duration_s = Some(*d),
                Some(AcquireTermination::HeaterCycles(c)) => acquire.heater_cycles = Some(*c),
                Some(AcquireTermination::Stability { window_s, threshold_percent }) => {
                    acquire.stability = Some(RawStability {
                        window_s: Some(*window_s),
                        threshold_percent: Some(*threshold_percent),
                    });
                }
                None => {}
            }
            raw.acquire = Some(acquire);
        }
        StepAction::Wash(a) => {
            raw.wash = Some(RawWash {
                repeat_count: Some(a.repeat_count),
                target_weight_g: Some(a.target_weight_g),
                fill_timeout_s: Some(a.fill_timeout_s),
                drain_timeout_s: Some(a.drain_timeout_s),
                empty_tolerance_g: Some(a.empty_tolerance_g),
                empty_stability_window_s: Some(a.empty_stability_window_s),
            });
        }
        StepAction::Wait(a) => {
            let mut wait = RawWait {
                timeout_s: Some(a.timeout_s),
                ..RawWait::default()
            };
            match &a.condition {
                Some(WaitCondition::Duration(d)) => wait.duration_s = Some(*d),
                Some(WaitCondition::HeaterCycles(c)) => wait.heater_cycles = Some(*c),
                Some(WaitCondition::Weight { target_g }) => wait.weight_g = Some(*target_g),
                Some(WaitCondition::Empty { tolerance_g, stability_window_s }) => {
                    wait.empty = Some(RawEmpty {
                        tolerance_g: Some(*tolerance_g),
                        stability_window_s: Some(*stability_window_s),
                    });
                }
                None => {}
            }
            raw.wait = Some(wait);
        }
        StepAction::SetState(a) => {
            raw.set_state = Some(RawSetState {
                state: Some(a.mode.as_str().to_string()),
            });
        }
        StepAction::SetGasPump(a) => {
            raw.set_gas_pump = Some(RawSetGasPump {
                pwm_percent: Some(a.pwm_percent),
            });
        }
        StepAction::PhaseMarker(a) => {
            raw.phase_marker = Some(RawPhaseMarker {
                phase_name: Some(a.phase_name.clone()),
                is_start: Some(a.is_start),
            });
        }
        StepAction::Loop(a) => {
            raw.repeat = Some(RawLoop {
                count: Some(a.count),
                steps: Some(a.steps.iter().map(step_to_raw).collect()),
            });
        }
    }
    raw
}
