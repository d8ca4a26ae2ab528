//! Program validator: forward simulation, diagnostics, estimates.

use enose_core::program::*;
use enose_core::system_state::SystemMode;
use enose_core::validator::{ProgramValidator, Severity};
use rstest::rstest;

fn liquid(id: &str, pump: u32, available: f64) -> LiquidInventory {
    LiquidInventory {
        id: id.to_string(),
        name: id.to_string(),
        pump_index: pump,
        liquid_type: LiquidType::Sample,
        available_ml: available,
        density_g_ml: 1.0,
    }
}

fn inject_step(name: &str, volume: f64) -> Step {
    Step {
        name: name.to_string(),
        action: StepAction::Inject(InjectAction {
            target_volume_ml: Some(volume),
            target_weight_g: None,
            components: vec![InjectComponent { liquid_id: "sample".to_string(), ratio: 1.0 }],
            flow_rate_ml_min: 5.0,
            tolerance_g: 0.5,
            stable_timeout_s: 30.0,
        }),
    }
}

fn drain_step(name: &str) -> Step {
    Step {
        name: name.to_string(),
        action: StepAction::Drain(DrainAction {
            empty_tolerance_g: 2.0,
            stability_window_s: 5.0,
            timeout_s: 60.0,
            gas_pump_pwm: None,
        }),
    }
}

fn base_program(steps: Vec<Step>) -> Program {
    Program {
        id: "prog".to_string(),
        name: "prog".to_string(),
        description: String::new(),
        version: "1.0.0".to_string(),
        hardware: HardwareEnvelope {
            bottle_capacity_ml: 150.0,
            max_fill_ml: 100.0,
            max_gas_pump_pwm: 100,
            liquids: vec![liquid("sample", 2, 1000.0)],
        },
        steps,
    }
}

fn codes(diags: &[enose_core::validator::Diagnostic]) -> Vec<&'static str> {
    diags.iter().map(|d| d.code).collect()
}

/// Three 40 ml injects with no drain: peak 120 ml against a 100 ml safe
/// fill. Exactly one OVERFLOW_RISK error at the top-level path.
#[rstest]
fn overflow_rejection() {
    let program = base_program(vec![
        inject_step("a", 40.0),
        inject_step("b", 40.0),
        inject_step("c", 40.0),
    ]);

    let report = ProgramValidator::validate(&program);

    assert!(!report.valid);
    assert_eq!(codes(&report.errors), vec!["OVERFLOW_RISK"]);
    assert_eq!(report.errors[0].path, "");
    assert!((report.estimate.peak_liquid_level_ml - 120.0).abs() < 1e-9);
}

#[rstest]
fn capacity_exceeded_compounds_with_overflow() {
    let program = base_program(vec![
        inject_step("a", 80.0),
        inject_step("b", 80.0),
    ]);

    let report = ProgramValidator::validate(&program);
    assert!(!report.valid);
    let codes = codes(&report.errors);
    assert!(codes.contains(&"OVERFLOW_RISK"));
    assert!(codes.contains(&"CAPACITY_EXCEEDED"));
}

#[rstest]
fn drains_reset_the_level() {
    let program = base_program(vec![
        inject_step("a", 60.0),
        drain_step("empty"),
        inject_step("b", 60.0),
    ]);

    let report = ProgramValidator::validate(&program);
    assert!(report.valid, "errors: {:?}", report.errors);
    assert!((report.estimate.peak_liquid_level_ml - 60.0).abs() < 1e-9);
}

#[rstest]
fn high_fill_warns_without_error() {
    let program = base_program(vec![inject_step("a", 95.0)]);
    let report = ProgramValidator::validate(&program);
    assert!(report.valid);
    assert!(codes(&report.warnings).contains(&"HIGH_FILL_LEVEL"));
}

#[rstest]
fn unknown_liquid_is_an_error_with_a_structured_path() {
    let mut program = base_program(vec![inject_step("a", 10.0)]);
    if let StepAction::Inject(action) = &mut program.steps[0].action {
        action.components[0].liquid_id = "mystery".to_string();
    }

    let report = ProgramValidator::validate(&program);
    assert!(!report.valid);
    let diag = report
        .errors
        .iter()
        .find(|d| d.code == "UNKNOWN_LIQUID")
        .expect("UNKNOWN_LIQUID raised");
    assert_eq!(diag.path, "steps[0].inject.components[0].liquid_id");
    assert_eq!(diag.severity, Severity::Error);
}

#[rstest]
fn insufficient_liquid_is_flagged() {
    let mut program = base_program(vec![inject_step("a", 50.0)]);
    program.hardware.liquids = vec![liquid("sample", 2, 30.0)];

    let report = ProgramValidator::validate(&program);
    assert!(!report.valid);
    assert!(codes(&report.errors).contains(&"INSUFFICIENT_LIQUID"));
    let consumption = &report.estimate.liquid_consumption[0];
    assert!(!consumption.sufficient);
    assert!((consumption.required_ml - 50.0).abs() < 1e-9);
}

#[rstest]
fn low_margin_warns_when_just_under_available() {
    let mut program = base_program(vec![inject_step("a", 95.0)]);
    program.hardware.liquids = vec![liquid("sample", 2, 100.0)];
    program.hardware.max_fill_ml = 200.0;
    program.hardware.bottle_capacity_ml = 300.0;

    let report = ProgramValidator::validate(&program);
    assert!(report.valid);
    assert!(codes(&report.warnings).contains(&"LOW_LIQUID_MARGIN"));
}

#[rstest]
fn duplicate_ids_and_pumps_are_errors() {
    let mut program = base_program(vec![]);
    program.hardware.liquids = vec![
        liquid("sample", 2, 100.0),
        liquid("sample", 3, 100.0),
        liquid("other", 2, 100.0),
    ];

    let report = ProgramValidator::validate(&program);
    let codes = codes(&report.errors);
    assert!(codes.contains(&"DUPLICATE_LIQUID_ID"));
    assert!(codes.contains(&"DUPLICATE_PUMP_INDEX"));
}

#[rstest]
fn missing_rinse_liquid_warns() {
    let program = base_program(vec![]);
    let report = ProgramValidator::validate(&program);
    assert!(codes(&report.warnings).contains(&"NO_RINSE_LIQUID"));
}

#[rstest]
fn structural_step_diagnostics() {
    let mut program = base_program(vec![]);
    program.steps = vec![
        Step {
            name: String::new(),
            action: StepAction::Wait(WaitAction { condition: None, timeout_s: 0.0 }),
        },
        Step {
            name: "acq".to_string(),
            action: StepAction::Acquire(AcquireAction {
                gas_pump_pwm: 40.0,
                termination: None,
                max_duration_s: 0.0,
            }),
        },
        Step {
            name: "noinject".to_string(),
            action: StepAction::Inject(InjectAction {
                target_volume_ml: None,
                target_weight_g: None,
                components: vec![InjectComponent {
                    liquid_id: "sample".to_string(),
                    ratio: 1.0,
                }],
                flow_rate_ml_min: 5.0,
                tolerance_g: 1.0,
                stable_timeout_s: 30.0,
            }),
        },
        Step {
            name: "hollow".to_string(),
            action: StepAction::Loop(LoopAction { count: 3, steps: vec![] }),
        },
        drain_step("dry"),
    ];

    let report = ProgramValidator::validate(&program);

    let error_codes = codes(&report.errors);
    assert!(error_codes.contains(&"NO_CONDITION"));
    assert!(error_codes.contains(&"NO_TERMINATION"));
    assert!(error_codes.contains(&"NO_TARGET"));
    assert!(error_codes.contains(&"EMPTY_LOOP"));

    let warning_codes = codes(&report.warnings);
    assert!(warning_codes.contains(&"EMPTY_STEP_NAME"));
    assert!(warning_codes.contains(&"NO_TIMEOUT"));
    assert!(warning_codes.contains(&"NO_MAX_DURATION"));
    assert!(warning_codes.contains(&"EMPTY_DRAIN"));
}

#[rstest]
fn large_tolerance_warns() {
    let mut program = base_program(vec![inject_step("a", 10.0)]);
    if let StepAction::Inject(action) = &mut program.steps[0].action {
        action.tolerance_g = 8.0;
    }
    let report = ProgramValidator::validate(&program);
    assert!(codes(&report.warnings).contains(&"LARGE_TOLERANCE"));
}

/// Loop bodies are simulated once and scaled by the count.
#[rstest]
fn loop_scales_resources_by_count() {
    let program = base_program(vec![Step {
        name: "cycle".to_string(),
        action: StepAction::Loop(LoopAction {
            count: 3,
            steps: vec![inject_step("fill", 10.0), drain_step("empty")],
        }),
    }]);

    let report = ProgramValidator::validate(&program);
    assert!(report.valid, "errors: {:?}", report.errors);
    let pump2 = report.estimate.pump_consumption_ml.get(&2).copied().unwrap_or(0.0);
    assert!((pump2 - 30.0).abs() < 1e-9, "3 x 10 ml through pump 2, got {pump2}");
    // Each iteration drains, so the peak stays at one fill.
    assert!((report.estimate.peak_liquid_level_ml - 10.0).abs() < 1e-9);
}

#[rstest]
fn loop_without_drain_accumulates_level() {
    let program = base_program(vec![Step {
        name: "cycle".to_string(),
        action: StepAction::Loop(LoopAction { count: 3, steps: vec![inject_step("fill", 10.0)] }),
    }]);

    let report = ProgramValidator::validate(&program);
    assert!((report.estimate.peak_liquid_level_ml - 30.0).abs() < 1e-9);
}

#[rstest]
fn duration_estimate_accumulates() {
    let program = base_program(vec![
        inject_step("a", 50.0),
        Step {
            name: "settle".to_string(),
            action: StepAction::Wait(WaitAction {
                condition: Some(WaitCondition::Duration(20.0)),
                timeout_s: 300.0,
            }),
        },
        Step {
            name: "measure".to_string(),
            action: StepAction::Acquire(AcquireAction {
                gas_pump_pwm: 50.0,
                termination: Some(AcquireTermination::HeaterCycles(4)),
                max_duration_s: 300.0,
            }),
        },
    ]);

    let report = ProgramValidator::validate(&program);
    // inject: 50/5 min = 600 s + 30 s stabilization; wait 20 s; 4 cycles at
    // the per-cycle estimate.
    let expected = 600.0 + 30.0 + 20.0 + 4.0 * 2.5;
    assert!((report.estimate.estimated_duration_s - expected).abs() < 1e-6);
    assert_eq!(report.estimate.heater_cycles, 4);
}

#[rstest]
fn misconfigured_envelope_is_missing_hardware() {
    let mut program = base_program(vec![]);
    program.hardware.bottle_capacity_ml = 0.0;
    let report = ProgramValidator::validate(&program);
    assert!(codes(&report.errors).contains(&"MISSING_HARDWARE"));
}

#[rstest]
fn set_state_and_markers_need_no_validation() {
    let program = base_program(vec![
        Step {
            name: "to-drain".to_string(),
            action: StepAction::SetState(SetStateAction { mode: SystemMode::Drain }),
        },
        Step {
            name: "pump-on".to_string(),
            action: StepAction::SetGasPump(SetGasPumpAction { pwm_percent: 60.0 }),
        },
        Step {
            name: "marker".to_string(),
            action: StepAction::PhaseMarker(PhaseMarkerAction {
                phase_name: "baseline".to_string(),
                is_start: true,
            }),
        },
    ]);

    let report = ProgramValidator::validate(&program);
    assert!(report.valid);
}
