//! Primitive executors: preconditions, feedback loops, rollback and the
//! consumable events.

use enose_core::executors::{
    AcquireExecutor, DrainExecutor, ExecCtx, InjectExecutor, StepExecutor, WashExecutor,
};
use enose_core::hardware_state::HardwareStateMachine;
use enose_core::load_cell::LoadCellDriver;
use enose_core::mocks::{sensor_packet, MemoryConsumables, MockActuator, ScriptedSensor};
use enose_core::program::*;
use enose_core::system_state::{SystemMode, SystemState};
use enose_config::LoadCellCfg;
use enose_traits::clock::test_clock::TestClock;
use enose_traits::{Clock, MonotonicClock, SensorStream};
use rstest::rstest;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    actuator: Arc<MockActuator>,
    clock: Arc<TestClock>,
    system_state: Arc<SystemState>,
    hardware_state: Arc<HardwareStateMachine>,
    load_cell: Arc<LoadCellDriver>,
    consumables: Arc<MemoryConsumables>,
}

impl Rig {
    fn new() -> Self {
        let actuator = Arc::new(MockActuator::new());
        let clock = Arc::new(TestClock::new());
        let system_state = Arc::new(SystemState::new(actuator.clone(), clock.clone()));
        let hardware_state = HardwareStateMachine::new(Arc::clone(&system_state));
        let cfg = LoadCellCfg {
            invert_reading: false,
            filter_window_size: 5,
            stable_stddev_threshold: 2.0,
            trend_threshold: 5.0,
            ..LoadCellCfg::default()
        };
        let load_cell = Arc::new(LoadCellDriver::new(
            actuator.clone(),
            clock.clone(),
            "bottle_cell",
            cfg,
        ));
        Self {
            actuator,
            clock,
            system_state,
            hardware_state,
            load_cell,
            consumables: MemoryConsumables::new(),
        }
    }

    fn ctx(&self) -> ExecCtx {
        let mut bindings = HashMap::new();
        bindings.insert("sample".to_string(), 2usize);
        bindings.insert("rinse".to_string(), 3usize);
        ExecCtx::new(
            Arc::new(std::sync::atomic::AtomicBool::new(false)),
            Arc::new(enose_core::executors::PauseGate::default()),
            self.clock.clone(),
            self.consumables.clone(),
            bindings,
            Arc::new(|_message| {}),
        )
    }

    /// Make the load cell read `grams`, stable.
    fn settle_weight(&self, grams: f64) {
        for _ in 0..5 {
            self.load_cell.ingest(0.0, Some(grams));
            self.clock.advance(Duration::from_millis(200));
        }
    }
}

fn inject_step(volume: f64, stable_timeout_s: f64) -> Step {
    Step {
        name: "inject".to_string(),
        action: StepAction::Inject(InjectAction {
            target_volume_ml: Some(volume),
            target_weight_g: None,
            components: vec![InjectComponent { liquid_id: "sample".to_string(), ratio: 1.0 }],
            flow_rate_ml_min: 5.0,
            tolerance_g: 0.5,
            stable_timeout_s,
        }),
    }
}

fn drain_step() -> Step {
    Step {
        name: "drain".to_string(),
        action: StepAction::Drain(DrainAction {
            empty_tolerance_g: 2.0,
            stability_window_s: 1.0,
            timeout_s: 60.0,
            gas_pump_pwm: None,
        }),
    }
}

/// Straight-line happy path: one 50 ml single-component inject lands on
/// pump 2 as a 50,000 mm move at F5000, and the consumable event carries
/// the 0.1 ml/mm conversion.
#[rstest]
fn inject_happy_path_commands_and_consumables() {
    let rig = Rig::new();
    rig.settle_weight(49.8); // already within tolerance of 50 g
    let executor = InjectExecutor::new(
        Arc::clone(&rig.system_state),
        Some(Arc::clone(&rig.hardware_state)),
        Arc::clone(&rig.load_cell),
    );

    let result = executor.execute(&inject_step(50.0, 30.0), &rig.ctx());

    assert!(result.success, "{}", result.error_message);
    assert!(result.execution_id.is_some());

    let g1 = rig
        .actuator
        .commands()
        .into_iter()
        .find(|c| c.starts_with("G1 "))
        .expect("composite move");
    assert_eq!(g1, "G1 C50000.0 F5000.0");

    // mode restored on the success path
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);

    let ml = rig.consumables.pump_ml(2);
    assert!((ml - 5000.0).abs() < 1e-6, "50000 mm x 0.1 ml/mm, got {ml}");
}

#[rstest]
fn inject_timeout_still_commits_and_restores() {
    let rig = Rig::new();
    rig.settle_weight(0.0);
    let executor = InjectExecutor::new(
        Arc::clone(&rig.system_state),
        None,
        Arc::clone(&rig.load_cell),
    );

    let before = rig.clock.now();
    let result = executor.execute(&inject_step(30.0, 2.0), &rig.ctx());
    let elapsed = rig.clock.now().saturating_duration_since(before);

    assert!(result.success);
    assert!(elapsed >= Duration::from_secs(2), "ran to the stable timeout");
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);
    // Runtime was still charged for the pump that ran.
    assert!(rig.consumables.runtime_s("pump_tube_2") >= 2);
}

#[rstest]
fn inject_preconditions_guard_ratios_and_mode() {
    let rig = Rig::new();
    let executor = InjectExecutor::new(
        Arc::clone(&rig.system_state),
        Some(Arc::clone(&rig.hardware_state)),
        Arc::clone(&rig.load_cell),
    );

    let mut step = inject_step(50.0, 30.0);
    if let StepAction::Inject(action) = &mut step.action {
        action.components[0].ratio = 0.6; // sums to 0.6
    }
    let precond = executor.check_preconditions(&step);
    assert!(!precond.satisfied);
    assert!(precond.summary().contains("ratios"));

    // Wrong starting mode is refused without opening a transaction.
    rig.system_state.transition_to(SystemMode::Sample);
    let result = executor.execute(&inject_step(50.0, 30.0), &rig.ctx());
    assert!(!result.success);
    assert_eq!(rig.system_state.mode(), SystemMode::Sample);
}

#[rstest]
fn inject_split_components_share_the_move() {
    let rig = Rig::new();
    rig.settle_weight(19.8);
    let executor = InjectExecutor::new(
        Arc::clone(&rig.system_state),
        None,
        Arc::clone(&rig.load_cell),
    );

    let step = Step {
        name: "mix".to_string(),
        action: StepAction::Inject(InjectAction {
            target_volume_ml: Some(20.0),
            target_weight_g: None,
            components: vec![
                InjectComponent { liquid_id: "sample".to_string(), ratio: 0.75 },
                InjectComponent { liquid_id: "rinse".to_string(), ratio: 0.25 },
            ],
            flow_rate_ml_min: 5.0,
            tolerance_g: 0.5,
            stable_timeout_s: 10.0,
        }),
    };
    let result = executor.execute(&step, &rig.ctx());
    assert!(result.success);

    let g1 = rig
        .actuator
        .commands()
        .into_iter()
        .find(|c| c.starts_with("G1 "))
        .expect("composite move");
    assert!(g1.contains("C15000.0"), "{g1}");
    assert!(g1.contains("D5000.0"), "{g1}");
}

/// After a successful drain the dynamic empty baseline holds the weight the
/// wait returned.
#[rstest]
fn drain_earns_the_baseline_and_restores_mode() {
    let rig = Rig::new();
    rig.settle_weight(1.4);
    let executor = DrainExecutor::new(
        Arc::clone(&rig.system_state),
        Some(Arc::clone(&rig.hardware_state)),
        Arc::clone(&rig.load_cell),
    );

    let result = executor.execute(&drain_step(), &rig.ctx());

    assert!(result.success);
    assert!(executor.is_idempotent());
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);
    let baseline = rig.load_cell.dynamic_empty_weight().expect("baseline set");
    assert!((baseline - 1.4).abs() < 1e-9);
}

#[rstest]
fn drain_timeout_is_not_fatal() {
    let rig = Rig::new();
    // Unstable readings: alternate so stability is never reached.
    for i in 0..20 {
        let grams = if i % 2 == 0 { 0.0 } else { 30.0 };
        rig.load_cell.ingest(0.0, Some(grams));
        rig.clock.advance(Duration::from_millis(200));
    }
    let executor = DrainExecutor::new(
        Arc::clone(&rig.system_state),
        None,
        Arc::clone(&rig.load_cell),
    );

    let mut step = drain_step();
    if let StepAction::Drain(action) = &mut step.action {
        action.timeout_s = 3.0;
    }
    let result = executor.execute(&step, &rig.ctx());

    // Timeout is logged and the primitive still commits and restores.
    assert!(result.success);
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);
    assert_eq!(rig.load_cell.dynamic_empty_weight(), None);
}

#[rstest]
fn drain_requires_initial_or_inject_mode() {
    let rig = Rig::new();
    let executor = DrainExecutor::new(
        Arc::clone(&rig.system_state),
        None,
        Arc::clone(&rig.load_cell),
    );

    rig.system_state.transition_to(SystemMode::Clean);
    let precond = executor.check_preconditions(&drain_step());
    assert!(!precond.satisfied);

    rig.system_state.transition_to(SystemMode::Inject);
    // INJECT is a legal entry mode for drain.
    let rig2 = Rig::new();
    rig2.system_state.transition_to(SystemMode::Inject);
    let executor2 = DrainExecutor::new(
        Arc::clone(&rig2.system_state),
        None,
        Arc::clone(&rig2.load_cell),
    );
    assert!(executor2.check_preconditions(&drain_step()).satisfied);
}

/// Every wash iteration enters and leaves with the same outer mode.
#[rstest]
fn wash_iterations_restore_the_outer_mode() {
    let rig = Rig::new();
    rig.settle_weight(1.0);
    let executor = WashExecutor::new(Arc::clone(&rig.system_state), Arc::clone(&rig.load_cell));

    let step = Step {
        name: "wash".to_string(),
        action: StepAction::Wash(WashAction {
            repeat_count: 2,
            target_weight_g: 25.0,
            fill_timeout_s: 1.0,
            drain_timeout_s: 30.0,
            empty_tolerance_g: 2.0,
            empty_stability_window_s: 0.5,
        }),
    };
    let result = executor.execute(&step, &rig.ctx());

    assert!(result.success, "{}", result.error_message);
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);

    // Both cycles ran: two soft-start ramps of the wash pump (one per
    // CLEAN entry).
    let ramp_starts = rig
        .actuator
        .commands_matching("wash_pump VALUE=0.1")
        .len();
    assert_eq!(ramp_starts, 2);
}

#[rstest]
fn wash_cancellation_rolls_back_to_initial() {
    let rig = Rig::new();
    rig.settle_weight(1.0);
    let executor = WashExecutor::new(Arc::clone(&rig.system_state), Arc::clone(&rig.load_cell));

    let ctx = rig.ctx();
    ctx.stop.store(true, Ordering::SeqCst);

    let step = Step {
        name: "wash".to_string(),
        action: StepAction::Wash(WashAction {
            repeat_count: 3,
            target_weight_g: 25.0,
            fill_timeout_s: 1.0,
            drain_timeout_s: 30.0,
            empty_tolerance_g: 2.0,
            empty_stability_window_s: 0.5,
        }),
    };
    let result = executor.execute(&step, &ctx);

    assert!(!result.success);
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);
}

#[rstest]
fn acquire_duration_mode_enters_and_leaves_sample() {
    let rig = Rig::new();
    let executor = AcquireExecutor::new(Arc::clone(&rig.system_state), None);

    let step = Step {
        name: "measure".to_string(),
        action: StepAction::Acquire(AcquireAction {
            gas_pump_pwm: 60.0,
            termination: Some(AcquireTermination::Duration(1.0)),
            max_duration_s: 30.0,
        }),
    };
    let result = executor.execute(&step, &rig.ctx());

    assert!(result.success);
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);
    // SAMPLE entry turned the membrane pump on; the restore turned it off.
    let membrane = rig.actuator.commands_matching("membrane_pump");
    assert_eq!(membrane, vec![
        "SET_PIN PIN=membrane_pump VALUE=1",
        "SET_PIN PIN=membrane_pump VALUE=0",
    ]);
}

#[rstest]
fn acquire_rejects_out_of_range_pwm() {
    let rig = Rig::new();
    let executor = AcquireExecutor::new(Arc::clone(&rig.system_state), None);
    let step = Step {
        name: "measure".to_string(),
        action: StepAction::Acquire(AcquireAction {
            gas_pump_pwm: 140.0,
            termination: Some(AcquireTermination::Duration(1.0)),
            max_duration_s: 30.0,
        }),
    };
    assert!(!executor.check_preconditions(&step).satisfied);
}

#[rstest]
fn acquire_counts_heater_cycles_after_the_first_wrap() {
    let rig = Rig::new();
    let sensor = Arc::new(ScriptedSensor::new());
    let stream: Arc<dyn SensorStream> = sensor.clone();
    let executor = AcquireExecutor::new(Arc::clone(&rig.system_state), Some(stream));

    // Real clock here: the cycle counter blocks on channel receives.
    let ctx = ExecCtx::detached(Arc::new(MonotonicClock::new()));

    let feeder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        // Steps walk 0..9 and wrap; the first wrap only arms the counter.
        for _ in 0..3 {
            for step in [0u32, 5, 9] {
                sensor.push(sensor_packet(step, 1.0));
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        sensor.push(sensor_packet(0, 1.0));
    });

    let step = Step {
        name: "measure".to_string(),
        action: StepAction::Acquire(AcquireAction {
            gas_pump_pwm: 50.0,
            termination: Some(AcquireTermination::HeaterCycles(2)),
            max_duration_s: 10.0,
        }),
    };
    let start = std::time::Instant::now();
    let result = executor.execute(&step, &ctx);
    feeder.join().expect("feeder");

    assert!(result.success);
    assert!(start.elapsed() < Duration::from_secs(5), "did not fall back to the estimate");
    assert_eq!(rig.system_state.mode(), SystemMode::Initial);
}

#[rstest]
fn acquire_stability_terminates_when_variation_is_low() {
    let rig = Rig::new();
    let sensor = Arc::new(ScriptedSensor::new());
    let stream: Arc<dyn SensorStream> = sensor.clone();
    let executor = AcquireExecutor::new(Arc::clone(&rig.system_state), Some(stream));
    let ctx = ExecCtx::detached(Arc::new(MonotonicClock::new()));

    let feeder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        for i in 0..15 {
            let value = 100.0 + (i % 2) as f64 * 0.1;
            sensor.push(sensor_packet(3, value));
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let step = Step {
        name: "measure".to_string(),
        action: StepAction::Acquire(AcquireAction {
            gas_pump_pwm: 50.0,
            termination: Some(AcquireTermination::Stability {
                window_s: 30.0,
                threshold_percent: 5.0,
            }),
            max_duration_s: 10.0,
        }),
    };
    let start = std::time::Instant::now();
    let result = executor.execute(&step, &ctx);
    feeder.join().expect("feeder");

    assert!(result.success);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[rstest]
fn estimates_follow_the_primitive_parameters() {
    let rig = Rig::new();
    let inject = InjectExecutor::new(
        Arc::clone(&rig.system_state),
        None,
        Arc::clone(&rig.load_cell),
    );
    let drain = DrainExecutor::new(
        Arc::clone(&rig.system_state),
        None,
        Arc::clone(&rig.load_cell),
    );

    // 50 ml at 5 ml/min: 600 s plus the settle allowance.
    assert!((inject.estimate_duration(&inject_step(50.0, 30.0)) - 605.0).abs() < 1e-9);
    assert!((drain.estimate_duration(&drain_step()) - 60.0).abs() < 1e-9);
}
