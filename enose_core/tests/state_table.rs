//! L0 transition protocol: emitted commands are exactly the field-wise diff,
//! in declaration order, with the stepper auto-stop first when applicable.

use enose_core::mocks::MockActuator;
use enose_core::system_state::{InjectionParams, PumpState, SystemMode, SystemState, PUMP_COUNT};
use enose_traits::clock::test_clock::TestClock;
use enose_traits::Clock;
use rstest::rstest;
use std::sync::Arc;

fn harness() -> (Arc<MockActuator>, SystemState) {
    let actuator = Arc::new(MockActuator::new());
    let clock = Arc::new(TestClock::new());
    let state = SystemState::new(actuator.clone(), clock);
    (actuator, state)
}

#[rstest]
fn drain_transition_emits_exact_diff_in_order() {
    let (actuator, state) = harness();

    state.transition_to(SystemMode::Drain);

    assert_eq!(
        actuator.commands(),
        vec![
            "SET_PIN PIN=valve_waste VALUE=1",
            "SET_PIN PIN=valve_outlet VALUE=1",
            "SET_PIN PIN=membrane_pump VALUE=1",
        ]
    );
    assert_eq!(state.mode(), SystemMode::Drain);
}

#[rstest]
fn repeated_transition_to_same_mode_emits_nothing() {
    let (actuator, state) = harness();
    state.transition_to(SystemMode::Drain);
    actuator.clear_commands();

    state.transition_to(SystemMode::Drain);
    assert!(actuator.commands().is_empty());
}

#[rstest]
fn pinch_valve_drives_inject_area_fans() {
    let (actuator, state) = harness();

    state.transition_to(SystemMode::Inject);

    assert_eq!(
        actuator.commands(),
        vec![
            "SET_PIN PIN=valve_pinch VALUE=1",
            "SET_PIN PIN=fan_inject_0 VALUE=1",
            "SET_PIN PIN=fan_inject_1 VALUE=1",
        ]
    );
}

#[rstest]
fn wash_pump_soft_starts_in_ten_steps() {
    let (actuator, state) = harness();

    state.transition_to(SystemMode::Clean);

    let ramp = actuator.commands_matching("wash_pump");
    assert_eq!(ramp.len(), 10);
    assert_eq!(ramp[0], "SET_PIN PIN=wash_pump VALUE=0.1");
    assert_eq!(ramp[9], "SET_PIN PIN=wash_pump VALUE=1");

    // Stops are a single direct write.
    actuator.clear_commands();
    state.transition_to(SystemMode::Initial);
    assert_eq!(
        actuator.commands_matching("wash_pump"),
        vec!["SET_PIN PIN=wash_pump VALUE=0"]
    );
}

#[rstest]
fn start_inject_issues_axis_registration_and_composite_move() {
    let (actuator, state) = harness();

    let mut params = InjectionParams::default();
    params.distances_mm[2] = 50_000.0;
    params.speed = 5.0 / 60.0 * 1000.0;
    params.accel = params.speed * 2.0;
    state.start_inject(&params);

    let commands = actuator.commands();
    let register_pos = commands
        .iter()
        .position(|c| c == "REGISTER_PUMPS_TO_AXIS")
        .expect("axis registration emitted");
    let g1 = &commands[register_pos + 1];
    assert_eq!(g1, "G1 C50000.0 F5000.0");

    assert_eq!(state.mode(), SystemMode::Inject);
    assert_eq!(state.peripheral_state().pumps[2], PumpState::Running);
}

#[rstest]
fn auto_stop_precedes_all_other_emissions() {
    let (actuator, state) = harness();

    let mut params = InjectionParams::default();
    params.distances_mm[0] = 100.0;
    params.distances_mm[7] = 200.0;
    state.start_inject(&params);
    actuator.clear_commands();

    state.transition_to(SystemMode::Initial);

    let commands = actuator.commands();
    assert_eq!(commands[0], "ENOSE_ASYNC_STOP");
    assert!(commands.len() > 1, "diff emissions follow the stop");
    for pump in state.peripheral_state().pumps {
        assert_eq!(pump, PumpState::Stopped);
    }
}

#[rstest]
fn stop_inject_stops_and_returns_to_initial() {
    let (actuator, state) = harness();

    let mut params = InjectionParams::default();
    params.distances_mm[1] = 10.0;
    state.start_inject(&params);
    actuator.clear_commands();

    state.stop_inject();

    let commands = actuator.commands();
    assert_eq!(commands[0], "ENOSE_ASYNC_STOP");
    // The stop cleared the pump states, so the INITIAL transition must not
    // issue a second async stop.
    assert_eq!(commands.iter().filter(|c| *c == "ENOSE_ASYNC_STOP").count(), 1);
    assert_eq!(state.mode(), SystemMode::Initial);
}

#[rstest]
fn axis_letters_cover_all_eight_pumps() {
    let (actuator, state) = harness();

    let mut params = InjectionParams::default();
    for i in 0..PUMP_COUNT {
        params.distances_mm[i] = (i as f64 + 1.0) * 10.0;
    }
    state.start_inject(&params);

    let g1 = actuator
        .commands()
        .into_iter()
        .find(|c| c.starts_with("G1 "))
        .expect("composite move emitted");
    for letter in ["A10.0", "B20.0", "C30.0", "D40.0", "H50.0", "I60.0", "J70.0", "K80.0"] {
        assert!(g1.contains(letter), "{g1} missing {letter}");
    }
}

#[rstest]
fn set_gas_pump_updates_vector_without_mode_change() {
    let (actuator, state) = harness();
    actuator.clear_commands();

    state.set_gas_pump_pwm(0.55);

    assert_eq!(actuator.commands(), vec!["SET_PIN PIN=membrane_pump VALUE=0.55"]);
    assert_eq!(state.mode(), SystemMode::Initial);
    assert!((state.peripheral_state().membrane_pump_pwm - 0.55).abs() < 1e-6);
}

#[rstest]
fn run_pump_resets_position_and_moves_unsynchronized() {
    let (actuator, state) = harness();
    actuator.clear_commands();

    state.run_pump(4, 20.0, 100.0, 250.0);

    assert_eq!(
        actuator.commands(),
        vec![
            "MANUAL_STEPPER STEPPER=pump_4 SET_POSITION=0",
            "MANUAL_STEPPER STEPPER=pump_4 SPEED=20 ACCEL=100 MOVE=250 SYNC=0",
        ]
    );
    assert_eq!(state.peripheral_state().pumps[4], PumpState::Running);

    // The next transition cancels the free-running move first.
    actuator.clear_commands();
    state.transition_to(SystemMode::Drain);
    assert_eq!(actuator.commands()[0], "ENOSE_ASYNC_STOP");
}

#[rstest]
fn soft_start_sleeps_between_ramp_steps() {
    let actuator = Arc::new(MockActuator::new());
    let clock = Arc::new(TestClock::new());
    let state = SystemState::new(actuator, clock.clone());

    let before = clock.now();
    state.transition_to(SystemMode::Clean);
    let elapsed = clock.now().saturating_duration_since(before);

    // 9 gaps of 100 ms between the 10 steps.
    assert_eq!(elapsed.as_millis(), 900);
}
