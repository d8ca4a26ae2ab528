mod cli;

use clap::Parser;
use cli::{Cli, Commands, FILE_GUARD};
use enose_core::orchestrator::{ExperimentLifecycle, Orchestrator, ProgramSource};
use enose_core::validator::ProgramValidator;
use enose_core::{HardwareStateMachine, LoadCellDriver, SystemState};
use enose_traits::{Actuator, MonotonicClock, SensorStream};
use eyre::WrapErr;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn humanize(err: &eyre::Report) -> String {
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("websocket") || lower.contains("connection refused") {
        return "What happened: Could not reach the motion firmware.\nLikely causes: Firmware not running, wrong host/port in [actuator], network down.\nHow to fix: Check the firmware service and the config, then retry.".to_string();
    }
    if lower.contains("serial") {
        return "What happened: Could not open the sensor board serial link.\nLikely causes: Wrong device path in [sensor], board unplugged, permissions.\nHow to fix: Check the device path and that the process may access it.".to_string();
    }
    if lower.contains("parse failed") || lower.contains("yaml") {
        return format!(
            "What happened: The program file could not be parsed.\nHow to fix: Fix the reported line and rerun. Original: {msg}"
        );
    }
    if lower.contains("validation failed") {
        return "What happened: The program failed static validation.\nHow to fix: Address the listed errors (overflow risk, missing liquids, ...) and reload.".to_string();
    }

    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!("Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}")
}

/// JSON-lines file sink described by the `[logging]` config section, if one
/// is configured. The non-blocking writer stops logging the moment its guard
/// drops, so the guard parks in `FILE_GUARD` for the life of the process.
fn logging_file_sink(
    logging: &enose_config::LoggingCfg,
) -> Option<tracing_appender::non_blocking::NonBlocking> {
    let file = logging.file.as_deref()?;
    if let Some(parent) = std::path::Path::new(file).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let rotation = logging.rotation.as_deref().unwrap_or("never");
    let appender = if rotation.eq_ignore_ascii_case("daily") {
        tracing_appender::rolling::daily(".", file)
    } else if rotation.eq_ignore_ascii_case("hourly") {
        tracing_appender::rolling::hourly(".", file)
    } else {
        tracing_appender::rolling::never(".", file)
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    Some(writer)
}

/// Initialize tracing once for the whole app. RUST_LOG wins over the CLI
/// level; the config's `[logging]` section may add a rotating JSON file sink.
fn init_tracing(json: bool, level: &str, logging: &enose_config::LoggingCfg) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let file_layer =
        logging_file_sink(logging).map(|writer| fmt::layer().json().with_writer(writer).boxed());

    let registry = tracing_subscriber::registry().with(filter).with(console);
    match file_layer {
        Some(layer) => registry.with(layer).init(),
        None => registry.init(),
    }
}

fn print_validation(report: &enose_core::ValidationReport) {
    for d in &report.errors {
        println!("error[{}] {}: {}", d.code, d.path, d.message);
    }
    for d in &report.warnings {
        println!("warning[{}] {}: {}", d.code, d.path, d.message);
    }
    let est = &report.estimate;
    println!(
        "estimate: peak {:.1} ml, {:.0} s, {} heater cycles",
        est.peak_liquid_level_ml, est.estimated_duration_s, est.heater_cycles
    );
    for lc in &est.liquid_consumption {
        println!(
            "  pump {} '{}': {:.1}/{:.1} ml{}",
            lc.pump_index,
            lc.liquid_id,
            lc.required_ml,
            lc.available_ml,
            if lc.sufficient { "" } else { " (INSUFFICIENT)" }
        );
    }
}

fn cmd_validate(program_path: &std::path::Path) -> eyre::Result<i32> {
    let text = std::fs::read_to_string(program_path)
        .wrap_err_with(|| format!("read {}", program_path.display()))?;
    let program = enose_core::parser::parse_program(&text).wrap_err("parse program")?;
    let report = ProgramValidator::validate(&program);
    print_validation(&report);
    if report.valid {
        println!("valid: {}", program.id);
        Ok(0)
    } else {
        println!("invalid: {}", program.id);
        Ok(2)
    }
}

fn connect(cli: &Cli) -> eyre::Result<(enose_config::Config, Orchestrator)> {
    let config = enose_config::load_config(&cli.config)
        .wrap_err_with(|| format!("load config {}", cli.config.display()))?;

    let mut load_cell_cfg =
        enose_config::load_calibration_json(&cli.calibration).wrap_err("load calibration")?;
    // The TOML [load_cell] section overrides side-file defaults only when the
    // side-file is absent; the wizard-written file wins otherwise.
    if !cli.calibration.exists() {
        load_cell_cfg = config.load_cell.clone();
    }

    let link = enose_link::KlipperLink::connect(
        &config.actuator.host,
        config.actuator.port,
        &config.actuator.load_cell_name,
    )
    .wrap_err("connect actuator link")?;
    let actuator: Arc<dyn Actuator> = Arc::new(link);

    let sensor: Option<Arc<dyn SensorStream>> = match &config.sensor {
        Some(sensor_cfg) => {
            let board = enose_link::SensorBoardLink::open(&sensor_cfg.device, sensor_cfg.baud)
                .wrap_err("open sensor link")?;
            board.sync().wrap_err("sensor sync")?;
            Some(Arc::new(board))
        }
        None => None,
    };

    let clock = Arc::new(MonotonicClock::new());
    let system_state = Arc::new(SystemState::new(Arc::clone(&actuator), clock.clone()));
    let hardware_state = HardwareStateMachine::new(Arc::clone(&system_state));
    let load_cell = Arc::new(LoadCellDriver::new(
        Arc::clone(&actuator),
        clock.clone(),
        &config.actuator.load_cell_name,
        load_cell_cfg,
    ));
    Arc::clone(&load_cell).start();

    let orchestrator = Orchestrator::new(
        actuator,
        system_state,
        hardware_state,
        load_cell,
        sensor,
        Arc::new(enose_core::NullConsumables),
        clock,
    );
    Ok((config, orchestrator))
}

fn cmd_run(cli: &Cli, program_path: &std::path::Path, follow: bool) -> eyre::Result<i32> {
    let text = std::fs::read_to_string(program_path)
        .wrap_err_with(|| format!("read {}", program_path.display()))?;

    let (_config, orchestrator) = connect(cli)?;

    let events = follow.then(|| orchestrator.subscribe_experiment_events());

    let outcome = orchestrator.load_program(ProgramSource::Yaml(text));
    if let Some(report) = &outcome.validation {
        print_validation(report);
    }
    if !outcome.success {
        eyre::bail!(outcome.error_message.unwrap_or_else(|| "load failed".to_string()));
    }

    orchestrator.start_experiment().wrap_err("start experiment")?;

    loop {
        if let Some(events) = &events {
            while let Some(event) = events.next(Duration::from_millis(200)) {
                println!(
                    "[{:?}] {} {}",
                    event.event_type, event.step_name, event.message
                );
            }
        } else {
            std::thread::sleep(Duration::from_millis(500));
        }

        let status = orchestrator.get_experiment_status();
        match status.lifecycle {
            ExperimentLifecycle::Completed => {
                println!("experiment complete");
                return Ok(0);
            }
            ExperimentLifecycle::Error => {
                println!(
                    "experiment error: {}",
                    status.error_message.unwrap_or_default()
                );
                return Ok(1);
            }
            ExperimentLifecycle::Aborted => {
                println!("experiment aborted");
                return Ok(1);
            }
            _ => {}
        }
    }
}

fn cmd_check(cli: &Cli) -> eyre::Result<i32> {
    let (config, orchestrator) = connect(cli)?;
    // Give the liveness probe a couple of cycles to settle.
    std::thread::sleep(Duration::from_secs(5));
    let mode = orchestrator.system_state().mode();
    let phase = orchestrator.hardware_state().current_state();
    println!("actuator: {}:{}", config.actuator.host, config.actuator.port);
    println!("mode: {mode}, phase: {}", phase.as_str());
    let status = orchestrator.load_cell().status();
    println!(
        "load cell: filtered {:.2} g, stable {}, calibrated {}",
        status.filtered_weight, status.is_stable, status.is_calibrated
    );
    Ok(0)
}

fn main() {
    let cli = Cli::parse();

    // Logging config comes from the file when present; CLI flags win.
    let logging = enose_config::load_config(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_tracing(cli.json, &cli.log_level, &logging);

    let result = match &cli.cmd {
        Commands::Validate { program } => cmd_validate(program),
        Commands::Run { program, follow } => cmd_run(&cli, program, *follow),
        Commands::Check => cmd_check(&cli),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", humanize(&err));
            tracing::error!(error = ?err, "command failed");
            std::process::exit(1);
        }
    }
}
