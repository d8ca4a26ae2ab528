//! Load-cell driver.
//!
//! Sits on top of the actuator link: a 200 ms poll queries the firmware's
//! load-cell object, and every reading runs through a sliding-window filter
//! that derives the filtered weight, stability and trend. On top of the
//! filter sit the overflow watchdog, the debounced drain-complete signal,
//! the session's dynamic empty-bottle baseline and the calibration wizard.
//!
//! `ingest` is public so tests (and the poll callback) feed readings through
//! the same path.

use enose_config::LoadCellCfg;
use enose_traits::{Actuator, Clock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const POLL_PERIOD: Duration = Duration::from_millis(200);
const EMPTY_POLL_PERIOD: Duration = Duration::from_millis(500);
/// Spread bound for the empty-bottle stability window.
const EMPTY_SPREAD_G: f64 = 0.5;
/// Consecutive near-baseline samples required before the window phase.
const EMPTY_CONSECUTIVE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightTrend {
    Stable,
    Increasing,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    Idle,
    ZeroPoint,
    ReferenceWeight,
    Verify,
    Complete,
}

#[derive(Debug, Clone)]
pub struct LoadCellStatus {
    pub raw_weight: f64,
    /// Raw sample scaled to -100..100.
    pub raw_percent: f64,
    pub filtered_weight: f64,
    pub tared_weight: f64,
    pub stddev: f64,
    pub trend: WeightTrend,
    pub is_stable: bool,
    pub is_calibrated: bool,
    pub overflow_warning: bool,
    pub sensor_ok: bool,
}

impl Default for LoadCellStatus {
    fn default() -> Self {
        Self {
            raw_weight: 0.0,
            raw_percent: 0.0,
            filtered_weight: 0.0,
            tared_weight: 0.0,
            stddev: 0.0,
            trend: WeightTrend::Stable,
            is_stable: false,
            is_calibrated: false,
            overflow_warning: false,
            sensor_ok: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EmptyBottleResult {
    pub success: bool,
    pub empty_weight: f64,
}

/// Distance (mm) -> expected measured weight (g) under the persisted model.
pub fn mm_to_weight(cfg: &LoadCellCfg, mm: f64) -> f64 {
    let measured = mm * cfg.pump_mm_to_ml + cfg.pump_mm_offset;
    measured * cfg.weight_scale + cfg.weight_offset
}

/// Inverse of `mm_to_weight`.
pub fn weight_to_mm(cfg: &LoadCellCfg, grams: f64) -> f64 {
    let measured = (grams - cfg.weight_offset) / cfg.weight_scale;
    (measured - cfg.pump_mm_offset) / cfg.pump_mm_to_ml
}

struct LcInner {
    samples: VecDeque<f64>,
    status: LoadCellStatus,
    tare_offset: f64,
    // Drain-complete episode tracking.
    was_stable: bool,
    stable_since_ms: u64,
    episode_start_weight: f64,
    episode_fired: bool,
    dynamic_empty: Option<f64>,
    calibration_step: CalibrationStep,
    reference_weight_g: f64,
}

type SignalCallback = Box<dyn Fn() + Send + Sync>;
type DrainCallback = Box<dyn Fn(f64) + Send + Sync>;
type CalibrationCallback = Box<dyn Fn(CalibrationStep, &str) + Send + Sync>;

pub struct LoadCellDriver {
    actuator: Arc<dyn Actuator>,
    clock: Arc<dyn Clock + Send + Sync>,
    cfg: Mutex<LoadCellCfg>,
    object_name: String,
    inner: Mutex<LcInner>,
    epoch: Instant,
    running: AtomicBool,
    on_overflow: Mutex<Option<SignalCallback>>,
    on_drain_complete: Mutex<Option<DrainCallback>>,
    on_calibration: Mutex<Option<CalibrationCallback>>,
}

impl LoadCellDriver {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        clock: Arc<dyn Clock + Send + Sync>,
        name: &str,
        cfg: LoadCellCfg,
    ) -> Self {
        let epoch = clock.now();
        tracing::info!(sensor = name, "load cell driver initialized");
        Self {
            actuator,
            clock,
            cfg: Mutex::new(cfg),
            object_name: format!("load_cell {name}"),
            inner: Mutex::new(LcInner {
                samples: VecDeque::new(),
                status: LoadCellStatus::default(),
                tare_offset: 0.0,
                was_stable: false,
                stable_since_ms: 0,
                episode_start_weight: 0.0,
                episode_fired: false,
                dynamic_empty: None,
                calibration_step: CalibrationStep::Idle,
                reference_weight_g: 0.0,
            }),
            epoch,
            running: AtomicBool::new(false),
            on_overflow: Mutex::new(None),
            on_drain_complete: Mutex::new(None),
            on_calibration: Mutex::new(None),
        }
    }

    /// Start the 200 ms polling loop on a background thread.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let driver = self;
        let watchdog = Arc::clone(&driver);
        let spawn = std::thread::Builder::new()
            .name("load-cell-poll".into())
            .spawn(move || {
                while driver.running.load(Ordering::Relaxed) {
                    Self::poll_once(&driver);
                    driver.clock.sleep(POLL_PERIOD);
                }
            });
        if let Err(e) = spawn {
            tracing::error!(error = %e, "failed to spawn load cell poll thread");
            watchdog.running.store(false, Ordering::SeqCst);
        } else {
            tracing::info!("load cell polling started");
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn poll_once(driver: &Arc<Self>) {
        let key = driver.object_name.clone();
        let sink = Arc::clone(driver);
        driver.actuator.query_object(
            &driver.object_name,
            Box::new(move |response| {
                let Some(object) = response
                    .get("status")
                    .and_then(|s| s.get(key.as_str()))
                else {
                    return;
                };
                let Some(raw_sample) = object.get("raw_sample").and_then(|v| v.as_f64()) else {
                    return;
                };
                let force_g = object.get("force_g").and_then(|v| v.as_f64());
                sink.ingest(raw_sample, force_g);
            }),
        );
    }

    /// Feed one reading through the filter and detection chain.
    pub fn ingest(&self, raw_sample: f64, force_g: Option<f64>) {
        let cfg = self.cfg_snapshot();
        let mut fire_overflow = false;
        let mut fire_drain: Option<f64> = None;

        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.status.raw_percent = raw_sample * 100.0;

            match force_g {
                Some(mut grams) => {
                    if cfg.invert_reading {
                        grams = -grams;
                    }
                    inner.status.raw_weight = grams;
                    inner.status.is_calibrated = true;

                    update_filter(&mut inner, &cfg, grams);
                    compute_statistics(&mut inner, &cfg);
                    fire_overflow = check_overflow(&mut inner, &cfg);
                    fire_drain = self.check_drain_complete(&mut inner, &cfg);
                }
                None => {
                    inner.status.is_calibrated = false;
                }
            }
            inner.status.sensor_ok = true;
        }

        if fire_overflow {
            if let Ok(slot) = self.on_overflow.lock() {
                if let Some(cb) = slot.as_ref() {
                    cb();
                }
            }
        }
        if let Some(weight) = fire_drain {
            if let Ok(slot) = self.on_drain_complete.lock() {
                if let Some(cb) = slot.as_ref() {
                    cb(weight);
                }
            }
        }
    }

    /// Debounced drain-complete: one shot per stable episode, gated on the
    /// full stable duration and on bounded drift since the episode began.
    fn check_drain_complete(&self, inner: &mut LcInner, cfg: &LoadCellCfg) -> Option<f64> {
        let now_ms = self.clock.ms_since(self.epoch);

        if inner.status.is_stable && inner.status.trend == WeightTrend::Stable {
            if !inner.was_stable {
                inner.was_stable = true;
                inner.stable_since_ms = now_ms;
                inner.episode_start_weight = inner.status.filtered_weight;
                inner.episode_fired = false;
                return None;
            }
            let stable_for_ms = now_ms.saturating_sub(inner.stable_since_ms);
            if !inner.episode_fired
                && stable_for_ms as f64 >= cfg.drain_stable_duration * 1000.0
                && (inner.status.filtered_weight - inner.episode_start_weight).abs()
                    < cfg.trend_threshold
            {
                inner.episode_fired = true;
                tracing::info!(
                    weight = inner.status.filtered_weight,
                    stable_s = stable_for_ms as f64 / 1000.0,
                    "drain complete detected"
                );
                return Some(inner.status.filtered_weight);
            }
        } else {
            inner.was_stable = false;
        }
        None
    }

    // === Snapshots ===

    pub fn status(&self) -> LoadCellStatus {
        self.inner
            .lock()
            .map(|g| g.status.clone())
            .unwrap_or_default()
    }

    pub fn filtered_weight(&self) -> f64 {
        self.inner
            .lock()
            .map(|g| g.status.filtered_weight)
            .unwrap_or(0.0)
    }

    pub fn is_stable(&self) -> bool {
        self.inner.lock().map(|g| g.status.is_stable).unwrap_or(false)
    }

    pub fn trend(&self) -> WeightTrend {
        self.inner
            .lock()
            .map(|g| g.status.trend)
            .unwrap_or(WeightTrend::Stable)
    }

    pub fn dynamic_empty_weight(&self) -> Option<f64> {
        self.inner.lock().ok().and_then(|g| g.dynamic_empty)
    }

    /// Forget the session baseline; the next successful drain earns a new one.
    pub fn reset_dynamic_empty_weight(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.dynamic_empty = None;
        }
    }

    pub fn cfg_snapshot(&self) -> LoadCellCfg {
        self.cfg.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn set_cfg(&self, cfg: LoadCellCfg) {
        if let Ok(mut slot) = self.cfg.lock() {
            *slot = cfg;
        }
    }

    /// Expected measured weight for a pump distance, under the persisted model.
    pub fn mm_to_weight(&self, mm: f64) -> f64 {
        mm_to_weight(&self.cfg_snapshot(), mm)
    }

    /// Pump distance required for a physical weight, under the persisted model.
    pub fn weight_to_mm(&self, grams: f64) -> f64 {
        weight_to_mm(&self.cfg_snapshot(), grams)
    }

    // === Observers ===

    pub fn on_overflow_warning<F: Fn() + Send + Sync + 'static>(&self, cb: F) {
        if let Ok(mut slot) = self.on_overflow.lock() {
            *slot = Some(Box::new(cb));
        }
    }

    pub fn on_drain_complete<F: Fn(f64) + Send + Sync + 'static>(&self, cb: F) {
        if let Ok(mut slot) = self.on_drain_complete.lock() {
            *slot = Some(Box::new(cb));
        }
    }

    pub fn on_calibration_update<F: Fn(CalibrationStep, &str) + Send + Sync + 'static>(
        &self,
        cb: F,
    ) {
        if let Ok(mut slot) = self.on_calibration.lock() {
            *slot = Some(Box::new(cb));
        }
    }

    // === Tare ===

    pub fn tare(&self) {
        self.actuator
            .send_command(&format!("LOAD_CELL_TARE LOAD_CELL={}", self.cell_name()), false);
        if let Ok(mut inner) = self.inner.lock() {
            inner.tare_offset = inner.status.filtered_weight;
            tracing::info!(offset = inner.tare_offset, "tare executed");
        }
    }

    fn cell_name(&self) -> &str {
        self.object_name
            .strip_prefix("load_cell ")
            .unwrap_or(&self.object_name)
    }

    // === Empty-bottle wait ===

    /// Block until the bottle reads empty and stable, or `timeout_s` elapses.
    ///
    /// Success requires three consecutive stable samples near the session
    /// baseline (stability alone when no baseline is set yet). When
    /// `stability_window_s > 0` it additionally requires a contiguous window
    /// of that length whose filtered spread stays under 0.5 g. Success
    /// updates the baseline; timeout does not.
    pub fn wait_for_empty_bottle(
        &self,
        tolerance_g: f64,
        timeout_s: f64,
        stability_window_s: f64,
        should_abort: &(dyn Fn() -> bool + Sync),
    ) -> EmptyBottleResult {
        let start = self.clock.now();
        let deadline = Duration::from_secs_f64(timeout_s.max(0.0));
        let baseline = self.dynamic_empty_weight();

        let fail = |weight: f64| EmptyBottleResult { success: false, empty_weight: weight };

        // Phase 1: consecutive near-baseline stable samples.
        let mut consecutive = 0u32;
        loop {
            if should_abort() {
                return fail(self.filtered_weight());
            }
            if self.clock.now().saturating_duration_since(start) >= deadline {
                tracing::warn!("empty bottle wait timed out");
                return fail(self.filtered_weight());
            }
            let status = self.status();
            let near = match baseline {
                Some(base) => (status.filtered_weight - base).abs() <= tolerance_g,
                None => true,
            };
            if status.is_stable && near {
                consecutive += 1;
                if consecutive >= EMPTY_CONSECUTIVE {
                    break;
                }
            } else {
                consecutive = 0;
            }
            self.clock.sleep(EMPTY_POLL_PERIOD);
        }

        // Phase 2: contiguous low-spread window.
        if stability_window_s > 0.0 {
            let window = Duration::from_secs_f64(stability_window_s);
            let mut window_start = self.clock.now();
            let mut min = self.filtered_weight();
            let mut max = min;
            loop {
                if should_abort() {
                    return fail(self.filtered_weight());
                }
                if self.clock.now().saturating_duration_since(start) >= deadline {
                    tracing::warn!("empty bottle stability window timed out");
                    return fail(self.filtered_weight());
                }
                self.clock.sleep(EMPTY_POLL_PERIOD);
                let weight = self.filtered_weight();
                min = min.min(weight);
                max = max.max(weight);
                if max - min >= EMPTY_SPREAD_G {
                    // Spread broke; restart the window from here.
                    window_start = self.clock.now();
                    min = weight;
                    max = weight;
                    continue;
                }
                if self.clock.now().saturating_duration_since(window_start) >= window {
                    break;
                }
            }
        }

        let empty_weight = self.filtered_weight();
        if let Ok(mut inner) = self.inner.lock() {
            inner.dynamic_empty = Some(empty_weight);
        }
        tracing::info!(empty_weight, "empty bottle confirmed");
        EmptyBottleResult { success: true, empty_weight }
    }

    // === Calibration wizard ===

    pub fn calibration_step(&self) -> CalibrationStep {
        self.inner
            .lock()
            .map(|g| g.calibration_step)
            .unwrap_or(CalibrationStep::Idle)
    }

    /// Reference mass entered during the current wizard run.
    pub fn reference_weight(&self) -> f64 {
        self.inner.lock().map(|g| g.reference_weight_g).unwrap_or(0.0)
    }

    pub fn start_calibration(&self) {
        self.actuator.send_command(
            &format!("LOAD_CELL_CALIBRATE LOAD_CELL={}", self.cell_name()),
            false,
        );
        self.set_calibration_step(
            CalibrationStep::ZeroPoint,
            "Remove everything from the carrier, then confirm the zero point.",
        );
    }

    pub fn set_zero_point(&self) {
        if self.calibration_step() != CalibrationStep::ZeroPoint {
            tracing::warn!("set_zero_point called out of order");
            return;
        }
        self.actuator.send_command("TARE", false);
        self.set_calibration_step(
            CalibrationStep::ReferenceWeight,
            "Zero point set. Place a known weight and confirm its mass.",
        );
    }

    pub fn set_reference_weight(&self, grams: f64) {
        if self.calibration_step() != CalibrationStep::ReferenceWeight {
            tracing::warn!("set_reference_weight called out of order");
            return;
        }
        if let Ok(mut inner) = self.inner.lock() {
            inner.reference_weight_g = grams;
        }
        self.actuator
            .send_command(&format!("CALIBRATE GRAMS={}", grams as i64), false);
        self.set_calibration_step(
            CalibrationStep::Verify,
            "Calibration measured. Verify the reading, then save or restart.",
        );
    }

    pub fn save_calibration(&self) {
        if self.calibration_step() != CalibrationStep::Verify {
            tracing::warn!("save_calibration called out of order");
            return;
        }
        self.actuator.send_command("ACCEPT", false);
        self.actuator.send_command("SAVE_CONFIG", false);
        self.set_calibration_step(CalibrationStep::Complete, "Calibration saved.");
        // Wizard returns to rest once the terminal step is announced.
        if let Ok(mut inner) = self.inner.lock() {
            inner.calibration_step = CalibrationStep::Idle;
        }
    }

    pub fn cancel_calibration(&self) {
        if self.calibration_step() == CalibrationStep::Idle {
            return;
        }
        self.actuator.send_command("ABORT", false);
        self.set_calibration_step(CalibrationStep::Idle, "Calibration cancelled.");
    }

    fn set_calibration_step(&self, step: CalibrationStep, message: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.calibration_step = step;
        }
        tracing::info!(?step, message, "calibration step");
        if let Ok(slot) = self.on_calibration.lock() {
            if let Some(cb) = slot.as_ref() {
                cb(step, message);
            }
        }
    }
}

fn update_filter(inner: &mut LcInner, cfg: &LoadCellCfg, grams: f64) {
    inner.samples.push_back(grams);
    while inner.samples.len() > cfg.filter_window_size.max(1) {
        inner.samples.pop_front();
    }
    if !inner.samples.is_empty() {
        let sum: f64 = inner.samples.iter().sum();
        inner.status.filtered_weight = sum / inner.samples.len() as f64;
        inner.status.tared_weight = inner.status.filtered_weight - inner.tare_offset;
    }
}

fn compute_statistics(inner: &mut LcInner, cfg: &LoadCellCfg) {
    if inner.samples.len() < 3 {
        inner.status.stddev = 0.0;
        inner.status.is_stable = false;
        inner.status.trend = WeightTrend::Stable;
        return;
    }

    let mean = inner.status.filtered_weight;
    let variance: f64 = inner
        .samples
        .iter()
        .map(|s| {
            let diff = s - mean;
            diff * diff
        })
        .sum::<f64>()
        / inner.samples.len() as f64;
    inner.status.stddev = variance.sqrt();
    inner.status.is_stable = inner.status.stddev < cfg.stable_stddev_threshold;

    // Trend from the half-window mean delta, with the threshold as hysteresis.
    if inner.samples.len() >= cfg.filter_window_size.max(2) {
        let half = inner.samples.len() / 2;
        let older: f64 = inner.samples.iter().take(half).sum::<f64>() / half.max(1) as f64;
        let recent_count = inner.samples.len() - half;
        let recent: f64 =
            inner.samples.iter().skip(half).sum::<f64>() / recent_count.max(1) as f64;
        let delta = recent - older;
        inner.status.trend = if delta > cfg.trend_threshold {
            WeightTrend::Increasing
        } else if delta < -cfg.trend_threshold {
            WeightTrend::Decreasing
        } else {
            WeightTrend::Stable
        };
    }
}

/// Rising-edge overflow detection; returns true when the warning fires.
fn check_overflow(inner: &mut LcInner, cfg: &LoadCellCfg) -> bool {
    let threshold = cfg.max_bottle_weight - cfg.overflow_margin;
    let warning = inner.status.tared_weight > threshold;
    let rising = warning && !inner.status.overflow_warning;
    if rising {
        tracing::warn!(
            weight = inner.status.tared_weight,
            threshold,
            "overflow warning"
        );
    }
    inner.status.overflow_warning = warning;
    rising
}
