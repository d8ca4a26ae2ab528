//! Consumable accounting seam.
//!
//! The core emits consumption events; the persistence layer behind this
//! trait is someone else's problem.

/// Sink for maintenance-accounting events.
pub trait ConsumableSink: Send + Sync {
    /// Liquid pushed through a pump tube, in milliliters.
    fn add_pump_consumption(&self, pump_index: usize, ml: f64);
    /// Runtime accrued by a wear part (pump tube, carbon filter, ...).
    fn add_runtime(&self, kind: &str, seconds: u64);
}

/// Discards every event. Default when no repository is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConsumables;

impl ConsumableSink for NullConsumables {
    fn add_pump_consumption(&self, _pump_index: usize, _ml: f64) {}
    fn add_runtime(&self, _kind: &str, _seconds: u64) {}
}
