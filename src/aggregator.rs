use crate::error::{DerivationError, StoreError};
use crate::extractor::{Extraction, Reading};
use crate::property_store::PropertyStore;
use crate::quantity::{AC_CURRENT, AC_VOLTAGE};
use tracing::{debug, trace};

pub const UPDATE_INDEX: &str = "/UpdateIndex";
const UPDATE_INDEX_MAX: i64 = 255;

/// How the aggregate current is derived from aggregate power and voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurrentFormula {
    /// `I = P / U`
    #[default]
    PowerOverVoltage,
    /// `U / P`, as published by the original dbus service.
    VoltageOverPower,
}

/// What one publish pass wrote to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishSummary {
    pub written: usize,
    pub voltage: Option<f64>,
    /// `None` when no phase voltage was accepted and the derivation was not attempted.
    pub current: Option<Result<f64, DerivationError>>,
}

/// Writes accepted readings and the derived aggregates to the store.
/// Does not touch the Update Index.
pub fn publish(
    extraction: &Extraction,
    store: &PropertyStore,
    formula: CurrentFormula,
) -> Result<PublishSummary, StoreError> {
    let written = write_readings(&extraction.accepted, store)?;

    let voltages: Vec<f64> = extraction
        .accepted
        .iter()
        .filter(|r| r.phase_voltage)
        .map(|r| r.value)
        .collect();
    let power = extraction
        .accepted
        .iter()
        .rev()
        .find(|r| r.aggregate_power)
        .map(|r| r.value);

    let mut summary = PublishSummary {
        written,
        voltage: None,
        current: None,
    };

    let Some(voltage) = mean(&voltages).map(round2) else {
        return Ok(summary);
    };
    store.set(AC_VOLTAGE, voltage)?;
    summary.voltage = Some(voltage);
    summary.written += 1;

    let current = derive_current(voltage, power, formula);
    match &current {
        Ok(current) => {
            store.set(AC_CURRENT, *current)?;
            summary.written += 1;
        }
        Err(e) => debug!("skipping aggregate current: {e}"),
    }
    summary.current = Some(current);

    Ok(summary)
}

/// Writes each reading to its path in order, without deriving aggregates.
pub fn write_readings(readings: &[Reading], store: &PropertyStore) -> Result<usize, StoreError> {
    for reading in readings {
        trace!(path = %reading.path, value = reading.value, "publishing reading");
        store.set(&reading.path, reading.value)?;
    }
    Ok(readings.len())
}

pub fn derive_current(
    voltage: f64,
    power: Option<f64>,
    formula: CurrentFormula,
) -> Result<f64, DerivationError> {
    let power = power.ok_or(DerivationError::MissingPower)?;
    if power == 0.0 {
        return Err(DerivationError::ZeroPower);
    }
    let current = match formula {
        CurrentFormula::PowerOverVoltage => power / voltage,
        CurrentFormula::VoltageOverPower => voltage / power,
    };
    Ok(round2(current))
}

/// Bumps `/UpdateIndex` by one, wrapping 255 → 0. Returns the new value.
pub fn advance_update_index(store: &PropertyStore) -> Result<i64, StoreError> {
    let current = store
        .get(UPDATE_INDEX)
        .ok_or_else(|| StoreError::UnknownPath(UPDATE_INDEX.to_string()))?;
    let next = next_update_index(current.as_i64());
    store.set(UPDATE_INDEX, next)?;
    Ok(next)
}

/// Anything outside 0..=254 (including a non-integer written from outside)
/// restarts the index at 0.
pub fn next_update_index(current: Option<i64>) -> i64 {
    match current {
        Some(index) if (0..UPDATE_INDEX_MAX).contains(&index) => index + 1,
        _ => 0,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Rounds to two decimals from the exact binary value, so `2.675`
/// (stored as 2.67499...) becomes 2.67 rather than 2.68.
pub fn round2(value: f64) -> f64 {
    format!("{value:.2}").parse().unwrap_or(value)
}
