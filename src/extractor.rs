use crate::error::ExtractionError;
use crate::meter_client::Document;
use crate::quantity::{FieldMap, FieldSpec, QuantityKind};
use serde_json::Value;

/// How a missing or non-numeric source value affects the rest of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionPolicy {
    /// A missing or non-numeric value only drops that field.
    #[default]
    PerField,
    /// The first missing or non-numeric value stops extraction. Readings
    /// accepted before it are still published, then the cycle fails.
    /// Out-of-range values are dropped per field in both modes.
    StopAtFirstFailure,
}

/// A validated value for one published path.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub path: String,
    pub kind: QuantityKind,
    pub value: f64,
    pub phase_voltage: bool,
    pub aggregate_power: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    Missing,
    NotNumeric,
    OutOfRange(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub path: String,
    pub reason: RejectReason,
}

/// Result of one extraction pass, in field map order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub accepted: Vec<Reading>,
    pub rejected: Vec<Rejection>,
    /// Set when [`ExtractionPolicy::StopAtFirstFailure`] cut the pass short.
    /// Fields after the failing one were not looked at.
    pub stopped: Option<ExtractionError>,
}

pub fn extract(doc: &Document, fields: &FieldMap, policy: ExtractionPolicy) -> Extraction {
    let mut extraction = Extraction::default();

    for field in fields.iter() {
        let reason = match classify(doc.get(&field.source_key), field) {
            Ok(reading) => {
                extraction.accepted.push(reading);
                continue;
            }
            Err(reason) => reason,
        };

        if policy == ExtractionPolicy::StopAtFirstFailure {
            let path = field.path.clone();
            let source_key = field.source_key.clone();
            match reason {
                RejectReason::Missing => {
                    extraction.stopped = Some(ExtractionError::MissingKey { path, source_key });
                    break;
                }
                RejectReason::NotNumeric => {
                    extraction.stopped = Some(ExtractionError::NotNumeric { path, source_key });
                    break;
                }
                RejectReason::OutOfRange(_) => {}
            }
        }
        extraction.rejected.push(Rejection {
            path: field.path.clone(),
            reason,
        });
    }

    extraction
}

fn classify(raw: Option<&Value>, field: &FieldSpec) -> Result<Reading, RejectReason> {
    let value = raw
        .ok_or(RejectReason::Missing)?
        .as_f64()
        .ok_or(RejectReason::NotNumeric)?;
    if !field.kind.accepts(value) {
        return Err(RejectReason::OutOfRange(value));
    }
    Ok(Reading {
        path: field.path.clone(),
        kind: field.kind,
        value,
        phase_voltage: field.phase_voltage,
        aggregate_power: field.is_aggregate_power(),
    })
}
