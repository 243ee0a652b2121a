use crate::error::ConfigError;

/// Aggregate power path, captured separately for the current derivation.
pub const AC_POWER: &str = "/Ac/Power";
pub const AC_VOLTAGE: &str = "/Ac/Voltage";
pub const AC_CURRENT: &str = "/Ac/Current";

/// Physical quantity a published path measures. Selects the plausibility range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityKind {
    Voltage,
    Current,
    Power,
    Frequency,
    Energy,
}

const KIND_MARKERS: [(&str, QuantityKind); 5] = [
    ("Voltage", QuantityKind::Voltage),
    ("Power", QuantityKind::Power),
    ("Frequency", QuantityKind::Frequency),
    ("Current", QuantityKind::Current),
    ("Energy", QuantityKind::Energy),
];

impl QuantityKind {
    /// Infers the kind from the path. Exactly one marker must match.
    pub fn infer(path: &str) -> Result<Self, ConfigError> {
        let mut matches = KIND_MARKERS
            .iter()
            .filter(|(marker, _)| path.contains(marker))
            .map(|(_, kind)| *kind);

        match (matches.next(), matches.next()) {
            (Some(kind), None) => Ok(kind),
            (None, _) => Err(ConfigError::UnknownQuantity(path.to_string())),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousQuantity(path.to_string())),
        }
    }

    /// Inclusive `(min, max)` plausibility bounds.
    pub fn range(self) -> (f64, f64) {
        match self {
            QuantityKind::Voltage => (80.0, 270.0),
            QuantityKind::Power => (-30_000.0, 30_000.0),
            QuantityKind::Frequency => (20.0, 70.0),
            QuantityKind::Current => (-1_000.0, 1_000.0),
            QuantityKind::Energy => (0.0, 100_000_000.0),
        }
    }

    pub fn accepts(self, value: f64) -> bool {
        let (min, max) = self.range();
        value >= min && value <= max
    }
}

/// One measurement the bridge tracks, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub path: String,
    pub source_key: String,
    pub kind: QuantityKind,
    pub phase_voltage: bool,
}

impl FieldSpec {
    pub fn new(path: &str, source_key: &str) -> Result<Self, ConfigError> {
        let kind = QuantityKind::infer(path)?;
        Ok(Self {
            path: path.to_string(),
            source_key: source_key.to_string(),
            kind,
            phase_voltage: path.contains("/Ac/L") && path.contains("/Voltage"),
        })
    }

    pub fn is_aggregate_power(&self) -> bool {
        self.path == AC_POWER
    }
}

/// Ordered path → source-key table. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap {
    fields: Vec<FieldSpec>,
}

impl FieldMap {
    pub fn new<'a, I>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let fields = entries
            .into_iter()
            .map(|(path, key)| FieldSpec::new(path, key))
            .collect::<Result<Vec<_>, _>>()?;
        if fields.is_empty() {
            return Err(ConfigError::EmptyFieldMap);
        }
        Ok(Self { fields })
    }

    /// Parses `path=key` pairs separated by commas, e.g.
    /// `/Ac/Power=Power,/Ac/L1/Voltage=Volt_L1_curr`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let pairs = spec
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(path, key)| (path.trim(), key.trim()))
                    .filter(|(path, key)| !path.is_empty() && !key.is_empty())
                    .ok_or_else(|| ConfigError::InvalidValue {
                        name: "METER_FIELDS",
                        value: entry.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(pairs)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for FieldMap {
    /// Mapping used by the Tasmota SML script for the LK13BE meter.
    fn default() -> Self {
        use QuantityKind::*;
        let fields = [
            ("/Ac/Energy/Forward", "E_in", Energy),
            ("/Ac/Energy/Reverse", "E_out", Energy),
            (AC_POWER, "Power", Power),
            ("/Ac/L1/Power", "Power_L1_curr", Power),
            ("/Ac/L2/Power", "Power_L2_curr", Power),
            ("/Ac/L3/Power", "Power_L3_curr", Power),
            ("/Ac/L1/Frequency", "HZ", Frequency),
            ("/Ac/L2/Frequency", "HZ", Frequency),
            ("/Ac/L3/Frequency", "HZ", Frequency),
            ("/Ac/L1/Voltage", "Volt_L1_curr", Voltage),
            ("/Ac/L2/Voltage", "Volt_L2_curr", Voltage),
            ("/Ac/L3/Voltage", "Volt_L3_curr", Voltage),
            ("/Ac/L1/Current", "Amperage_L1_curr", Current),
            ("/Ac/L2/Current", "Amperage_L2_curr", Current),
            ("/Ac/L3/Current", "Amperage_L3_curr", Current),
        ]
        .into_iter()
        .map(|(path, source_key, kind)| FieldSpec {
            path: path.to_string(),
            source_key: source_key.to_string(),
            kind,
            phase_voltage: kind == Voltage && path.starts_with("/Ac/L"),
        })
        .collect();

        Self { fields }
    }
}
