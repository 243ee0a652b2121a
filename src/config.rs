use crate::aggregator::CurrentFormula;
use crate::error::ConfigError;
use crate::extractor::ExtractionPolicy;
use crate::meter_service::ServiceIdentity;
use crate::quantity::FieldMap;
use std::{env, net::SocketAddr, str::FromStr, time::Duration};
use tracing::info;

const DEFAULT_PAGE_KEY: &str = "StatusSNS";
const DEFAULT_DEVICE_KEY: &str = "LK13BE";
const DEFAULT_POLL_MS: u64 = 1000;
const DEFAULT_TIMEOUT_MS: u64 = 900;
const DEFAULT_BUS_ADDR: &str = "0.0.0.0:5502";

/// Static process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub meter_url: String,
    pub page_key: String,
    pub device_key: String,
    pub fields: FieldMap,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub extraction_policy: ExtractionPolicy,
    pub current_formula: CurrentFormula,
    pub identity: ServiceIdentity,
    pub bus_addr: SocketAddr,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any name → value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let meter_url = get("METER_URL").ok_or(ConfigError::Missing("METER_URL"))?;
        let fields = match get("METER_FIELDS") {
            Some(spec) => FieldMap::parse(&spec)?,
            None => FieldMap::default(),
        };
        let poll_ms = parse_or("METER_POLL_MS", get("METER_POLL_MS"), DEFAULT_POLL_MS)?;
        let timeout_ms = parse_or("METER_TIMEOUT_MS", get("METER_TIMEOUT_MS"), DEFAULT_TIMEOUT_MS)?;
        if poll_ms == 0 {
            return Err(invalid("METER_POLL_MS", "0"));
        }
        if timeout_ms == 0 {
            return Err(invalid("METER_TIMEOUT_MS", "0"));
        }

        let extraction_policy = if parse_bool_safe(get("METER_STRICT_EXTRACTION")) {
            ExtractionPolicy::StopAtFirstFailure
        } else {
            ExtractionPolicy::PerField
        };
        let current_formula = match get("METER_CURRENT_FORMULA").as_deref() {
            None | Some("power/voltage") => CurrentFormula::PowerOverVoltage,
            Some("voltage/power") => CurrentFormula::VoltageOverPower,
            Some(other) => return Err(invalid("METER_CURRENT_FORMULA", other)),
        };

        let defaults = ServiceIdentity::default();
        let identity = ServiceIdentity {
            device_instance: parse_or(
                "DEVICE_INSTANCE",
                get("DEVICE_INSTANCE"),
                defaults.device_instance,
            )?,
            product_name: get("PRODUCT_NAME").unwrap_or(defaults.product_name),
            connection: get("METER_CONNECTION").unwrap_or(defaults.connection),
        };

        let bus_addr = get("BUS_MODBUS_ADDR").unwrap_or_else(|| DEFAULT_BUS_ADDR.to_string());
        let bus_addr = bus_addr
            .parse::<SocketAddr>()
            .map_err(|_| invalid("BUS_MODBUS_ADDR", &bus_addr))?;

        Ok(Self {
            meter_url,
            page_key: get("METER_PAGE").unwrap_or_else(|| DEFAULT_PAGE_KEY.to_string()),
            device_key: get("METER_ID").unwrap_or_else(|| DEFAULT_DEVICE_KEY.to_string()),
            fields,
            poll_interval: Duration::from_millis(poll_ms),
            request_timeout: Duration::from_millis(timeout_ms),
            extraction_policy,
            current_formula,
            identity,
            bus_addr,
        })
    }

    pub fn log_summary(&self) {
        info!("Meter bridge config:");
        info!("  Meter URL: {}", self.meter_url);
        info!("  Document path: {}/{}", self.page_key, self.device_key);
        info!("  Fields: {}", self.fields.len());
        info!(
            "  Poll interval: {:?}, request timeout: {:?}",
            self.poll_interval, self.request_timeout
        );
        info!("  Extraction: {:?}", self.extraction_policy);
        info!("  Current formula: {:?}", self.current_formula);
        info!("  Modbus bus: {}", self.bus_addr);
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    }
}

fn parse_or<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| invalid(name, &raw)),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
