//! Creates every store path the bridge publishes, with initial values.

use crate::aggregator::UPDATE_INDEX;
use crate::error::StoreError;
use crate::property_store::{Access, PropertyStore};
use crate::quantity::{FieldMap, AC_CURRENT, AC_POWER, AC_VOLTAGE};
use tracing::{debug, info};

/// Product id used by Victron's AC sensor bridge for grid meters.
pub const PRODUCT_ID: i64 = 16;
pub const FIRMWARE_VERSION: f64 = 0.1;
pub const HARDWARE_VERSION: i64 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceIdentity {
    pub device_instance: u32,
    pub product_name: String,
    pub connection: String,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            device_instance: 31,
            product_name: "Tasmota SML Meter".to_string(),
            connection: "Tasmota SML Meter service".to_string(),
        }
    }
}

impl ServiceIdentity {
    pub fn service_name(&self) -> String {
        format!("com.victronenergy.grid.tasmota_sml_{}", self.device_instance)
    }
}

/// Registers management, identity and measurement paths.
///
/// Identity paths are read-only and never change after this call. Measurement
/// paths and `/UpdateIndex` start at 0 and accept external writes.
pub fn register(
    store: &PropertyStore,
    identity: &ServiceIdentity,
    fields: &FieldMap,
) -> Result<(), StoreError> {
    info!(
        service = %identity.service_name(),
        device_instance = identity.device_instance,
        "registering meter service"
    );

    store.add_path("/Mgmt/ProcessName", env!("CARGO_PKG_NAME"), Access::ReadOnly)?;
    store.add_path(
        "/Mgmt/ProcessVersion",
        format!("{} (Rust)", env!("CARGO_PKG_VERSION")).as_str(),
        Access::ReadOnly,
    )?;
    store.add_path("/Mgmt/Connection", identity.connection.as_str(), Access::ReadOnly)?;

    store.add_path(
        "/DeviceInstance",
        i64::from(identity.device_instance),
        Access::ReadOnly,
    )?;
    store.add_path("/ProductId", PRODUCT_ID, Access::ReadOnly)?;
    store.add_path("/ProductName", identity.product_name.as_str(), Access::ReadOnly)?;
    store.add_path("/FirmwareVersion", FIRMWARE_VERSION, Access::ReadOnly)?;
    store.add_path("/HardwareVersion", HARDWARE_VERSION, Access::ReadOnly)?;
    store.add_path("/Connected", 1, Access::ReadOnly)?;

    let measurement_paths = [AC_POWER, AC_CURRENT, AC_VOLTAGE]
        .into_iter()
        .chain(fields.iter().map(|f| f.path.as_str()));
    for path in measurement_paths {
        if store.contains(path) {
            continue;
        }
        debug!("adding measurement path {path}");
        store.add_path(path, 0, Access::Writeable)?;
    }
    store.add_path(UPDATE_INDEX, 0, Access::Writeable)?;

    Ok(())
}
