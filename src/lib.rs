//! Tasmota SML Meter Bridge Library
//!
//! Polls a Tasmota smart-meter reader over HTTP, validates each measurement
//! against a plausible range, derives aggregate voltage and current, and
//! publishes everything into a shared property store that external consumers
//! can read (and write) over Modbus TCP.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod extractor;
pub mod meter_client;
pub mod meter_service;
pub mod modbus_bus;
pub mod poller;
pub mod property_store;
pub mod quantity;

// Re-export commonly used types for easier access
pub use config::BridgeConfig;
pub use meter_client::MeterClient;
pub use modbus_bus::ModbusBus;
pub use poller::{CycleOutcome, CycleReport, MeterPoller};
pub use property_store::{Access, PropertyStore, PropertyValue};
pub use quantity::{FieldMap, QuantityKind};
