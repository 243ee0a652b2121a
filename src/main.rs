use std::sync::Arc;
use tasmota_sml_bridge::{
    meter_service, modbus_bus, BridgeConfig, MeterPoller, ModbusBus, PropertyStore,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Tasmota SML meter bridge");
    let config = BridgeConfig::from_env()?;
    config.log_summary();

    let store = PropertyStore::new();
    meter_service::register(&store, &config.identity, &config.fields)?;
    debug!("Registered paths: {}", store.snapshot_json()?);

    // The poller owns the only internal writer; the bus only sees the store.
    let poller = Arc::new(MeterPoller::from_config(&config, store.clone())?);
    let _poll_loop = poller.spawn(config.poll_interval);

    modbus_bus::serve(config.bus_addr, ModbusBus::new(store)).await?;

    Ok(())
}
