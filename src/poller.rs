use crate::aggregator::{
    advance_update_index, publish, write_readings, CurrentFormula, PublishSummary,
};
use crate::config::BridgeConfig;
use crate::error::{CycleError, FetchError};
use crate::extractor::{extract, ExtractionPolicy};
use crate::meter_client::MeterClient;
use crate::property_store::PropertyStore;
use crate::quantity::FieldMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Failed cycles in a row before the log level is raised to error.
const FAILURE_ESCALATION: u32 = 10;

/// Result of one completed poll cycle.
#[derive(Debug)]
pub struct CycleReport {
    /// Value of `/UpdateIndex` after the cycle, `None` if it could not be written.
    pub update_index: Option<i64>,
    pub published: usize,
    pub rejected: usize,
    pub error: Option<CycleError>,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// A previous cycle was still in flight.
    Skipped,
}

struct CycleState {
    client: MeterClient,
    fields: FieldMap,
    policy: ExtractionPolicy,
    formula: CurrentFormula,
    consecutive_failures: u32,
}

/// Drives the fetch → extract → publish → UpdateIndex cycle.
///
/// At most one cycle runs at a time: the cycle state sits behind a mutex that a
/// tick only `try_lock`s, so a tick that arrives mid-cycle is dropped.
pub struct MeterPoller {
    cycle: Mutex<CycleState>,
    store: PropertyStore,
}

impl MeterPoller {
    pub fn new(
        client: MeterClient,
        fields: FieldMap,
        policy: ExtractionPolicy,
        formula: CurrentFormula,
        store: PropertyStore,
    ) -> Self {
        Self {
            cycle: Mutex::new(CycleState {
                client,
                fields,
                policy,
                formula,
                consecutive_failures: 0,
            }),
            store,
        }
    }

    pub fn from_config(config: &BridgeConfig, store: PropertyStore) -> Result<Self, FetchError> {
        let client = MeterClient::new(
            &config.meter_url,
            &config.page_key,
            &config.device_key,
            config.request_timeout,
        )?;
        Ok(Self::new(
            client,
            config.fields.clone(),
            config.extraction_policy,
            config.current_formula,
            store,
        ))
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    /// Spawns the timer loop onto the runtime.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(period).await;
        })
    }

    /// Ticks forever. Failed cycles are logged and polling continues.
    pub async fn run(&self, period: Duration) {
        info!("Starting meter poll loop every {period:?}");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Runs one cycle unless another one is already in flight.
    pub async fn tick(&self) -> CycleOutcome {
        let Ok(mut state) = self.cycle.try_lock() else {
            debug!("previous poll cycle still running, skipping tick");
            return CycleOutcome::Skipped;
        };
        CycleOutcome::Completed(self.run_cycle(&mut state).await)
    }

    async fn run_cycle(&self, state: &mut CycleState) -> CycleReport {
        let result = self.poll_once(state).await;

        // Liveness signal: advances whether or not the poll succeeded.
        let update_index = match advance_update_index(&self.store) {
            Ok(index) => Some(index),
            Err(e) => {
                error!("Failed to advance update index: {e}");
                None
            }
        };

        match result {
            Ok((summary, rejected)) => {
                if state.consecutive_failures > 0 {
                    info!(
                        "Meter readable again after {} failed cycles",
                        state.consecutive_failures
                    );
                }
                state.consecutive_failures = 0;
                debug!(
                    published = summary.written,
                    rejected,
                    voltage = ?summary.voltage,
                    update_index = ?update_index,
                    "poll cycle complete"
                );
                CycleReport {
                    update_index,
                    published: summary.written,
                    rejected,
                    error: None,
                }
            }
            Err(e) => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= FAILURE_ESCALATION {
                    error!(
                        stage = e.stage(),
                        failures = state.consecutive_failures,
                        "could not read from device: {e}"
                    );
                } else {
                    warn!(stage = e.stage(), "could not read from device: {e}");
                }
                CycleReport {
                    update_index,
                    published: 0,
                    rejected: 0,
                    error: Some(e),
                }
            }
        }
    }

    async fn poll_once(&self, state: &CycleState) -> Result<(PublishSummary, usize), CycleError> {
        let doc = state.client.fetch().await?;
        let mut extraction = extract(&doc, &state.fields, state.policy);
        for rejection in &extraction.rejected {
            debug!(path = %rejection.path, reason = ?rejection.reason, "reading rejected");
        }
        if let Some(stop) = extraction.stopped.take() {
            // Fields ahead of the failing key stay published; aggregates are not derived.
            let written = write_readings(&extraction.accepted, &self.store)?;
            debug!(written, "published readings ahead of the failing key");
            return Err(stop.into());
        }
        let summary = publish(&extraction, &self.store, state.formula)?;
        Ok((summary, extraction.rejected.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::UPDATE_INDEX;
    use crate::error::ExtractionError;
    use crate::meter_service::{register, ServiceIdentity};
    use crate::property_store::PropertyValue;
    use mockito::Matcher;
    use serde_json::{json, Value};

    fn status_body(device: Value) -> String {
        json!({
            "StatusSNS": {
                "Time": "2024-05-01T12:00:00",
                "LK13BE": device
            }
        })
        .to_string()
    }

    fn full_device() -> Value {
        json!({
            "E_in": 12345.6,
            "E_out": 789.1,
            "Power": 2301.3,
            "Power_L1_curr": 800.0,
            "Power_L2_curr": 700.3,
            "Power_L3_curr": 801.0,
            "HZ": 50.02,
            "Volt_L1_curr": 230.1,
            "Volt_L2_curr": 229.8,
            "Volt_L3_curr": 230.5,
            "Amperage_L1_curr": 3.48,
            "Amperage_L2_curr": 3.05,
            "Amperage_L3_curr": 3.47
        })
    }

    fn poller(url: &str, policy: ExtractionPolicy, timeout: Duration) -> MeterPoller {
        let store = PropertyStore::new();
        let fields = FieldMap::default();
        register(&store, &ServiceIdentity::default(), &fields).unwrap();
        let client = MeterClient::new(url, "StatusSNS", "LK13BE", timeout).unwrap();
        MeterPoller::new(client, fields, policy, CurrentFormula::default(), store)
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Skipped => panic!("cycle was skipped"),
        }
    }

    fn number(store: &PropertyStore, path: &str) -> Option<f64> {
        store.get(path).and_then(|v| v.as_f64())
    }

    #[tokio::test]
    async fn test_cycle_publishes_readings_and_aggregates() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body(status_body(full_device()))
            .create_async()
            .await;

        let poller = poller(
            &format!("{}/cm", server.url()),
            ExtractionPolicy::PerField,
            Duration::from_millis(500),
        );
        let report = completed(poller.tick().await);
        let store = poller.store();

        assert!(report.error.is_none());
        assert_eq!(report.update_index, Some(1));
        assert_eq!(report.rejected, 0);
        // 15 mapped fields plus aggregate voltage and current
        assert_eq!(report.published, 17);

        assert_eq!(number(store, "/Ac/Energy/Forward"), Some(12345.6));
        assert_eq!(number(store, "/Ac/L2/Frequency"), Some(50.02));
        assert_eq!(number(store, "/Ac/Voltage"), Some(230.13));
        assert_eq!(number(store, "/Ac/Current"), Some(10.0));
        assert_eq!(store.get(UPDATE_INDEX), Some(PropertyValue::Integer(1)));
    }

    #[tokio::test]
    async fn test_out_of_range_keeps_previous_value() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body(status_body(full_device()))
            .create_async()
            .await;
        let poller = poller(
            &format!("{}/cm", server.url()),
            ExtractionPolicy::PerField,
            Duration::from_millis(500),
        );
        completed(poller.tick().await);

        let mut device = full_device();
        device["Volt_L1_curr"] = json!(300.0);
        device["HZ"] = json!(75);
        server.reset();
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body(status_body(device))
            .create_async()
            .await;

        let report = completed(poller.tick().await);
        let store = poller.store();

        assert_eq!(report.rejected, 4);
        assert_eq!(number(store, "/Ac/L1/Voltage"), Some(230.1));
        assert_eq!(number(store, "/Ac/L3/Frequency"), Some(50.02));
        // Mean of the two remaining phase voltages
        assert_eq!(number(store, "/Ac/Voltage"), Some(230.15));
        assert_eq!(report.update_index, Some(2));
    }

    #[tokio::test]
    async fn test_fetch_failure_only_advances_update_index() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(503)
            .create_async()
            .await;
        let poller = poller(
            &format!("{}/cm", server.url()),
            ExtractionPolicy::PerField,
            Duration::from_millis(500),
        );
        let store = poller.store();
        store.set("/Ac/Power", 123.0).unwrap();
        store.set(UPDATE_INDEX, 41).unwrap();
        let before = store.snapshot();

        let report = completed(poller.tick().await);

        assert!(
            matches!(report.error, Some(CycleError::Fetch(FetchError::Http(ref e)))
                if e.status() == Some(reqwest::StatusCode::SERVICE_UNAVAILABLE)),
            "got {:?}",
            report.error
        );
        assert_eq!(report.update_index, Some(42));
        let after = store.snapshot();
        for ((path, old), (_, new)) in before.iter().zip(after.iter()) {
            if path == UPDATE_INDEX {
                assert_eq!(*new, PropertyValue::Integer(42));
            } else {
                assert_eq!(old, new, "{path} changed");
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_still_advances_update_index() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let poller = poller(
            &format!("http://{addr}/cm"),
            ExtractionPolicy::PerField,
            Duration::from_millis(150),
        );

        let report = completed(poller.tick().await);
        assert_eq!(report.error.as_ref().map(CycleError::stage), Some("fetch"));
        assert_eq!(report.update_index, Some(1));

        let report = completed(poller.tick().await);
        assert_eq!(report.update_index, Some(2));
        drop(listener);
    }

    #[tokio::test]
    async fn test_missing_key_policies() {
        let mut device = full_device();
        device.as_object_mut().unwrap().remove("Volt_L2_curr");
        let body = status_body(device);

        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body(body)
            .expect(2)
            .create_async()
            .await;
        let url = format!("{}/cm", server.url());

        let strict = poller(
            &url,
            ExtractionPolicy::StopAtFirstFailure,
            Duration::from_millis(500),
        );
        let report = completed(strict.tick().await);
        assert!(matches!(report.error, Some(CycleError::Extraction(_))));
        assert_eq!(report.update_index, Some(1));
        // Fields mapped ahead of the missing key are published
        assert_eq!(number(strict.store(), "/Ac/Power"), Some(2301.3));
        assert_eq!(number(strict.store(), "/Ac/L1/Voltage"), Some(230.1));
        // The rest of the map and the aggregates are not
        assert_eq!(
            strict.store().get("/Ac/L3/Voltage"),
            Some(PropertyValue::Integer(0))
        );
        assert_eq!(
            strict.store().get("/Ac/Voltage"),
            Some(PropertyValue::Integer(0))
        );

        let lenient = poller(&url, ExtractionPolicy::PerField, Duration::from_millis(500));
        let report = completed(lenient.tick().await);
        assert!(report.error.is_none());
        assert_eq!(report.rejected, 1);
        assert_eq!(number(lenient.store(), "/Ac/Power"), Some(2301.3));
        assert_eq!(
            lenient.store().get("/Ac/L2/Voltage"),
            Some(PropertyValue::Integer(0))
        );
        // Mean of L1 and L3 only
        assert_eq!(number(lenient.store(), "/Ac/Voltage"), Some(230.3));
    }

    #[tokio::test]
    async fn test_stop_at_first_failure_publishes_leading_fields() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body(status_body(json!({"E_in": 100, "E_out": 5, "Power": 500})))
            .create_async()
            .await;
        let poller = poller(
            &format!("{}/cm", server.url()),
            ExtractionPolicy::StopAtFirstFailure,
            Duration::from_millis(500),
        );

        let report = completed(poller.tick().await);
        let store = poller.store();

        assert!(matches!(
            report.error,
            Some(CycleError::Extraction(ExtractionError::MissingKey { ref source_key, .. }))
                if source_key == "Power_L1_curr"
        ));
        assert_eq!(number(store, "/Ac/Energy/Forward"), Some(100.0));
        assert_eq!(number(store, "/Ac/Energy/Reverse"), Some(5.0));
        assert_eq!(number(store, "/Ac/Power"), Some(500.0));
        assert_eq!(report.update_index, Some(1));
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let poller = Arc::new(poller(
            &format!("http://{addr}/cm"),
            ExtractionPolicy::PerField,
            Duration::from_millis(400),
        ));

        let in_flight = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(poller.tick().await, CycleOutcome::Skipped));

        let report = completed(in_flight.await.unwrap());
        assert_eq!(report.update_index, Some(1));
        assert_eq!(
            poller.store().get(UPDATE_INDEX),
            Some(PropertyValue::Integer(1))
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_spawned_loop_keeps_polling() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body(status_body(full_device()))
            .expect_at_least(3)
            .create_async()
            .await;
        let poller = Arc::new(poller(
            &format!("{}/cm", server.url()),
            ExtractionPolicy::PerField,
            Duration::from_millis(500),
        ));
        let mut updates = poller.store().subscribe(UPDATE_INDEX).unwrap();

        let handle = poller.clone().spawn(Duration::from_millis(20));
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), updates.changed())
                .await
                .expect("update index did not advance")
                .unwrap();
        }
        handle.abort();

        let index = poller.store().get(UPDATE_INDEX).and_then(|v| v.as_i64());
        assert!(index >= Some(3), "update index {index:?}");
    }
}
