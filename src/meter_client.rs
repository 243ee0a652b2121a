use crate::error::FetchError;
use serde_json::{Map, Value};
use std::time::Duration;

/// Measurement sub-document: source key → raw value.
pub type Document = Map<String, Value>;

/// Reads the Tasmota `status 8` (sensor) page of the meter.
pub struct MeterClient {
    status_url: String,
    page_key: String,
    device_key: String,
    client: reqwest::Client,
}

impl MeterClient {
    pub fn new(
        base_url: &str,
        page_key: &str,
        device_key: &str,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let separator = if base_url.contains('?') { '&' } else { '?' };
        Ok(Self {
            status_url: format!("{base_url}{separator}cmnd=status%208"),
            page_key: page_key.to_string(),
            device_key: device_key.to_string(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn status_url(&self) -> &str {
        &self.status_url
    }

    /// One GET, no retries. The cycle driver decides what happens on failure.
    pub async fn fetch(&self) -> Result<Document, FetchError> {
        let body: Value = self
            .client
            .get(&self.status_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| {
                if e.is_decode() {
                    FetchError::Malformed(e.to_string())
                } else {
                    FetchError::Http(e)
                }
            })?;
        select_measurements(body, &self.page_key, &self.device_key)
    }
}

/// Navigates `body[page_key][device_key]`, which must be an object.
pub fn select_measurements(
    body: Value,
    page_key: &str,
    device_key: &str,
) -> Result<Document, FetchError> {
    let page = take_object(body, "document")?
        .remove(page_key)
        .ok_or_else(|| FetchError::MissingKey(page_key.to_string()))?;
    let device = take_object(page, page_key)?
        .remove(device_key)
        .ok_or_else(|| FetchError::MissingKey(device_key.to_string()))?;
    take_object(device, device_key)
}

fn take_object(value: Value, what: &str) -> Result<Document, FetchError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(FetchError::Malformed(format!(
            "{what} is not an object: {other}"
        ))),
    }
}

#[cfg(test)]
mod test_meter_client {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    const STATUS_BODY: &str = r#"
        {
            "StatusSNS": {
                "Time": "2024-05-01T12:00:00",
                "LK13BE": {
                    "E_in": 12345.6,
                    "E_out": 789.1,
                    "Power": 350,
                    "Volt_L1_curr": 230.1
                }
            }
        }
    "#;

    fn client_for(server: &mockito::Server) -> MeterClient {
        MeterClient::new(
            &format!("{}/cm", server.url()),
            "StatusSNS",
            "LK13BE",
            Duration::from_millis(500),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_status_page() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(STATUS_BODY)
            .create_async()
            .await;

        let client = client_for(&server);
        let doc = client.fetch().await.unwrap();

        assert_eq!(doc.get("Power"), Some(&json!(350)));
        assert_eq!(doc.get("E_in"), Some(&json!(12345.6)));
        assert_eq!(doc.len(), 4);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_url_query() {
        let client = MeterClient::new(
            "http://192.168.178.54/cm",
            "StatusSNS",
            "LK13BE",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            client.status_url(),
            "http://192.168.178.54/cm?cmnd=status%208"
        );

        let client =
            MeterClient::new("http://meter/cm?user=a", "p", "d", Duration::from_secs(1)).unwrap();
        assert_eq!(client.status_url(), "http://meter/cm?user=a&cmnd=status%208");
    }

    #[tokio::test]
    async fn test_fetch_missing_device_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body(r#"{"StatusSNS": {"OtherMeter": {"Power": 1}}}"#)
            .create_async()
            .await;

        let err = client_for(&server).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::MissingKey(ref key) if key == "LK13BE"));
    }

    #[tokio::test]
    async fn test_fetch_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(200)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let err = client_for(&server).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_fetch_http_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/cm")
            .match_query(Matcher::UrlEncoded("cmnd".into(), "status 8".into()))
            .with_status(500)
            .create_async()
            .await;

        let err = client_for(&server).fetch().await.unwrap_err();
        assert!(
            matches!(err, FetchError::Http(ref e)
                if e.status() == Some(reqwest::StatusCode::INTERNAL_SERVER_ERROR)),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        // Accepts connections at the socket level but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = MeterClient::new(
            &format!("http://{addr}/cm"),
            "StatusSNS",
            "LK13BE",
            Duration::from_millis(200),
        )
        .unwrap();

        let err = client.fetch().await.unwrap_err();
        assert!(
            matches!(err, FetchError::Http(ref e) if e.is_timeout()),
            "got {err:?}"
        );
        drop(listener);
    }

    #[test]
    fn test_select_measurements_errors() {
        assert!(matches!(
            select_measurements(json!({}), "StatusSNS", "LK13BE"),
            Err(FetchError::MissingKey(ref k)) if k == "StatusSNS"
        ));
        assert!(matches!(
            select_measurements(json!({"StatusSNS": 5}), "StatusSNS", "LK13BE"),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            select_measurements(json!([1, 2]), "StatusSNS", "LK13BE"),
            Err(FetchError::Malformed(_))
        ));
    }
}
