//! Resolution engine gateway
//!
//! The loader only ever talks to the engine through [`EngineGateway`]:
//! one synchronous-per-worker `add_record` call with idempotent upsert
//! semantics assumed for repeated `(data_source, record_id)` pairs. The
//! implementation is chosen once at startup and injected; nothing picks
//! an engine at runtime.

use async_trait::async_trait;
use erl_common::{LoaderError, Result};
use tracing::debug;

/// Narrow interface into the downstream resolution engine.
#[async_trait]
pub trait EngineGateway: Send + Sync {
    /// Upsert one record. Blocks the calling worker until the engine
    /// answers. Returns the enriched "with info" response body when
    /// requested and available.
    async fn add_record(
        &self,
        data_source: &str,
        record_id: &str,
        payload: &[u8],
        load_id: &str,
        with_info: bool,
    ) -> Result<Option<String>>;
}

/// Gateway to an engine exposed over HTTP.
///
/// Records are upserted with
/// `PUT {base}/data-sources/{data_source}/records/{record_id}`; the
/// original message body is the request body, untouched.
#[derive(Debug, Clone)]
pub struct HttpEngineGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngineGateway {
    /// Build the gateway. The engine configuration blob, when present,
    /// must at least be valid JSON; anything else is caught here rather
    /// than on the first record.
    pub fn new(base_url: &str, engine_config_json: Option<&str>) -> Result<Self> {
        if let Some(raw) = engine_config_json {
            let parsed: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
                LoaderError::config(format!("engine configuration is not valid JSON: {e}"))
            })?;
            debug!(
                keys = parsed.as_object().map(|o| o.len()).unwrap_or(0),
                "engine configuration accepted"
            );
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EngineGateway for HttpEngineGateway {
    async fn add_record(
        &self,
        data_source: &str,
        record_id: &str,
        payload: &[u8],
        load_id: &str,
        with_info: bool,
    ) -> Result<Option<String>> {
        let url = format!(
            "{}/data-sources/{}/records/{}",
            self.base_url, data_source, record_id
        );

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .query(&[("load_id", load_id)])
            .body(payload.to_vec());
        if with_info {
            request = request.query(&[("with_info", "true")]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LoaderError::downstream(data_source, record_id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LoaderError::downstream(
                data_source,
                record_id,
                format!("engine returned {status}: {detail}"),
            ));
        }

        if with_info {
            let info = response
                .text()
                .await
                .map_err(|e| LoaderError::downstream(data_source, record_id, e.to_string()))?;
            Ok(Some(info))
        } else {
            Ok(None)
        }
    }
}

/// Gateway that validates the call shape but loads nothing. Used for
/// dry runs.
#[derive(Debug, Default)]
pub struct NoopEngineGateway;

impl NoopEngineGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EngineGateway for NoopEngineGateway {
    async fn add_record(
        &self,
        data_source: &str,
        record_id: &str,
        _payload: &[u8],
        load_id: &str,
        with_info: bool,
    ) -> Result<Option<String>> {
        debug!(
            data_source = %data_source,
            record_id = %record_id,
            load_id = %load_id,
            "dry run: record accepted"
        );
        Ok(with_info.then(|| "{}".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_noop_gateway() {
        let gateway = NoopEngineGateway::new();
        let none = gateway
            .add_record("TEST", "1", b"{}", "load-1", false)
            .await
            .unwrap();
        assert!(none.is_none());
        let info = gateway
            .add_record("TEST", "1", b"{}", "load-1", true)
            .await
            .unwrap();
        assert_eq!(info.as_deref(), Some("{}"));
    }

    #[test]
    fn test_invalid_engine_config_json_rejected() {
        let err = HttpEngineGateway::new("http://localhost", Some("{not json}")).unwrap_err();
        assert!(matches!(err, LoaderError::Config(_)));
    }

    #[tokio::test]
    async fn test_add_record_puts_payload() {
        let server = MockServer::start().await;
        let payload = r#"{"DATA_SOURCE":"TEST","RECORD_ID":"1"}"#;

        Mock::given(method("PUT"))
            .and(path("/data-sources/TEST/records/1"))
            .and(query_param("load_id", "load-1"))
            .and(body_string(payload))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpEngineGateway::new(&server.uri(), None).unwrap();
        let result = gateway
            .add_record("TEST", "1", payload.as_bytes(), "load-1", false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_add_record_with_info_returns_body() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/data-sources/TEST/records/2"))
            .and(query_param("with_info", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"AFFECTED":[]}"#))
            .mount(&server)
            .await;

        let gateway = HttpEngineGateway::new(&server.uri(), None).unwrap();
        let info = gateway
            .add_record("TEST", "2", b"{}", "load-1", true)
            .await
            .unwrap();
        assert_eq!(info.as_deref(), Some(r#"{"AFFECTED":[]}"#));
    }

    #[tokio::test]
    async fn test_engine_failure_is_downstream_error() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500).set_body_string("engine on fire"))
            .mount(&server)
            .await;

        let gateway = HttpEngineGateway::new(&server.uri(), None).unwrap();
        let err = gateway
            .add_record("TEST", "3", b"{}", "load-1", false)
            .await
            .unwrap_err();
        match err {
            LoaderError::Downstream {
                data_source,
                record_id,
                message,
            } => {
                assert_eq!(data_source, "TEST");
                assert_eq!(record_id, "3");
                assert!(message.contains("500"));
            },
            other => panic!("expected downstream error, got {other}"),
        }
    }
}
