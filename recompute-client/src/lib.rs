use std::time::Duration;

use async_trait::async_trait;
use compute_cache::{ComputeOutput, RecomputeError, RecomputeGateway, RecomputeRequest};
use indicator_registry::DefinitionKind;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use ts_core::{SeriesPoint, TimeSeries};

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = "chart-workspace-recompute/0.1";

#[derive(Debug, Clone)]
pub struct RecomputeClientConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl RecomputeClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into()).filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for RecomputeClientConfig {
    fn default() -> Self {
        let base_url = std::env::var("RECOMPUTE_API_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let auth_token = std::env::var("RECOMPUTE_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self {
            base_url,
            auth_token,
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Failures while building the client. Per-request failures are `RecomputeError`s.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct RecomputeClient {
    config: RecomputeClientConfig,
    base: Url,
    http: reqwest::Client,
}

impl RecomputeClient {
    pub fn new(config: RecomputeClientConfig) -> Result<Self, ClientError> {
        let base = parse_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, base, http })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(RecomputeClientConfig::default())
    }

    pub fn config(&self) -> &RecomputeClientConfig {
        &self.config
    }

    pub fn endpoint(&self, kind: DefinitionKind) -> Result<Url, RecomputeError> {
        self.base
            .join(&endpoint_path(kind))
            .map_err(|e| RecomputeError::Transport(e.to_string()))
    }

    async fn post(&self, request: &RecomputeRequest) -> Result<String, RecomputeError> {
        let url = self.endpoint(request.kind)?;
        debug!(
            url = %url,
            definition_id = request.definition_id,
            symbol = %request.context.symbol,
            "posting recompute request"
        );
        let mut builder = self.http.post(url).json(&request_body(request));
        if let Some(token) = &self.config.auth_token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await.map_err(transport)?;
        if let Some(err) = classify_status(resp.status()) {
            warn!(
                definition_id = request.definition_id,
                status = resp.status().as_u16(),
                "recompute request rejected"
            );
            return Err(err);
        }
        resp.text().await.map_err(transport)
    }
}

#[async_trait]
impl RecomputeGateway for RecomputeClient {
    async fn recompute(&self, request: &RecomputeRequest) -> Result<ComputeOutput, RecomputeError> {
        let body = self.post(request).await?;
        parse_response(request.kind, &body)
    }
}

fn transport(err: reqwest::Error) -> RecomputeError {
    RecomputeError::Transport(err.to_string())
}

fn parse_base_url(raw: &str) -> Result<Url, ClientError> {
    let mut raw = raw.trim().to_string();
    // `Url::join` replaces the last path segment unless the base ends in '/'.
    if !raw.ends_with('/') {
        raw.push('/');
    }
    let url = Url::parse(&raw).map_err(|e| ClientError::InvalidBaseUrl {
        url: raw.clone(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ClientError::InvalidBaseUrl {
            url: raw,
            reason: "cannot be a base".to_string(),
        });
    }
    Ok(url)
}

pub fn endpoint_path(kind: DefinitionKind) -> String {
    format!("api/run-updated-{}/", kind.as_str())
}

fn id_field(kind: DefinitionKind) -> String {
    format!("{}_id", kind.as_str())
}

/// JSON body for one run: the definition id, the fully merged inputs and the
/// market context.
pub fn request_body(request: &RecomputeRequest) -> Value {
    let mut body = Map::new();
    body.insert(id_field(request.kind), request.definition_id.into());
    body.insert("inputs".to_string(), Value::Object(request.inputs.clone()));
    body.insert(
        "binance_symbol".to_string(),
        Value::String(request.context.symbol.clone()),
    );
    body.insert(
        "interval".to_string(),
        Value::String(request.context.interval.name()),
    );
    body.insert("end".to_string(), Value::String(request.context.end.clone()));
    Value::Object(body)
}

/// `None` for success. 404 is the only status that means the definition is gone.
pub fn classify_status(status: StatusCode) -> Option<RecomputeError> {
    if status == StatusCode::NOT_FOUND {
        Some(RecomputeError::NotFound)
    } else if status.is_success() {
        None
    } else {
        Some(RecomputeError::Status(status.as_u16()))
    }
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    indicator_result: Option<Vec<SeriesPoint>>,
    #[serde(default)]
    strategy_graph: Option<Vec<SeriesPoint>>,
    #[serde(default)]
    strategy_result: Option<Value>,
    #[serde(default)]
    prints: Option<Vec<Value>>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub fn parse_response(kind: DefinitionKind, body: &str) -> Result<ComputeOutput, RecomputeError> {
    let resp: RunResponse =
        serde_json::from_str(body).map_err(|e| RecomputeError::Decode(e.to_string()))?;

    if resp.status.as_deref() == Some("error") {
        let message = resp
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "evaluation failed".to_string());
        return Err(RecomputeError::Unavailable(message));
    }

    let prints = resp.prints.unwrap_or_default();
    let output = match kind {
        DefinitionKind::Indicator => {
            let points = resp.indicator_result.ok_or_else(|| {
                RecomputeError::Decode("missing indicator_result".to_string())
            })?;
            ComputeOutput::new(TimeSeries::from_unsorted(points), prints)
        }
        DefinitionKind::Strategy => {
            let points = resp
                .strategy_graph
                .ok_or_else(|| RecomputeError::Decode("missing strategy_graph".to_string()))?;
            let output = ComputeOutput::new(TimeSeries::from_unsorted(points), prints);
            match resp.strategy_result {
                Some(summary) if !summary.is_null() => output.with_summary(summary),
                _ => output,
            }
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use ts_core::{MarketContext, TimeFrame};

    fn request(kind: DefinitionKind) -> RecomputeRequest {
        RecomputeRequest {
            kind,
            definition_id: 42,
            inputs: json!({"len": 21, "src": "close"}).as_object().cloned().unwrap(),
            context: MarketContext::new("BTCUSDT", TimeFrame::Hours(4))
                .with_end("2024-03-01T00:00:00")
                .require()
                .unwrap(),
        }
    }

    #[test]
    fn body_uses_kind_specific_id_field() {
        let body = request_body(&request(DefinitionKind::Indicator));
        assert_eq!(
            body,
            json!({
                "indicator_id": 42,
                "inputs": {"len": 21, "src": "close"},
                "binance_symbol": "BTCUSDT",
                "interval": "4h",
                "end": "2024-03-01T00:00:00"
            })
        );

        let body = request_body(&request(DefinitionKind::Strategy));
        assert_eq!(body["strategy_id"], json!(42));
        assert!(body.get("indicator_id").is_none());
    }

    #[test]
    fn endpoints_join_onto_base_path() {
        let config = RecomputeClientConfig::new("https://api.example.com/v2");
        let client = RecomputeClient::new(config).unwrap();
        assert_eq!(
            client.endpoint(DefinitionKind::Indicator).unwrap().as_str(),
            "https://api.example.com/v2/api/run-updated-indicator/"
        );
        assert_eq!(
            client.endpoint(DefinitionKind::Strategy).unwrap().as_str(),
            "https://api.example.com/v2/api/run-updated-strategy/"
        );
    }

    #[test]
    fn rejects_unusable_base_url() {
        let err = RecomputeClient::new(RecomputeClientConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, ClientError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn blank_token_is_ignored() {
        let config = RecomputeClientConfig::new(DEFAULT_BASE_URL).with_auth_token("  ");
        assert_eq!(config.auth_token, None);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            Some(RecomputeError::NotFound)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(RecomputeError::Status(502))
        );
        assert!(classify_status(StatusCode::UNAUTHORIZED)
            .unwrap()
            .is_transient());
    }

    #[test]
    fn parses_indicator_response_sorted() {
        let body = r#"{
            "indicator_result": [
                {"time": 2000, "rsi": 40.0},
                {"time": 1000, "rsi": 55.5}
            ],
            "prints": ["crossed 50"]
        }"#;
        let out = parse_response(DefinitionKind::Indicator, body).unwrap();
        assert_eq!(out.result.len(), 2);
        assert_eq!(out.result.first().unwrap().time, 1000);
        assert_eq!(out.result.first().unwrap().value("rsi"), Some(&json!(55.5)));
        assert_eq!(out.prints, vec![json!("crossed 50")]);
        assert_eq!(out.summary, None);
    }

    #[test]
    fn parses_strategy_graph_and_summary() {
        let body = r#"{
            "strategy_graph": [{"time": 1000, "equity": 10000}],
            "strategy_result": {"trades": 3, "pnl": 12.5},
            "prints": null
        }"#;
        let out = parse_response(DefinitionKind::Strategy, body).unwrap();
        assert_eq!(out.result.len(), 1);
        assert!(out.prints.is_empty());
        assert_eq!(out.summary, Some(json!({"trades": 3, "pnl": 12.5})));
    }

    #[test]
    fn error_status_in_body_is_transient() {
        let body = r#"{"indicator_result": [], "status": "error", "message": "no candles"}"#;
        let err = parse_response(DefinitionKind::Indicator, body).unwrap_err();
        assert_eq!(err, RecomputeError::Unavailable("no candles".to_string()));
        assert!(err.is_transient());
    }

    #[test]
    fn missing_or_garbled_result_is_decode_error() {
        let err = parse_response(DefinitionKind::Indicator, r#"{"prints": []}"#).unwrap_err();
        assert!(matches!(err, RecomputeError::Decode(_)));
        let err = parse_response(DefinitionKind::Strategy, "<html>").unwrap_err();
        assert!(matches!(err, RecomputeError::Decode(_)));
    }

    /// Serves one canned HTTP response and hands back the raw request text.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn posts_to_indicator_endpoint_with_token() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"indicator_result": [{"time": 1, "v": 2}], "prints": []}"#,
        )
        .await;
        let client = RecomputeClient::new(
            RecomputeClientConfig::new(base).with_auth_token("secret"),
        )
        .unwrap();

        let out = client
            .recompute(&request(DefinitionKind::Indicator))
            .await
            .unwrap();
        assert_eq!(out.result.len(), 1);

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /api/run-updated-indicator/ "));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(raw.contains(r#""indicator_id":42"#));
    }

    #[tokio::test]
    async fn not_found_status_becomes_not_found() {
        let (base, server) = serve_once("404 Not Found", r#"{"detail": "gone"}"#).await;
        let client = RecomputeClient::new(RecomputeClientConfig::new(base)).unwrap();
        let err = client
            .recompute(&request(DefinitionKind::Strategy))
            .await
            .unwrap_err();
        assert_eq!(err, RecomputeError::NotFound);
        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /api/run-updated-strategy/ "));
    }

    #[tokio::test]
    async fn server_error_is_transient_status() {
        let (base, _server) = serve_once("500 Internal Server Error", "{}").await;
        let client = RecomputeClient::new(RecomputeClientConfig::new(base)).unwrap();
        let err = client
            .recompute(&request(DefinitionKind::Indicator))
            .await
            .unwrap_err();
        assert_eq!(err, RecomputeError::Status(500));
    }

    #[tokio::test]
    async fn integration_recompute_if_service_configured() -> Result<(), Box<dyn std::error::Error>> {
        if std::env::var("RECOMPUTE_API_URL").is_err() {
            return Ok(()); // skip when no service configured
        }
        let client = RecomputeClient::from_env()?;
        match client.recompute(&request(DefinitionKind::Indicator)).await {
            Ok(_) | Err(RecomputeError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
