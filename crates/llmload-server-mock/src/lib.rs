//! Fake OpenAI-style completions endpoint that streams SSE frames on a timer.
//!
//! Per-model [`Behavior`] overrides let tests provoke every outcome the load
//! generator classifies: streamed tokens, non-2xx, empty 200 and a stalled stream.

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// `max_tokens` frames, then `[DONE]`
    Stream,
    /// reply with this status code and a short error body
    Status(u16),
    /// 200, body closed without a single frame
    Empty,
    /// 200, headers sent, then nothing ever arrives
    Hang,
}

impl FromStr for Behavior {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Behavior::Stream),
            "empty" => Ok(Behavior::Empty),
            "hang" => Ok(Behavior::Hang),
            code => {
                let code: u16 = code
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid behavior: {s} (stream|empty|hang|<status>)"))?;
                anyhow::ensure!((100..600).contains(&code), "invalid status code: {code}");
                Ok(Behavior::Status(code))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub first_token_delay: Duration,
    pub token_delay: Duration,
    /// used when the request carries no `max_tokens`
    pub default_tokens: u32,
    pub behaviors: HashMap<String, Behavior>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            first_token_delay: Duration::from_millis(50),
            token_delay: Duration::from_millis(10),
            default_tokens: 16,
            behaviors: HashMap::new(),
        }
    }
}

impl MockConfig {
    pub fn with_behavior(mut self, model: impl Into<String>, b: Behavior) -> Self {
        self.behaviors.insert(model.into(), b);
        self
    }

    fn behavior(&self, model: &str) -> Behavior {
        self.behaviors.get(model).cloned().unwrap_or(Behavior::Stream)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    model: String,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    stream: bool,
}

#[derive(Clone)]
struct MockState {
    cfg: Arc<MockConfig>,
    prom: Option<PrometheusHandle>,
}

/// `prom` is only set by the binary; tests run without a global recorder.
pub fn router(cfg: MockConfig, prom: Option<PrometheusHandle>) -> Router {
    let state = MockState {
        cfg: Arc::new(cfg),
        prom,
    };
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve on an ephemeral localhost port.
pub async fn spawn(cfg: MockConfig) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
    let app = router(cfg, None);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(err = %e, "mock server stopped");
        }
    });
    Ok((addr, handle))
}

fn token_frame(model: &str, i: u32, last: bool) -> String {
    serde_json::json!({
        "id": "cmpl-mock",
        "object": "text_completion",
        "model": model,
        "choices": [{
            "index": 0,
            "text": format!(" tok{i}"),
            "finish_reason": if last { Some("length") } else { None },
        }],
    })
    .to_string()
}

async fn completions(State(st): State<MockState>, Json(req): Json<CompletionBody>) -> Response {
    let behavior = st.cfg.behavior(&req.model);
    let outcome = match &behavior {
        Behavior::Stream => "stream",
        Behavior::Status(_) => "status",
        Behavior::Empty => "empty",
        Behavior::Hang => "hang",
    };
    metrics::counter!("mock_requests_total", "model" => req.model.clone(), "outcome" => outcome).increment(1);
    tracing::debug!(model = %req.model, outcome, "completion request");

    let tokens = req.max_tokens.unwrap_or(st.cfg.default_tokens);
    match behavior {
        Behavior::Status(code) => {
            let code = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, format!("mock failure for model {}", req.model)).into_response()
        }
        Behavior::Stream if !req.stream => {
            tokio::time::sleep(st.cfg.first_token_delay + st.cfg.token_delay * tokens.saturating_sub(1)).await;
            let text: String = (0..tokens).map(|i| format!(" tok{i}")).collect();
            Json(serde_json::json!({
                "id": "cmpl-mock",
                "object": "text_completion",
                "model": req.model,
                "choices": [{ "index": 0, "text": text, "finish_reason": "length" }],
            }))
            .into_response()
        }
        Behavior::Stream => {
            let cfg = Arc::clone(&st.cfg);
            let model = req.model;
            let stream = async_stream::stream! {
                for i in 0..tokens {
                    let wait = if i == 0 { cfg.first_token_delay } else { cfg.token_delay };
                    tokio::time::sleep(wait).await;
                    yield Ok::<_, Infallible>(Event::default().data(token_frame(&model, i, i + 1 == tokens)));
                }
                yield Ok(Event::default().data("[DONE]"));
            };
            Sse::new(stream).into_response()
        }
        Behavior::Empty => (StatusCode::OK, "").into_response(),
        Behavior::Hang => {
            let stream = async_stream::stream! {
                std::future::pending::<()>().await;
                yield Ok::<_, Infallible>(Event::default().data("[DONE]"));
            };
            Sse::new(stream).into_response()
        }
    }
}

async fn metrics(State(st): State<MockState>) -> impl IntoResponse {
    match &st.prom {
        Some(p) => (StatusCode::OK, p.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}
