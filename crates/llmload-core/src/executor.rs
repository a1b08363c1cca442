//! One streaming request, timed and classified into a [`MeasurementRecord`].

use crate::schema::{MeasurementRecord, RequestSpec, Status};
use crate::stream::{ArrivalEvent, StreamError, StreamReader};
use crate::util::{current_time_secs, since_ms};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};

/// Why a request did not produce a stream. Always folded into `Status::Fail`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("http {status}: {body}")]
    Protocol { status: StatusCode, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream framing: line longer than {0} bytes")]
    LineTooLong(usize),
}

impl From<StreamError<reqwest::Error>> for RequestError {
    fn from(e: StreamError<reqwest::Error>) -> Self {
        match e {
            StreamError::Body(e) => RequestError::Transport(e),
            StreamError::LineTooLong(n) => RequestError::LineTooLong(n),
        }
    }
}

/// Anything that turns a [`RequestSpec`] into a record. Must not fail: errors become `Status::Fail`.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, spec: RequestSpec) -> MeasurementRecord;
}

/// First/last unit times and unit count of one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArrivalTrace {
    pub units: u64,
    pub first: Option<Instant>,
    pub last: Option<Instant>,
}

impl ArrivalTrace {
    pub fn observe(&mut self, ev: ArrivalEvent) {
        if self.first.is_none() {
            self.first = Some(ev.at);
        }
        self.last = Some(ev.at);
        self.units += 1;
    }
}

/// Status classification and latency arithmetic.
///
/// - error            -> `Fail`, all latencies zero
/// - ok, no units     -> `EmptyResponse`
/// - ok, >= 1 unit    -> `Success`; ITL only when more than one unit arrived
pub fn classify(
    spec: &RequestSpec,
    start_time: f64,
    started: Instant,
    outcome: Result<ArrivalTrace, RequestError>,
) -> MeasurementRecord {
    let trace = match outcome {
        Ok(t) => t,
        Err(_) => return MeasurementRecord::failed(spec, start_time),
    };

    let mut rec = MeasurementRecord {
        seq: spec.seq,
        request_id: spec.id.clone(),
        scenario: spec.scenario.clone(),
        model: spec.model.clone(),
        start_time,
        ttft_ms: 0.0,
        total_latency_ms: 0.0,
        avg_itl_ms: 0.0,
        unit_count: trace.units,
        status: Status::EmptyResponse,
    };

    if let (Some(first), Some(last)) = (trace.first, trace.last) {
        rec.status = Status::Success;
        rec.ttft_ms = since_ms(started, first);
        rec.total_latency_ms = since_ms(started, last).max(rec.ttft_ms);
        if trace.units > 1 {
            rec.avg_itl_ms = (rec.total_latency_ms - rec.ttft_ms) / (trace.units - 1) as f64;
        }
    }
    rec
}

/// Streams completions over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct RequestExecutor {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(url: impl Into<String>, timeout: Duration, max_idle_per_host: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(max_idle_per_host)
            .tcp_nodelay(true)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    async fn exchange(&self, spec: &RequestSpec) -> Result<ArrivalTrace, RequestError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&spec.to_payload())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
            return Err(RequestError::Protocol { status, body });
        }

        let mut reader = StreamReader::new(Box::pin(resp.bytes_stream()));
        let mut trace = ArrivalTrace::default();
        while let Some(ev) = reader.next_event().await? {
            trace.observe(ev);
        }
        Ok(trace)
    }
}

#[async_trait]
impl Executor for RequestExecutor {
    async fn execute(&self, spec: RequestSpec) -> MeasurementRecord {
        let start_time = current_time_secs();
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.timeout, self.exchange(&spec)).await {
            Ok(r) => r,
            Err(_) => Err(RequestError::Timeout(self.timeout)),
        };
        if let Err(e) = &outcome {
            tracing::warn!(request_id = %spec.id, model = %spec.model, err = %e, "request failed");
        }

        let rec = classify(&spec, start_time, started, outcome);
        tracing::debug!(
            request_id = %rec.request_id,
            status = %rec.status,
            ttft_ms = rec.ttft_ms,
            total_ms = rec.total_latency_ms,
            units = rec.unit_count,
            "request done"
        );
        rec
    }
}
