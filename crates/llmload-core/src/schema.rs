// crates/llmload-core/src/schema.rs
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome class of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    /// 2xx 但一个输出单元都没有收到
    EmptyResponse,
    Fail,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::EmptyResponse => "EMPTY_RESPONSE",
            Status::Fail => "FAIL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to send. Built by the scheduling loop, consumed once by an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    /// Launch sequence within the scenario run (0-based).
    pub seq: u64,
    pub id: String,
    pub scenario: String,
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// vLLM extension: keep generating past EOS so output length is fixed.
    pub ignore_eos: Option<bool>,
}

impl RequestSpec {
    pub fn to_payload(&self) -> CompletionRequest<'_> {
        CompletionRequest {
            model: &self.model,
            prompt: &self.prompt,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: true,
            ignore_eos: self.ignore_eos,
        }
    }
}

/// JSON body of `POST /v1/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub max_tokens: u32,
    pub temperature: f64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_eos: Option<bool>,
}

/// Result of one completed (or failed) request.
///
/// `avg_itl_ms` is zero unless `status == Success && unit_count > 1`.
/// Every latency field is zero on `Fail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    #[serde(skip)]
    pub seq: u64,
    pub request_id: String,
    pub scenario: String,
    pub model: String,
    /// unix seconds at send time
    pub start_time: f64,
    pub ttft_ms: f64,
    pub total_latency_ms: f64,
    pub avg_itl_ms: f64,
    pub unit_count: u64,
    pub status: Status,
}

impl MeasurementRecord {
    pub fn failed(spec: &RequestSpec, start_time: f64) -> Self {
        Self {
            seq: spec.seq,
            request_id: spec.id.clone(),
            scenario: spec.scenario.clone(),
            model: spec.model.clone(),
            start_time,
            ttft_ms: 0.0,
            total_latency_ms: 0.0,
            avg_itl_ms: 0.0,
            unit_count: 0,
            status: Status::Fail,
        }
    }
}
