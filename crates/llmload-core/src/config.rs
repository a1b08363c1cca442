use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Share of traffic the first (dominant) model gets under the weighted scenario.
pub const DOMINANT_SHARE: f64 = 0.8;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-2;

/// Slowest accepted arrival rate; keeps every derived delay representable as a `Duration`.
pub const MIN_RATE: f64 = 1e-6;

/// 运行时配置：默认值对应单机 vLLM 多模型部署；可由 JSON 文件覆盖，再由 CLI 覆盖。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// completions endpoint, e.g. http://localhost:8001/v1/completions
    pub url: String,
    pub models: Vec<String>,

    /// base arrival rate (requests per second)
    pub target_rps: f64,
    pub duration_secs: u64,
    pub seed: u64,

    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,

    /// Upper bound on one request, connect through last frame.
    pub request_timeout_ms: u64,

    /// Weighted scenario distribution; `None` means dominant-first (0.8 + even split).
    pub weights: Option<Vec<f64>>,

    pub burst_interval_secs: u64,
    pub burst_size: usize,
    /// quiet period after the last request of a burst
    pub burst_cooldown_ms: u64,

    /// pause between scenarios when several run back to back
    pub scenario_pause_secs: u64,
    pub out_dir: String,

    pub sweep: SweepConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "http://localhost:8001/v1/completions".into(),
            models: vec![
                "Chatbot-A-large".into(),
                "Chatbot-B".into(),
                "Chatbot-C".into(),
            ],
            target_rps: 3.0,
            duration_secs: 60,
            seed: 42,
            prompt: "Define the Service Level Objective in one sentence.".into(),
            max_tokens: 50,
            temperature: 0.7,
            request_timeout_ms: 120_000,
            weights: None,
            burst_interval_secs: 10,
            burst_size: 10,
            burst_cooldown_ms: 1_000,
            scenario_pause_secs: 10,
            out_dir: "results".into(),
            sweep: SweepConfig::default(),
        }
    }
}

/// Fixed-concurrency sweep: TTFT vs input length, then ITL vs batch size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// model under test; defaults to the first entry of `Config::models`
    pub model: Option<String>,

    pub input_lengths: Vec<u32>,
    pub samples: usize,
    /// 1 = sequential, so samples don't interfere with each other
    pub concurrency: usize,
    pub ttft_max_tokens: u32,

    pub batch_sizes: Vec<usize>,
    pub itl_input_len: u32,
    pub itl_output_len: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            model: None,
            input_lengths: vec![128, 512, 1024, 2048],
            samples: 50,
            concurrency: 1,
            ttft_max_tokens: 16,
            batch_sizes: vec![1, 2, 4, 8, 16, 32, 64],
            itl_input_len: 512,
            itl_output_len: 128,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("parse config: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn burst_interval(&self) -> Duration {
        Duration::from_secs(self.burst_interval_secs)
    }

    pub fn burst_cooldown(&self) -> Duration {
        Duration::from_millis(self.burst_cooldown_ms)
    }

    pub fn sweep_model(&self) -> &str {
        self.sweep
            .model
            .as_deref()
            .or_else(|| self.models.first().map(String::as_str))
            .unwrap_or_default()
    }

    /// Explicit weights, or the dominant-first default for `models`.
    pub fn effective_weights(&self) -> Vec<f64> {
        match &self.weights {
            Some(w) => w.clone(),
            None => dominant_weights(self.models.len()),
        }
    }

    /// Everything a scenario needs must be sane before the first request goes out.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.url.trim().is_empty(), "url is empty");
        anyhow::ensure!(!self.models.is_empty(), "no models configured");
        anyhow::ensure!(
            self.models.iter().all(|m| !m.trim().is_empty()),
            "model names must be non-empty: {:?}",
            self.models
        );
        anyhow::ensure!(
            self.target_rps.is_finite() && self.target_rps >= MIN_RATE,
            "target_rps must be >= {MIN_RATE} (got {})",
            self.target_rps
        );
        anyhow::ensure!(self.duration_secs > 0, "duration_secs must be > 0");
        anyhow::ensure!(self.request_timeout_ms > 0, "request_timeout_ms must be > 0");
        anyhow::ensure!(self.burst_size > 0, "burst_size must be > 0");
        anyhow::ensure!(
            self.burst_interval_secs > 0,
            "burst_interval_secs must be > 0"
        );
        validate_weights(&self.effective_weights(), self.models.len())?;

        let sw = &self.sweep;
        anyhow::ensure!(sw.concurrency > 0, "sweep.concurrency must be > 0");
        anyhow::ensure!(
            sw.batch_sizes.iter().all(|b| *b > 0),
            "sweep.batch_sizes must all be > 0: {:?}",
            sw.batch_sizes
        );
        Ok(())
    }
}

/// `[0.8, 0.2/(n-1), ...]`; a single model gets everything.
pub fn dominant_weights(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let rest = (1.0 - DOMINANT_SHARE) / (n - 1) as f64;
            std::iter::once(DOMINANT_SHARE)
                .chain(std::iter::repeat(rest).take(n - 1))
                .collect()
        }
    }
}

pub fn validate_weights(weights: &[f64], n_models: usize) -> anyhow::Result<()> {
    anyhow::ensure!(
        weights.len() == n_models,
        "weights has {} entries but there are {} models",
        weights.len(),
        n_models
    );
    anyhow::ensure!(
        weights.iter().all(|w| w.is_finite() && *w >= 0.0),
        "weights must be finite and >= 0: {weights:?}"
    );
    let sum: f64 = weights.iter().sum();
    anyhow::ensure!(
        (sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE,
        "weights must sum to 1.0 (got {sum:.4})"
    );
    Ok(())
}

/// Named arrival pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    RoundRobin,
    Zipfian,
    Bursty,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::RoundRobin, Scenario::Zipfian, Scenario::Bursty];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::RoundRobin => "round_robin",
            Scenario::Zipfian => "zipfian",
            Scenario::Bursty => "bursty",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "round-robin" | "rr" => Ok(Scenario::RoundRobin),
            "zipfian" | "weighted" => Ok(Scenario::Zipfian),
            "bursty" | "burst" => Ok(Scenario::Bursty),
            _ => Err(anyhow::anyhow!(
                "invalid scenario: {s} (round_robin|zipfian|bursty)"
            )),
        }
    }
}
