//! Awaiting in-flight requests and reducing records to latency tables.
//!
//! Latency percentiles only look at `SUCCESS` records (ITL additionally needs
//! more than one unit). `EMPTY_RESPONSE` and `FAIL` are counted, not averaged in.

use crate::generator::InFlight;
use crate::schema::{MeasurementRecord, Status};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunBudget {
    Duration(Duration),
    Tasks(usize),
}

/// All records of one scenario invocation, ordered by launch sequence.
#[derive(Debug, Clone)]
pub struct ScenarioRun {
    pub name: String,
    pub budget: RunBudget,
    pub records: Vec<MeasurementRecord>,
}

impl ScenarioRun {
    pub fn new(name: impl Into<String>, budget: RunBudget, mut records: Vec<MeasurementRecord>) -> Self {
        records.sort_by_key(|r| r.seq);
        Self {
            name: name.into(),
            budget,
            records,
        }
    }

    pub fn summary(&self) -> RunSummary {
        let mut by_model: BTreeMap<&str, Vec<&MeasurementRecord>> = BTreeMap::new();
        for r in &self.records {
            by_model.entry(r.model.as_str()).or_default().push(r);
        }

        RunSummary {
            scenario: self.name.clone(),
            budget: self.budget,
            overall: GroupSummary::from_records("all", self.records.iter()),
            per_model: by_model
                .into_iter()
                .map(|(model, recs)| GroupSummary::from_records(model, recs.into_iter()))
                .collect(),
        }
    }
}

pub struct ResultCollector;

impl ResultCollector {
    /// Wait for every launched request, whichever finishes first.
    pub async fn collect(mut inflight: InFlight) -> ScenarioRun {
        let mut records = Vec::with_capacity(inflight.launched as usize);
        while let Some(res) = inflight.tasks.join_next().await {
            match res {
                Ok(rec) => records.push(rec),
                Err(e) => tracing::error!(scenario = %inflight.scenario, err = %e, "request task aborted"),
            }
        }
        let lost = (inflight.launched as usize).saturating_sub(records.len());
        if lost > 0 {
            tracing::warn!(scenario = %inflight.scenario, lost, "records missing from aborted tasks");
        }
        tracing::info!(scenario = %inflight.scenario, records = records.len(), "scenario complete");
        ScenarioRun::new(inflight.scenario, inflight.budget, records)
    }
}

// ---------------- statistics ----------------

/// Value at percentile `p` (0..=100) of an ascending slice, nearest rank.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = ((p / 100.0) * (n as f64 - 1.0)).round() as usize;
    sorted[rank.min(n - 1)]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencyStats {
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let count = values.len();
        Some(Self {
            count,
            mean: values.iter().sum::<f64>() / count as f64,
            min: values[0],
            max: values[count - 1],
            p50: percentile(&values, 50.0),
            p90: percentile(&values, 90.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
        })
    }
}

/// Counts and latency tables for one group of records (a model, or everything).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub key: String,
    pub requests: usize,
    pub success: usize,
    pub empty: usize,
    pub failed: usize,
    /// (empty + failed) / requests
    pub error_rate: f64,
    pub ttft_ms: Option<LatencyStats>,
    pub total_latency_ms: Option<LatencyStats>,
    pub avg_itl_ms: Option<LatencyStats>,
}

impl GroupSummary {
    pub fn from_records<'a>(key: &str, records: impl Iterator<Item = &'a MeasurementRecord>) -> Self {
        let mut s = GroupSummary {
            key: key.to_string(),
            requests: 0,
            success: 0,
            empty: 0,
            failed: 0,
            error_rate: 0.0,
            ttft_ms: None,
            total_latency_ms: None,
            avg_itl_ms: None,
        };
        let mut ttft = Vec::new();
        let mut total = Vec::new();
        let mut itl = Vec::new();

        for r in records {
            s.requests += 1;
            match r.status {
                Status::Success => {
                    s.success += 1;
                    ttft.push(r.ttft_ms);
                    total.push(r.total_latency_ms);
                    if r.unit_count > 1 {
                        itl.push(r.avg_itl_ms);
                    }
                }
                Status::EmptyResponse => s.empty += 1,
                Status::Fail => s.failed += 1,
            }
        }

        if s.requests > 0 {
            s.error_rate = (s.empty + s.failed) as f64 / s.requests as f64;
        }
        s.ttft_ms = LatencyStats::from_values(ttft);
        s.total_latency_ms = LatencyStats::from_values(total);
        s.avg_itl_ms = LatencyStats::from_values(itl);
        s
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub budget: RunBudget,
    pub overall: GroupSummary,
    pub per_model: Vec<GroupSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::generator::tests::FakeExec;
    use crate::generator::{RequestTemplate, TrafficGenerator};
    use crate::scheduler::RoundRobin;
    use std::sync::Arc;

    fn rec(seq: u64, model: &str, status: Status, ttft: f64, total: f64, units: u64) -> MeasurementRecord {
        let avg_itl_ms = if status == Status::Success && units > 1 {
            (total - ttft) / (units - 1) as f64
        } else {
            0.0
        };
        MeasurementRecord {
            seq,
            request_id: format!("RR-{seq}"),
            scenario: "round_robin".into(),
            model: model.into(),
            start_time: 0.0,
            ttft_ms: ttft,
            total_latency_ms: total,
            avg_itl_ms,
            unit_count: units,
            status,
        }
    }

    #[test]
    fn percentile_nearest_rank() {
        let v: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert_eq!(percentile(&v, 50.0), 51.0);
        assert_eq!(percentile(&v, 99.0), 99.0);
        assert_eq!(percentile(&v, 100.0), 100.0);
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7.0], 90.0), 7.0);
    }

    #[test]
    fn stats_of_values() {
        let s = LatencyStats::from_values(vec![30.0, 10.0, 20.0]).unwrap();
        assert_eq!(s.count, 3);
        assert_eq!((s.min, s.max, s.p50), (10.0, 30.0, 20.0));
        assert!((s.mean - 20.0).abs() < 1e-9);
        assert!(LatencyStats::from_values(vec![]).is_none());
    }

    #[test]
    fn failures_stay_out_of_percentiles() {
        let records = vec![
            rec(0, "A", Status::Success, 100.0, 400.0, 4),
            rec(1, "A", Status::Fail, 0.0, 0.0, 0),
            rec(2, "A", Status::EmptyResponse, 0.0, 0.0, 0),
            rec(3, "A", Status::Success, 200.0, 200.0, 1),
        ];
        let g = GroupSummary::from_records("A", records.iter());
        assert_eq!((g.requests, g.success, g.empty, g.failed), (4, 2, 1, 1));
        assert!((g.error_rate - 0.5).abs() < 1e-12);

        let ttft = g.ttft_ms.unwrap();
        assert_eq!(ttft.count, 2);
        assert_eq!(ttft.min, 100.0);
        // single-unit success has no ITL sample
        let itl = g.avg_itl_ms.unwrap();
        assert_eq!(itl.count, 1);
        assert!((itl.mean - 100.0).abs() < 1e-9);
    }

    #[test]
    fn all_failed_group_has_no_latency_tables() {
        let records = [rec(0, "B", Status::Fail, 0.0, 0.0, 0)];
        let g = GroupSummary::from_records("B", records.iter());
        assert_eq!(g.error_rate, 1.0);
        assert!(g.ttft_ms.is_none());
        assert!(g.total_latency_ms.is_none());
        assert!(g.avg_itl_ms.is_none());
    }

    #[test]
    fn summary_groups_by_model_sorted() {
        let run = ScenarioRun::new(
            "round_robin",
            RunBudget::Duration(Duration::from_secs(1)),
            vec![
                rec(2, "C", Status::Success, 1.0, 2.0, 2),
                rec(0, "A", Status::Success, 1.0, 2.0, 2),
                rec(1, "B", Status::Fail, 0.0, 0.0, 0),
                rec(3, "A", Status::Success, 3.0, 4.0, 2),
            ],
        );
        assert_eq!(run.records.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        let s = run.summary();
        assert_eq!(s.overall.requests, 4);
        let keys: Vec<&str> = s.per_model.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert_eq!(s.per_model[0].success, 2);
        assert_eq!(s.per_model[1].failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_waits_for_out_of_order_completions() {
        // earliest launch finishes last
        let exec = Arc::new(FakeExec::new(|seq| Duration::from_millis(5_000 - seq * 400)));
        let gen = TrafficGenerator::new(exec, RequestTemplate::from_config(&Config::default()));
        let mut rr = RoundRobin::new(vec!["A".into(), "B".into(), "C".into()], 2.0).unwrap();

        let inflight = gen.run_for(&mut rr, Duration::from_secs(5)).await;
        let run = ResultCollector::collect(inflight).await;

        assert_eq!(run.name, "round_robin");
        assert_eq!(run.records.len(), 10);
        let models: Vec<&str> = run.records.iter().map(|r| r.model.as_str()).collect();
        assert_eq!(models, ["A", "B", "C", "A", "B", "C", "A", "B", "C", "A"]);
        assert!(run.records.iter().all(|r| r.status == Status::Success));
    }
}
