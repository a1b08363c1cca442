//! Scheduling loop: turns arrival decisions into concurrently running requests.

use crate::collector::RunBudget;
use crate::config::Config;
use crate::executor::Executor;
use crate::scheduler::{id_prefix, ArrivalScheduler};
use crate::schema::{MeasurementRecord, RequestSpec};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Everything in a request except what the scheduler decides.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTemplate {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub ignore_eos: Option<bool>,
}

impl RequestTemplate {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            prompt: cfg.prompt.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            ignore_eos: None,
        }
    }

    pub fn build(&self, seq: u64, id: String, scenario: &str, model: String) -> RequestSpec {
        RequestSpec {
            seq,
            id,
            scenario: scenario.to_string(),
            model,
            prompt: self.prompt.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            ignore_eos: self.ignore_eos,
        }
    }
}

/// Requests launched by one duration-bounded run, still possibly running.
pub struct InFlight {
    pub scenario: String,
    pub budget: RunBudget,
    pub launched: u64,
    pub tasks: JoinSet<MeasurementRecord>,
}

pub struct TrafficGenerator<E> {
    executor: Arc<E>,
    template: RequestTemplate,
}

impl<E: Executor> TrafficGenerator<E> {
    pub fn new(executor: Arc<E>, template: RequestTemplate) -> Self {
        Self { executor, template }
    }

    /// Launch arrivals until `duration` of schedule has elapsed.
    ///
    /// Launches never wait for earlier requests. The next decision is due at the
    /// previous decision time plus its delay, so a late wakeup does not push the
    /// rest of the schedule back. Sequence counters live here only; tasks get an
    /// owned `RequestSpec`.
    pub async fn run_for(&self, scheduler: &mut dyn ArrivalScheduler, duration: Duration) -> InFlight {
        let scenario = scheduler.scenario();
        let name = scenario.name();
        tracing::info!(scenario = name, duration_s = duration.as_secs_f64(), "scenario start");

        let start = Instant::now();
        let mut due = start;
        let mut seq: u64 = 0;
        let mut max_lag = Duration::ZERO;
        let mut tasks = JoinSet::new();

        while due - start < duration {
            let now = Instant::now();
            max_lag = max_lag.max(now.saturating_duration_since(due));

            let arrival = scheduler.next_arrival(due - start);
            let id = format!("{}-{}", id_prefix(scenario, arrival.kind), seq);
            let spec = self.template.build(seq, id, name, arrival.model);
            let exec = Arc::clone(&self.executor);
            tasks.spawn(async move { exec.execute(spec).await });
            seq += 1;

            due += arrival.delay;
            if due > now {
                tokio::time::sleep_until(due).await;
            }
        }

        tracing::info!(
            scenario = name,
            launched = seq,
            in_flight = tasks.len(),
            max_lag_ms = max_lag.as_secs_f64() * 1000.0,
            "all requests dispatched, waiting for pending responses"
        );

        InFlight {
            scenario: name.to_string(),
            budget: RunBudget::Duration(duration),
            launched: seq,
            tasks,
        }
    }

    /// Drain `specs` with `workers` concurrent pull-and-execute loops.
    ///
    /// Records come back in completion order.
    pub async fn run_queue(&self, specs: Vec<RequestSpec>, workers: usize) -> Vec<MeasurementRecord> {
        let total = specs.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(specs)));
        let (tx, mut rx) = mpsc::channel::<MeasurementRecord>(total.max(1));

        // collector task
        let collector = tokio::spawn(async move {
            let mut out = Vec::with_capacity(total);
            while let Some(rec) = rx.recv().await {
                out.push(rec);
            }
            out
        });

        let mut pool = JoinSet::new();
        for _ in 0..workers.max(1) {
            let queue = Arc::clone(&queue);
            let exec = Arc::clone(&self.executor);
            let tx = tx.clone();
            pool.spawn(async move {
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some(spec) = next else { break };
                    let rec = exec.execute(spec).await;
                    // receiver outlives every worker
                    let _ = tx.send(rec).await;
                }
            });
        }
        drop(tx);

        while let Some(res) = pool.join_next().await {
            if let Err(e) = res {
                tracing::error!(err = %e, "queue worker aborted");
            }
        }

        match collector.await {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(err = %e, "record collector aborted");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Scenario;
    use crate::scheduler::{build_scheduler, plan_arrivals, seeded_rng, ArrivalKind, PlannedArrival, RoundRobin};
    use crate::schema::Status;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records launch offsets and answers after a per-call latency.
    pub(crate) struct FakeExec {
        pub t0: Instant,
        pub launches: std::sync::Mutex<Vec<(String, String, Duration)>>,
        pub latency: Box<dyn Fn(u64) -> Duration + Send + Sync>,
        pub status: Status,
        pub running: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl FakeExec {
        pub(crate) fn new(latency: impl Fn(u64) -> Duration + Send + Sync + 'static) -> Self {
            Self {
                t0: Instant::now(),
                launches: std::sync::Mutex::new(Vec::new()),
                latency: Box::new(latency),
                status: Status::Success,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Executor for FakeExec {
        async fn execute(&self, spec: RequestSpec) -> MeasurementRecord {
            self.launches.lock().unwrap().push((
                spec.id.clone(),
                spec.model.clone(),
                Instant::now() - self.t0,
            ));
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);

            let lat = (self.latency)(spec.seq);
            tokio::time::sleep(lat).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut rec = MeasurementRecord::failed(&spec, 0.0);
            if self.status == Status::Success {
                rec.status = Status::Success;
                rec.unit_count = 1;
                rec.ttft_ms = lat.as_secs_f64() * 1000.0;
                rec.total_latency_ms = rec.ttft_ms;
            }
            rec
        }
    }

    fn abc() -> Vec<String> {
        vec!["A".into(), "B".into(), "C".into()]
    }

    fn template() -> RequestTemplate {
        RequestTemplate::from_config(&Config::default())
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_launches_on_schedule_without_waiting() {
        // later requests finish first
        let exec = Arc::new(FakeExec::new(|seq| Duration::from_millis(3_000 - seq * 250)));
        let gen = TrafficGenerator::new(Arc::clone(&exec), template());
        let mut rr = RoundRobin::new(abc(), 2.0).unwrap();

        let inflight = gen.run_for(&mut rr, Duration::from_secs(5)).await;
        assert_eq!(inflight.launched, 10);
        assert_eq!(inflight.scenario, "round_robin");

        let launches = exec.launches.lock().unwrap().clone();
        assert_eq!(launches.len(), 10);
        for (n, (id, model, at)) in launches.iter().enumerate() {
            assert_eq!(id, &format!("RR-{n}"));
            assert_eq!(model, &abc()[n % 3]);
            assert_eq!(*at, Duration::from_millis(500) * n as u32);
        }
        // launching is not gated on completion
        assert!(exec.peak.load(Ordering::SeqCst) >= 5);
    }

    /// Launches sorted by sequence number: (id, model, offset).
    fn launches_in_order(exec: &FakeExec) -> Vec<(String, String, Duration)> {
        let mut l = exec.launches.lock().unwrap().clone();
        l.sort_by_key(|(id, _, _)| id.rsplit('-').next().unwrap().parse::<u64>().unwrap());
        l
    }

    fn assert_live_matches_plan(live: &[(String, String, Duration)], plan: &[PlannedArrival]) {
        assert_eq!(live.len(), plan.len());
        for ((id, model, at), p) in live.iter().zip(plan) {
            assert_eq!(model, &p.model, "{id}");
            // timer wheel granularity
            assert!(*at >= p.offset && *at <= p.offset + Duration::from_millis(1), "{id}: {at:?} vs {:?}", p.offset);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bursty_live_run_matches_virtual_plan() {
        let cfg = Config {
            models: abc(),
            ..Config::default()
        };
        let window = Duration::from_secs(31);
        let plan = {
            let mut s = build_scheduler(Scenario::Bursty, &cfg, seeded_rng(7, Scenario::Bursty)).unwrap();
            plan_arrivals(s.as_mut(), window)
        };

        let exec = Arc::new(FakeExec::new(|_| Duration::from_millis(80)));
        let gen = TrafficGenerator::new(Arc::clone(&exec), template());
        let mut s = build_scheduler(Scenario::Bursty, &cfg, seeded_rng(7, Scenario::Bursty)).unwrap();
        let inflight = gen.run_for(s.as_mut(), window).await;
        assert_eq!(inflight.launched as usize, plan.len());

        let live = launches_in_order(&exec);
        assert_live_matches_plan(&live, &plan);
        for ((id, _, _), p) in live.iter().zip(&plan) {
            let prefix = if p.kind == ArrivalKind::Burst { "BURST-" } else { "BG-" };
            assert!(id.starts_with(prefix), "{id} {:?}", p.kind);
        }
        let bursts = live.iter().filter(|(id, _, _)| id.starts_with("BURST-")).count();
        assert_eq!(bursts, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn weighted_live_run_matches_virtual_plan() {
        let cfg = Config {
            models: abc(),
            target_rps: 5.0,
            ..Config::default()
        };
        let window = Duration::from_secs(10);
        let plan = {
            let mut s = build_scheduler(Scenario::Zipfian, &cfg, seeded_rng(3, Scenario::Zipfian)).unwrap();
            plan_arrivals(s.as_mut(), window)
        };

        let exec = Arc::new(FakeExec::new(|seq| Duration::from_millis(10 + seq % 7 * 30)));
        let gen = TrafficGenerator::new(Arc::clone(&exec), template());
        let mut s = build_scheduler(Scenario::Zipfian, &cfg, seeded_rng(3, Scenario::Zipfian)).unwrap();
        gen.run_for(s.as_mut(), window).await;

        assert_live_matches_plan(&launches_in_order(&exec), &plan);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_loop() {
        let mut fake = FakeExec::new(|_| Duration::from_millis(10));
        fake.status = Status::Fail;
        let exec = Arc::new(fake);
        let gen = TrafficGenerator::new(Arc::clone(&exec), template());
        let mut rr = RoundRobin::new(abc(), 4.0).unwrap();

        let mut inflight = gen.run_for(&mut rr, Duration::from_secs(2)).await;
        assert_eq!(inflight.launched, 8);
        let mut n = 0;
        while let Some(rec) = inflight.tasks.join_next().await {
            assert_eq!(rec.unwrap().status, Status::Fail);
            n += 1;
        }
        assert_eq!(n, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_mode_is_bounded_by_workers() {
        let exec = Arc::new(FakeExec::new(|seq| Duration::from_millis(100 + seq * 7)));
        let gen = TrafficGenerator::new(Arc::clone(&exec), template());
        let t = template();
        let specs: Vec<RequestSpec> = (0..7)
            .map(|i| t.build(i, format!("Q-{i}"), "queue", "A".into()))
            .collect();

        let recs = gen.run_queue(specs, 2).await;
        assert_eq!(recs.len(), 7);
        assert_eq!(exec.peak.load(Ordering::SeqCst), 2);

        let mut seqs: Vec<u64> = recs.iter().map(|r| r.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..7).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_returns_nothing() {
        let exec = Arc::new(FakeExec::new(|_| Duration::ZERO));
        let gen = TrafficGenerator::new(exec, template());
        assert!(gen.run_queue(Vec::new(), 4).await.is_empty());
    }
}
