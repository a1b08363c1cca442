//! Arrival strategies: which model goes next, and how long to wait after it.
//!
//! A scheduler is a pure decision source. It never sleeps and never reads the
//! clock itself; the caller passes the elapsed time since scenario start, which
//! keeps every strategy drivable in virtual time (see [`plan_arrivals`]).

use crate::config::{Config, Scenario, MIN_RATE};
use crate::util::period;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrivalKind {
    /// steady-state arrival of round robin / weighted
    Regular,
    /// low-rate traffic between bursts
    Background,
    Burst,
}

/// One emission decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub model: String,
    /// Wait after launching this request before asking for the next one.
    pub delay: Duration,
    pub kind: ArrivalKind,
}

pub trait ArrivalScheduler: Send {
    fn scenario(&self) -> Scenario;

    /// Next decision for a launch happening `elapsed` after scenario start.
    fn next_arrival(&mut self, elapsed: Duration) -> Arrival;
}

/// Request id prefix per arrival kind, e.g. `RR-0`, `ZIPF-7`, `BURST-12`.
pub fn id_prefix(scenario: Scenario, kind: ArrivalKind) -> &'static str {
    match (scenario, kind) {
        (_, ArrivalKind::Burst) => "BURST",
        (_, ArrivalKind::Background) => "BG",
        (Scenario::RoundRobin, _) => "RR",
        (Scenario::Zipfian, _) => "ZIPF",
        (Scenario::Bursty, _) => "BG",
    }
}

/// One RNG per scenario run, derived from the base seed.
pub fn seeded_rng(seed: u64, scenario: Scenario) -> StdRng {
    let salt = match scenario {
        Scenario::RoundRobin => 0,
        Scenario::Zipfian => 1,
        Scenario::Bursty => 2,
    };
    StdRng::seed_from_u64(seed.wrapping_add(salt))
}

pub fn build_scheduler(
    scenario: Scenario,
    cfg: &Config,
    rng: StdRng,
) -> anyhow::Result<Box<dyn ArrivalScheduler>> {
    let models = cfg.models.clone();
    Ok(match scenario {
        Scenario::RoundRobin => Box::new(RoundRobin::new(models, cfg.target_rps)?),
        Scenario::Zipfian => Box::new(Weighted::new(
            models,
            &cfg.effective_weights(),
            cfg.target_rps,
            rng,
        )?),
        Scenario::Bursty => Box::new(Bursty::new(
            models,
            cfg.target_rps,
            BurstShape {
                interval: cfg.burst_interval(),
                size: cfg.burst_size,
                cooldown: cfg.burst_cooldown(),
            },
            rng,
        )?),
    })
}

fn check_common(models: &[String], rate: f64) -> anyhow::Result<()> {
    anyhow::ensure!(!models.is_empty(), "scheduler needs at least one model");
    anyhow::ensure!(
        rate.is_finite() && rate >= MIN_RATE,
        "target rate must be >= {MIN_RATE} (got {rate})"
    );
    Ok(())
}

// ---------------- round robin ----------------

/// `models[i mod n]` at a fixed `1/rate` spacing. No randomness.
#[derive(Debug)]
pub struct RoundRobin {
    models: Vec<String>,
    period: Duration,
    next: usize,
}

impl RoundRobin {
    pub fn new(models: Vec<String>, rate: f64) -> anyhow::Result<Self> {
        check_common(&models, rate)?;
        Ok(Self {
            models,
            period: period(rate),
            next: 0,
        })
    }
}

impl ArrivalScheduler for RoundRobin {
    fn scenario(&self) -> Scenario {
        Scenario::RoundRobin
    }

    fn next_arrival(&mut self, _elapsed: Duration) -> Arrival {
        let model = self.models[self.next % self.models.len()].clone();
        self.next += 1;
        Arrival {
            model,
            delay: self.period,
            kind: ArrivalKind::Regular,
        }
    }
}

// ---------------- weighted / poisson ----------------

/// Weighted model choice with exponential (Poisson-process) spacing.
///
/// Model and delay are drawn from the same generator, model first, so a fixed
/// seed reproduces the whole sequence.
#[derive(Debug)]
pub struct Weighted {
    models: Vec<String>,
    dist: WeightedIndex<f64>,
    rate: f64,
    rng: StdRng,
}

impl Weighted {
    pub fn new(models: Vec<String>, weights: &[f64], rate: f64, rng: StdRng) -> anyhow::Result<Self> {
        check_common(&models, rate)?;
        crate::config::validate_weights(weights, models.len())?;
        let dist = WeightedIndex::new(weights)
            .map_err(|e| anyhow::anyhow!("invalid weights {weights:?}: {e}"))?;
        Ok(Self {
            models,
            dist,
            rate,
            rng,
        })
    }
}

impl ArrivalScheduler for Weighted {
    fn scenario(&self) -> Scenario {
        Scenario::Zipfian
    }

    fn next_arrival(&mut self, _elapsed: Duration) -> Arrival {
        let model = self.models[self.dist.sample(&mut self.rng)].clone();
        let delay = exp_interval(&mut self.rng, self.rate);
        Arrival {
            model,
            delay,
            kind: ArrivalKind::Regular,
        }
    }
}

/// Exponential inter-arrival with mean `1/rate`, via inverse CDF `-ln(U)/rate`.
pub fn exp_interval(rng: &mut StdRng, rate: f64) -> Duration {
    let mut u: f64 = rng.gen();
    if u <= 0.0 {
        u = 1e-12;
    }
    Duration::from_secs_f64(-u.ln() / rate)
}

// ---------------- bursty ----------------

#[derive(Debug, Clone, Copy)]
pub struct BurstShape {
    pub interval: Duration,
    pub size: usize,
    pub cooldown: Duration,
}

impl Default for BurstShape {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            size: 10,
            cooldown: Duration::from_secs(1),
        }
    }
}

/// Background traffic at half the base rate, plus a burst of `size`
/// back-to-back requests at every `interval` boundary (never at t=0).
#[derive(Debug)]
pub struct Bursty {
    models: Vec<String>,
    background: Duration,
    shape: BurstShape,
    /// next boundary that has not fired yet
    next_boundary: Duration,
    /// burst requests still to emit
    pending: usize,
    bursts_fired: u64,
    rng: StdRng,
}

impl Bursty {
    pub fn new(models: Vec<String>, rate: f64, shape: BurstShape, rng: StdRng) -> anyhow::Result<Self> {
        check_common(&models, rate)?;
        anyhow::ensure!(shape.size > 0, "burst size must be > 0");
        anyhow::ensure!(!shape.interval.is_zero(), "burst interval must be > 0");
        Ok(Self {
            models,
            background: period(rate / 2.0),
            next_boundary: shape.interval,
            shape,
            pending: 0,
            bursts_fired: 0,
            rng,
        })
    }

    pub fn bursts_fired(&self) -> u64 {
        self.bursts_fired
    }

    fn pick(&mut self) -> String {
        let i = self.rng.gen_range(0..self.models.len());
        self.models[i].clone()
    }

    fn maybe_fire(&mut self, elapsed: Duration) {
        if self.pending > 0 || elapsed < self.next_boundary {
            return;
        }
        let interval = self.shape.interval.as_nanos();
        let due = (self.next_boundary.as_nanos() / interval) as u64;
        let reached = (elapsed.as_nanos() / interval) as u64;
        if reached > due {
            tracing::warn!(
                elapsed_s = elapsed.as_secs_f64(),
                skipped = reached - due,
                "scheduler overslept burst boundaries; firing once"
            );
        }
        self.next_boundary = self.shape.interval * (reached as u32 + 1);
        self.pending = self.shape.size;
        self.bursts_fired += 1;
        tracing::info!(
            at_s = elapsed.as_secs_f64(),
            boundary = reached,
            size = self.shape.size,
            "burst incoming"
        );
    }
}

impl ArrivalScheduler for Bursty {
    fn scenario(&self) -> Scenario {
        Scenario::Bursty
    }

    fn next_arrival(&mut self, elapsed: Duration) -> Arrival {
        self.maybe_fire(elapsed);

        if self.pending > 0 {
            self.pending -= 1;
            let delay = if self.pending == 0 {
                self.shape.cooldown
            } else {
                Duration::ZERO
            };
            return Arrival {
                model: self.pick(),
                delay,
                kind: ArrivalKind::Burst,
            };
        }

        Arrival {
            model: self.pick(),
            delay: self.background,
            kind: ArrivalKind::Background,
        }
    }
}

// ---------------- virtual-time plan ----------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedArrival {
    pub offset: Duration,
    pub model: String,
    pub kind: ArrivalKind,
}

/// Drive `scheduler` in virtual time for `duration`, the same way the
/// generator loop does, without sending anything.
pub fn plan_arrivals(scheduler: &mut dyn ArrivalScheduler, duration: Duration) -> Vec<PlannedArrival> {
    let mut out = Vec::new();
    let mut elapsed = Duration::ZERO;
    while elapsed < duration {
        let a = scheduler.next_arrival(elapsed);
        out.push(PlannedArrival {
            offset: elapsed,
            model: a.model,
            kind: a.kind,
        });
        elapsed += a.delay;
    }
    out
}
