//! Fixed-concurrency sweeps for controlled-batch experiments.
//!
//! - TTFT phase: prefill latency per input length, few output tokens, queue
//!   drained by `concurrency` workers (1 = strictly sequential).
//! - ITL phase: decode latency per batch size, each batch sent all at once.

use crate::collector::{RunBudget, ScenarioRun};
use crate::config::SweepConfig;
use crate::executor::Executor;
use crate::generator::{RequestTemplate, TrafficGenerator};
use crate::schema::RequestSpec;
use crate::util::synth_prompt;

pub fn ttft_tag(input_len: u32) -> String {
    format!("ttft_in{input_len}")
}

pub fn itl_tag(batch: usize) -> String {
    format!("itl_batch{batch}")
}

fn specs(tag: &str, model: &str, template: &RequestTemplate, n: usize) -> Vec<RequestSpec> {
    (0..n)
        .map(|i| template.build(i as u64, format!("{}-{}", tag.to_uppercase(), i), tag, model.to_string()))
        .collect()
}

fn deterministic(input_len: u32, max_tokens: u32) -> RequestTemplate {
    RequestTemplate {
        prompt: synth_prompt(input_len),
        max_tokens,
        temperature: 0.0,
        ignore_eos: Some(true),
    }
}

pub async fn ttft_sweep<E: Executor>(
    gen: &TrafficGenerator<E>,
    cfg: &SweepConfig,
    model: &str,
) -> Vec<ScenarioRun> {
    let mut runs = Vec::with_capacity(cfg.input_lengths.len());
    for &len in &cfg.input_lengths {
        let tag = ttft_tag(len);
        tracing::info!(input_len = len, samples = cfg.samples, concurrency = cfg.concurrency, "ttft sweep step");
        let template = deterministic(len, cfg.ttft_max_tokens);
        let records = gen
            .run_queue(specs(&tag, model, &template, cfg.samples), cfg.concurrency)
            .await;
        runs.push(ScenarioRun::new(tag, RunBudget::Tasks(cfg.samples), records));
    }
    runs
}

pub async fn itl_sweep<E: Executor>(
    gen: &TrafficGenerator<E>,
    cfg: &SweepConfig,
    model: &str,
) -> Vec<ScenarioRun> {
    let template = deterministic(cfg.itl_input_len, cfg.itl_output_len);
    let mut runs = Vec::with_capacity(cfg.batch_sizes.len());
    for &batch in &cfg.batch_sizes {
        let tag = itl_tag(batch);
        tracing::info!(batch, input_len = cfg.itl_input_len, output_len = cfg.itl_output_len, "itl sweep step");
        // one worker per request: the whole batch is in flight together
        let records = gen.run_queue(specs(&tag, model, &template, batch), batch).await;
        runs.push(ScenarioRun::new(tag, RunBudget::Tasks(batch), records));
    }
    runs
}
