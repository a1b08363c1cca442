use crate::collector::{GroupSummary, LatencyStats, RunSummary, ScenarioRun};
use crate::schema::MeasurementRecord;
use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const CSV_HEADER: &str =
    "request_id,scenario,model,start_time,ttft_ms,total_latency_ms,avg_itl_ms,unit_count,status";

pub fn results_path(out_dir: impl AsRef<Path>, scenario: &str) -> PathBuf {
    let safe: String = scenario
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    out_dir.as_ref().join(format!("benchmark_results_{safe}.csv"))
}

/// One row per record, in the run's order. Overwrites `path`.
pub fn write_records_csv(path: &Path, records: &[MeasurementRecord]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let f = File::create(path).with_context(|| format!("create csv: {}", path.display()))?;
    let mut w = BufWriter::new(f);

    writeln!(w, "{CSV_HEADER}")?;
    for r in records {
        writeln!(
            w,
            "{},{},{},{:.6},{:.3},{:.3},{:.3},{},{}",
            escape_csv(&r.request_id),
            escape_csv(&r.scenario),
            escape_csv(&r.model),
            r.start_time,
            r.ttft_ms,
            r.total_latency_ms,
            r.avg_itl_ms,
            r.unit_count,
            r.status,
        )?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_run(out_dir: &Path, run: &ScenarioRun) -> anyhow::Result<PathBuf> {
    let path = results_path(out_dir, &run.name);
    write_records_csv(&path, &run.records)?;
    tracing::info!(path = %path.display(), rows = run.records.len(), "results saved");
    Ok(path)
}

pub fn write_summary_json(path: &Path, summaries: &[RunSummary]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create dir: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summaries)?;
    std::fs::write(path, json).with_context(|| format!("write summary: {}", path.display()))?;
    Ok(())
}

pub fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn fmt_stats(name: &str, s: &Option<LatencyStats>) -> String {
    match s {
        Some(s) => format!(
            "{name}: n={} mean={:.1} p50={:.1} p90={:.1} p99={:.1} max={:.1}",
            s.count, s.mean, s.p50, s.p90, s.p99, s.max
        ),
        None => format!("{name}: n=0"),
    }
}

fn group_lines(g: &GroupSummary) -> Vec<String> {
    vec![
        format!(
            "[{}] requests={} success={} empty={} fail={} error_rate={:.2}%",
            g.key,
            g.requests,
            g.success,
            g.empty,
            g.failed,
            g.error_rate * 100.0
        ),
        format!("    {}", fmt_stats("ttft_ms", &g.ttft_ms)),
        format!("    {}", fmt_stats("total_latency_ms", &g.total_latency_ms)),
        format!("    {}", fmt_stats("avg_itl_ms", &g.avg_itl_ms)),
    ]
}

/// Console "quick summary" of one run.
pub fn render_summary(s: &RunSummary) -> String {
    let mut lines = vec![format!("=== Quick Summary ({}) ===", s.scenario)];
    if s.overall.requests == 0 {
        lines.push("No data collected.".to_string());
        return lines.join("\n");
    }
    for g in &s.per_model {
        lines.extend(group_lines(g));
    }
    lines.extend(group_lines(&s.overall));
    lines.join("\n")
}
