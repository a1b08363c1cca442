use anyhow::Context;
use clap::Parser;
use llmload_server_mock::{router, Behavior, MockConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(about = "Mock streaming completions endpoint")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8001")]
    addr: SocketAddr,

    #[arg(long, default_value_t = 50)]
    first_token_ms: u64,

    #[arg(long, default_value_t = 10)]
    token_ms: u64,

    /// tokens per response when the request omits max_tokens
    #[arg(long, default_value_t = 16)]
    tokens: u32,

    /// per-model override, e.g. `--behavior Chatbot-C=503` or `--behavior Chatbot-B=hang`
    #[arg(long = "behavior", value_parser = parse_override)]
    behaviors: Vec<(String, Behavior)>,
}

fn parse_override(s: &str) -> anyhow::Result<(String, Behavior)> {
    let (model, b) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected MODEL=BEHAVIOR, got {s}"))?;
    Ok((model.to_string(), b.parse()?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let prom = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    let cfg = MockConfig {
        first_token_delay: Duration::from_millis(args.first_token_ms),
        token_delay: Duration::from_millis(args.token_ms),
        default_tokens: args.tokens,
        behaviors: args.behaviors.into_iter().collect(),
    };
    tracing::info!(?cfg, "mock config");

    let app = router(cfg, Some(prom)).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("bind {}", args.addr))?;
    tracing::info!("llmload-server-mock listening on http://{}", args.addr);
    axum::serve(listener, app).await?;
    Ok(())
}
