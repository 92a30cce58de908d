//! A mock volume service served behind the idempotent interception layer.
//!
//! Useful for exercising clients against the layer's serial-access and
//! idempotency behaviour without a real storage backend.

use clap::{Arg, ArgAction, Command};
use csi_idempotency::{mock::MockVolumeService, IdempotencyLayer};
use std::sync::Arc;
use tracing::info;

mod config;
mod server;

use config::MockConfig;

const DEFAULT_TIMEOUT: &str = "0s";
const DEFAULT_NODE_ID: &str = "mock-node";

/// Tracing with a stdout subscriber; RUST_LOG overrides the configured
/// level.
fn init_tracing(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Registry};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Command::new("csi-mock")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .short('e')
                .help("tcp:// or unix:// endpoint to serve on, defaults to $CSI_ENDPOINT"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .short('t')
                .env("X_CSI_IDEMP_TIMEOUT")
                .default_value(DEFAULT_TIMEOUT)
                .help("bounded wait for a volume's serial-access lock, 0 for non-blocking"),
        )
        .arg(
            Arg::new("require-volume")
                .long("require-volume")
                .env("X_CSI_IDEMP_REQUIRE_VOLUME")
                .action(ArgAction::SetTrue)
                .help("fail operations that name a volume which does not exist"),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .short('n')
                .default_value(DEFAULT_NODE_ID)
                .help("node id reported by the mock service"),
        )
        .arg(
            Arg::new("attributes")
                .long("attributes")
                .short('a')
                .env("X_CSI_MOCK_ATTRIBUTES")
                .help("key=value attributes stamped onto every created volume"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .short('l')
                .default_value("info")
                .help("default tracing level, overridden by RUST_LOG"),
        )
        .get_matches();

    MockConfig::initialize(&args)?;
    let cfg = MockConfig::get();
    init_tracing(cfg.log_level());

    let service = Arc::new(
        MockVolumeService::new(cfg.node_id()).with_attributes(cfg.attributes().clone()),
    );
    let layer = Arc::new(IdempotencyLayer::new(
        service.clone(),
        cfg.idempotency_options(),
    ));
    info!(node.id = cfg.node_id(), "mock volume service initialized");

    server::serve(layer, service).await
}
