use std::path::PathBuf;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use local_smtp_relay::config::RelayConfig;
use local_smtp_relay::{Relay, RelayDeps};

const DEFAULT_CONFIG_PATH: &str = "relay.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    eprintln!("📮 Local SMTP Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!("   Store: {}", config.store.directory.display());
    eprintln!(
        "   Upstream: {}:{}{}",
        config.forwarder.hostname,
        config.forwarder.port(),
        if config.forwarder.disable { " (disabled)" } else { "" }
    );
    if let Some(am) = &config.alertmanager {
        eprintln!("   Alertmanager: {}", am.base_url);
    }
    if let Some(llm) = &config.llm {
        eprintln!("   LLM: {}", llm.base_url);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let deps = RelayDeps::from_config(&config)?;
    let relay = Relay::start(config, deps, &cancel)
        .await
        .context("relay startup failed")?;

    let breaker = relay.breaker().clone();
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = breaker.tripped() => {
            error!("Forwarding failed permanently, new mail is refused until restart");
            cancel.cancelled().await;
        }
    }
    info!("Shutdown requested");

    relay.shutdown().await;
    Ok(())
}
