mod error;
mod ingress;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use relay_engine::{Engine, HandlerRegistry, RelayConfig};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "relay-server", about = "Event routing and batched dispatch server")]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(long, default_value = "relay.toml", env = "RELAY_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match RelayConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    tracing::info!(
        streams = config.streams.len(),
        queues = config.queues.len(),
        rules = config.rules.len(),
        dispatchers = config.dispatchers.len(),
        "bootstrapping engine"
    );
    let listen = config.listen.clone();
    let engine = match Engine::bootstrap(config, HandlerRegistry::new()).await {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!(error = %e, "failed to bootstrap engine");
            std::process::exit(1);
        }
    };

    let token = CancellationToken::new();
    let mut ingress = tokio::spawn({
        let engine = engine.clone();
        let token = token.clone();
        async move { ingress::serve(engine, &listen, token).await }
    });

    tracing::info!("relay-server started, press Ctrl+C to stop");

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => Some(result),
        // Ingress only returns on its own when it cannot bind.
        stopped = &mut ingress => {
            report(stopped);
            None
        }
    };
    if let Some(result) = interrupted {
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
        tracing::info!("shutting down...");
        token.cancel();
        report(ingress.await);
    }

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.shutdown().await,
        Err(_) => tracing::warn!("engine still referenced, skipping graceful shutdown"),
    }
}

fn report(stopped: Result<Result<(), ServerError>, tokio::task::JoinError>) {
    match stopped {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "ingress failed"),
        Err(e) => tracing::error!(error = %e, "ingress task panicked"),
    }
}
