use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use intelligence_adapter::bus::KafkaBus;
use intelligence_adapter::logging::init_logging;
use intelligence_adapter::{AdapterRuntime, HttpBackendGateway};
use resilience::{cancellation, CancellationSource};
use tracing::{error, info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config_rs::load_config().context("failed to load configuration")?;
    init_logging(&config.logging, &config.service.name)?;

    let gateway = HttpBackendGateway::new(&config.backend).context("failed to build backend client")?;
    let bus = KafkaBus::connect(&config.bus).context("failed to connect to the message bus")?;
    let consumer = Arc::new(bus.consumer);
    let producer = Arc::new(bus.producer);

    let runtime = AdapterRuntime::new(&config, consumer, producer.clone(), Arc::new(gateway));

    let (source, shutdown) = cancellation();
    tokio::spawn(wait_for_signal(source));

    let report = runtime.run(shutdown).await;

    if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
        warn!(error = %e, "Producer flush incomplete");
    }

    let snapshot = runtime.metrics().snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => info!(metrics = %json, "Final metrics snapshot"),
        Err(e) => warn!(error = %e, "Final metrics snapshot could not be encoded"),
    }

    match report {
        Ok(report) => {
            info!(
                dispatched = %report.dispatched,
                abandoned = %report.abandoned,
                "Intelligence adapter stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Intelligence adapter failed");
            Err(e.into())
        }
    }
}

async fn wait_for_signal(source: CancellationSource) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received, draining"),
                    _ = terminate.recv() => info!("SIGTERM received, draining"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT received, draining");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupt received, draining");
    }

    source.cancel();
}
