use anyhow::Result;
use open_energy_dispatch::{config, controller, domain, hardware, repo, strategy, telemetry};
use config::Config;
use std::sync::Arc;
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use open_energy_dispatch::channel::ProcessImage;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    if cfg.ess.is_empty() {
        warn!("no ESS configured, the engine will only publish diagnostics");
    }

    let image = Arc::new(ProcessImage::new(cfg.engine.stale_after_cycles));
    let factory = hardware::DeviceFactory::new(cfg.engine.hardware);

    let (telemetry, forwarder) =
        repo::TimeseriesForwarder::spawn(repo::sink_from_config(&cfg.telemetry), (&cfg.telemetry).into());

    let mut engine = controller::CycleEngine::new(cfg.engine.clone(), image).with_telemetry(telemetry);
    for ess_cfg in &cfg.ess {
        let ess = domain::Ess::new(ess_cfg.id.clone(), ess_cfg.kind);
        engine.add_ess(ess, ess_cfg.mode, factory.create_ess(ess_cfg));
    }
    for strategy in strategy::from_config(&cfg.strategies) {
        engine.add_strategy(strategy);
    }

    info!(
        ess = cfg.ess.len(),
        strategies = cfg.strategies.len(),
        hardware = ?cfg.engine.hardware,
        "starting Open Energy Dispatch"
    );

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let engine_task = tokio::spawn(async move {
        engine.run(token).await;
        engine.diagnostics()
    });

    telemetry::shutdown_signal().await;
    shutdown.cancel();

    let diagnostics = engine_task.await?;
    if let Err(e) = forwarder.await {
        warn!(error = %e, "telemetry forwarder ended abnormally");
    }

    warn!(
        cycles = diagnostics.cycles,
        overruns = diagnostics.overruns,
        read_failures = diagnostics.read_failures,
        write_failures = diagnostics.write_failures,
        "shutdown complete"
    );
    Ok(())
}
