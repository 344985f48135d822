//! Lambda extension runner for the loopback credential sidecar.

use sidecar_runtime::{DrainOutcome, Sidecar, SidecarConfig, SidecarError};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), SidecarError> {
    setup_log();

    // Read the environment exactly once; everything downstream receives the
    // values explicitly.
    let config = SidecarConfig::from_env().inspect_err(|e| error!("{e}"))?;
    info!(
        extension = %config.extension_name,
        port = config.port,
        runtime_api = %config.runtime_api,
        "Starting token sidecar"
    );

    // Fatal startup errors (bind, registration) end the process here and the
    // host restarts the sandbox.
    let running = Sidecar::new(config)
        .start()
        .await
        .inspect_err(|e| error!("Startup failed: {e}"))?;
    info!(
        addr = %running.local_addr(),
        identity = %running.identity(),
        "Token sidecar ready"
    );

    let report = running
        .run()
        .await
        .inspect_err(|e| error!("Sidecar failed: {e}"))?;

    match report.drain {
        DrainOutcome::Drained => info!(
            reason = %report.reason,
            invocations = report.invocations,
            "Token sidecar shut down cleanly"
        ),
        DrainOutcome::Abandoned => warn!(
            reason = %report.reason,
            invocations = report.invocations,
            grace_ms = report.grace.as_millis() as u64,
            "Token sidecar shut down with requests still in flight"
        ),
    }

    Ok(())
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
