use anyhow::Result;
use phoebus::driver::EmsDriver;
use phoebus::config::Config;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    phoebus::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Phoebus EMS controller starting up");

    let mut driver = EmsDriver::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create driver: {}", e))?;

    driver
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Driver error: {}", e))?;

    info!("Driver shutdown complete");
    Ok(())
}
