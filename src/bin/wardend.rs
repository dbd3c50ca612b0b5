// wardend - the supervisor daemon

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use warden::config::DaemonSettings;
use warden::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let settings = DaemonSettings::from_env().context("Invalid daemon settings")?;
    Daemon::new(settings)
        .run()
        .await
        .context("wardend exited with an error")?;
    Ok(())
}
