use tracing::error;
use tracing_subscriber::EnvFilter;

use rostrum::config::RelayConfig;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match RelayConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rostrum::server::run(cfg).await {
        error!("{e}");
        std::process::exit(1);
    }
}
