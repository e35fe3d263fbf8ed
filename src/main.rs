use portcullis::{component::Component, config::Config, proxy::Proxy};
use std::path::Path;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_owned());
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        tracing::warn!(path = %config_path, "config not found, using defaults");
        Config::default()
    };

    let proxy = Proxy::new(config)?;

    tokio::select! {
        result = proxy.clone().run() => result,
        _ = tokio::signal::ctrl_c() => {
            proxy
                .shutdown(Component::text(
                    "Proxy is shutting down...\nPlease reconnect in a moment!",
                ))
                .await;
            Ok(())
        }
    }
}
