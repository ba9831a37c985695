use anyhow::Result;
use discovery_zk::ZkClient;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{FileConfig, LogFormat, DEFAULT_CONFIG_PATH};

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SERVICE_DISCOVERY_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

fn tracing_init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let file_config = FileConfig::load(&path)?;
    tracing_init(file_config.log_format);

    info!("Starting service-discovery daemon with {}...", path.display());

    let client = ZkClient::connect(file_config.to_zk_config()?).await?;
    info!("Connected, root {}", client.root_path());

    if let Some(register) = &file_config.register {
        client
            .register(
                &register.service,
                &register.host,
                register.port,
                client.config().dial_options.clone(),
            )
            .await?;
        info!(
            "Registered {} at {}:{}",
            register.service, register.host, register.port
        );
    }

    let mut ticker = tokio::time::interval(file_config.poll_interval());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting...");
                break;
            }
            _ = ticker.tick() => report(&client, &file_config.watch).await,
        }
    }

    if file_config.register.is_some() {
        if let Err(e) = client.unregister().await {
            warn!("Unregister failed: {}", e);
        }
    }
    client.close().await;

    Ok(())
}

async fn report(client: &ZkClient, watch: &[String]) {
    for service in watch {
        match client.resolve_remote(service).await {
            Ok(addrs) if addrs.is_empty() => warn!("No instances of {}", service),
            Ok(addrs) => {
                let addrs: Vec<&str> = addrs.iter().map(|a| a.addr.as_str()).collect();
                info!("{} has {} instances: {:?}", service, addrs.len(), addrs);
            }
            Err(e) => error!("Error resolving {}: {}", service, e),
        }
    }

    let cached = client.local_conns().await;
    debug!("Connection cache holds {} services", cached.len());
}
