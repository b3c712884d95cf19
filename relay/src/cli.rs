use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use crate::{config::RelayConfig, server};

#[derive(Parser, Debug)]
#[command(name = "codedrop-relay")]
#[command(author, version, about = "Pairing relay for codedrop transfers", long_about = None)]
pub struct Args {
    /// TOML file with relay settings.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overriding the config file.
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Port to listen on, keeping the configured host.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,
}

impl Args {
    /// Config file values with command-line overrides applied.
    pub fn resolve(&self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.bind.set_port(port);
        }
        Ok(config)
    }
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let config = args.resolve()?;
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        "Session TTL {}s, sweep every {}s",
        config.session_ttl_secs, config.sweep_interval_secs
    );

    server::serve(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn flags_override_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind = \"127.0.0.1:4000\"\nsession_ttl_secs = 42").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::try_parse_from(["codedrop-relay", "--config", &path, "--port", "5000"])
            .unwrap();
        let config = args.resolve().unwrap();
        assert_eq!(config.bind, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.session_ttl_secs, 42);

        let args = Args::try_parse_from(["codedrop-relay", "--bind", "10.0.0.1:9000"]).unwrap();
        let bind = args.resolve().unwrap().bind;
        assert_eq!(bind.ip().to_string(), "10.0.0.1");
    }
}
