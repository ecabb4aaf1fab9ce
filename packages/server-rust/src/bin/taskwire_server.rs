//! Chat server built on `taskwire`.
//!
//! Answers the JSON protocol in [`taskwire_server::chat`] until Ctrl-C.

use std::time::Duration;

use clap::Parser;
use taskwire_server::chat::{ChatProcessor, DEFAULT_PORT};
use taskwire_server::{ClientConfig, Server, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line and environment configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "taskwire-server", version, about = "A taskwire chat server")]
struct Args {
    /// Address to bind.
    ///
    /// Environment variable: `TASKWIRE_HOST`
    #[arg(long, env = "TASKWIRE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    ///
    /// Environment variable: `TASKWIRE_PORT`
    #[arg(long, env = "TASKWIRE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of workers processing requests. At least 2.
    ///
    /// Environment variable: `TASKWIRE_WORKERS`
    #[arg(long, env = "TASKWIRE_WORKERS", default_value_t = taskwire_server::network::DEFAULT_POOL_SIZE)]
    workers: usize,

    /// Milliseconds a single accept waits before checking for shutdown.
    ///
    /// Environment variable: `TASKWIRE_ACCEPT_TIMEOUT_MS`
    #[arg(long, env = "TASKWIRE_ACCEPT_TIMEOUT_MS", default_value_t = 1000)]
    accept_timeout_ms: u64,

    /// Largest accepted message in bytes.
    ///
    /// Environment variable: `TASKWIRE_MAX_FRAME_LENGTH`
    #[arg(long, env = "TASKWIRE_MAX_FRAME_LENGTH", default_value_t = taskwire_server::network::DEFAULT_MAX_FRAME_LENGTH)]
    max_frame_length: usize,

    /// Seconds to wait for workers to drain on shutdown.
    ///
    /// Environment variable: `TASKWIRE_SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "TASKWIRE_SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    shutdown_timeout_secs: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            pool_size: self.workers,
            accept_timeout: Duration::from_millis(self.accept_timeout_ms),
            client: ClientConfig {
                max_frame_length: self.max_frame_length,
                ..ClientConfig::default()
            },
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let server = Server::builder()
        .config(args.server_config())
        .processor(ChatProcessor::new()?)
        .bind()
        .await?;

    server.start();
    info!(addr = %server.local_addr()?, workers = args.workers, "chat server started");

    tokio::signal::ctrl_c().await?;

    server.stop();
    let timeout = Duration::from_secs(args.shutdown_timeout_secs);
    if server.join(Some(timeout)).await {
        info!("server shut down successfully");
    } else {
        warn!(?timeout, "server did not shut down in time");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_chat_protocol() {
        let args = Args::parse_from(["taskwire-server"]);
        let config = args.server_config();
        assert_eq!(config.port, 39722);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.accept_timeout, Duration::from_secs(1));
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "taskwire-server",
            "--port",
            "4000",
            "--workers",
            "3",
            "--max-frame-length",
            "1024",
        ]);
        let config = args.server_config();
        assert_eq!(config.port, 4000);
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.client.max_frame_length, 1024);
    }
}
