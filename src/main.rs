#![allow(dead_code)]

mod collaborators;
mod config;
mod container;
mod crypto;
mod delivery;
mod error;
mod policy;
mod server;
mod storage;
mod upload;
mod vault;
mod zip_extract;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "ece-server",
    bin_name = "ece-server",
    about = "Encrypted content engine for a self-hosted NAS",
    version,
    author
)]
struct Cli {
    /// Base data directory all storage paths are resolved relative to
    #[arg(long, env = "ECE_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Vault directory (salt, config, wrapped DEK)
    #[arg(long, env = "ECE_VAULT_DIR")]
    vault_dir: Option<PathBuf>,

    /// Enable X-Accel-Redirect offload for cleartext downloads
    #[arg(long, env = "ECE_OFFLOAD_ENABLED")]
    offload_enabled: bool,

    /// Internal location prefix the reverse proxy maps to the base directory
    #[arg(long, env = "ECE_OFFLOAD_PREFIX", default_value = "/_internal")]
    offload_prefix: String,

    /// Maximum accepted size for non-chunked uploads, in bytes
    #[arg(long, env = "ECE_UPLOAD_CAP_BYTES", default_value_t = 2 * 1024 * 1024 * 1024)]
    upload_cap_bytes: u64,

    /// Bind address
    #[arg(short = 'b', long, env = "ECE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on
    #[arg(short = 'p', long, env = "ECE_PORT", default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("nas_ece=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let base_dir = cli.base_dir.unwrap_or_else(|| std::env::temp_dir().join("nas-ece").join("data"));
    let vault_dir = cli.vault_dir.unwrap_or_else(|| std::env::temp_dir().join("nas-ece").join("vault"));
    std::fs::create_dir_all(&base_dir)?;
    std::fs::create_dir_all(&vault_dir)?;

    let config = config::EceConfig::new(
        base_dir,
        vault_dir,
        cli.offload_enabled,
        cli.offload_prefix,
        cli.upload_cap_bytes,
        cli.bind.clone(),
        cli.port,
    )?;

    tracing::info!(base_dir = %config.base_dir.display(), port = config.port, "starting encrypted content engine");

    let state = Arc::new(server::AppState::new(config));
    let app = server::build_router(state);

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
