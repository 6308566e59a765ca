//! # tetherd
//!
//! tether server binary: loads settings, starts logging and the metrics
//! recorder, then serves the protocol socket and the health endpoint until
//! Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::Role;
use tether_server::accounts::AccountStore;
use tether_server::{ServerConfig, ServerContext, TetherServer};
use tether_settings::{TetherSettings, TlsSettings};
use tether_transport::tls;

/// How long open sessions get to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// tether protocol server.
#[derive(Parser, Debug)]
#[command(name = "tetherd", about = "tether protocol server")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Protocol port (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Health/metrics port (0 for auto-assign).
    #[arg(long)]
    health_port: Option<u16>,

    /// TLS certificate chain (PEM). Requires `--tls-key`.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM). Requires `--tls-cert`.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (e.g. `debug`).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    /// Create an admin account at startup. Requires `--admin-password`.
    #[arg(long, requires = "admin_password")]
    admin_user: Option<String>,

    /// Password for `--admin-user`.
    #[arg(long, requires = "admin_user")]
    admin_password: Option<String>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(port) = self.health_port {
            settings.server.health_port = port;
        }
        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            settings.server.tls = Some(TlsSettings {
                cert_path: cert.to_string_lossy().into_owned(),
                key_path: key.to_string_lossy().into_owned(),
            });
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings.clone().unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    tether_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics = tether_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let config = ServerConfig::from_settings(&settings.server);
    let ctx = ServerContext::in_memory();
    if let (Some(user), Some(password)) = (&args.admin_user, &args.admin_password) {
        let account = ctx
            .accounts
            .register(user, password, Role::Admin)
            .await
            .context("Failed to create admin account")?;
        tracing::info!(user_id = %account.user_id, username = %user, "admin account created");
    }

    let acceptor = config
        .tls
        .as_ref()
        .map(|paths| tls::acceptor(&paths.cert_path, &paths.key_path))
        .transpose()
        .context("Failed to configure TLS")?;

    let mut server = TetherServer::new(config, ctx).with_metrics(metrics);
    if let Some(acceptor) = acceptor {
        server = server.with_tls(acceptor);
    }

    let (addr, accept) = server.listen().await.context("Failed to bind protocol socket")?;
    let (health_addr, health) = server.listen_http().await.context("Failed to bind health endpoint")?;
    tracing::info!(
        %addr,
        %health_addr,
        tls = server.config().tls.is_some(),
        "tetherd listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(Some(SHUTDOWN_GRACE)).await;
    let _ = accept.await;
    let _ = health.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
