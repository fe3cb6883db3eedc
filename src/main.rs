use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use subrelay::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "subrelay",
    version = env!("CARGO_PKG_VERSION"),
    about = "Reverse HTTP tunnel relay",
    long_about = "subrelay exposes clients behind NAT under subdomains and relays public HTTP requests to them over their control connection"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(
        short,
        long,
        env = "SUBRELAY_CONFIG",
        default_value = "subrelay.toml",
        global = true
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "SUBRELAY_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the relay
    Serve(ServeArgs),

    /// Write a default configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective configuration
    ShowConfig(ServeArgs),
}

/// Overrides applied on top of the configuration file
#[derive(Args, Debug)]
struct ServeArgs {
    /// Bind address for the client listener
    #[arg(long, env = "SUBRELAY_CLIENT_ADDR")]
    client_addr: Option<String>,

    #[arg(long, env = "SUBRELAY_CLIENT_PORT")]
    client_port: Option<u16>,

    /// Bind address for the HTTP listener
    #[arg(long, env = "SUBRELAY_SERVER_ADDR")]
    server_addr: Option<String>,

    #[arg(long, env = "SUBRELAY_SERVER_PORT")]
    server_port: Option<u16>,

    /// Hostname of the HTTP server, clients live at {id}.{host}
    #[arg(long, env = "SUBRELAY_HOST")]
    host: Option<String>,

    /// Allow clients to specify custom IDs
    #[arg(long)]
    custom_ids: bool,

    /// Password clients must present on registration
    #[arg(long, env = "SUBRELAY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Serve HTTPS on the public listener
    #[arg(long)]
    https: bool,

    /// Path to the certificate chain (PEM)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to the private key (PEM)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Port advertised in client URLs
    #[arg(long)]
    public_port: Option<u16>,

    /// Seconds to wait for a tunnel response, 0 waits forever
    #[arg(long)]
    response_timeout: Option<u64>,

    /// Bind address for the admin API
    #[arg(long)]
    admin_bind: Option<SocketAddr>,
}

impl ServeArgs {
    fn apply(self, config: &mut Config) {
        let http = &mut config.http;
        if let Some(v) = self.client_addr {
            http.client_addr = v;
        }
        if let Some(v) = self.client_port {
            http.client_port = v;
        }
        if let Some(v) = self.server_addr {
            http.server_addr = v;
        }
        if let Some(v) = self.server_port {
            http.server_port = v;
        }
        if let Some(v) = self.host {
            http.host = v;
        }
        if self.custom_ids {
            http.custom_ids = true;
        }
        if let Some(v) = self.password {
            http.password = v;
        }
        if self.https {
            http.tls.enabled = true;
        }
        if let Some(v) = self.cert {
            http.tls.cert = v;
        }
        if let Some(v) = self.key {
            http.tls.key = v;
        }
        if let Some(v) = self.public_port {
            http.public_port = Some(v);
        }
        if let Some(v) = self.response_timeout {
            http.response_timeout = v;
        }
        if let Some(v) = self.admin_bind {
            http.admin_addr = Some(v);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    match cli.command {
        Commands::Serve(args) => {
            let mut config = Config::load(&cli.config)?;
            args.apply(&mut config);

            info!("Starting subrelay {}", subrelay::VERSION);
            if config.http.password.is_empty() {
                warn!("No password configured, any client may register");
            }
            subrelay::run_server(config).await?;
        }

        Commands::Init { force } => {
            if cli.config.exists() && !force {
                warn!("{:?} already exists. Use --force to overwrite.", cli.config);
                return Ok(());
            }

            Config::default().save(&cli.config)?;
            info!("✓ Wrote default configuration to {:?}", cli.config);
        }

        Commands::ShowConfig(args) => {
            let mut config = Config::load(&cli.config)?;
            args.apply(&mut config);
            if !config.http.password.is_empty() {
                config.http.password = "********".to_string();
            }
            let rendered = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("{}", rendered);
        }
    }

    Ok(())
}
