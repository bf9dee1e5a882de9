//! Server binary entry point

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use boreal_rdp_server::config::{Config, CredentialsBackend};
use boreal_rdp_server::creds::{
    Credentials, FileCredentials, OneTimeCredentials, SecretServiceCredentials, TpmCredentials,
};
use boreal_rdp_server::security;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "boreal-rdp-server")]
#[command(version, about = "Headless remote-desktop server", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/boreal-rdp-server/config.toml")]
    config: String,

    /// Listen address override
    #[arg(short, long, env = "BOREAL_RDP_LISTEN_ADDR")]
    listen: Option<String>,

    /// Listen port override
    #[arg(short, long, env = "BOREAL_RDP_PORT")]
    port: Option<u16>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "compact")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Starting boreal-rdp-server v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config: {e:#}; using defaults");
            Config::default()
        }
    };
    let config = config.with_overrides(args.listen.clone(), args.port);
    config.validate()?;
    debug!("Configuration: {config:?}");

    let credentials = build_credentials(&config).await?;
    match credentials
        .lookup(boreal_rdp_server::creds::CredentialsKind::Rdp)
        .await
    {
        Ok(_) => info!("RDP credentials available"),
        Err(boreal_rdp_server::creds::CredentialsError::NotFound) => {
            warn!("No RDP credentials stored; clients cannot authenticate until they are set")
        }
        Err(e) => return Err(e.into()),
    }

    let tls = match security::load_configured_material(
        config.security.cert_path.as_deref(),
        config.security.key_path.as_deref(),
    )? {
        Some(material) => material,
        None => {
            info!("Generating self-signed TLS material");
            security::generate_self_signed("boreal-rdp-server")?
        }
    };
    debug!("TLS material ready ({} certificate(s))", tls.certificates.len());

    info!(
        "Listening on {}:{} (transport layer is provided by the embedding session)",
        config.server.listen_addr, config.server.port
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}

async fn build_credentials(config: &Config) -> Result<Box<dyn Credentials>> {
    let credentials: Box<dyn Credentials> = match config.credentials.backend {
        CredentialsBackend::File => Box::new(FileCredentials::new()?),
        CredentialsBackend::SecretService => Box::new(SecretServiceCredentials::new().await?),
        CredentialsBackend::Tpm => Box::new(TpmCredentials::new()?),
        CredentialsBackend::OneTime => Box::new(OneTimeCredentials::new()),
    };
    Ok(credentials)
}

fn init_logging(args: &Args) -> Result<()> {
    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("boreal_rdp_server={log_level},warn"))
    });

    match args.log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        }
    }

    Ok(())
}
