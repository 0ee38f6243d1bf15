use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use commandrig::client::DaemonClient;
use commandrig::config::{self, Config};
use commandrig::daemon::computer::ShellComputer;
use commandrig::daemon::side_channel::DaemonSettings;
use commandrig::daemon::{DaemonState, create_app};
use commandrig::provisioner::Provisioner;

#[derive(Parser)]
#[command(name = "commandrig", about = "Provision remote machines and control them over HTTP")]
enum Cli {
    /// Run the control daemon (default when no subcommand is given)
    #[command(alias = "serve")]
    Daemon {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Overrides DAEMON_PORT
        #[arg(long)]
        port: Option<u16>,
        /// Overrides DAEMON_TOKEN
        #[arg(long)]
        token: Option<String>,
        /// YAML file with VNC/RDP executables and command templates
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Provision a machine, wait for its daemon, and tear it down on Ctrl-C
    Up {
        /// YAML provisioner config
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Daemon {
            host: "0.0.0.0".to_string(),
            port: None,
            token: None,
            settings: None,
        }
    } else {
        Cli::parse()
    };

    let config = Config::from_env();
    init_tracing();
    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: false,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Daemon {
            host,
            port,
            token,
            settings,
        } => run_daemon(config, host, port, token, settings).await,
        Cli::Up { config: path } => run_up(path).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("commandrig=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

async fn run_daemon(
    mut config: Config,
    host: String,
    port: Option<u16>,
    token: Option<String>,
    settings: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        config.token = Some(token);
    }

    let settings = match settings {
        Some(path) => config::load_daemon_settings(&path)?,
        None => DaemonSettings::default(),
    };

    let (token, generated) = config.resolve_token()?;
    if generated {
        println!("Generated API token: {token}");
    }

    let state = DaemonState::new(Arc::new(ShellComputer), settings, token);
    let app = create_app(state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("{host}:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_up(path: PathBuf) -> Result<(), Box<dyn Error>> {
    let provisioner_config = config::load_provisioner_config(&path)?;
    let provisioner = Provisioner::new(provisioner_config)?;
    let mut client = DaemonClient::new(provisioner);

    let interrupted = tokio::select! {
        started = client.start() => {
            let session = started?;
            println!("Daemon ready at {}", session.base_url());
            false
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            true
        }
    };
    if interrupted {
        // Dropping the start future queued cleanup of any partial resource;
        // close waits for it and releases anything already recorded.
        tracing::info!("interrupted during provisioning, tearing down");
        client.close().await?;
        return Ok(());
    }

    println!("API token: {}", client.provisioner().token());
    println!("Press Ctrl-C to tear down.");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("tearing down");
    client.close().await?;
    Ok(())
}
