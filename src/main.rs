use std::{path::{Path, PathBuf}, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

use cli::{Cli, Commands};
use config::{loading::{load_settings, LoadedSettings}, ConfigStore};
use discovery::IppProbeScanner;
use ipp_client::IppDevice;
use keepalive::{render::ColorBarsRenderer, Trigger};
use mqtt_client::{client::Bridge, models::ConnectionState};
use scheduler::Scheduler;
use service::{Collaborators, Service};
use state::StateStore;

mod cli;
mod config;
mod discovery;
mod ipp_client;
mod keepalive;
mod mqtt_client;
mod scheduler;
mod service;
mod state;

fn init_logging(filter: &str) {
    let mut builder = colog::default_builder();
    builder.parse_filters(filter);
    builder.init();
}

fn log_sources(sources: &[PathBuf]) {
    for source in sources {
        info!("Loaded configuration from {:?}", source);
    }
}

fn init_sentry(dsn: &str) -> sentry::ClientInitGuard {
    sentry::init((dsn, sentry::ClientOptions {
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let LoadedSettings { settings, sources } = load_settings(cli.config.as_deref()).context("Could not load settings")?;

    init_logging(&settings.log_filter);
    log_sources(&sources);
    let _sentry = settings.sentry_dsn.as_deref().filter(|dsn| !dsn.is_empty()).map(init_sentry);

    let mqtt = settings.mqtt.clone();
    let data_dir = settings.data_dir.clone();
    let config = Arc::new(ConfigStore::open(settings).context("Invalid configuration")?);
    let state = Arc::new(StateStore::open(&data_dir).context("Could not load the state file")?);

    let snapshot = config.current();
    let device = IppDevice::new(snapshot.ipp.ignore_tls_errors);
    let collaborators = Collaborators {
        telemetry: Arc::new(device.clone()),
        submitter: Arc::new(device.clone()),
        renderer: Arc::new(ColorBarsRenderer),
        scanner: Arc::new(IppProbeScanner::new(device.clone(), snapshot.discovery.candidates.clone(), snapshot.discovery.include_ipps)),
        device,
    };
    let initial = if mqtt.enabled { ConnectionState::Disconnected } else { ConnectionState::Disabled };
    let (connection_tx, connection_rx) = watch::channel(initial);
    let service = Arc::new(Service::new(config, state, collaborators, connection_rx));
    service.state().persist_or_degrade().await;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(service, cli.config, mqtt.enabled.then_some(mqtt), connection_tx).await?,
        Commands::Health => {
            for printer in &service.config().current().printers {
                if let Err(e) = service.poll_now(&printer.id).await {
                    warn!("{}", e);
                }
            }
            println!("{}", serde_json::to_string_pretty(&service.health())?);
        },
        Commands::Print { printer_id, if_due } => {
            let execution = match if_due {
                true => service.print_if_due(&printer_id, Trigger::Cli).await,
                false => service.force_print(&printer_id, Trigger::Cli).await,
            };
            println!("{}", serde_json::to_string_pretty(&execution?)?);
        },
        Commands::Poll { printer_id } => {
            let health = service.poll_now(&printer_id).await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        },
        Commands::Discover => {
            let printers = service.discover().await?;
            println!("{}", serde_json::to_string_pretty(&printers)?);
        },
        Commands::Dump { printer_id } => {
            for (name, value) in service.dump(&printer_id).await? {
                println!("{name}: {value}");
            }
        },
    }

    Ok(())
}

async fn run(service: Arc<Service>, config_file: Option<PathBuf>, mqtt: Option<config::models::Mqtt>, connection: watch::Sender<ConnectionState>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(service.clone());
    let scheduler_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { scheduler.run(shutdown).await }
    });
    let bridge_task = mqtt.map(|mqtt| tokio::spawn(Arc::new(Bridge::new(service.clone(), mqtt, connection)).run(shutdown_rx.clone())));

    let mut hangup = signal(SignalKind::hangup()).context("Could not listen for SIGHUP")?;
    let mut terminate = signal(SignalKind::terminate()).context("Could not listen for SIGTERM")?;
    info!("printer-keepalive {} running", env!("CARGO_PKG_VERSION"));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => reload(&service, config_file.as_deref()),
        }
    }

    info!("Shutting down");
    shutdown_tx.send_replace(true);
    scheduler_task.await.context("Scheduler task panicked")?;
    if let Some(bridge_task) = bridge_task {
        bridge_task.await.context("MQTT bridge task panicked")?;
    }
    Ok(())
}

fn reload(service: &Service, config_file: Option<&Path>) {
    info!("SIGHUP received, reloading configuration");
    let settings = match load_settings(config_file) {
        Ok(LoadedSettings { settings, sources }) => {
            log_sources(&sources);
            settings
        },
        Err(e) => {
            error!("Could not load configuration, keeping the current one: {}", snafu::Report::from_error(e));
            return;
        },
    };
    if let Err(e) = service.reload(settings) {
        error!("Rejected new configuration: {}", snafu::Report::from_error(e));
    }
}
