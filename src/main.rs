//! Sensorium entry point: configuration load, task spawns, shutdown.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use sensorium::app::cli::Args;
use sensorium::app::logging;
use sensorium::config::{Config, ConfigDoc, Server};
use sensorium::hwmon::{Discovery, HwmonDiscovery};
use sensorium::sensor;
use sensorium::server::{Hub, UPDATE_QUEUE};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = args
        .log_level
        .clone()
        .map(|l| l.to_lowercase())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    logging::init_tracing(&filter);

    let discovery = HwmonDiscovery::new();

    if args.scan {
        let conf = discovery.scan(Server::default()).await?;
        let doc = conf.to_doc().await;
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    info!("sensorium v{} starting", env!("CARGO_PKG_VERSION"));

    let doc = match ConfigDoc::load(&args.config) {
        Ok(doc) => doc,
        Err(e) => {
            error!("cannot load config {:?}: {}", args.config, e);
            eprintln!("No usable configuration at {:?}.", args.config);
            eprintln!("Generate one with: sensorium --scan > {}", args.config.display());
            std::process::exit(1);
        }
    };
    let conf = Config::from_doc(&doc);

    let discovery: Arc<dyn Discovery> = Arc::new(discovery);
    for s in conf.all_sensors() {
        discovery.setup(&s).await;
    }

    let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE);
    sensor::start_all(&conf, &updates_tx).await;

    let (hub, inbound_rx, feedback_rx) = Hub::new(
        conf,
        doc,
        args.config.clone(),
        Arc::clone(&discovery),
        updates_tx,
    );

    tokio::spawn(Arc::clone(&hub).dispatch(inbound_rx));
    tokio::spawn(Arc::clone(&hub).render_updates(updates_rx));
    tokio::spawn(Arc::clone(&hub).run_sysinfo());
    tokio::spawn(Arc::clone(&hub).process_feedback(feedback_rx));

    // SIGHUP re-reads the log filter from the environment.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut sighup) = signal(SignalKind::hangup()) {
            tokio::spawn(async move {
                loop {
                    sighup.recv().await;
                    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
                    logging::set_level(&filter);
                }
            });
        }
    }

    tokio::select! {
        result = hub.serve() => {
            if let Err(e) = result {
                error!("server failed: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    hub.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
