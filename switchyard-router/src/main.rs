// Switchyard router daemon: router and service ports, device trackers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use switchyard_router::trackers::{
    run_tracker, AndroidBackend, DeviceBackend, DeviceConnector, IosBackend, TrackerTiming,
    WinPhoneBackend,
};
use switchyard_router::{
    config, port_mapping, Config, DirectoryLocator, Listener, Router, RouterOptions,
    TokioLauncher,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "switchyard", version, about = "Connection router for on-demand services")]
struct Cli {
    /// Also append logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Config file (default: ~/.config/switchyard/config.toml, /etc/switchyard/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    verbose: bool,

    /// Open the router port in the host firewall and exit
    #[arg(long)]
    register_port_mapping: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        eprintln!("switchyard: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    init_logging(&cli)?;
    let cfg = config::load(cli.config.as_deref()).context("loading config")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(cli, cfg))
}

async fn run_async(cli: Cli, cfg: Config) -> anyhow::Result<()> {
    if cli.register_port_mapping {
        port_mapping::register_port_mapping(cfg.listen_port)
            .await
            .context("registering port mapping")?;
        return Ok(());
    }
    serve(cfg).await
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(level)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    let router = Router::new(
        RouterOptions {
            pending_timeout: cfg.pending_timeout(),
            service_start_timeout: cfg.service_start_timeout(),
            service_port: cfg.service_port,
        },
        Arc::new(DirectoryLocator::new(cfg.package_roots.clone())),
        Arc::new(TokioLauncher),
    );

    let main_listener = Listener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding router port {}", cfg.listen_port))?;
    let service_listener = if cfg.service_port != cfg.listen_port {
        let listener = Listener::bind(("127.0.0.1", cfg.service_port))
            .await
            .with_context(|| format!("binding service port {}", cfg.service_port))?;
        Some(listener)
    } else {
        None
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        service_port = cfg.service_port,
        roots = ?cfg.package_roots,
        "switchyard started"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|s| *s).await;
    };

    let connector: Arc<dyn DeviceConnector> = Arc::new(router.clone());
    let timing = TrackerTiming {
        poll_interval: cfg.trackers.poll_interval(),
        retry_interval: cfg.trackers.retry_interval(),
    };
    let mut trackers = JoinSet::new();
    for backend in tracker_backends(&cfg) {
        trackers.spawn(run_tracker(connector.clone(), backend, timing));
    }

    let main_router = router.clone();
    let main_task = tokio::spawn({
        let stop = stopped(stop_rx.clone());
        async move { main_router.serve(main_listener, stop).await }
    });
    let service_task = service_listener.map(|listener| {
        let service_router = router.clone();
        let stop = stopped(stop_rx.clone());
        tokio::spawn(async move { service_router.serve(listener, stop).await })
    });

    shutdown_signal().await?;
    info!("shutting down");
    stop_tx.send_replace(true);
    // Dropping a tracker drops its dial loops and device sessions with it.
    trackers.shutdown().await;
    let _ = main_task.await;
    if let Some(task) = service_task {
        let _ = task.await;
    }
    Ok(())
}

fn tracker_backends(cfg: &Config) -> Vec<Arc<dyn DeviceBackend>> {
    let t = &cfg.trackers;
    let mut out: Vec<Arc<dyn DeviceBackend>> = Vec::new();
    if t.android {
        out.push(Arc::new(AndroidBackend::new(t.adb_path.clone(), t.device_port)));
    }
    if t.ios {
        out.push(Arc::new(IosBackend::new(
            t.idevice_id_path.clone(),
            t.iproxy_path.clone(),
            t.device_port,
        )));
    }
    if t.winphone {
        out.push(Arc::new(WinPhoneBackend::new(t.ipoverusb_path.clone())));
    }
    out
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
