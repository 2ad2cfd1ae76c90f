use aphrodite_loadbalancer::admin_listener::AdminListener;
use aphrodite_loadbalancer::config::LoadBalancerConfig;
use aphrodite_loadbalancer::dispatch::Dispatcher;
use aphrodite_loadbalancer::health::HealthProber;
use aphrodite_loadbalancer::listener::Listener;
use aphrodite_loadbalancer::service::ProxyService;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Weighted, path-aware load balancer for inference endpoints.
#[derive(Parser, Debug)]
#[command(name = "aphrodite-loadbalancer", version, about)]
struct Cli {
    /// Configuration file (YAML, or TOML/JSON by extension).
    config: PathBuf,

    /// Interface to listen on, overriding the config file.
    #[arg(long, env = "LB_HOST")]
    host: Option<String>,

    /// Port to listen on, overriding the config file.
    #[arg(short, long, env = "LB_PORT")]
    port: Option<u16>,

    /// Address for /health, /metrics and /endpoints.
    #[arg(long, env = "LB_ADMIN_ADDR")]
    admin_addr: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("starting aphrodite load balancer");

    if let Err(e) = run(cli).await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = LoadBalancerConfig::from_file(&cli.config)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.admin_addr.is_some() {
        config.admin_addr = cli.admin_addr;
    }

    let dispatcher = Arc::new(Dispatcher::from_config(&config)?);
    info!(
        listen = %config.listen_addr(),
        admin = config.admin_addr.as_deref().unwrap_or("disabled"),
        endpoints = dispatcher.registry().len(),
        groups = dispatcher.router().groups().len(),
        timeout_ms = config.request_timeout_ms,
        "configuration loaded"
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let proxy_listener = Listener::bind(
        &config.listen_addr(),
        ProxyService::new(dispatcher.clone(), config.cors),
    )
    .await?
    .with_drain_timeout(config.drain_timeout());
    info!("proxy listening on {}", proxy_listener.local_addr());

    let mut proxy_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = proxy_listener.serve(shutdown_rx).await {
                error!("proxy listener error: {}", e);
            }
        }
    });

    let mut background: Vec<(&str, JoinHandle<()>)> = Vec::new();

    if let Some(admin_addr) = &config.admin_addr {
        let admin_listener = AdminListener::bind(admin_addr, dispatcher.clone()).await?;
        info!(
            "admin endpoints on {} (/health, /metrics, /endpoints)",
            admin_listener.local_addr()
        );
        let shutdown_rx = shutdown_tx.subscribe();
        background.push((
            "admin",
            tokio::spawn(async move {
                if let Err(e) = admin_listener.serve(shutdown_rx).await {
                    error!("admin listener error: {}", e);
                }
            }),
        ));
    }

    if let Some(health_check) = config.health_check.clone() {
        let prober = HealthProber::new(
            dispatcher.registry().clone(),
            dispatcher.health().clone(),
            health_check,
        );
        background.push(("health prober", tokio::spawn(prober.run(shutdown_tx.subscribe()))));
    }

    let mut proxy_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut proxy_task => {
            proxy_finished = true;
            match res {
                Ok(()) => info!("proxy task completed"),
                Err(err) => error!("proxy task join error: {}", err),
            }
        }
    }

    dispatcher.shutdown();
    let _ = shutdown_tx.send(());

    if !proxy_finished {
        match proxy_task.await {
            Ok(()) => info!("proxy task completed"),
            Err(err) => error!("proxy task join error: {}", err),
        }
    }

    for (name, task) in background {
        match task.await {
            Ok(()) => info!("{} task completed", name),
            Err(err) => error!("{} task join error: {}", name, err),
        }
    }

    info!(in_flight = dispatcher.in_flight(), "shutdown complete");
    Ok(())
}
