use std::time::Duration;

use ferry_config::FerryConfig;
use ferry_core::LoadBalancer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = FerryConfig::from_file("ferry.toml")?;

    let report = ferry_config::validate(&cfg);
    if report.has_errors() {
        eprintln!("invalid configuration:\n{}", report.format());
        std::process::exit(1);
    }
    if !report.warnings().is_empty() {
        eprintln!("configuration warnings:\n{}", report.format());
    }

    ferry_logging::init_tracing(&cfg.global.log_level);

    info!(target: "ferry::main", listen = %cfg.http.listen_addr, "starting ferryd");

    let shutdown_drain_secs = cfg.proxy.shutdown_drain_secs.max(1);
    let socket_path = cfg.control.socket_path.clone();

    let lb = LoadBalancer::new(cfg.proxy);
    lb.restore_from_state_file().await?;

    let listener = ferry_listener::Server::bind(cfg.http, lb.clone()).await?;
    let control_listener = ferry_control::bind_listener(&socket_path).await?;

    let http_task = tokio::spawn(async move {
        if let Err(err) = listener.serve(wait_for_shutdown_signal()).await {
            error!(target: "ferry::main", error = ?err, "HTTP listener exited with an error");
        }
    });

    let control_lb = lb.clone();
    let control_task = tokio::spawn(async move {
        if let Err(err) = ferry_control::accept_loop(control_listener, control_lb).await {
            error!(target: "ferry::main", error = ?err, "control accept loop exited with an error");
        }
    });

    wait_for_shutdown_signal().await;
    info!(target: "ferry::main", "shutdown signal received; draining upstreams");

    http_task.abort();
    control_task.abort();

    lb.drain_all(Duration::from_secs(shutdown_drain_secs)).await;

    info!(target: "ferry::main", "shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
