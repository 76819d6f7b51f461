use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use gasoline_web::app::{AppState, build_router};
use gasoline_web::config::{Cli, Config, VERSION};
use gasoline_web::lifecycle::{
    PidFile, install_panic_hook, run_sweeper, shutdown_signal, take_upgrade_marker, watch_binary,
};
use gasoline_web::mcp::GasolineMcpHandler;
use gasoline_web::stdio;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Time given to in-flight requests once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Delay between stdin EOF and stopping the background listener.
const STDIN_EOF_GRACE: Duration = Duration::from_millis(100);

fn main() {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(async {
        match run(cli).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("{err}");
                1
            }
        }
    });
    // The stdin reader sits on a blocking thread that never returns on its own.
    runtime.shutdown_timeout(STDIN_EOF_GRACE);
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = Config::from_cli(cli);

    // stdout carries JSON-RPC in stdio mode, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    install_panic_hook(config.crash_log());

    let state = AppState::new(config.clone());
    if let Some(marker) = take_upgrade_marker(&config.upgrade_marker()) {
        info!(
            from = %marker.from_version,
            to = %marker.to_version,
            "restarted after upgrade"
        );
        state.inner.lock().upgrade = Some(marker);
    }

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind HTTP on {addr}: {e}"))?;
    info!(%addr, version = VERSION, server_only = config.server_only, "gasoline listening");

    let _pid_file = match PidFile::write(config.pid_file()) {
        Ok(pid) => Some(pid),
        Err(e) => {
            warn!(error = %e, "continuing without a pid file");
            None
        }
    };

    tokio::spawn(run_sweeper(state.clone()));
    if config.auto_upgrade {
        match std::env::current_exe() {
            Ok(exe) => {
                tokio::spawn(watch_binary(
                    exe,
                    config.upgrade_marker(),
                    state.shutdown.clone(),
                ));
            }
            Err(e) => warn!(error = %e, "binary watcher disabled: cannot locate executable"),
        }
    }

    let signal_shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.trigger();
    });

    let app = build_router(state.clone());
    let server_shutdown = state.shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await
    });

    if config.server_only {
        tokio::select! {
            _ = state.shutdown.wait() => {}
            result = &mut server => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("HTTP server error: {e}")),
                    Err(e) => Err(format!("HTTP server task failed: {e}")),
                };
            }
        }
    } else {
        let handler = GasolineMcpHandler::new(state.clone());
        tokio::select! {
            _ = state.shutdown.wait() => {}
            result = stdio::run(handler) => {
                if let Err(e) = result {
                    error!(error = %e, "stdio transport failed");
                }
                tokio::time::sleep(STDIN_EOF_GRACE).await;
                state.shutdown.trigger();
            }
        }
    }

    let expired = state
        .store
        .correlator()
        .expire_all_pending("server shutting down");
    if expired > 0 {
        info!(expired, "pending commands expired at shutdown");
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server stopped with an error"),
        Ok(Err(e)) => warn!(error = %e, "HTTP server task failed"),
        Err(_) => warn!("HTTP server did not stop within the grace period"),
        Ok(Ok(Ok(()))) => {}
    }
    info!("gasoline stopped");
    Ok(())
}
