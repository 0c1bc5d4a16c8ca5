// Supervisor server: control channel, health endpoint and telemetry
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;

use llama_proxy::web::config::ProxyConfig;
use llama_proxy::web::event_bridge::{BroadcastChannel, EventBridge};
use llama_proxy::web::logger::init_logging;
use llama_proxy::web::routes::{handle_request, AppState};
use llama_proxy::web::state_store::StateStore;
use llama_proxy::web::telemetry::{SysinfoSource, TelemetryRecorder};
use llama_proxy::web::worker::process_manager::OsProcessLauncher;
use llama_proxy::web::worker::supervisor::Supervisor;
use llama_proxy::{sys_error, sys_info};

const BROADCAST_CAPACITY: usize = 256;

const USAGE: &str = "\
Usage: llama_proxy_web [--config <path>]

Options:
  -c, --config <path>   JSON config file (defaults apply when omitted)
  -h, --help            Print this help

Environment overrides:
  LLAMA_PROXY_BIND_ADDR, LLAMA_PROXY_DATA_DIR,
  LLAMA_PROXY_WORKERS_DIR, LLAMA_PROXY_LOG_LEVEL";

/// Returns `None` when help was requested.
fn parse_args() -> anyhow::Result<Option<Option<PathBuf>>> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Ok(None),
            other => anyhow::bail!("unknown argument '{other}'\n\n{USAGE}"),
        }
    }
    Ok(Some(config_path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(config_path) = parse_args()? else {
        println!("{USAGE}");
        return Ok(());
    };

    let config = ProxyConfig::load(config_path.as_deref())?;
    init_logging(&config.logging)?;

    let store = StateStore::new(config.state_path());
    let supervisor = Supervisor::new(
        config.supervisor_settings()?,
        Arc::new(OsProcessLauncher),
        store,
    );
    sys_info!(
        "[MAIN] Supervising workers from {} ({} discovered)",
        config.workers_dir.display(),
        supervisor.catalog().len()
    );

    let telemetry = TelemetryRecorder::new(
        Box::new(SysinfoSource::new()),
        config.history_path(),
        config.history_capacity,
    );
    let bridge = EventBridge::new(Arc::clone(&supervisor), Some(Arc::clone(&telemetry)));
    let channel = BroadcastChannel::new(BROADCAST_CAPACITY);
    bridge.install(&channel);
    let forwarders = bridge.spawn_forwarders(config.logging.live_broadcast);
    telemetry.start_periodic_recording(config.metrics_interval());

    let state = AppState { bridge, channel };
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
        }
    });

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.bind_addr))?;
    let server = Server::try_bind(&addr)
        .with_context(|| format!("cannot bind {addr}"))?
        .serve(make_svc)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                sys_error!("[MAIN] Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        });

    sys_info!("[MAIN] llama-proxy listening on http://{}", addr);
    sys_info!("[MAIN]   GET  /health      - Health and per-model status");
    sys_info!("[MAIN]   GET  /api/status  - Per-model status");
    sys_info!("[MAIN]   GET  /ws          - Control channel (WebSocket)");

    let served = server.await;

    sys_info!("[MAIN] Shutting down");
    // Clients may have replaced the schedule since startup.
    telemetry.stop_periodic_recording();
    supervisor.stop_all().await;
    for task in forwarders {
        task.abort();
    }

    served.context("server error")
}
