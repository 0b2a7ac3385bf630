use std::env;
use std::io::Cursor;
use std::net::SocketAddr;
use std::process;

use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{error, info, warn};
use wulpus_core::config;
use wulpus_core::hal::SystemControl;
use wulpus_core::logging::init_logging;
use wulpus_core::sim::{SimBoard, StatusBoard};
use wulpus_core::Bridge;

/// Exit code asking the supervisor to start the gateway again.
const RESTART_EXIT_CODE: i32 = 75;

struct ProcessRestart;

impl SystemControl for ProcessRestart {
    fn restart(&self) -> ! {
        warn!("restart requested, exiting");
        process::exit(RESTART_EXIT_CODE)
    }
}

fn json_response(body: String, code: u16) -> Response<Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body).with_status_code(StatusCode(code));
    if let Ok(header) = Header::from_bytes("content-type", "application/json") {
        response.add_header(header);
    }
    if let Ok(header) = Header::from_bytes("cache-control", "no-store") {
        response.add_header(header);
    }
    response
}

fn handle(request: Request, status: &StatusBoard, bridge_addr: SocketAddr) {
    let response = match (request.method(), request.url()) {
        (Method::Get, "/healthz") => json_response("{\"status\":\"ok\"}\n".to_string(), 200),
        (Method::Get, "/status") => {
            let body = serde_json::json!({
                "status": status.current(),
                "history": status.history(),
                "bridge": bridge_addr.to_string(),
                "version": env!("CARGO_PKG_VERSION"),
            });
            json_response(format!("{}\n", body), 200)
        }
        _ => Response::from_string("not found\n").with_status_code(StatusCode(404)),
    };
    if let Err(err) = request.respond(response) {
        warn!(error = %err, "failed to answer status request");
    }
}

fn serve_status(listen: &str, status: &StatusBoard, bridge_addr: SocketAddr) {
    let server = match Server::http(listen) {
        Ok(server) => server,
        Err(err) => {
            error!(%listen, error = %err, "failed to start status server");
            return;
        }
    };
    info!(%listen, "status server listening");
    for request in server.incoming_requests() {
        handle(request, status, bridge_addr);
    }
}

#[tokio::main]
async fn main() {
    let (cfg, path) = match config::load_config_or_default() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("Failed to load config: {}", err);
            process::exit(1);
        }
    };
    if let Err(err) = cfg.validate() {
        eprintln!("Config validation failed ({}): {}", path.display(), err);
        process::exit(1);
    }
    init_logging(&cfg.log_config());

    let board = SimBoard::new();
    let platform = board.platform(Box::new(ProcessRestart));
    let bridge = match Bridge::start(cfg.settings(), board.hardware(), platform).await {
        Ok(bridge) => bridge,
        Err(err) => {
            error!(error = %err, "startup failed");
            process::exit(1);
        }
    };
    let bridge_addr = match bridge.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, "failed to read local addr");
            process::exit(1);
        }
    };
    info!(addr = %bridge_addr, config = %path.display(), "wulpus-gw ready");

    board.companion(bridge.isr_handle(), cfg.sim_settings()).spawn();

    let status_listen =
        env::var("WULPUS_GW_STATUS_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let status = board.status.clone();
    std::thread::spawn(move || serve_status(&status_listen, &status, bridge_addr));

    bridge.run().await;
}
