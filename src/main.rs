//! remote-desk-stream command line entry point
//!
//! ```text
//! remote-desk-stream host <listen-uri>
//! remote-desk-stream view <uri> [snapshot.png]
//! remote-desk-stream displays
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use remote_desk_stream::{
    capture::{CaptureOrchestrator, DisplayRegistry, FrameStreamer},
    config::{Config, ConfigManager},
    logging::init_logging,
    protocol::DisplayDto,
    session::{HostSession, ViewerSlots},
    transport::{quic, FrameListener, TransportOptions},
    viewer::ViewerSession,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const USAGE: &str = "usage: remote-desk-stream host <listen-uri> | view <uri> [snapshot.png] | displays";
const CERT_COMMON_NAME: &str = "remote-desk-stream";

/// Accepts `host:port` as shorthand for `tcp://host:port`
fn normalize_uri(arg: &str) -> String {
    if arg.contains("://") {
        arg.to_string()
    } else {
        format!("tcp://{}", arg)
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        token.cancel();
    });
    cancel
}

async fn run_host(manager: &ConfigManager, config: Config, uri: &str) -> anyhow::Result<()> {
    let cert = if uri.starts_with("quic://") {
        Some(quic::load_or_create_cert(&manager.cert_directory(), CERT_COMMON_NAME)?)
    } else {
        None
    };
    let listener = FrameListener::bind(uri, cert.as_ref()).await?;
    let registry = Arc::new(DisplayRegistry::system());
    let options = TransportOptions::new(config.transport.clone());
    let cancel = shutdown_on_ctrl_c();
    let slots = ViewerSlots::new(config.host.max_viewers);

    info!("Hosting {} display(s) on {}", registry.displays().len(), listener.local_uri()?);

    loop {
        let session = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = HostSession::accept(&listener, options.clone()) => match accepted {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to accept viewer: {}", e);
                    continue;
                }
            },
        };

        let Some(permit) = slots.try_admit() else {
            warn!(
                "Rejecting viewer {}: already serving {} viewer(s)",
                session.session().transport().peer(),
                config.host.max_viewers
            );
            session.session().close("host is serving another viewer").await;
            continue;
        };

        // Each session duplicates its display on its own capture thread;
        // only the display registry is shared
        let orchestrator = CaptureOrchestrator::system(Arc::clone(&registry), &config.capture);
        let streamer = FrameStreamer::new(orchestrator, config.capture.clone());
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            let session_id = session.session().session_id();
            match session.run(streamer, cancel).await {
                Ok(stats) => info!("Session {} finished: {:?}", session_id, stats),
                Err(e) => error!("Session {} failed: {}", session_id, e),
            }
        });
    }

    Ok(())
}

async fn run_viewer(config: Config, uri: &str, snapshot: Option<PathBuf>) -> anyhow::Result<()> {
    let viewer = ViewerSession::connect(uri, TransportOptions::new(config.transport.clone()))
        .await
        .with_context(|| format!("connecting to {}", uri))?;
    let cancel = shutdown_on_ctrl_c();

    tokio::select! {
        _ = viewer.wait_for_close() => info!("Host closed the connection"),
        _ = cancel.cancelled() => viewer.close("viewer exiting").await,
    }

    let renderer = viewer
        .renderer()
        .lock()
        .map_err(|_| anyhow::anyhow!("renderer lock poisoned"))?;
    info!("Painted {} region(s)", renderer.regions_applied());

    if let Some(path) = snapshot.or(config.viewer.snapshot_path) {
        renderer
            .save_png(&path)
            .with_context(|| format!("saving snapshot to {:?}", path))?;
    }
    Ok(())
}

fn print_displays() -> anyhow::Result<()> {
    let registry = DisplayRegistry::system();
    let displays: Vec<DisplayDto> = registry.displays().iter().map(DisplayDto::from).collect();
    println!("{}", serde_json::to_string_pretty(&displays)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::new()?;
    let config = manager.load_or_create_default()?;
    init_logging(config.logging.level);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["host", uri] => run_host(&manager, config, &normalize_uri(uri)).await,
        ["view", uri] => run_viewer(config, &normalize_uri(uri), None).await,
        ["view", uri, snapshot] => {
            run_viewer(config, &normalize_uri(uri), Some(PathBuf::from(snapshot))).await
        }
        ["displays"] => print_displays(),
        _ => bail!(USAGE),
    }
}
