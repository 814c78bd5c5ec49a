//! DrishtiIO - surgical navigation broadcast daemon

use drishti_io::config::Config;
use drishti_io::core::{Clock, FrameBuffer};
use drishti_io::devices::NdiTracker;
use drishti_io::error::{Error, Result};
use drishti_io::streaming::{IgtlServer, TrackerCommandHandler};
use parking_lot::Mutex;
use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("DrishtiIO v0.3.0 starting...");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/drishti.toml".to_string());

    log::info!("Using config: {}", config_path);
    let config = Config::load(&config_path)?;
    let config_dir = Path::new(&config_path)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let clock = Clock::new();
    let buffer = Arc::new(FrameBuffer::new("TrackerStream"));

    // Tracker: probe (when the port is unknown), connect, start polling
    let tools = config.tool_descriptors(&config_dir)?;
    log::info!("Configured {} tool data source(s)", tools.len());
    let tracker = NdiTracker::new(
        config.tracker_settings(),
        tools,
        Arc::clone(&buffer),
        clock,
    );

    if config.tracker.serial_port < 0 {
        log::info!("Probing serial ports for a tracker...");
        tracker.probe()?;
    }
    tracker.connect()?;
    if let Some(version) = tracker.version() {
        log::info!("Tracker firmware: {}", version);
    }

    let tracker = Arc::new(Mutex::new(tracker));
    tracker.lock().start_tracking()?;

    // Broadcast server with the tracker-backed command handler
    let handler = Arc::new(TrackerCommandHandler::new(Arc::clone(&tracker)));
    let mut server = IgtlServer::new(
        config.server_settings(),
        Arc::clone(&buffer),
        clock,
        handler,
    )?;
    server.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!(
        "DrishtiIO running on port {}. Press Ctrl-C to stop.",
        server.port()
    );

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    log::info!("Shutting down...");
    server.stop();
    tracker.lock().disconnect()?;

    log::info!("DrishtiIO stopped");
    Ok(())
}
