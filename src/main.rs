//! setu-bridged - sample server exposing cameras on the bus

use parking_lot::Mutex;
use setu_bridge::broadcaster::Broadcaster;
use setu_bridge::bus::{MAX_DOMAIN_ID, Participant};
use setu_bridge::camera::{Context, DeviceChange};
use setu_bridge::config::Config;
use setu_bridge::device::server::{DeviceServer, ServerOptions};
use setu_bridge::error::{Error, Result};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct CliArgs {
    config_path: Option<String>,
    domain: Option<u16>,
    debug: bool,
}

fn parse_args() -> Result<CliArgs> {
    let mut parsed = CliArgs {
        config_path: None,
        domain: None,
        debug: false,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-d" | "--domain" => {
                let value = args
                    .next()
                    .ok_or_else(|| Error::Config("--domain requires a value".to_string()))?;
                let domain: u16 = value.parse().map_err(|_| {
                    Error::Config(format!("invalid domain value '{}'", value))
                })?;
                if domain > MAX_DOMAIN_ID {
                    return Err(Error::Config(format!(
                        "invalid domain value, enter a value in the range [0, {}]",
                        MAX_DOMAIN_ID
                    )));
                }
                parsed.domain = Some(domain);
            }
            "--debug" => parsed.debug = true,
            "-h" | "--help" => {
                println!(
                    "usage: setu-bridged [config.toml] [-d|--domain <0-{}>] [--debug]",
                    MAX_DOMAIN_ID
                );
                std::process::exit(0);
            }
            other if !other.starts_with('-') => parsed.config_path = Some(other.to_string()),
            other => {
                return Err(Error::Config(format!("unknown argument '{}'", other)));
            }
        }
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    let args = parse_args()?;

    // Initialize logger; --debug lowers the default filter
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    log::info!("setu-bridge v0.2.0 starting...");

    let config = match &args.config_path {
        Some(path) => {
            log::info!("Using config: {}", path);
            Config::load(path)?
        }
        None => Config::default(),
    };
    let domain = args.domain.unwrap_or(config.bus.domain_id);

    // Create the bus participant; an invalid domain fails here
    let participant = Participant::new(domain, "setu-bridged")?;
    log::info!("Participant created on domain {}", domain);

    // Run the device broadcaster
    let broadcaster = Arc::new(Broadcaster::new(&participant)?);
    broadcaster.run()?;

    let server_options = ServerOptions {
        metadata: config.server.metadata,
        queue_depth: config.server.queue_depth,
    };

    // Wire the device watcher: attach broadcasts the device and stands up a
    // per-device server; detach tears both down.
    let servers: Arc<Mutex<HashMap<String, DeviceServer>>> = Arc::new(Mutex::new(HashMap::new()));
    let context = Context::new();
    {
        let participant = participant.clone();
        let broadcaster = Arc::clone(&broadcaster);
        let servers = Arc::clone(&servers);
        context.run(move |change| match change {
            DeviceChange::Added(camera) => {
                let serial = camera.serial();
                log::info!("Device connected: {} ({})", camera.name(), serial);
                let server =
                    match DeviceServer::new(&participant, camera, server_options.clone()) {
                        Ok(server) => server,
                        Err(e) => {
                            log::error!("Failed to create device server: {}", e);
                            return;
                        }
                    };
                if let Err(e) = server.run() {
                    log::error!("Failed to run device server: {}", e);
                    return;
                }
                broadcaster.add_device(server.info().clone());
                servers.lock().insert(serial, server);
            }
            DeviceChange::Removed(serial) => {
                log::info!("Device disconnected: {}", serial);
                broadcaster.remove_device(&serial);
                if let Some(server) = servers.lock().remove(&serial) {
                    server.stop();
                }
            }
        });
    }

    // Attach the configured cameras
    for device in &config.simulation.devices {
        let camera = device.create_camera()?;
        context.add_device(Arc::new(camera))?;
    }

    // Set up shutdown signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Internal(format!("error setting Ctrl-C handler: {}", e)))?;

    log::info!(
        "Serving {} device(s). Press Ctrl-C to stop.",
        context.device_count()
    );

    // Main loop - keep alive while serving
    let mut last_stats = Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));

        if last_stats.elapsed().as_secs() >= 10 {
            log::info!(
                "Serving {} device(s), {} broadcast",
                context.device_count(),
                broadcaster.device_count()
            );
            last_stats = Instant::now();
        }
    }

    // Shutdown
    log::info!("Shutting down...");
    for (_, server) in servers.lock().drain() {
        server.stop();
    }
    broadcaster.stop();

    log::info!("setu-bridge stopped");
    Ok(())
}
