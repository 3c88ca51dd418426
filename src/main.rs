//! klipper-watch agent
//!
//! Connects to Moonraker, follows the print and reports to Telegram.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use klipper_watch::camera::{Camera, CaptureLock, FrameSource, SnapshotSource};
use klipper_watch::config::Config;
use klipper_watch::logging::{get_log_dir, init_logging};
use klipper_watch::notify::{ChatSink, Notifier, TelegramSink};
use klipper_watch::printer::{MoonrakerApi, MoonrakerClient, PowerDevice, StatusComposer};
use klipper_watch::scheduler::Scheduler;
use klipper_watch::stream::client::create_stream_channels;
use klipper_watch::stream::handler::EventHandler;
use klipper_watch::stream::{create_client_channels, EventStreamClient};
use klipper_watch::timelapse::assembly::{cleanup_unfinished_lapses, FfmpegEncoder, LapseAssembler};
use klipper_watch::timelapse::TimelapseCoordinator;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_path = match args.iter().position(|a| a == "--config" || a == "-c") {
        Some(index) => Some(PathBuf::from(
            args.get(index + 1)
                .context("--config requires a path argument")?,
        )),
        None => None,
    };

    let config = Config::load(config_path.as_deref())?;
    let _log_guard = init_logging(&config.logging)?;
    info!("klipper-watch starting...");
    info!("Configuration loaded from {:?}", config.config_path().ok());
    if let Ok(log_dir) = get_log_dir(&config.logging) {
        info!("Writing logs to {:?}", log_dir);
    }
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let (handle, commands) = create_client_channels();

    let ctrl_c_handle = handle.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        if !ctrl_c_handle.blocking_shutdown() {
            warn!("Event stream client already stopped");
        }
    })?;

    let result = runtime.block_on(async move {
        let client = build_client(&config, commands)?;
        client.run().await
    });
    if let Err(e) = &result {
        error!("Agent stopped with error: {:#}", e);
    }

    info!("Shutdown complete");
    result
}

/// Wire every component together
fn build_client(
    config: &Config,
    commands: tokio::sync::mpsc::Receiver<klipper_watch::stream::ClientCommand>,
) -> Result<EventStreamClient> {
    let scheduler = Scheduler::new();
    let (channels, receivers) = create_stream_channels();

    let moonraker = Arc::new(
        MoonrakerClient::new(&config.moonraker).context("Failed to create Moonraker client")?,
    );
    let api: Arc<dyn MoonrakerApi> = moonraker.clone();

    let chat: Arc<dyn ChatSink> = Arc::new(
        TelegramSink::new(&config.telegram).context("Telegram bot token is not configured")?,
    );
    let chat_id = config
        .telegram
        .chat_id
        .context("Telegram chat id is not configured")?;

    let light = config
        .moonraker
        .light_device
        .as_ref()
        .map(|name| Arc::new(PowerDevice::new(name.clone(), api.clone())));
    let mut power_devices: Vec<Arc<PowerDevice>> = light.iter().cloned().collect();
    for name in &config.status_message.devices {
        if !power_devices.iter().any(|device| device.name() == name.as_str()) {
            power_devices.push(Arc::new(PowerDevice::new(name.clone(), api.clone())));
        }
    }

    let source: Option<Arc<dyn FrameSource>> = if config.camera_available() {
        SnapshotSource::from_config(&config.camera)?.map(|source| Arc::new(source) as Arc<dyn FrameSource>)
    } else {
        info!("Camera disabled, notifications are sent without photos");
        None
    };
    let camera = Arc::new(Camera::new(
        source,
        CaptureLock::new(light, &config.light, scheduler.clone()),
    ));

    let notifier = Notifier::new(
        config.notifications.clone(),
        chat_id,
        chat.clone(),
        camera.clone(),
        StatusComposer::new(&config.status_message, config.moonraker.light_device.clone()),
        scheduler.clone(),
        channels.ticks.clone(),
    );

    cleanup_unfinished_lapses(&config.timelapse.base_dir);
    let assembler = LapseAssembler::new(
        Arc::new(FfmpegEncoder::new(config.timelapse.ffmpeg_path.clone())),
        config.timelapse.ready_dir.clone(),
    );
    let timelapse = TimelapseCoordinator::new(
        config.timelapse.clone(),
        camera,
        api.clone(),
        chat,
        chat_id,
        config.notifications.silent_progress,
        assembler,
        scheduler.clone(),
        channels.ticks.clone(),
    );

    let handler = EventHandler::new(
        notifier,
        timelapse,
        power_devices,
        config.moonraker.sensors.clone(),
        api,
        scheduler,
        channels,
    );

    Ok(EventStreamClient::new(
        config.moonraker.clone(),
        moonraker,
        handler,
        receivers,
        commands,
    ))
}

fn print_help() {
    println!("klipper-watch - Klipper print monitor with Telegram notifications and timelapses");
    println!();
    println!("USAGE:");
    println!("    klipper-watch [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help             Print this help message");
    println!("    -c, --config <PATH>    Use this configuration file");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                  Set log level (e.g., debug, info, warn)");
    println!("    KLIPPER_WATCH_LOG_PATH    Directory for log files");
}
