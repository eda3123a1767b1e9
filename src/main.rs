#![deny(clippy::all)]

mod audio;
mod channel;
mod controller;
mod error;
mod gateway;
mod scheduler;
mod transcript;

use channel::WsConnector;
use controller::{ControllerConfig, SessionController, SessionEvent};
use gateway::{Attachment, Gateway, HttpGateway};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Application configuration
#[derive(serde::Deserialize)]
struct Config {
    backend: BackendConfig,
    timers: TimerConfig,
}

#[derive(serde::Deserialize)]
struct BackendConfig {
    base_url: String,
    websocket_url: String,
}

#[derive(serde::Deserialize)]
struct TimerConfig {
    periodic_message_interval_secs: u64,
    record_timeout_secs: u64,
}

/// Load configuration from embedded config.toml
fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    const CONFIG_TOML: &str = include_str!("../config.toml");
    let config: Config = toml::from_str(CONFIG_TOML)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for structured logging
    tracing_subscriber::fmt::init();

    // Load .env overrides, then the embedded config.toml
    let _ = dotenvy::dotenv();
    let config = load_config()?;

    let backend_url = std::env::var("CONFAB_BACKEND_URL").unwrap_or(config.backend.base_url);
    let websocket_url =
        std::env::var("CONFAB_WEBSOCKET_URL").unwrap_or(config.backend.websocket_url);
    info!(
        "Backend: {}, listening endpoint: {}",
        backend_url, websocket_url
    );

    let gateway: Arc<dyn Gateway> = Arc::new(HttpGateway::new(&backend_url)?);
    let connector = Arc::new(WsConnector::new(&websocket_url)?);

    // Capture devices are enumerated once per session
    let devices = audio::list_input_devices();
    for (index, device) in devices.iter().enumerate() {
        info!("  device {}: {}", index, device.name);
    }

    let controller = SessionController::new(
        ControllerConfig {
            periodic_interval: Duration::from_secs(config.timers.periodic_message_interval_secs),
            record_timeout: Duration::from_secs(config.timers.record_timeout_secs),
        },
        gateway.clone(),
        connector,
        Arc::new(audio::CpalCapture),
        devices,
    );
    let events = controller.handle();
    let mut updates = controller.subscribe();

    // Render appended transcript entries
    tokio::spawn(async move {
        while let Ok(entry) = updates.recv().await {
            println!("{:>9}  {}", entry.role, entry.content);
        }
    });

    tokio::spawn(controller.run());

    print_help();

    // Console stand-in for the view layer: lines become controller events
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(arg) = line.strip_prefix("/device ") {
            match arg.trim().parse() {
                Ok(index) => send(&events, SessionEvent::SelectDevice { index }),
                Err(_) => eprintln!("Usage: /device <index>"),
            }
        } else if let Some(path) = line.strip_prefix("/attach ") {
            attach_file(&events, path.trim()).await;
        } else {
            match line {
                "/quit" => break,
                "/help" => print_help(),
                "/record" => send(&events, SessionEvent::ToggleRecording),
                "/listen" => send(&events, SessionEvent::ToggleListening),
                "/detach" => send(&events, SessionEvent::ClearAttachment),
                "/settings" => show_settings(gateway.clone()).await,
                _ => send(
                    &events,
                    SessionEvent::SubmitText {
                        input: line.to_string(),
                    },
                ),
            }
        }
    }

    Ok(())
}

fn print_help() {
    println!("Type a message and press Enter to chat.");
    println!("  /record          start or stop a voice recording");
    println!("  /listen          toggle continuous listening");
    println!("  /device <index>  select a capture device");
    println!("  /attach <path>   attach an image to the next message");
    println!("  /detach          remove the pending attachment");
    println!("  /settings        show backend settings");
    println!("  /quit            exit");
}

fn send(events: &mpsc::UnboundedSender<SessionEvent>, event: SessionEvent) {
    if events.send(event).is_err() {
        error!("Session controller is gone");
    }
}

async fn attach_file(events: &mpsc::UnboundedSender<SessionEvent>, path: &str) {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let filename = std::path::Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let content_type = content_type_for(&filename).to_string();
            send(
                events,
                SessionEvent::AttachFile {
                    attachment: Attachment {
                        filename,
                        content_type,
                        bytes,
                    },
                },
            );
            println!("(attached; it will be sent with the next message)");
        }
        Err(e) => eprintln!("Cannot read {path}: {e}"),
    }
}

/// Content type from the file extension; the backend reads images
fn content_type_for(filename: &str) -> &'static str {
    match filename
        .rsplit('.')
        .next()
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn show_settings(gateway: Arc<dyn Gateway>) {
    match gateway.fetch_settings().await {
        Ok(settings) => match serde_json::to_string_pretty(&settings.0) {
            Ok(json) => println!("{json}"),
            Err(e) => error!("Failed to render settings: {}", e),
        },
        Err(e) => error!("Failed to fetch settings: {}", e),
    }
}
