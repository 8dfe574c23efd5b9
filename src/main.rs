mod config;
mod gardena;
mod host;
mod mqtt;

use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use gardena::bridge::StateRefresh;
use host::HostAdapter;
use mqtt::MqttMessage;
use mqtt::client::MqttClient;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting gardena-smart-mqtt bridge (mqtt={}:{}, tenant={}, switches={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.gardena.tenant,
        config.entries.len(),
    );

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            std::process::exit(1);
        }
    };

    // Channels
    let (command_tx, mut command_rx) = mpsc::channel::<MqttMessage>(100);
    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<StateRefresh>();

    // The event loop has to be running before anything waits on the client.
    let mqtt_client = MqttClient::new(&config);
    let transport = Arc::new(mqtt_client.transport());
    let mqtt_handle = tokio::spawn(mqtt_client.run());

    let mut adapter = HostAdapter::new(config, transport);
    if let Err(e) = adapter.start(command_tx, refresh_tx).await {
        error!("Failed to listen for switch commands: {}", e);
        mqtt_handle.abort();
        std::process::exit(1);
    }
    if adapter.registry().is_empty() {
        warn!("No switch could be set up; only the bridge status is published");
    }

    // Main loop: route switch commands to bridges, publish state refreshes,
    // handle shutdown
    loop {
        tokio::select! {
            Some(msg) = command_rx.recv() => {
                if let Err(e) = adapter.handle_command(&msg).await {
                    error!("Command on {} failed: {}", msg.topic, e);
                }
            }
            Some(refresh) = refresh_rx.recv() => {
                if let Err(e) = adapter.publish_state(&refresh).await {
                    warn!("Failed to publish state of {}: {}", refresh.entry_id, e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Cleanup
    adapter.shutdown().await;
    mqtt_handle.abort();
    info!("gardena-smart-mqtt bridge stopped");
}
