use std::sync::Arc;

use log::{error, info};
use rtmp_sfu_gateway::modules::rtmp::server::load_tls_config;
use rtmp_sfu_gateway::{
    Gateway, IngestListener, Settings, SignalingClient, SignalingOptions, StreamRegistry,
};
use tokio::sync::{broadcast, mpsc};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = Settings::load()?;
    info!("Gateway name: {}", settings.name);
    for stream in &settings.streams {
        info!(
            "Stream key {} (video: {}, audio: {})",
            stream.stream_key,
            stream.video.as_ref().map_or("-", |c| c.mime_type.as_str()),
            stream.audio.as_ref().map_or("-", |c| c.mime_type.as_str()),
        );
    }

    // Set up TLS if configured
    let tls_acceptor = match (&settings.tls_cert_path, &settings.tls_key_path) {
        (Some(cert), Some(key)) => Some(load_tls_config(cert, key)?),
        _ => None,
    };

    let registry = StreamRegistry::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (signaling_shutdown_tx, _) = broadcast::channel::<()>(1);
    let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();

    // Signaling task owns the SFU connection and the negotiation queue
    let signaling = SignalingClient::new(registry.clone(), settings.name.clone());
    let options = SignalingOptions {
        url: settings.sfu_url.clone(),
        origin: settings.sfu_origin.clone(),
        reconnect_interval: settings.reconnect_interval,
    };
    let signaling_task = tokio::spawn(signaling.run(
        options,
        signaling_rx,
        signaling_shutdown_tx.subscribe(),
    ));

    let gateway = Arc::new(Gateway::new(
        settings.streams.clone(),
        registry.clone(),
        signaling_tx,
    ));
    let listener = IngestListener::bind(
        ("0.0.0.0", settings.rtmp_port),
        gateway,
        registry,
        tls_acceptor,
    )
    .await?;
    let listener_task = tokio::spawn(listener.run_with_shutdown(shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down");
    let _ = shutdown_tx.send(());

    match listener_task.await {
        Ok(Err(e)) => error!("RTMP listener failed: {}", e),
        Err(e) => error!("RTMP listener task failed: {}", e),
        Ok(Ok(())) => {}
    }
    // sessions have queued their pause requests by now
    let _ = signaling_shutdown_tx.send(());
    if let Err(e) = signaling_task.await {
        error!("Signaling task failed: {}", e);
    }

    Ok(())
}
