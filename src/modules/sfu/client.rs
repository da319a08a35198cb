//! SFU signaling client
//!
//! A single task owns the control WebSocket and the queue of producers
//! waiting for negotiation. Session tasks talk to it only through
//! [`SignalingCommand`]s.
//!
//! The SFU answers requests in order without echoing any request id, so
//! every `sendPlainTransport` / `producer` response is applied to the head of
//! the queue and only one transport negotiation is ever in flight.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::messages::{MessageError, SfuRequest, SfuResponse};
use super::producer::ProducerProgress;
use crate::modules::rtmp::registry::StreamRegistry;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid Origin header: {0}")]
    InvalidOrigin(String),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Requests from ingest sessions to the signaling task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingCommand {
    /// A new producer was stored under this key and needs negotiating
    Enqueue(String),
    /// The publisher went away
    Pause(String),
    /// The publisher came back
    Resume(String),
}

/// Where and how to reach the SFU
#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub url: String,
    pub origin: String,
    pub reconnect_interval: Option<Duration>,
}

pub struct SignalingClient {
    registry: StreamRegistry,
    app_name: String,
    pending: VecDeque<String>,
    connected: bool,
}

impl SignalingClient {
    pub fn new(registry: StreamRegistry, app_name: String) -> Self {
        SignalingClient {
            registry,
            app_name,
            pending: VecDeque::new(),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Stream keys waiting for negotiation, head first
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn on_connected(&mut self) -> Vec<SfuRequest> {
        log::info!("Connected to SFU");
        self.connected = true;
        self.next_transport_request()
    }

    /// Producers and pending negotiations do not survive the connection
    pub async fn on_disconnected(&mut self) {
        log::info!("Disconnected from SFU");
        self.connected = false;
        if !self.pending.is_empty() {
            log::warn!("Abandoning {} pending negotiation(s)", self.pending.len());
        }
        self.pending.clear();
        self.registry.clear_producers().await;
    }

    pub fn on_failed_to_connect(&mut self, error: &SignalingError) {
        log::error!("Failed to connect to SFU: {}", error);
        self.connected = false;
    }

    /// Apply one inbound text message; returns the requests to send next
    pub async fn on_message(&mut self, text: &str) -> Vec<SfuRequest> {
        let response = match SfuResponse::parse(text) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Ignoring SFU message: {}", e);
                return Vec::new();
            }
        };

        let Some(head) = self.pending.front().cloned() else {
            log::warn!("SFU response with no pending producer: {:?}", response);
            return Vec::new();
        };

        let Some(slot) = self.registry.producer(&head).await else {
            log::warn!("Producer {} vanished during negotiation", head);
            self.pending.pop_front();
            return self.next_transport_request();
        };
        let mut producer = slot.lock().await;

        match response {
            SfuResponse::TransportCreated(endpoint) => producer
                .on_transport_created(endpoint, &self.app_name)
                .await
                .into_iter()
                .collect(),
            SfuResponse::ProducerCreated(created) => {
                log::info!(
                    "Producer {} created for {} ({:?})",
                    created.id,
                    head,
                    created.kind
                );
                let progress = producer.on_producer_created(created.id);
                match progress {
                    ProducerProgress::NeedAudioTransport => {
                        vec![SfuRequest::create_plain_transport()]
                    }
                    ProducerProgress::Created => {
                        drop(producer);
                        self.pending.pop_front();
                        log::info!("{} negotiated, {} still pending", head, self.pending.len());
                        self.next_transport_request()
                    }
                    ProducerProgress::Ignored => Vec::new(),
                }
            }
        }
    }

    pub async fn handle_command(&mut self, command: SignalingCommand) -> Vec<SfuRequest> {
        match command {
            SignalingCommand::Enqueue(stream_key) => {
                let was_empty = self.pending.is_empty();
                self.pending.push_back(stream_key);
                if was_empty {
                    self.next_transport_request()
                } else {
                    Vec::new()
                }
            }
            SignalingCommand::Pause(stream_key) => {
                self.producer_requests(&stream_key, |p| p.pause_requests())
                    .await
            }
            SignalingCommand::Resume(stream_key) => {
                self.producer_requests(&stream_key, |p| p.resume_requests())
                    .await
            }
        }
    }

    async fn producer_requests<F>(&self, stream_key: &str, build: F) -> Vec<SfuRequest>
    where
        F: FnOnce(&super::MediaProducer) -> Vec<SfuRequest>,
    {
        if !self.connected {
            log::debug!("Not connected, dropping request for {}", stream_key);
            return Vec::new();
        }
        let Some(slot) = self.registry.producer(stream_key).await else {
            return Vec::new();
        };
        let producer = slot.lock().await;
        build(&producer)
    }

    fn next_transport_request(&self) -> Vec<SfuRequest> {
        if !self.connected || self.pending.is_empty() {
            return Vec::new();
        }
        vec![SfuRequest::create_plain_transport()]
    }

    /// Drive the control connection until shutdown.
    ///
    /// Without a reconnect interval the client stops talking to the SFU after
    /// the first failure or loss but keeps absorbing commands.
    pub async fn run(
        mut self,
        options: SignalingOptions,
        mut commands: mpsc::UnboundedReceiver<SignalingCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            match self.connect_and_serve(&options, &mut commands, &mut shutdown).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => self.on_failed_to_connect(&e),
            }

            let retry = options.reconnect_interval;
            if let Some(interval) = retry {
                log::info!("Reconnecting to SFU in {:?}", interval);
            }
            if self.idle(retry, &mut commands, &mut shutdown).await {
                break;
            }
        }
        log::info!("Signaling client stopped");
    }

    /// Returns Ok(true) on shutdown, Ok(false) when the connection was lost
    async fn connect_and_serve(
        &mut self,
        options: &SignalingOptions,
        commands: &mut mpsc::UnboundedReceiver<SignalingCommand>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<bool, SignalingError> {
        let mut request = options.url.as_str().into_client_request()?;
        let origin = HeaderValue::from_str(&options.origin)
            .map_err(|_| SignalingError::InvalidOrigin(options.origin.clone()))?;
        request.headers_mut().insert("Origin", origin);

        log::info!("Connecting to SFU at {}", options.url);
        let (mut ws_stream, _) = tokio_tungstenite::connect_async(request).await?;

        let initial = self.on_connected();
        let mut lost = send_all(&mut ws_stream, initial).await.is_err();

        while !lost {
            // queued commands go out before shutdown is observed
            tokio::select! {
                biased;

                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            let requests = self.handle_command(command).await;
                            lost = send_all(&mut ws_stream, requests).await.is_err();
                        }
                        None => {
                            let _ = ws_stream.close(None).await;
                            self.on_disconnected().await;
                            return Ok(true);
                        }
                    }
                }
                incoming = ws_stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            log::debug!("SFU -> {}", text);
                            let requests = self.on_message(&text).await;
                            lost = send_all(&mut ws_stream, requests).await.is_err();
                        }
                        Some(Ok(Message::Close(_))) | None => lost = true,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("Error reading SFU message: {}", e);
                            lost = true;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let _ = ws_stream.close(None).await;
                    self.on_disconnected().await;
                    return Ok(true);
                }
            }
        }

        self.on_disconnected().await;
        Ok(false)
    }

    /// Absorb commands while disconnected; returns true on shutdown.
    /// With `retry` set, returns false once the interval elapses.
    async fn idle(
        &mut self,
        retry: Option<Duration>,
        commands: &mut mpsc::UnboundedReceiver<SignalingCommand>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let sleep = tokio::time::sleep(retry.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep, if retry.is_some() => return false,
                command = commands.recv() => match command {
                    Some(command) => {
                        // nothing can be sent while disconnected
                        let _ = self.handle_command(command).await;
                    }
                    None => return true,
                },
                _ = shutdown.recv() => return true,
            }
        }
    }
}

async fn send_all<S>(sink: &mut S, requests: Vec<SfuRequest>) -> Result<(), SignalingError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    for request in requests {
        let text = request.to_json()?;
        log::debug!("SFU <- {}", text);
        if let Err(e) = sink.send(Message::Text(text)).await {
            log::error!("Failed to send SFU request: {}", e);
            return Err(e.into());
        }
    }
    Ok(())
}
