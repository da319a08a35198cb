//! Stream Registry for ingest sessions and media producers
//!
//! Holds three maps shared by every session task and the signaling task:
//! connections still waiting for a stream key, the connection currently
//! publishing each stream key, and the producer slot for each stream key.
//! The registry is the single owner of producers; everything else refers to
//! them by stream key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::ConnectionId;
use crate::modules::sfu::MediaProducer;

/// Shared handle to one producer slot
pub type ProducerSlot = Arc<Mutex<MediaProducer>>;

#[derive(Clone)]
pub struct StreamRegistry {
    connecting: Arc<RwLock<HashMap<ConnectionId, SocketAddr>>>,
    active: Arc<RwLock<HashMap<String, ConnectionId>>>,
    producers: Arc<RwLock<HashMap<String, ProducerSlot>>>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        StreamRegistry {
            connecting: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            producers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Track an accepted connection that has not authenticated yet
    pub async fn add_connecting(&self, id: ConnectionId, peer: SocketAddr) {
        self.connecting.write().await.insert(id, peer);
    }

    pub async fn connecting_count(&self) -> usize {
        self.connecting.read().await.len()
    }

    /// Claim `stream_key` for connection `id`.
    ///
    /// Returns false, leaving the current owner untouched, when another
    /// connection already publishes the key.
    pub async fn activate(&self, stream_key: &str, id: ConnectionId) -> bool {
        {
            let mut active = self.active.write().await;
            match active.get(stream_key) {
                Some(owner) if *owner != id => return false,
                Some(_) => {}
                None => {
                    active.insert(stream_key.to_string(), id);
                }
            }
        }
        self.connecting.write().await.remove(&id);
        log::info!("Publisher registered: {} ({})", stream_key, id);
        true
    }

    /// Drop every entry held by connection `id`, whichever keys it claimed.
    /// Keys owned by other connections are left alone.
    pub async fn release(&self, id: ConnectionId) {
        self.connecting.write().await.remove(&id);

        self.active.write().await.retain(|stream_key, owner| {
            if *owner != id {
                return true;
            }
            log::info!("Publisher unregistered: {} ({})", stream_key, id);
            false
        });
    }

    pub async fn owner(&self, stream_key: &str) -> Option<ConnectionId> {
        self.active.read().await.get(stream_key).copied()
    }

    pub async fn is_stream_active(&self, stream_key: &str) -> bool {
        self.active.read().await.contains_key(stream_key)
    }

    pub async fn active_stream_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Store a producer unless the key already has one; returns whether it was inserted
    pub async fn insert_producer(&self, producer: MediaProducer) -> bool {
        let mut producers = self.producers.write().await;
        let key = producer.stream_key().to_string();
        if producers.contains_key(&key) {
            return false;
        }
        producers.insert(key, Arc::new(Mutex::new(producer)));
        true
    }

    pub async fn producer(&self, stream_key: &str) -> Option<ProducerSlot> {
        self.producers.read().await.get(stream_key).cloned()
    }

    pub async fn producer_count(&self) -> usize {
        self.producers.read().await.len()
    }

    /// Forget every producer (control channel lost)
    pub async fn clear_producers(&self) {
        let mut producers = self.producers.write().await;
        if !producers.is_empty() {
            log::info!("Dropping {} producer(s)", producers.len());
        }
        producers.clear();
    }

    /// Forget every session entry; producers stay for the signaling task
    pub async fn clear_sessions(&self) {
        self.connecting.write().await.clear();
        self.active.write().await.clear();
    }
}
