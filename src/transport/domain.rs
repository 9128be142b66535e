use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, LazyLock, Mutex,
    },
};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use super::{Qos, TransportError};

/// Process-wide ledger of live participants: at most one per domain id.
/// Readers discover a domain here without owning it.
static LIVE_DOMAINS: LazyLock<Mutex<HashMap<u32, Arc<Participant>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Participant-level configuration. An empty interface name is the one
/// misconfiguration the transport rejects at creation time.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub interface: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            interface: "en0".to_string(),
        }
    }
}

pub(crate) struct TopicEntry {
    pub(crate) chan: broadcast::Sender<Bytes>,
    pub(crate) writers: usize,
    pub(crate) readers: usize,
    /// Times this topic has been created (not merely looked up).
    pub(crate) creates: usize,
}

/// The addressable scope publishers and subscribers discover each other in.
/// Owned by exactly one `Domain`; handed to publishers/subscribers as an
/// `Arc` so handles outliving the domain degrade to no-ops instead of
/// touching freed transport state.
pub(crate) struct Participant {
    domain_id: u32,
    alive: AtomicBool,
    topics: Mutex<HashMap<String, TopicEntry>>,
    groups: Mutex<usize>,
    /// Matched-reader count, delivered to watchers on every change.
    peers_tx: watch::Sender<u32>,
}

impl Participant {
    fn new(domain_id: u32) -> Self {
        let (peers_tx, _) = watch::channel(0);
        Self {
            domain_id,
            alive: AtomicBool::new(true),
            topics: Mutex::new(HashMap::new()),
            groups: Mutex::new(0),
            peers_tx,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn create_topic(&self, name: &str, qos: &Qos) -> Result<(), String> {
        if !self.is_alive() {
            return Err("participant deleted".to_string());
        }
        if name.trim().is_empty() {
            return Err("invalid topic name".to_string());
        }
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.entry(name.to_string()).or_insert_with(|| {
            let (chan, _) = broadcast::channel(qos.max_samples.max(1));
            TopicEntry {
                chan,
                writers: 0,
                readers: 0,
                creates: 0,
            }
        });
        entry.creates += 1;
        Ok(())
    }

    pub(crate) fn create_publisher_group(&self) -> Result<(), String> {
        if !self.is_alive() {
            return Err("participant deleted".to_string());
        }
        *self.groups.lock().unwrap() += 1;
        Ok(())
    }

    pub(crate) fn create_writer(&self, name: &str) -> Result<broadcast::Sender<Bytes>, String> {
        if !self.is_alive() {
            return Err("participant deleted".to_string());
        }
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.get_mut(name).ok_or("topic not found")?;
        entry.writers += 1;
        Ok(entry.chan.clone())
    }

    pub(crate) fn release_writer(&self, name: &str) {
        if let Some(entry) = self.topics.lock().unwrap().get_mut(name) {
            entry.writers = entry.writers.saturating_sub(1);
        }
    }

    pub(crate) fn release_publisher_group(&self) {
        let mut groups = self.groups.lock().unwrap();
        *groups = groups.saturating_sub(1);
    }

    pub(crate) fn release_topic(&self, name: &str) {
        let mut topics = self.topics.lock().unwrap();
        let remove = match topics.get(name) {
            Some(entry) => entry.writers == 0 && entry.readers == 0,
            None => false,
        };
        if remove {
            topics.remove(name);
        }
    }

    pub(crate) fn attach_reader(
        &self,
        name: &str,
        qos: &Qos,
    ) -> Result<broadcast::Receiver<Bytes>, String> {
        self.create_topic(name, qos)?;
        let mut topics = self.topics.lock().unwrap();
        let entry = topics.get_mut(name).ok_or("topic not found")?;
        entry.readers += 1;
        let rx = entry.chan.subscribe();
        drop(topics);
        self.publication_matched(1);
        Ok(rx)
    }

    pub(crate) fn detach_reader(&self, name: &str) {
        if let Some(entry) = self.topics.lock().unwrap().get_mut(name) {
            entry.readers = entry.readers.saturating_sub(1);
        }
        self.publication_matched(-1);
    }

    /// Publication-matched status change: recompute the peer count and wake
    /// every watcher, even when the count lands on the same value.
    fn publication_matched(&self, delta: i64) {
        self.peers_tx.send_modify(|peers| {
            *peers = (*peers as i64 + delta).max(0) as u32;
        });
        log::debug!(
            "domain {}: publication matched, peers now {}",
            self.domain_id,
            *self.peers_tx.borrow()
        );
    }

    pub(crate) fn peers(&self) -> watch::Receiver<u32> {
        self.peers_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn topic_create_count(&self, name: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.creates)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn topic_writer_count(&self, name: &str) -> usize {
        self.topics
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.writers)
            .unwrap_or(0)
    }
}

/// Transport domain lifecycle: NotCreated until `create()`, Created until
/// `destroy()` (or drop, which destroys a still-created domain).
pub struct Domain {
    id: u32,
    config: TransportConfig,
    participant: Option<Arc<Participant>>,
}

impl Domain {
    pub fn new(id: u32, config: TransportConfig) -> Self {
        Self {
            id,
            config,
            participant: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn create(&mut self) -> Result<(), TransportError> {
        if self.participant.is_some() {
            return Err(TransportError::AlreadyCreated);
        }
        if self.config.interface.trim().is_empty() {
            return Err(TransportError::ParticipantCreationFailed(
                "no network interface configured".to_string(),
            ));
        }
        let mut live = LIVE_DOMAINS.lock().unwrap();
        if live.contains_key(&self.id) {
            return Err(TransportError::AlreadyCreated);
        }
        let participant = Arc::new(Participant::new(self.id));
        live.insert(self.id, Arc::clone(&participant));
        drop(live);
        self.participant = Some(participant);
        log::info!("domain {} created on interface {}", self.id, self.config.interface);
        Ok(())
    }

    /// Peer-count observable, updated from publication-matched events.
    pub fn peers(&self) -> Result<watch::Receiver<u32>, TransportError> {
        Ok(self.participant()?.peers())
    }

    pub(crate) fn participant(&self) -> Result<&Arc<Participant>, TransportError> {
        self.participant.as_ref().ok_or(TransportError::NotYetCreated)
    }

    /// Discovers the live participant for a domain id, if any. This is how
    /// readers reach a domain another component owns.
    pub(crate) fn lookup(id: u32) -> Result<Arc<Participant>, TransportError> {
        LIVE_DOMAINS
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(TransportError::NotYetCreated)
    }

    pub fn destroy(&mut self) -> Result<(), TransportError> {
        let participant = self
            .participant
            .take()
            .ok_or(TransportError::NotYetCreated)?;
        // Listener and participant are released before domain deletion,
        // whatever the deletion outcome.
        participant.alive.store(false, Ordering::Release);
        drop(participant);
        if LIVE_DOMAINS.lock().unwrap().remove(&self.id).is_none() {
            log::error!("domain {} missing from live-domain ledger", self.id);
            return Err(TransportError::DeletionFailed);
        }
        log::info!("domain {} destroyed", self.id);
        Ok(())
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        if self.participant.is_some() {
            if let Err(e) = self.destroy() {
                log::warn!("domain {} cleanup on drop failed: {}", self.id, e);
            }
        }
    }
}
