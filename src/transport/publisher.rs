use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;

use super::{domain::Participant, Domain, TransportError};

/// Bounded-resource policy for a topic. Real-time topics cap outstanding
/// samples at 1 each with oldest-sample-drop-on-overflow, and ask the
/// transport to order delivery by source timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Qos {
    pub max_samples: usize,
    pub max_instances: usize,
    pub max_samples_per_instance: usize,
    pub by_source_timestamp: bool,
}

impl Qos {
    pub fn realtime() -> Self {
        Self {
            max_samples: 1,
            max_instances: 1,
            max_samples_per_instance: 1,
            by_source_timestamp: true,
        }
    }
}

impl Default for Qos {
    fn default() -> Self {
        Self {
            max_samples: 2,
            max_instances: 2,
            max_samples_per_instance: 2,
            by_source_timestamp: false,
        }
    }
}

/// Typed writer bound to one (participant, topic, QoS) at construction.
/// `start`/`stop`/`publish` are callable through a shared reference so the
/// pipeline's tasks can hold the publisher in an `Arc`.
pub struct Publisher<M> {
    participant: Arc<Participant>,
    topic: String,
    qos: Qos,
    started: AtomicBool,
    writer: Mutex<Option<broadcast::Sender<Bytes>>>,
    _marker: PhantomData<fn(M)>,
}

impl<M: Serialize> Publisher<M> {
    pub fn new(domain: &Domain, topic: &str, qos: Qos) -> Result<Self, TransportError> {
        Ok(Self {
            participant: Arc::clone(domain.participant()?),
            topic: topic.to_string(),
            qos,
            started: AtomicBool::new(false),
            writer: Mutex::new(None),
            _marker: PhantomData,
        })
    }

    /// Idempotent: true immediately if already started. Creates topic,
    /// publisher group, and writer in that order; a failed step releases the
    /// sub-resources created before it, so repeated failed starts do not
    /// leak handles.
    pub fn start(&self) -> bool {
        if self.started.load(Ordering::Acquire) {
            return true;
        }
        if let Err(e) = self.participant.create_topic(&self.topic, &self.qos) {
            log::warn!("could not create topic {}: {}", self.topic, e);
            return false;
        }
        if let Err(e) = self.participant.create_publisher_group() {
            log::warn!("could not create publisher group for {}: {}", self.topic, e);
            self.participant.release_topic(&self.topic);
            return false;
        }
        let writer = match self.participant.create_writer(&self.topic) {
            Ok(w) => w,
            Err(e) => {
                log::warn!("could not create writer for {}: {}", self.topic, e);
                self.participant.release_publisher_group();
                self.participant.release_topic(&self.topic);
                return false;
            }
        };
        *self.writer.lock().unwrap() = Some(writer);
        self.started.store(true, Ordering::Release);
        log::info!("publisher started on topic {}", self.topic);
        true
    }

    /// Releases the topic and its owned children. No-op unless started.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.writer.lock().unwrap().take();
        self.participant.release_writer(&self.topic);
        self.participant.release_publisher_group();
        self.participant.release_topic(&self.topic);
        log::info!("publisher stopped on topic {}", self.topic);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// False without side effects when not started or the writer is absent;
    /// false with a logged reason when the underlying write reports non-OK.
    pub fn publish(&self, message: &M) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        let writer = match self.writer.lock().unwrap().clone() {
            Some(w) => w,
            None => return false,
        };
        if !self.participant.is_alive() {
            log::warn!("write failed on {}: participant deleted", self.topic);
            return false;
        }
        let payload = match bincode::serialize(message) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                log::warn!("write failed on {}: serialize: {}", self.topic, e);
                return false;
            }
        };
        match writer.send(payload) {
            Ok(_) => true,
            Err(_) => {
                log::debug!("write failed on {}: no matched readers", self.topic);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn participant(&self) -> &Arc<Participant> {
        &self.participant
    }
}

impl<M> Drop for Publisher<M> {
    fn drop(&mut self) {
        if self.started.swap(false, Ordering::AcqRel) {
            self.writer.lock().unwrap().take();
            self.participant.release_writer(&self.topic);
            self.participant.release_publisher_group();
            self.participant.release_topic(&self.topic);
        }
    }
}

/// Matching consumer side. Attaching counts as a publication match on the
/// participant, which is what drives the peer-count observable.
pub struct Subscriber<M> {
    participant: Arc<Participant>,
    topic: String,
    rx: broadcast::Receiver<Bytes>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: DeserializeOwned> Subscriber<M> {
    pub fn new(domain: &Domain, topic: &str, qos: Qos) -> Result<Self, TransportError> {
        Self::with_participant(Arc::clone(domain.participant()?), topic, qos)
    }

    /// Joins a domain by id without owning it, the way a remote reader
    /// would. Fails until some component has created the domain.
    pub fn attach(domain_id: u32, topic: &str, qos: Qos) -> Result<Self, TransportError> {
        Self::with_participant(Domain::lookup(domain_id)?, topic, qos)
    }

    fn with_participant(
        participant: Arc<Participant>,
        topic: &str,
        qos: Qos,
    ) -> Result<Self, TransportError> {
        let rx = participant
            .attach_reader(topic, &qos)
            .map_err(TransportError::ResourceCreationFailed)?;
        Ok(Self {
            participant,
            topic: topic.to_string(),
            rx,
            _marker: PhantomData,
        })
    }

    /// Next message, skipping samples superseded under the topic's resource
    /// limits and any that fail to decode. `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => match bincode::deserialize(&payload) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        log::warn!("bad sample on {}: {}", self.topic, e);
                        continue;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("{}: {} stale samples dropped", self.topic, n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<M> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) => match bincode::deserialize(&payload) {
                    Ok(msg) => return Some(msg),
                    Err(_) => continue,
                },
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl<M> Drop for Subscriber<M> {
    fn drop(&mut self) {
        self.participant.detach_reader(&self.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    fn domain(id: u32) -> Domain {
        let mut d = Domain::new(id, TransportConfig::default());
        d.create().unwrap();
        d
    }

    #[test]
    fn test_start_is_idempotent_and_creates_resources_once() {
        let d = domain(200);
        let publisher = Publisher::<Ping>::new(&d, "Pings", Qos::default()).unwrap();
        assert!(publisher.start());
        assert!(publisher.start());
        let participant = publisher.participant();
        assert_eq!(participant.topic_create_count("Pings"), 1);
        assert_eq!(participant.topic_writer_count("Pings"), 1);
    }

    #[test]
    fn test_publish_before_start_is_noop() {
        let d = domain(201);
        let publisher = Publisher::<Ping>::new(&d, "Pings", Qos::default()).unwrap();
        assert!(!publisher.publish(&Ping { seq: 0 }));
    }

    #[test]
    fn test_publish_after_stop_fails() {
        let d = domain(202);
        let publisher = Publisher::<Ping>::new(&d, "Pings", Qos::default()).unwrap();
        let _sub = Subscriber::<Ping>::new(&d, "Pings", Qos::default()).unwrap();
        assert!(publisher.start());
        assert!(publisher.publish(&Ping { seq: 1 }));
        publisher.stop();
        assert!(!publisher.publish(&Ping { seq: 2 }));
        // stop is guarded: a second stop is a no-op.
        publisher.stop();
    }

    #[test]
    fn test_start_rolls_back_on_failure() {
        let d = domain(203);
        let publisher = Publisher::<Ping>::new(&d, "", Qos::default()).unwrap();
        assert!(!publisher.start());
        assert!(!publisher.is_started());
        // Failed starts may be retried without leaking handles.
        assert!(!publisher.start());
    }

    #[test]
    fn test_publish_after_domain_destroy_fails() {
        let mut d = domain(204);
        let publisher = Publisher::<Ping>::new(&d, "Pings", Qos::default()).unwrap();
        let _sub = Subscriber::<Ping>::new(&d, "Pings", Qos::default()).unwrap();
        assert!(publisher.start());
        d.destroy().unwrap();
        assert!(!publisher.publish(&Ping { seq: 3 }));
    }

    #[tokio::test]
    async fn test_round_trip_and_peer_count() {
        let d = domain(205);
        let mut peers = d.peers().unwrap();
        assert_eq!(*peers.borrow(), 0);

        let publisher = Publisher::<Ping>::new(&d, "Pings", Qos::realtime()).unwrap();
        assert!(publisher.start());
        let mut sub = Subscriber::<Ping>::new(&d, "Pings", Qos::realtime()).unwrap();

        peers.changed().await.unwrap();
        assert_eq!(*peers.borrow(), 1);

        assert!(publisher.publish(&Ping { seq: 7 }));
        assert_eq!(sub.recv().await, Some(Ping { seq: 7 }));

        drop(sub);
        peers.changed().await.unwrap();
        assert_eq!(*peers.borrow(), 0);
    }

    #[tokio::test]
    async fn test_realtime_qos_drops_oldest() {
        let d = domain(206);
        let publisher = Publisher::<Ping>::new(&d, "Pings", Qos::realtime()).unwrap();
        assert!(publisher.start());
        let mut sub = Subscriber::<Ping>::new(&d, "Pings", Qos::realtime()).unwrap();

        // Depth-1 ring: the second write supersedes the first.
        assert!(publisher.publish(&Ping { seq: 0 }));
        assert!(publisher.publish(&Ping { seq: 1 }));
        assert_eq!(sub.recv().await, Some(Ping { seq: 1 }));
    }
}
