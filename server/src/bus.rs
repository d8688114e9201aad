//! Broadcast collaborator.
//!
//! Room actors publish every accepted event on the room topic and merge what
//! other observers publish. The [`Transport`] trait is the seam; [`LocalBus`]
//! is the in-process implementation backed by one `tokio::sync::broadcast`
//! channel per topic. Its connectivity signal can be flipped to simulate a
//! dropped link, during which publishes are lost.

use log::{debug, warn};
use shared::{RaceError, RaceEvent};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

/// Messages buffered per subscriber before it starts lagging.
pub const TOPIC_CAPACITY: usize = 1024;

/// Identifies a publishing observer so it can skip its own echoes.
pub type ObserverId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: ObserverId,
    pub event: RaceEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected,
}

/// Publish/subscribe with at-least-once, unordered semantics.
pub trait Transport: Send + Sync + 'static {
    fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), RaceError>;

    fn subscribe(&self, topic: &str) -> Subscription;

    fn connectivity(&self) -> watch::Receiver<Connectivity>;
}

/// Receiving half of a topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next envelope on the topic.
    ///
    /// A lagging or closed channel is reported as `ConnectivityLost`; missed
    /// messages are not replayed.
    pub async fn recv(&mut self) -> Result<Envelope, RaceError> {
        match self.receiver.recv().await {
            Ok(envelope) => Ok(envelope),
            Err(RecvError::Lagged(missed)) => {
                warn!("Subscriber on {} lagged, {} events missed", self.topic, missed);
                Err(RaceError::ConnectivityLost)
            }
            Err(RecvError::Closed) => {
                debug!("Topic {} closed", self.topic);
                Err(RaceError::ConnectivityLost)
            }
        }
    }
}

pub struct LocalBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    status: watch::Sender<Connectivity>,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (status, _) = watch::channel(Connectivity::Connected);
        Self {
            topics: Mutex::new(HashMap::new()),
            status,
            capacity,
        }
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.status.send_replace(connectivity);
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == Connectivity::Connected
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Topics with at least one live subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sender for a topic that still has an audience. Topics whose last
    /// subscriber went away are dropped here.
    fn live_sender(&self, topic: &str) -> Option<broadcast::Sender<Envelope>> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(sender) if sender.receiver_count() > 0 => Some(sender.clone()),
            Some(_) => {
                debug!("Topic {} has no subscribers left, dropping it", topic);
                topics.remove(topic);
                None
            }
            None => None,
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalBus {
    fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), RaceError> {
        if !self.is_connected() {
            debug!("Dropped {} on {}: bus disconnected", envelope.event.kind(), topic);
            return Err(RaceError::ConnectivityLost);
        }
        // No subscribers is not an error; the event simply has no audience yet.
        if let Some(sender) = self.live_sender(topic) {
            let _ = sender.send(envelope);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.retain(|_, sender| sender.receiver_count() > 0);
        let receiver = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            topic: topic.to_string(),
            receiver,
        }
    }

    fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ParticipantId;

    fn left(id: u32) -> RaceEvent {
        RaceEvent::ParticipantLeft {
            participant_id: ParticipantId(id),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("room:AAAAAA");
        let mut b = bus.subscribe("room:AAAAAA");
        assert_eq!(bus.subscriber_count("room:AAAAAA"), 2);

        bus.publish(
            "room:AAAAAA",
            Envelope {
                origin: 7,
                event: left(1),
            },
        )
        .unwrap();

        assert_eq!(a.recv().await.unwrap().origin, 7);
        assert_eq!(b.recv().await.unwrap().event, left(1));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = LocalBus::new();
        let mut other = bus.subscribe("room:BBBBBB");

        bus.publish(
            "room:AAAAAA",
            Envelope {
                origin: 1,
                event: left(1),
            },
        )
        .unwrap();

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(20), other.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_disconnected_bus_drops_publishes() {
        let bus = LocalBus::new();
        let mut status = bus.connectivity();
        let mut sub = bus.subscribe("room:CCCCCC");

        bus.set_connectivity(Connectivity::Disconnected);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), Connectivity::Disconnected);

        let result = bus.publish(
            "room:CCCCCC",
            Envelope {
                origin: 1,
                event: left(2),
            },
        );
        assert_eq!(result, Err(RaceError::ConnectivityLost));

        bus.set_connectivity(Connectivity::Connected);
        bus.publish(
            "room:CCCCCC",
            Envelope {
                origin: 1,
                event: left(3),
            },
        )
        .unwrap();
        assert_eq!(sub.recv().await.unwrap().event, left(3));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_reports_lost_connectivity() {
        let bus = LocalBus::with_capacity(2);
        let mut sub = bus.subscribe("room:DDDDDD");

        for id in 0..5 {
            bus.publish(
                "room:DDDDDD",
                Envelope {
                    origin: 1,
                    event: left(id),
                },
            )
            .unwrap();
        }

        assert_eq!(sub.recv().await, Err(RaceError::ConnectivityLost));
        assert!(sub.recv().await.is_ok());
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("room:EEEEEE");
        assert_eq!(sub.topic(), "room:EEEEEE");
        assert_eq!(bus.subscriber_count("room:EEEEEE"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("room:EEEEEE"), 0);
    }

    #[test]
    fn test_abandoned_topics_are_dropped() {
        let bus = LocalBus::new();
        for code in ["AAAAAA", "BBBBBB", "CCCCCC"] {
            drop(bus.subscribe(&format!("room:{}", code)));
        }
        let _live = bus.subscribe("room:DDDDDD");
        assert_eq!(bus.topic_count(), 1);

        let gone = bus.subscribe("room:EEEEEE");
        drop(gone);
        bus.publish(
            "room:EEEEEE",
            Envelope {
                origin: 1,
                event: left(1),
            },
        )
        .unwrap();
        assert_eq!(bus.topic_count(), 1);

        // Publishing to a topic nobody ever subscribed to creates nothing.
        bus.publish(
            "room:FFFFFF",
            Envelope {
                origin: 1,
                event: left(1),
            },
        )
        .unwrap();
        assert_eq!(bus.topic_count(), 1);
    }
}
