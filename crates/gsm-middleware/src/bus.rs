//! Typed, topic-based publish/subscribe bus for outbound map traffic.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives every
//! message without any single subscriber blocking the others.  Each
//! [`Topic`] has its own channel; every event is additionally mirrored onto a
//! global tap channel used by transport sinks that forward everything.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::SegmentUpdates`] | Per-object map updates |
//! | [`Topic::SceneUpdates`] | Full-scene snapshots |
//! | [`Topic::SegmentMeshes`] | Per-object meshes |
//! | [`Topic::SceneMeshes`] | Incremental and full scene meshes |
//! | [`Topic::Evictions`] | Labels removed by the sliding window |
//! | [`Topic::BoundingBoxes`] | Oriented boxes of published objects |
//! | [`Topic::WindowPose`] | New sliding-window reference frame |
//! | [`Topic::FeatureBlocks`] | Feature-layer blocks touched by a feature frame |

use gsm_types::{Event, EventPayload};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Every outbound routing topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SegmentUpdates,
    SceneUpdates,
    SegmentMeshes,
    SceneMeshes,
    Evictions,
    BoundingBoxes,
    WindowPose,
    FeatureBlocks,
}

impl Topic {
    /// The topic an event payload naturally belongs to.
    pub fn for_payload(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::SegmentUpdate(_) => Topic::SegmentUpdates,
            EventPayload::SceneUpdate(_) => Topic::SceneUpdates,
            EventPayload::SegmentMesh(_) => Topic::SegmentMeshes,
            EventPayload::SceneMesh(_) => Topic::SceneMeshes,
            EventPayload::Eviction(_) => Topic::Evictions,
            EventPayload::BoundingBox(_) => Topic::BoundingBoxes,
            EventPayload::WindowPose(_) => Topic::WindowPose,
            EventPayload::FeatureBlocks(_) => Topic::FeatureBlocks,
        }
    }
}

/// Shared bus.  Clone it cheaply – all clones share the same channels.
#[derive(Clone, Debug)]
pub struct MapBus {
    tap: broadcast::Sender<Event>,
    segment_updates: broadcast::Sender<Event>,
    scene_updates: broadcast::Sender<Event>,
    segment_meshes: broadcast::Sender<Event>,
    scene_meshes: broadcast::Sender<Event>,
    evictions: broadcast::Sender<Event>,
    bounding_boxes: broadcast::Sender<Event>,
    window_pose: broadcast::Sender<Event>,
    feature_blocks: broadcast::Sender<Event>,
}

impl MapBus {
    /// Create a new bus; `capacity` applies to every channel independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            tap: broadcast::channel(capacity).0,
            segment_updates: broadcast::channel(capacity).0,
            scene_updates: broadcast::channel(capacity).0,
            segment_meshes: broadcast::channel(capacity).0,
            scene_meshes: broadcast::channel(capacity).0,
            evictions: broadcast::channel(capacity).0,
            bounding_boxes: broadcast::channel(capacity).0,
            window_pose: broadcast::channel(capacity).0,
            feature_blocks: broadcast::channel(capacity).0,
        }
    }

    /// Publish `event` on its payload's topic and mirror it onto the tap.
    ///
    /// Returns the number of topic subscribers that were handed the event.
    /// Having no subscribers is a normal condition for a mapping node that
    /// runs headless, so it yields `0` rather than an error.
    pub fn publish(&self, event: Event) -> usize {
        let topic = Topic::for_payload(&event.payload);
        let _ = self.tap.send(event.clone());
        match self.topic_sender(topic).send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(_)) => {
                trace!(?topic, "no subscribers on topic");
                0
            }
        }
    }

    /// Wrap `payload` in an [`Event`] from `source` and publish it.
    pub fn emit(&self, source: &str, payload: EventPayload) -> usize {
        self.publish(Event::new(source, payload))
    }

    /// Subscribe to one [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.tap.subscribe()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::SegmentUpdates => &self.segment_updates,
            Topic::SceneUpdates => &self.scene_updates,
            Topic::SegmentMeshes => &self.segment_meshes,
            Topic::SceneMeshes => &self.scene_meshes,
            Topic::Evictions => &self.evictions,
            Topic::BoundingBoxes => &self.bounding_boxes,
            Topic::WindowPose => &self.window_pose,
            Topic::FeatureBlocks => &self.feature_blocks,
        }
    }
}

impl Default for MapBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.  Lagged gaps are logged and
    /// skipped; `None` means the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Blocking receive for plain OS threads.
    pub fn blocking_recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.blocking_recv()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(_) => return events,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_types::{EvictionNotice, Label};

    fn eviction(label: u32) -> EventPayload {
        EventPayload::Eviction(EvictionNotice {
            label: Label(label),
        })
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = MapBus::default();
        assert_eq!(bus.emit("test", eviction(1)), 0);
    }

    #[test]
    fn event_routes_to_payload_topic_only() {
        let bus = MapBus::default();
        let mut evictions = bus.subscribe_to(Topic::Evictions);
        let mut scenes = bus.subscribe_to(Topic::SceneUpdates);

        assert_eq!(bus.emit("test", eviction(3)), 1);

        let received = evictions.drain();
        assert_eq!(received.len(), 1);
        assert!(scenes.drain().is_empty());
    }

    #[tokio::test]
    async fn tap_sees_every_topic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = MapBus::default();
        let mut tap = bus.subscribe_all();

        bus.emit("a", eviction(1));
        bus.emit(
            "b",
            EventPayload::WindowPose(gsm_types::WindowPose {
                parent_frame: "world".into(),
                child_frame: "sliding_window".into(),
                position: gsm_types::Point3::zero(),
            }),
        );

        assert_eq!(tap.recv().await?.source, "a");
        assert_eq!(tap.recv().await?.source, "b");
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = MapBus::default();
        let mut rx1 = bus.subscribe_to(Topic::Evictions);
        let mut rx2 = bus.subscribe_to(Topic::Evictions);

        let event = Event::new("test", eviction(5));
        bus.publish(event.clone());

        assert_eq!(rx1.recv().await.map(|e| e.id), Some(event.id));
        assert_eq!(rx2.recv().await.map(|e| e.id), Some(event.id));
    }

    #[test]
    fn slow_subscriber_skips_lagged_events_on_drain() {
        let bus = MapBus::new(4);
        let mut slow = bus.subscribe_to(Topic::Evictions);
        for i in 0..10 {
            bus.emit("flood", eviction(i));
        }
        let received = slow.drain();
        assert_eq!(received.len(), 4);
    }
}
