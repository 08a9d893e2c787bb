//! `gsm-middleware` – transport plumbing for the segment map node.
//!
//! Routes data between the outside world and the mapping pipeline without
//! caring about its meaning.
//!
//! # Modules
//!
//! - [`bus`] – Typed, topic-based publish/subscribe bus for outbound map
//!   traffic, built on Tokio broadcast channels.
//! - [`adapter`] – Inbound [`ObservationSource`] trait and the JSON-lines
//!   reader.
//! - [`json_sink`] – Forwards every bus event to a writer as JSON lines.

pub mod adapter;
pub mod bus;
pub mod json_sink;

pub use adapter::{JsonLinesSource, ObservationSource, parse_observation};
pub use bus::{MapBus, Topic, TopicReceiver};
pub use json_sink::JsonLinesSink;
