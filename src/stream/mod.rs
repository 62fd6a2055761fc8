//! Job event streaming.
//!
//! - `event` — StreamEvent and its payloads
//! - `broker` — per-job topics with bounded fan-out

pub mod broker;
pub mod event;

pub use broker::{EventStream, StreamBroker, Topic};
pub use event::{EventPayload, StreamEvent};
