//! Event Hub: single-writer, many-reader broadcast with backpressure-by-drop.

pub mod hub;

pub use hub::{EventHub, HubEvent, Subscription};
