//! Delivery of logged events to live subscribers

pub mod service;
pub mod subscribers;

pub use service::{parse_entry, CycleReport, StreamFanout};
pub use subscribers::{BroadcastReport, SubscriberId, SubscriberSet};
