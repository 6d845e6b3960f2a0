//! External feed ingestion

pub mod feed;
pub mod session;
pub mod wire;

pub use feed::{FeedIngestor, FrameReport};
pub use session::{FeedSession, FeedSignal, FeedState, SessionAction};
pub use wire::{parse_frame, FeedPayload, SubscribeRequest};
