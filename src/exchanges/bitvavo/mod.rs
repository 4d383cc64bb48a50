pub mod book;
pub mod codec;
pub mod registry;
pub mod session;
pub mod types;

pub mod builder;
pub mod client;
pub mod rest;

// Re-export main components
pub use book::{BookCallback, BookSyncOutcome, BookSyncState, LocalBook};
pub use builder::{build_client, BitvavoBuilder};
pub use client::BitvavoClient;
pub use codec::{BitvavoCodec, BitvavoMessage, StreamEvent};
pub use registry::{EventCallback, SubscriptionRegistry};
pub use rest::BitvavoRest;
pub use session::{ErrorCallback, SessionState, StreamSession, StreamSessionConfig};
pub use types::{is_private_action, Channel, ChannelSubscription, ServerTime, SubscriptionKey};
