pub mod core;
pub mod exchanges;

pub use crate::core::{
    config::ExchangeConfig, errors::ExchangeError, kernel::RateLimitGovernor, types::*,
};
pub use crate::exchanges::bitvavo::{build_client, BitvavoBuilder, BitvavoClient, StreamSession};
