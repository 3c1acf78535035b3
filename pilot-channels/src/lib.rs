//! Channel adapter boundary for the pilot bridge.
//!
//! Adapters are pure I/O: they turn platform updates into `InboundMessage`
//! values and deliver outbound text (plain sends, progressive edits, typing).

mod telegram;
mod traits;
mod types;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    AdapterCapabilities, ChannelName, InboundMessage, OutboundKind, ProgressReceipt,
};
