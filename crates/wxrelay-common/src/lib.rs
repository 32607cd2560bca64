//! # wxrelay-common
//!
//! Common types and data structures for the wxrelay message pipeline.
//!
//! This crate is the leaf of the workspace: it holds the persisted records
//! (messages, listeners, platforms, rules, conversation keys) and the result
//! types shared between the platform implementations and the delivery
//! service, so that neither side needs to import the other.

pub mod conversation;
pub mod listener;
pub mod message;
pub mod platform;
pub mod rule;

pub use conversation::{ConversationEntry, ConversationKey, derive_user_id};
pub use listener::{FixedListener, Listener, ListenerStatus};
pub use message::{DeliveryStatus, FileType, Message, NewMessage, SkipReason};
pub use platform::{
    CozeConfig, DifyConfig, KeywordConfig, KeywordRule, MatchType, MessageSendMode, OpenAiConfig,
    PlatformDescriptor, PlatformKind, PlatformReply, ZhiweijzConfig,
};
pub use rule::Rule;
