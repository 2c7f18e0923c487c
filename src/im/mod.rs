pub mod auth;
pub mod client;
pub mod conversation;
pub mod db;
pub mod error;
pub mod gateway;
pub mod label;
pub mod membership;
pub mod message;
pub mod optimistic;
pub mod session;
pub mod types;
pub mod user;

// 重新导出错误类型
pub use error::{ChatError, ChatResult};

// 重新导出同步相关类型
pub use conversation::{RosterHandle, RosterListener, RosterSyncer};
pub use message::{TranscriptHandle, TranscriptListener, TranscriptSyncer};
