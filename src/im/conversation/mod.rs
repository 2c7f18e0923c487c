//! 会话列表模块
//!
//! 拉取当前用户加入的会话，附带成员、标签和最新消息，按最近活动排序并通过推送保持最新

pub mod api;
pub mod listener;
pub mod models;
pub mod roster;
pub mod service;

// 重新导出主要类型和函数
pub use api::ConversationApi;
pub use listener::{EmptyRosterListener, RosterListener};
pub use models::{ChatSummary, ChatTypeFilter, Member};
pub use roster::{build_roster, filter_roster, latest_message, sort_roster, RosterRows};
pub use service::{RosterHandle, RosterState, RosterSyncer};
