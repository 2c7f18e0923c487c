//! 会话列表监听器回调接口

use crate::im::conversation::models::ChatSummary;
use async_trait::async_trait;

/// 会话列表监听器
#[async_trait]
pub trait RosterListener: Send + Sync {
    /// 会话列表变更（已排序的完整列表）
    async fn on_roster_changed(&self, roster: Vec<ChatSummary>);

    /// 拉取会话列表失败，列表保持上一次的内容
    async fn on_sync_failed(&self, reason: String);
}

/// 空实现（默认监听器）
pub struct EmptyRosterListener;

#[async_trait]
impl RosterListener for EmptyRosterListener {
    async fn on_roster_changed(&self, _roster: Vec<ChatSummary>) {}
    async fn on_sync_failed(&self, _reason: String) {}
}
