//! 消息记录监听器
//!
//! 一个会话打开期间的消息事件回调。

use crate::im::message::models::TranscriptEntry;
use crate::im::types::Message;
use async_trait::async_trait;

/// 消息记录监听器
#[async_trait]
pub trait TranscriptListener: Send + Sync {
    /// 历史消息加载完成（升序，只触发一次）
    async fn on_history(&self, messages: Vec<Message>);

    /// 新消息进入记录（推送到达或自己发送的消息被确认）
    ///
    /// 每条消息只通知一次，会话列表的快速更新依赖这个回调。
    async fn on_new_message(&self, message: Message);

    /// 记录内容变化，包括乐观条目的增加和回滚
    async fn on_transcript_changed(&self, entries: Vec<TranscriptEntry>);

    /// 加载或推送处理失败
    async fn on_sync_failed(&self, reason: String);
}

/// 空实现（默认监听器）
pub struct EmptyTranscriptListener;

#[async_trait]
impl TranscriptListener for EmptyTranscriptListener {
    async fn on_history(&self, _messages: Vec<Message>) {}
    async fn on_new_message(&self, _message: Message) {}
    async fn on_transcript_changed(&self, _entries: Vec<TranscriptEntry>) {}
    async fn on_sync_failed(&self, _reason: String) {}
}
