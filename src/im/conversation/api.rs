//! 会话相关的远程调用
//!
//! 网关只支持平铺查询，关联数据（成员、用户、消息、标签）在这里分批查询后交给
//! [`build_roster`](crate::im::conversation::roster::build_roster) 拼装。

use crate::im::conversation::roster::RosterRows;
use crate::im::gateway::{decode_row, decode_rows, Filter, Gateway, Query};
use crate::im::types::{
    tables, ChatKind, ChatMemberRow, Conversation, Label, LabelAssignment, Message, User,
};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// 会话 API
#[derive(Clone)]
pub struct ConversationApi {
    gateway: Arc<dyn Gateway>,
}

fn unique(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

impl ConversationApi {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// 用户加入的所有会话的成员关系，按加入时间倒序
    pub async fn fetch_memberships_of(&self, user_id: &str) -> Result<Vec<ChatMemberRow>> {
        let rows = self
            .gateway
            .select(
                tables::CHAT_MEMBERS,
                &Query::new()
                    .filter(Filter::eq("user_id", user_id))
                    .order("joined_at", false),
            )
            .await
            .context("查询用户的会话成员关系失败")?;
        decode_rows(tables::CHAT_MEMBERS, rows)
    }

    /// 一批会话的全部成员关系
    pub async fn fetch_members(&self, chat_ids: &[String]) -> Result<Vec<ChatMemberRow>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .gateway
            .select(
                tables::CHAT_MEMBERS,
                &Query::new().filter(Filter::in_list("chat_id", chat_ids.to_vec())),
            )
            .await
            .context("查询会话成员失败")?;
        decode_rows(tables::CHAT_MEMBERS, rows)
    }

    pub async fn fetch_conversations(&self, chat_ids: &[String]) -> Result<Vec<Conversation>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .gateway
            .select(
                tables::CHATS,
                &Query::new().filter(Filter::in_list("id", chat_ids.to_vec())),
            )
            .await
            .context("查询会话失败")?;
        decode_rows(tables::CHATS, rows)
    }

    pub async fn fetch_users(&self, user_ids: &[String]) -> Result<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .gateway
            .select(
                tables::USERS,
                &Query::new().filter(Filter::in_list("id", user_ids.to_vec())),
            )
            .await
            .context("查询会话成员用户失败")?;
        decode_rows(tables::USERS, rows)
    }

    /// 一批会话的全部消息（用于计算每个会话的最新消息）
    pub async fn fetch_messages(&self, chat_ids: &[String]) -> Result<Vec<Message>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .gateway
            .select(
                tables::MESSAGES,
                &Query::new()
                    .filter(Filter::in_list("chat_id", chat_ids.to_vec()))
                    .order("created_at", true),
            )
            .await
            .context("查询会话消息失败")?;
        decode_rows(tables::MESSAGES, rows)
    }

    pub async fn fetch_assignments(&self, chat_ids: &[String]) -> Result<Vec<LabelAssignment>> {
        if chat_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .gateway
            .select(
                tables::CHAT_LABELS,
                &Query::new().filter(Filter::in_list("chat_id", chat_ids.to_vec())),
            )
            .await
            .context("查询会话标签失败")?;
        decode_rows(tables::CHAT_LABELS, rows)
    }

    pub async fn fetch_labels(&self, label_ids: &[String]) -> Result<Vec<Label>> {
        if label_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .gateway
            .select(
                tables::LABELS,
                &Query::new().filter(Filter::in_list("id", label_ids.to_vec())),
            )
            .await
            .context("查询标签失败")?;
        decode_rows(tables::LABELS, rows)
    }

    /// 拉取构建会话列表所需的全部数据
    pub async fn fetch_roster_rows(&self, user_id: &str) -> Result<RosterRows> {
        let own = self.fetch_memberships_of(user_id).await?;
        let chat_ids = unique(own.into_iter().map(|m| m.chat_id));
        debug!(
            "[ConvAPI] 用户 {} 共加入 {} 个会话",
            user_id,
            chat_ids.len()
        );
        if chat_ids.is_empty() {
            return Ok(RosterRows::default());
        }

        let conversations = self.fetch_conversations(&chat_ids).await?;
        let memberships = self.fetch_members(&chat_ids).await?;
        let messages = self.fetch_messages(&chat_ids).await?;
        let assignments = self.fetch_assignments(&chat_ids).await?;

        let user_ids = unique(
            memberships
                .iter()
                .map(|m| m.user_id.clone())
                .chain(messages.iter().map(|m| m.sender_id.clone())),
        );
        let users = self.fetch_users(&user_ids).await?;
        let label_ids = unique(assignments.iter().map(|a| a.label_id.clone()));
        let labels = self.fetch_labels(&label_ids).await?;

        Ok(RosterRows {
            conversations,
            memberships,
            users,
            messages,
            assignments,
            labels,
        })
    }

    /// 新建会话
    pub async fn create_conversation(
        &self,
        kind: ChatKind,
        name: Option<&str>,
        created_by: &str,
    ) -> Result<Conversation> {
        let row = self
            .gateway
            .insert(
                tables::CHATS,
                json!({
                    "type": kind.as_str(),
                    "name": name,
                    "created_by": created_by,
                }),
            )
            .await
            .context("创建会话失败")?;
        decode_row(tables::CHATS, row)
    }

    /// 新增一条成员关系
    pub async fn add_membership(&self, chat_id: &str, user_id: &str) -> Result<ChatMemberRow> {
        let row = self
            .gateway
            .insert(
                tables::CHAT_MEMBERS,
                json!({
                    "chat_id": chat_id,
                    "user_id": user_id,
                    "joined_at": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await
            .with_context(|| format!("添加会话成员失败: {} -> {}", user_id, chat_id))?;
        decode_row(tables::CHAT_MEMBERS, row)
    }
}
