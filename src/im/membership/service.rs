//! 会话成员管理
//!
//! 通过手机号查找用户后建立私聊、群聊或向群聊加人。手机号统一补齐区号，必须唯一匹配一个用户。
//! 新会话的成员关系逐条写入，中途失败时已写入的行保留，不做跨表回滚。

use crate::im::conversation::api::ConversationApi;
use crate::im::error::{ChatError, ChatResult};
use crate::im::gateway::Gateway;
use crate::im::types::{ChatKind, Conversation, User};
use crate::im::user::{normalize_phone, UserApi};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// 成员管理
pub struct MembershipManager {
    users: UserApi,
    conversations: ConversationApi,
    phone_prefix: String,
}

impl MembershipManager {
    pub fn new(gateway: Arc<dyn Gateway>, phone_prefix: &str) -> Self {
        Self {
            users: UserApi::new(gateway.clone()),
            conversations: ConversationApi::new(gateway),
            phone_prefix: phone_prefix.to_string(),
        }
    }

    async fn resolve(&self, phone: &str) -> ChatResult<User> {
        if phone.trim().is_empty() {
            return Err(ChatError::Validation("请输入手机号".to_string()));
        }
        let number = normalize_phone(&self.phone_prefix, phone);
        self.users.resolve_by_phone(&number).await
    }

    /// 向已有会话添加成员，返回被添加的用户
    pub async fn add_member(
        &self,
        conversation_id: &str,
        phone: &str,
        current_member_ids: &[String],
    ) -> ChatResult<User> {
        let user = self.resolve(phone).await?;
        if current_member_ids.iter().any(|id| *id == user.id) {
            return Err(ChatError::AlreadyMember("该用户已在会话中".to_string()));
        }
        self.conversations
            .add_membership(conversation_id, &user.id)
            .await?;
        info!(
            "[Member] ➕ 用户 {} 已加入会话 {}",
            user.id, conversation_id
        );
        Ok(user)
    }

    /// 当前用户与目标用户之间已有的私聊
    async fn find_private_chat(&self, current_user_id: &str, target_id: &str) -> ChatResult<Option<Conversation>> {
        let own = self.conversations.fetch_memberships_of(current_user_id).await?;
        let chat_ids: Vec<String> = own.into_iter().map(|m| m.chat_id).collect();
        let private: Vec<Conversation> = self
            .conversations
            .fetch_conversations(&chat_ids)
            .await?
            .into_iter()
            .filter(|c| c.kind == ChatKind::Private)
            .collect();
        if private.is_empty() {
            return Ok(None);
        }

        let private_ids: Vec<String> = private.iter().map(|c| c.id.clone()).collect();
        let with_target: HashSet<String> = self
            .conversations
            .fetch_members(&private_ids)
            .await?
            .into_iter()
            .filter(|m| m.user_id == target_id)
            .map(|m| m.chat_id)
            .collect();
        Ok(private.into_iter().find(|c| with_target.contains(&c.id)))
    }

    /// 发起私聊；已有私聊时直接返回，不重复创建
    pub async fn create_private_chat(&self, current_user: &User, phone: &str) -> ChatResult<Conversation> {
        let target = self.resolve(phone).await?;
        if target.id == current_user.id {
            return Err(ChatError::SelfChat);
        }

        if let Some(existing) = self.find_private_chat(&current_user.id, &target.id).await? {
            debug!("[Member] 与 {} 的私聊已存在: {}", target.id, existing.id);
            return Ok(existing);
        }

        let chat = self
            .conversations
            .create_conversation(ChatKind::Private, None, &current_user.id)
            .await?;
        for user_id in [&current_user.id, &target.id] {
            self.conversations.add_membership(&chat.id, user_id).await?;
        }
        info!("[Member] 💬 已创建私聊 {}，对方: {}", chat.id, target.id);
        Ok(chat)
    }

    /// 起草群聊时按手机号添加一位候选成员
    pub async fn stage_group_member(
        &self,
        current_user: &User,
        phone: &str,
        staged: &[User],
    ) -> ChatResult<User> {
        let user = self.resolve(phone).await?;
        if user.id == current_user.id {
            return Err(ChatError::SelfChat);
        }
        if staged.iter().any(|u| u.id == user.id) {
            return Err(ChatError::AlreadyMember("该用户已添加".to_string()));
        }
        Ok(user)
    }

    /// 创建群聊，创建者自动成为成员
    pub async fn create_group_chat(
        &self,
        current_user: &User,
        name: &str,
        member_ids: &[String],
    ) -> ChatResult<Conversation> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("请输入群组名称".to_string()));
        }
        if member_ids.is_empty() {
            return Err(ChatError::Validation("请至少添加一位成员".to_string()));
        }

        let mut seen = HashSet::new();
        let members: Vec<&str> = std::iter::once(current_user.id.as_str())
            .chain(member_ids.iter().map(String::as_str))
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .collect();

        let chat = self
            .conversations
            .create_conversation(ChatKind::Group, Some(name), &current_user.id)
            .await?;
        for user_id in members.iter() {
            self.conversations.add_membership(&chat.id, user_id).await?;
        }
        info!(
            "[Member] 👥 已创建群聊 {}（{}），成员 {} 人",
            chat.id,
            name,
            members.len()
        );
        Ok(chat)
    }
}
