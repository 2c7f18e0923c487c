//! 会话列表本地模型

use crate::im::types::{ChatKind, Conversation, Label, Message, MessageKind, User};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;

/// 会话成员；成员对应的用户可能已被删除，此时 `user` 为空
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub user_id: String,
    pub user: Option<User>,
}

impl Member {
    /// 成员显示名，用户不存在时为空字符串
    pub fn name(&self) -> &str {
        self.user
            .as_ref()
            .map(|u| u.full_name.as_str())
            .unwrap_or("")
    }

    pub fn phone(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|u| u.mobile_number.as_str())
            .filter(|p| !p.is_empty())
    }
}

/// 会话列表中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSummary {
    pub conversation: Conversation,
    pub members: Vec<Member>,
    pub labels: Vec<Label>,
    pub latest_message: Option<Message>,
    /// 用于搜索的名称：群聊为群名，私聊为对方的名字，缺失时为空字符串
    pub display_name: String,
    /// 私聊中的对方（构建列表时按当前用户计算）
    pub counterpart: Option<Member>,
}

impl ChatSummary {
    pub fn new(
        viewer_id: &str,
        conversation: Conversation,
        members: Vec<Member>,
        labels: Vec<Label>,
        latest_message: Option<Message>,
    ) -> Self {
        let counterpart = match conversation.kind {
            ChatKind::Private => members.iter().find(|m| m.user_id != viewer_id).cloned(),
            ChatKind::Group => None,
        };
        let display_name = match conversation.kind {
            ChatKind::Private => counterpart
                .as_ref()
                .map(|m| m.name().to_string())
                .unwrap_or_default(),
            ChatKind::Group => conversation.name.clone().unwrap_or_default(),
        };
        Self {
            conversation,
            members,
            labels,
            latest_message,
            display_name,
            counterpart,
        }
    }

    pub fn id(&self) -> &str {
        &self.conversation.id
    }

    pub fn kind(&self) -> ChatKind {
        self.conversation.kind
    }

    /// 排序依据：最新消息时间，没有消息时用会话创建时间
    pub fn latest_activity(&self) -> DateTime<Utc> {
        self.latest_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.conversation.created_at)
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    pub fn has_label(&self, label_id: &str) -> bool {
        self.labels.iter().any(|l| l.id == label_id)
    }

    /// 列表标题
    pub fn title(&self) -> String {
        if !self.display_name.is_empty() {
            return self.display_name.clone();
        }
        match self.kind() {
            ChatKind::Group => "未命名群组".to_string(),
            ChatKind::Private => String::new(),
        }
    }

    /// 私聊对方的手机号
    pub fn counterpart_phone(&self) -> Option<&str> {
        self.counterpart.as_ref().and_then(|m| m.phone())
    }

    /// 最新消息摘要
    pub fn preview(&self) -> String {
        match &self.latest_message {
            None => "暂无消息".to_string(),
            Some(msg) => match msg.kind {
                MessageKind::Text => msg.content.clone(),
                MessageKind::Image => "[图片]".to_string(),
                MessageKind::Video => "[视频]".to_string(),
                MessageKind::File => format!("[文件] {}", msg.content),
            },
        }
    }
}

/// 会话类型筛选
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatTypeFilter {
    #[default]
    All,
    Private,
    Group,
}

impl ChatTypeFilter {
    pub fn accepts(&self, kind: ChatKind) -> bool {
        match self {
            ChatTypeFilter::All => true,
            ChatTypeFilter::Private => kind == ChatKind::Private,
            ChatTypeFilter::Group => kind == ChatKind::Group,
        }
    }
}

impl FromStr for ChatTypeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(ChatTypeFilter::All),
            "private" => Ok(ChatTypeFilter::Private),
            "group" => Ok(ChatTypeFilter::Group),
            other => Err(format!("未知的会话类型筛选: {}", other)),
        }
    }
}
