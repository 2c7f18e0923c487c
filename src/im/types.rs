//! 公共数据类型
//!
//! 与后端表结构一一对应的行模型（users / chats / chat_members / messages / labels / chat_labels）。
//! 字段名直接使用后端列名，可从网关返回的 JSON 行直接反序列化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 表名常量
pub mod tables {
    pub const USERS: &str = "users";
    pub const CHATS: &str = "chats";
    pub const CHAT_MEMBERS: &str = "chat_members";
    pub const MESSAGES: &str = "messages";
    pub const LABELS: &str = "labels";
    pub const CHAT_LABELS: &str = "chat_labels";
}

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
        }
    }
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    File,
}

impl MessageKind {
    /// 根据附件的 MIME 类型推导消息类型：image/* → 图片，video/* → 视频，其余 → 文件
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.trim().to_ascii_lowercase();
        if content_type.starts_with("image/") {
            MessageKind::Image
        } else if content_type.starts_with("video/") {
            MessageKind::Video
        } else {
            MessageKind::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::File => "file",
        }
    }
}

fn default_role() -> String {
    "member".to_string()
}

/// 用户
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub mobile_number: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
}

/// 会话（chats 表的一行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    /// 仅群聊有名称
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 会话成员关系（chat_members 表的一行）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMemberRow {
    pub chat_id: String,
    pub user_id: String,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

/// 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    /// 发送者详情，由客户端关联查询后填充，不写回后端
    #[serde(default, skip_serializing)]
    pub sender: Option<User>,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default = "default_message_kind")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachment_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_message_kind() -> MessageKind {
    MessageKind::Text
}

impl Message {
    /// 发送者显示名，发送者已被删除时返回空字符串
    pub fn sender_name(&self) -> &str {
        self.sender
            .as_ref()
            .map(|u| u.full_name.as_str())
            .unwrap_or("")
    }
}

/// 标签（名称 + 一组显示颜色）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub text_color: String,
}

/// 会话与标签的关联（chat_labels 表的一行），记录由谁在何时打上
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelAssignment {
    pub chat_id: String,
    pub label_id: String,
    #[serde(default)]
    pub assigned_by: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_from_content_type() {
        assert_eq!(MessageKind::from_content_type("image/png"), MessageKind::Image);
        assert_eq!(MessageKind::from_content_type("Video/MP4"), MessageKind::Video);
        assert_eq!(MessageKind::from_content_type("application/pdf"), MessageKind::File);
        assert_eq!(MessageKind::from_content_type(""), MessageKind::File);
    }

    #[test]
    fn message_row_deserializes_backend_columns() {
        let row = serde_json::json!({
            "id": "m1",
            "chat_id": "c1",
            "sender_id": "u1",
            "content": "hello",
            "type": "image",
            "attachment_url": "https://cdn/x.png",
            "created_at": "2024-05-01T10:00:00.123456+00:00"
        });
        let msg: Message = serde_json::from_value(row).unwrap();
        assert_eq!(msg.kind, MessageKind::Image);
        assert!(msg.sender.is_none());
        assert_eq!(msg.sender_name(), "");

        let conv: Conversation = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "type": "group",
            "name": null,
            "created_by": "u1",
            "created_at": "2024-05-01T09:00:00Z"
        }))
        .unwrap();
        assert_eq!(conv.kind, ChatKind::Group);
        assert!(conv.name.is_none());
    }
}
