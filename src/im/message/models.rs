//! 消息会话本地模型

use crate::im::types::{Message, MessageKind};
use serde::Serialize;

/// 本地临时消息 ID 前缀
pub const LOCAL_ID_PREFIX: &str = "local-";

/// 投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryState {
    /// 已在本地显示，等待后端确认
    Pending,
    /// 后端已确认
    Confirmed,
}

/// 消息记录中的一项
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub message: Message,
    pub state: DeliveryState,
}

impl TranscriptEntry {
    pub fn confirmed(message: Message) -> Self {
        Self {
            message,
            state: DeliveryState::Confirmed,
        }
    }

    pub fn pending(message: Message) -> Self {
        Self {
            message,
            state: DeliveryState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }

    /// 是否可能是同一次发送：发送者、类型和内容都相同
    pub(crate) fn same_send(&self, message: &Message) -> bool {
        self.message.sender_id == message.sender_id
            && self.message.kind == message.kind
            && self.message.content == message.content
    }
}

/// 待发送的附件
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    /// 声明的媒体类型，例如 `image/png`
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// 文件扩展名（取最后一个 `.` 之后的部分），只接受 ASCII 字母和数字
    ///
    /// 扩展名会拼进存储路径，含 `/` 等字符时视为没有扩展名。
    pub fn extension(&self) -> Option<&str> {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_content_type(&self.content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_extension_and_kind() {
        let photo = Attachment::new("holiday.photo.JPG", "image/jpeg", vec![1]);
        assert_eq!(photo.extension(), Some("JPG"));
        assert_eq!(photo.kind(), MessageKind::Image);

        let bare = Attachment::new("README", "application/octet-stream", vec![]);
        assert_eq!(bare.extension(), None);
        assert_eq!(bare.kind(), MessageKind::File);

        for name in ["x./evil", "a.b\\c", "clip.mp4?x", "trail."] {
            assert_eq!(Attachment::new(name, "video/mp4", vec![]).extension(), None, "{}", name);
        }
    }
}
