//! 消息会话模块
//!
//! 单个会话的消息记录同步、乐观发送、附件上传以及按天分组

pub mod api;
pub mod grouping;
pub mod listener;
pub mod models;
pub mod service;

// 重新导出主要类型和函数
pub use api::MessageApi;
pub use grouping::{day_label, format_message_time, format_roster_date, group_by_day, TranscriptItem};
pub use listener::{EmptyTranscriptListener, TranscriptListener};
pub use models::{Attachment, DeliveryState, TranscriptEntry};
pub use service::{TranscriptHandle, TranscriptState, TranscriptSyncer};
