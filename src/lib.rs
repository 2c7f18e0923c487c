pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    auth::{AuthService, DEMO_OTP},
    client::{ChatClient, ClientConfig},
    conversation::{ChatSummary, ChatTypeFilter, RosterHandle, RosterListener, RosterSyncer},
    error::{ChatError, ChatResult},
    gateway::{Gateway, MemoryGateway, RestGateway},
    label::LabelManager,
    membership::MembershipManager,
    message::{Attachment, TranscriptEntry, TranscriptHandle, TranscriptListener, TranscriptSyncer},
    session::{LocalStorage, MemoryStorage, SessionStore, SqliteStorage},
};
