//! 错误类型
//!
//! 校验类、查重类错误在本地直接转换成面向用户的提示；远程调用失败统一归为 `RemoteFailure`，
//! 由调用方回滚乐观状态后给出通用的重试提示。不做任何自动重试。

/// SDK 统一错误
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// 按手机号 / ID 查询不到（或匹配到多条）
    #[error("未找到: {0}")]
    NotFound(String),

    #[error("已存在: {0}")]
    AlreadyExists(String),

    #[error("已经是成员: {0}")]
    AlreadyMember(String),

    #[error("不能以自己为对象")]
    SelfChat,

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("远程调用失败: {0}")]
    RemoteFailure(#[from] anyhow::Error),

    /// 本地保存的会话数据无法解析
    #[error("本地数据损坏: {0}")]
    Malformed(String),

    /// 附件已上传成功，但随后的消息写入失败，存储桶中留下了孤立文件
    #[error("附件消息写入失败，已上传文件未清理: {path} ({reason})")]
    OrphanedUpload { path: String, reason: String },

    /// 同步器已关闭
    #[error("同步器已关闭")]
    Closed,
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// 面向用户的提示文案
    pub fn user_message(&self) -> String {
        match self {
            ChatError::NotFound(what) => what.clone(),
            ChatError::AlreadyExists(what) => what.clone(),
            ChatError::AlreadyMember(what) => what.clone(),
            ChatError::SelfChat => "不能与自己发起会话".to_string(),
            ChatError::Validation(what) => what.clone(),
            ChatError::RemoteFailure(_) | ChatError::OrphanedUpload { .. } => {
                "操作失败，请稍后重试".to_string()
            }
            // 会话数据损坏时静默回到登录流程，这里给出的文案仅用于日志
            ChatError::Malformed(_) => "请重新登录".to_string(),
            ChatError::Closed => "会话已关闭".to_string(),
        }
    }

    /// 是否是需要用户重新发起操作的远程错误
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ChatError::RemoteFailure(_) | ChatError::OrphanedUpload { .. }
        )
    }
}
