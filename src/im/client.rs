//! 聊天客户端
//!
//! 把认证、会话列表、消息记录、标签和成员管理组装在一起。同一时间只打开一个会话：选择新会话
//! 前先关闭旧会话的订阅，避免重复投递。打开的会话收到的新消息会通过快速通道同步到会话列表。

use crate::im::auth::AuthService;
use crate::im::conversation::{EmptyRosterListener, RosterHandle, RosterListener, RosterSyncer};
use crate::im::error::{ChatError, ChatResult};
use crate::im::gateway::{Gateway, RestGateway};
use crate::im::label::LabelManager;
use crate::im::membership::MembershipManager;
use crate::im::message::{
    Attachment, EmptyTranscriptListener, TranscriptEntry, TranscriptHandle, TranscriptListener,
    TranscriptSyncer,
};
use crate::im::session::{SessionStore, SqliteStorage};
use crate::im::types::{Message, User};
use crate::im::user::DEFAULT_PHONE_PREFIX;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 默认附件存储桶
pub const DEFAULT_ATTACHMENT_BUCKET: &str = "chat-attachments";

/// 默认本地会话数据库
pub const DEFAULT_SESSION_DB_URL: &str = "sqlite://session.db?mode=rwc";

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// 后端 API 基础地址，例如 `https://xyz.example.co`
    pub api_base_url: String,
    /// 匿名访问密钥
    pub api_key: String,
    /// 推送 WebSocket 地址
    pub realtime_url: String,
    /// 附件存储桶
    pub attachment_bucket: String,
    /// 手机号区号
    pub phone_prefix: String,
    /// 保存登录会话的本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://session.db?mode=rwc`
    pub session_db_url: String,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(api_base_url: String, api_key: String) -> Self {
        let api_base_url = api_base_url.trim_end_matches('/').to_string();
        Self {
            realtime_url: realtime_url_for(&api_base_url),
            api_base_url,
            api_key,
            attachment_bucket: DEFAULT_ATTACHMENT_BUCKET.to_string(),
            phone_prefix: DEFAULT_PHONE_PREFIX.to_string(),
            session_db_url: DEFAULT_SESSION_DB_URL.to_string(),
        }
    }
}

/// 由 API 地址推导推送地址：`http(s)` 换成 `ws(s)`，路径为 `/realtime/v1/websocket`
pub(crate) fn realtime_url_for(api_base_url: &str) -> String {
    let ws_base = if let Some(rest) = api_base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        api_base_url.to_string()
    };
    format!("{}/realtime/v1/websocket", ws_base)
}

/// 转发消息记录回调，并把新消息同步到会话列表
struct RosterBridge {
    inner: Arc<dyn TranscriptListener>,
    roster: Option<RosterHandle>,
}

#[async_trait]
impl TranscriptListener for RosterBridge {
    async fn on_history(&self, messages: Vec<Message>) {
        self.inner.on_history(messages).await;
    }

    async fn on_new_message(&self, message: Message) {
        if let Some(roster) = &self.roster {
            let chat_id = message.chat_id.clone();
            roster.merge_incoming_latest(&chat_id, message.clone()).await;
        }
        self.inner.on_new_message(message).await;
    }

    async fn on_transcript_changed(&self, entries: Vec<TranscriptEntry>) {
        self.inner.on_transcript_changed(entries).await;
    }

    async fn on_sync_failed(&self, reason: String) {
        self.inner.on_sync_failed(reason).await;
    }
}

/// 聊天客户端
pub struct ChatClient {
    config: ClientConfig,
    gateway: Arc<dyn Gateway>,
    sessions: SessionStore,
    auth: AuthService,
    current_user: Option<User>,
    roster_listener: Arc<dyn RosterListener>,
    transcript_listener: Arc<dyn TranscriptListener>,
    roster: Option<RosterHandle>,
    transcript: Option<TranscriptHandle>,
}

impl ChatClient {
    /// 连接真实后端，登录会话保存在 `config.session_db_url`
    pub async fn connect(config: ClientConfig) -> ChatResult<Self> {
        let gateway = RestGateway::new(&config.api_base_url, &config.realtime_url, &config.api_key)?;
        let storage = SqliteStorage::connect(&config.session_db_url).await?;
        info!("[Client] 🔗 已连接后端: {}", config.api_base_url);
        Ok(Self::with_gateway(
            config,
            Arc::new(gateway),
            SessionStore::new(Arc::new(storage)),
        ))
    }

    /// 使用给定的网关和会话存储（测试、演示模式）
    pub fn with_gateway(config: ClientConfig, gateway: Arc<dyn Gateway>, sessions: SessionStore) -> Self {
        let auth = AuthService::new(gateway.clone(), sessions.clone(), &config.phone_prefix);
        Self {
            config,
            gateway,
            sessions,
            auth,
            current_user: None,
            roster_listener: Arc::new(EmptyRosterListener),
            transcript_listener: Arc::new(EmptyTranscriptListener),
            roster: None,
            transcript: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 注册会话列表监听器，下次 `start_roster` 时生效
    pub fn set_roster_listener(&mut self, listener: Arc<dyn RosterListener>) {
        self.roster_listener = listener;
    }

    /// 注册消息监听器，下次 `select_conversation` 时生效
    pub fn set_transcript_listener(&mut self, listener: Arc<dyn TranscriptListener>) {
        self.transcript_listener = listener;
    }

    pub fn current_user(&self) -> Option<&User> {
        self.current_user.as_ref()
    }

    fn require_user(&self) -> ChatResult<&User> {
        self.current_user
            .as_ref()
            .ok_or_else(|| ChatError::Validation("请先登录".to_string()))
    }

    /// 恢复上次的登录会话；会话损坏时按未登录处理
    pub async fn restore_session(&mut self) -> Option<User> {
        let user = self.sessions.load().await;
        match &user {
            Some(u) => info!("[Client] 🔑 恢复登录会话: {}", u.id),
            None => debug!("[Client] 没有可恢复的登录会话"),
        }
        self.current_user = user.clone();
        user
    }

    pub async fn sign_in(&mut self, mobile: &str, otp: &str) -> ChatResult<User> {
        let user = self.auth.sign_in(mobile, otp).await?;
        self.current_user = Some(user.clone());
        Ok(user)
    }

    pub async fn sign_up(&mut self, mobile: &str, otp: &str, full_name: &str) -> ChatResult<User> {
        let user = self.auth.sign_up(mobile, otp, full_name).await?;
        self.current_user = Some(user.clone());
        Ok(user)
    }

    /// 启动会话列表同步；已启动时先停止旧的
    pub async fn start_roster(&mut self) -> ChatResult<RosterHandle> {
        let user_id = self.require_user()?.id.clone();
        if let Some(old) = self.roster.take() {
            old.stop().await;
        }
        let handle =
            RosterSyncer::with_listener(self.gateway.clone(), &user_id, self.roster_listener.clone())
                .start();
        self.roster = Some(handle.clone());
        Ok(handle)
    }

    pub fn roster(&self) -> Option<&RosterHandle> {
        self.roster.as_ref()
    }

    pub fn transcript(&self) -> Option<&TranscriptHandle> {
        self.transcript.as_ref()
    }

    /// 选择会话：关闭当前打开的会话后打开新会话
    pub async fn select_conversation(&mut self, conversation_id: &str) -> ChatResult<TranscriptHandle> {
        self.require_user()?;
        if let Some(old) = self.transcript.take() {
            if old.conversation_id() == conversation_id && old.is_active() {
                self.transcript = Some(old.clone());
                return Ok(old);
            }
            old.close().await;
        }
        let bridge = Arc::new(RosterBridge {
            inner: self.transcript_listener.clone(),
            roster: self.roster.clone(),
        });
        let handle = TranscriptSyncer::with_listener(
            self.gateway.clone(),
            conversation_id,
            &self.config.attachment_bucket,
            bridge,
        )
        .open();
        self.transcript = Some(handle.clone());
        Ok(handle)
    }

    fn open_transcript(&self) -> ChatResult<&TranscriptHandle> {
        self.transcript
            .as_ref()
            .ok_or_else(|| ChatError::Validation("请先选择会话".to_string()))
    }

    /// 在当前会话中发送文本
    pub async fn send_text(&self, text: &str) -> ChatResult<Message> {
        let user = self.require_user()?;
        self.open_transcript()?.send(user, text).await
    }

    /// 在当前会话中发送附件
    pub async fn send_attachment(&self, attachment: Attachment) -> ChatResult<Message> {
        let user = self.require_user()?;
        self.open_transcript()?.send_attachment(user, attachment).await
    }

    /// 标签管理（会话列表已启动时联动更新列表）
    pub fn labels(&self) -> LabelManager {
        let manager = LabelManager::new(self.gateway.clone());
        match &self.roster {
            Some(roster) => manager.with_roster(roster.clone()),
            None => manager,
        }
    }

    pub fn membership(&self) -> MembershipManager {
        MembershipManager::new(self.gateway.clone(), &self.config.phone_prefix)
    }

    /// 关闭当前会话和会话列表同步
    pub async fn shutdown(&mut self) {
        if let Some(transcript) = self.transcript.take() {
            transcript.close().await;
        }
        if let Some(roster) = self.roster.take() {
            roster.stop().await;
        }
        if self.current_user.is_some() {
            info!("[Client] 👋 客户端已关闭");
        } else {
            warn!("[Client] 客户端在未登录状态下关闭");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::auth::DEMO_OTP;
    use crate::im::conversation::service::test_support::{channel_listener, next_roster, wait_subscribed};
    use crate::im::gateway::MemoryGateway;
    use crate::im::message::service::test_support::wait_until;
    use crate::im::session::{LocalStorage, MemoryStorage, SESSION_KEY};
    use crate::im::types::tables;
    use serde_json::json;
    use std::sync::Once;

    static INIT_LOGGER: Once = Once::new();

    fn init_test_logger() {
        INIT_LOGGER.call_once(|| {
            use tracing_subscriber::prelude::*;
            use tracing_subscriber::EnvFilter;

            // 测试中打开当前 crate 的 debug，关闭底层 HTTP 客户端的噪音
            let filter_layer = EnvFilter::new(
                "info,periskope_chat_core=debug,sqlx=info,hyper_util::client=info,reqwest=info",
            );

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_test_writer();

            // 其他测试模块可能已经装好了全局 subscriber
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init();
        });
    }

    fn client(gateway: &MemoryGateway, storage: Arc<MemoryStorage>) -> ChatClient {
        ChatClient::with_gateway(
            ClientConfig::new("https://demo.example.co/".to_string(), "anon".to_string()),
            Arc::new(gateway.clone()),
            SessionStore::new(storage),
        )
    }

    #[test]
    fn config_defaults_derive_realtime_url() {
        let config = ClientConfig::new("https://demo.example.co/".to_string(), "key".to_string());
        assert_eq!(config.api_base_url, "https://demo.example.co");
        assert_eq!(config.realtime_url, "wss://demo.example.co/realtime/v1/websocket");
        assert_eq!(config.attachment_bucket, "chat-attachments");
        assert_eq!(config.phone_prefix, "+91");
        assert_eq!(config.session_db_url, "sqlite://session.db?mode=rwc");
        assert_eq!(
            realtime_url_for("http://localhost:54321"),
            "ws://localhost:54321/realtime/v1/websocket"
        );
    }

    #[tokio::test]
    async fn corrupt_session_restores_as_signed_out() {
        let gateway = MemoryGateway::new();
        let storage = Arc::new(MemoryStorage::new());
        storage.set(SESSION_KEY, "not-json").await.unwrap();
        let mut client = client(&gateway, storage);
        assert!(client.restore_session().await.is_none());
        assert!(matches!(client.start_roster().await, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn end_to_end_private_chat_flow() {
        init_test_logger();
        let gateway = MemoryGateway::new();
        let storage = Arc::new(MemoryStorage::new());

        let mut other = client(&gateway, Arc::new(MemoryStorage::new()));
        other.sign_up("2222222222", DEMO_OTP, "Bharat").await.unwrap();

        let mut me = client(&gateway, storage.clone());
        let asha = me.sign_up("1111111111", DEMO_OTP, "Asha").await.unwrap();
        let (listener, mut rx) = channel_listener();
        me.set_roster_listener(listener);
        me.start_roster().await.unwrap();
        assert!(next_roster(&mut rx).await.is_empty());
        wait_subscribed(&gateway, 2).await;

        let chat = me.membership().create_private_chat(&asha, "2222222222").await.unwrap();
        let roster = next_roster(&mut rx).await;
        assert_eq!(roster[0].id(), chat.id);

        let transcript = me.select_conversation(&chat.id).await.unwrap();
        wait_until(|| transcript.is_loaded()).await;
        let sent = me.send_text("namaste").await.unwrap();

        // 快速通道或推送重新拉取都会把最新消息带到列表里
        wait_until(|| {
            me.roster()
                .and_then(|r| r.find(&chat.id))
                .and_then(|c| c.latest_message)
                .map(|m| m.id == sent.id)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(transcript.entries().len(), 1);

        // 重新选择同一会话复用句柄，切换到其他会话时关闭旧句柄
        let again = me.select_conversation(&chat.id).await.unwrap();
        assert!(again.is_active());
        me.shutdown().await;
        assert!(!transcript.is_active());
        assert_eq!(gateway.active_subscriptions(), 0);

        // 会话已保存，新客户端可以直接恢复
        let mut restored = client(&gateway, storage);
        assert_eq!(restored.restore_session().await.map(|u| u.id), Some(asha.id));
        assert_eq!(gateway.rows(tables::MESSAGES)[0]["content"], json!("namaste"));
    }
}
