//! 消息记录同步服务
//!
//! 打开一个会话时先订阅该会话的新消息推送，再拉取完整历史；推送只携带行 ID，每条推送都
//! 按 ID 重新查询完整消息（含发送者）后追加。
//!
//! 发送文本消息时先追加一条 `Pending` 乐观条目，再写入后端：
//!
//! - 写入成功：用确认后的记录原位替换乐观条目
//! - 推送回声：ID 已在记录中的直接丢弃；若回声先于写入结果到达，则替换发送者、类型、内容都
//!   相同的最早一条乐观条目
//! - 写入失败：移除乐观条目并把错误返回给调用方，不自动重试
//! - 历史先带回了这次写入的行：载入历史时丢弃对应的乐观条目；写入结果到达时发现 ID 已存在，
//!   只清掉本次仍在等待的乐观条目
//!
//! 两条路径谁先完成对账谁通知 `on_new_message`，另一条路径什么也不做。

use crate::im::error::{ChatError, ChatResult};
use crate::im::gateway::{ChangeKind, ChangePayload, EventSpec, Filter, Gateway, Subscription};
use crate::im::message::api::MessageApi;
use crate::im::message::listener::{EmptyTranscriptListener, TranscriptListener};
use crate::im::message::models::{Attachment, TranscriptEntry, LOCAL_ID_PREFIX};
use crate::im::optimistic::Optimistic;
use crate::im::types::{tables, Message, MessageKind, User};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 历史中的行与乐观条目对账时允许的时钟偏差
fn echo_window() -> chrono::Duration {
    chrono::Duration::seconds(60)
}

/// 写入结果对账的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Confirmation {
    /// 本次新确认了一条消息
    Confirmed,
    /// 消息已在记录中，移除了残留的乐观条目
    PrunedPending,
    /// 消息已在记录中，没有变化
    AlreadyKnown,
}

/// 一个会话的消息记录，由同步器独占
#[derive(Debug, Default)]
pub struct TranscriptState {
    entries: Vec<TranscriptEntry>,
    loaded: bool,
}

impl TranscriptState {
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.iter().any(|e| e.id() == message_id)
    }

    fn oldest_pending_like(&self, message: &Message) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.is_pending() && e.same_send(message))
    }

    /// 载入历史；加载期间已经出现的条目（推送、乐观发送）保留在历史之后
    ///
    /// 历史里可能已经带回了仍在等待写入结果的那次发送，对应的乐观条目就地丢弃，
    /// 之后的写入结果发现 ID 已存在时什么也不做。
    pub(crate) fn load_history(&mut self, history: Vec<Message>) {
        let known: HashSet<String> = history.iter().map(|m| m.id.clone()).collect();
        // 已经以确认条目出现过的行不再拿来对账
        let mut claimed: HashSet<&str> = history
            .iter()
            .filter(|m| self.contains(&m.id))
            .map(|m| m.id.as_str())
            .collect();
        let mut extra = Vec::new();
        for entry in self.entries.drain(..) {
            if known.contains(entry.id()) {
                continue;
            }
            if entry.is_pending() {
                let echoed = history.iter().find(|m| {
                    !claimed.contains(m.id.as_str())
                        && entry.same_send(m)
                        && m.created_at >= entry.message.created_at - echo_window()
                });
                if let Some(m) = echoed {
                    claimed.insert(m.id.as_str());
                    continue;
                }
            }
            extra.push(entry);
        }
        self.entries = history.iter().cloned().map(TranscriptEntry::confirmed).collect();
        self.entries.extend(extra);
        self.loaded = true;
    }

    /// 写入成功后的对账
    pub(crate) fn confirm(&mut self, temp_id: &str, message: Message) -> Confirmation {
        if self.contains(&message.id) {
            // 回声或历史已经带回了这条消息，只清掉本次仍在等待的乐观条目
            return match self
                .entries
                .iter()
                .position(|e| e.id() == temp_id && e.is_pending())
            {
                Some(idx) => {
                    self.entries.remove(idx);
                    Confirmation::PrunedPending
                }
                None => Confirmation::AlreadyKnown,
            };
        }
        let slot = self
            .entries
            .iter()
            .position(|e| e.id() == temp_id && e.is_pending())
            // 相同内容的乐观条目可互换，回声可能替换掉了本次的条目
            .or_else(|| self.oldest_pending_like(&message));
        match slot {
            Some(idx) => self.entries[idx] = TranscriptEntry::confirmed(message),
            None => self.entries.push(TranscriptEntry::confirmed(message)),
        }
        Confirmation::Confirmed
    }

    /// 处理一条推送到达的消息；返回是否新确认了一条消息
    pub(crate) fn accept_push(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        match self.oldest_pending_like(&message) {
            Some(idx) => self.entries[idx] = TranscriptEntry::confirmed(message),
            None => self.entries.push(TranscriptEntry::confirmed(message)),
        }
        true
    }

    /// 追加一条已确认消息（不参与乐观条目匹配）
    pub(crate) fn append_confirmed(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.entries.push(TranscriptEntry::confirmed(message));
        true
    }

    fn remove_pending(&mut self, temp_id: &str, like: &Message) -> bool {
        let slot = self
            .entries
            .iter()
            .position(|e| e.id() == temp_id && e.is_pending())
            .or_else(|| self.oldest_pending_like(like));
        match slot {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// 一次文本发送的乐观条目
pub(crate) struct PendingSend {
    message: Message,
}

impl PendingSend {
    fn new(chat_id: &str, sender: &User, content: &str) -> Self {
        Self {
            message: Message {
                id: format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()),
                chat_id: chat_id.to_string(),
                sender_id: sender.id.clone(),
                sender: Some(sender.clone()),
                content: content.to_string(),
                kind: MessageKind::Text,
                attachment_url: None,
                created_at: Utc::now(),
            },
        }
    }

    fn temp_id(&self) -> &str {
        &self.message.id
    }
}

impl Optimistic<TranscriptState> for PendingSend {
    fn apply(&mut self, state: &mut TranscriptState) {
        state
            .entries
            .push(TranscriptEntry::pending(self.message.clone()));
    }

    fn revert(&mut self, state: &mut TranscriptState) {
        state.remove_pending(&self.message.id, &self.message);
    }
}

struct TranscriptInner {
    api: MessageApi,
    gateway: Arc<dyn Gateway>,
    conversation_id: String,
    bucket: String,
    listener: Arc<dyn TranscriptListener>,
    state: Mutex<TranscriptState>,
    active: AtomicBool,
    started: AtomicBool,
    subscriptions: tokio::sync::Mutex<Vec<Box<dyn Subscription>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 消息记录同步器
pub struct TranscriptSyncer {
    inner: Arc<TranscriptInner>,
}

impl TranscriptSyncer {
    pub fn new(gateway: Arc<dyn Gateway>, conversation_id: &str, bucket: &str) -> Self {
        Self::with_listener(
            gateway,
            conversation_id,
            bucket,
            Arc::new(EmptyTranscriptListener),
        )
    }

    pub fn with_listener(
        gateway: Arc<dyn Gateway>,
        conversation_id: &str,
        bucket: &str,
        listener: Arc<dyn TranscriptListener>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(TranscriptInner {
                api: MessageApi::new(gateway.clone()),
                gateway,
                conversation_id: conversation_id.to_string(),
                bucket: bucket.to_string(),
                listener,
                state: Mutex::new(TranscriptState::default()),
                active: AtomicBool::new(true),
                started: AtomicBool::new(false),
                subscriptions: tokio::sync::Mutex::new(Vec::new()),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    /// 打开会话：立即返回句柄，订阅和历史加载在后台任务中完成
    pub fn open(self) -> TranscriptHandle {
        let handle = TranscriptHandle { inner: self.inner };
        if handle.inner.started.swap(true, Ordering::SeqCst) {
            return handle;
        }
        info!(
            "[Transcript] 📂 打开会话: {}",
            handle.inner.conversation_id
        );
        let task = tokio::spawn(run(handle.inner.clone()));
        *lock(&handle.inner.task) = Some(task);
        handle
    }
}

async fn run(inner: Arc<TranscriptInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // 先订阅再拉取历史，两者之间写入的消息不会丢失，重复的按 ID 去重
    let spec = EventSpec::new(ChangeKind::Insert, tables::MESSAGES)
        .with_filter(Filter::eq("chat_id", inner.conversation_id.as_str()));
    let channel = format!("chat:{}", inner.conversation_id);
    match inner.gateway.subscribe(&channel, spec, tx).await {
        Ok(sub) => {
            let mut subs = inner.subscriptions.lock().await;
            if !inner.active.load(Ordering::SeqCst) {
                drop(subs);
                sub.unsubscribe().await;
                return;
            }
            subs.push(sub);
        }
        Err(e) => {
            error!("[Transcript] 订阅会话 {} 失败: {:#}", inner.conversation_id, e);
            inner
                .listener
                .on_sync_failed(ChatError::from(e).user_message())
                .await;
        }
    }

    match inner.api.fetch_history(&inner.conversation_id).await {
        Ok(history) => {
            if !inner.active.load(Ordering::SeqCst) {
                return;
            }
            let snapshot = {
                let mut state = lock(&inner.state);
                state.load_history(history.clone());
                state.entries.clone()
            };
            info!(
                "[Transcript] ✅ 会话 {} 历史加载完成，共 {} 条",
                inner.conversation_id,
                history.len()
            );
            inner.listener.on_history(history).await;
            inner.listener.on_transcript_changed(snapshot).await;
        }
        Err(e) => {
            error!("[Transcript] 加载会话 {} 历史失败: {:#}", inner.conversation_id, e);
            inner
                .listener
                .on_sync_failed(ChatError::from(e).user_message())
                .await;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                if !inner.active.load(Ordering::SeqCst) {
                    break;
                }
                handle_push(&inner, event).await;
            }
        }
    }
    debug!("[Transcript] 会话 {} 的同步任务退出", inner.conversation_id);
}

async fn handle_push(inner: &TranscriptInner, event: ChangePayload) {
    let Some(id) = event.row_id() else {
        warn!("[Transcript] 推送缺少消息 ID，忽略");
        return;
    };
    let known = lock(&inner.state).contains(&id);
    if known {
        debug!("[Transcript] 消息 {} 已在记录中，忽略回声", id);
        return;
    }

    let message = match inner.api.fetch_message(&id).await {
        Ok(Some(message)) => Some(message),
        Ok(None) => None,
        Err(e) => {
            warn!("[Transcript] 查询推送消息 {} 失败，使用推送内容: {:#}", id, e);
            None
        }
    };
    // 查不到完整记录时退回推送自带的行（没有发送者详情）
    let message = message.or_else(|| {
        event
            .new
            .and_then(|row| serde_json::from_value::<Message>(row).ok())
    });
    let Some(message) = message else {
        warn!("[Transcript] 无法解析推送消息 {}", id);
        return;
    };

    if !inner.active.load(Ordering::SeqCst) {
        return;
    }
    let snapshot = {
        let mut state = lock(&inner.state);
        if !state.accept_push(message.clone()) {
            return;
        }
        state.entries.clone()
    };
    debug!("[Transcript] 📨 新消息 {} 来自 {}", message.id, message.sender_id);
    inner.listener.on_transcript_changed(snapshot).await;
    inner.listener.on_new_message(message).await;
}

/// 消息记录句柄，绑定一个会话，可低成本克隆
#[derive(Clone)]
pub struct TranscriptHandle {
    inner: Arc<TranscriptInner>,
}

impl TranscriptHandle {
    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// 历史是否已加载
    pub fn is_loaded(&self) -> bool {
        lock(&self.inner.state).loaded
    }

    /// 当前消息记录快照
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        lock(&self.inner.state).entries.clone()
    }

    /// 关闭会话并取消订阅；可重复调用
    pub async fn close(&self) {
        let was_active = self.inner.active.swap(false, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);
        let subs: Vec<Box<dyn Subscription>> =
            self.inner.subscriptions.lock().await.drain(..).collect();
        for sub in subs.iter() {
            sub.unsubscribe().await;
        }
        if let Some(task) = lock(&self.inner.task).take() {
            task.abort();
        }
        if was_active {
            info!("[Transcript] 📁 关闭会话: {}", self.inner.conversation_id);
        }
    }

    async fn publish(&self) {
        let snapshot = self.entries();
        self.inner.listener.on_transcript_changed(snapshot).await;
    }

    /// 发送文本消息
    ///
    /// 乐观条目在第一次等待之前就已追加。成功时返回后端确认的记录。
    pub async fn send(&self, sender: &User, text: &str) -> ChatResult<Message> {
        let content = text.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("消息内容不能为空".to_string()));
        }
        if !self.is_active() {
            return Err(ChatError::Closed);
        }

        let mut pending = PendingSend::new(&self.inner.conversation_id, sender, content);
        pending.apply(&mut *lock(&self.inner.state));
        debug!("[Transcript] ⏳ 乐观追加 {}", pending.temp_id());
        self.publish().await;

        let result = self
            .inner
            .api
            .insert_message(
                &self.inner.conversation_id,
                &sender.id,
                content,
                MessageKind::Text,
                None,
            )
            .await;

        match result {
            Ok(mut confirmed) => {
                confirmed.sender = Some(sender.clone());
                if !self.is_active() {
                    return Ok(confirmed);
                }
                let outcome = lock(&self.inner.state).confirm(pending.temp_id(), confirmed.clone());
                info!(
                    "[Transcript] ✅ 消息已发送: {} -> {}",
                    pending.temp_id(),
                    confirmed.id
                );
                match outcome {
                    Confirmation::Confirmed => {
                        self.publish().await;
                        self.inner.listener.on_new_message(confirmed.clone()).await;
                    }
                    Confirmation::PrunedPending => self.publish().await,
                    Confirmation::AlreadyKnown => {}
                }
                Ok(confirmed)
            }
            Err(e) => {
                error!("[Transcript] ❌ 发送消息失败: {:#}", e);
                if self.is_active() {
                    pending.revert(&mut *lock(&self.inner.state));
                    self.publish().await;
                }
                Err(ChatError::from(e))
            }
        }
    }

    /// 发送附件：先上传到对象存储，再写入一条对应类型的消息
    ///
    /// 上传成功但消息写入失败时返回 [`ChatError::OrphanedUpload`]，已上传的文件不会被清理。
    pub async fn send_attachment(&self, sender: &User, attachment: Attachment) -> ChatResult<Message> {
        if attachment.file_name.trim().is_empty() {
            return Err(ChatError::Validation("附件文件名不能为空".to_string()));
        }
        if !self.is_active() {
            return Err(ChatError::Closed);
        }

        let (path, url) = self
            .inner
            .api
            .upload_attachment(&self.inner.bucket, &self.inner.conversation_id, &attachment)
            .await?;
        debug!("[Transcript] 附件已上传: {}/{}", self.inner.bucket, path);

        let kind = attachment.kind();
        let inserted = self
            .inner
            .api
            .insert_message(
                &self.inner.conversation_id,
                &sender.id,
                &attachment.file_name,
                kind,
                Some(&url),
            )
            .await;
        let mut confirmed = match inserted {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "[Transcript] ⚠️ 附件消息写入失败，存储桶 {} 中的文件 {} 未被清理: {:#}",
                    self.inner.bucket, path, e
                );
                return Err(ChatError::OrphanedUpload {
                    path,
                    reason: format!("{:#}", e),
                });
            }
        };
        confirmed.sender = Some(sender.clone());
        info!(
            "[Transcript] ✅ 附件消息已发送: {} ({})",
            confirmed.id,
            kind.as_str()
        );

        let appended =
            self.is_active() && lock(&self.inner.state).append_confirmed(confirmed.clone());
        if appended {
            self.publish().await;
            self.inner.listener.on_new_message(confirmed.clone()).await;
        }
        Ok(confirmed)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// 把回调转发到通道
    pub struct ChannelTranscriptListener {
        pub new_messages: mpsc::UnboundedSender<Message>,
        pub history: mpsc::UnboundedSender<Vec<Message>>,
    }

    #[async_trait]
    impl TranscriptListener for ChannelTranscriptListener {
        async fn on_history(&self, messages: Vec<Message>) {
            let _ = self.history.send(messages);
        }
        async fn on_new_message(&self, message: Message) {
            let _ = self.new_messages.send(message);
        }
        async fn on_transcript_changed(&self, _entries: Vec<TranscriptEntry>) {}
        async fn on_sync_failed(&self, _reason: String) {}
    }

    pub struct Receivers {
        pub new_messages: mpsc::UnboundedReceiver<Message>,
        pub history: mpsc::UnboundedReceiver<Vec<Message>>,
    }

    pub fn channel_listener() -> (Arc<ChannelTranscriptListener>, Receivers) {
        let (new_tx, new_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelTranscriptListener {
                new_messages: new_tx,
                history: history_tx,
            }),
            Receivers {
                new_messages: new_rx,
                history: history_rx,
            },
        )
    }

    pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("等待回调超时")
            .expect("监听通道已关闭")
    }

    pub async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("条件未在预期时间内满足");
    }
}
