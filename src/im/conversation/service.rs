//! 会话列表同步服务
//!
//! 启动时全量拉取一次会话列表，然后订阅两类推送：
//!
//! - 当前用户的成员关系变更（增删改任意一种）
//! - 任意新消息
//!
//! 每收到一条推送都重新全量拉取，不信任推送内容本身的完整性和顺序。拉取结果带递增的票号，
//! 比已应用结果更旧的拉取会被丢弃。消息会话同步器观察到的新消息可以通过
//! [`RosterHandle::merge_incoming_latest`] 直接更新本地列表，无需等待重新拉取。

use crate::im::conversation::api::ConversationApi;
use crate::im::conversation::listener::{EmptyRosterListener, RosterListener};
use crate::im::conversation::models::{ChatSummary, ChatTypeFilter};
use crate::im::conversation::roster::{build_roster, filter_roster, sort_roster};
use crate::im::error::{ChatError, ChatResult};
use crate::im::gateway::{ChangeKind, EventSpec, Filter, Gateway, Subscription};
use crate::im::types::{tables, Label, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 会话列表的内存状态，由同步器独占
#[derive(Debug, Default)]
pub struct RosterState {
    roster: Vec<ChatSummary>,
    /// 每个会话已知的最新消息，跨多次拉取保留
    latest: HashMap<String, Message>,
    applied_ticket: u64,
}

impl RosterState {
    pub fn roster(&self) -> &[ChatSummary] {
        &self.roster
    }

    /// 应用一次拉取结果；票号不比已应用的新时丢弃并返回 `false`
    pub(crate) fn apply_fetch(&mut self, ticket: u64, mut roster: Vec<ChatSummary>) -> bool {
        if ticket <= self.applied_ticket {
            return false;
        }
        self.applied_ticket = ticket;

        for chat in roster.iter_mut() {
            let cached = self.latest.get(chat.id());
            let fetched_at = chat.latest_message.as_ref().map(|m| m.created_at);
            match (cached, fetched_at) {
                // 快速通道得知的消息更新，拉取结果还没包含它
                (Some(c), Some(f)) if c.created_at > f => chat.latest_message = Some(c.clone()),
                (Some(c), None) => chat.latest_message = Some(c.clone()),
                _ => {}
            }
            if let Some(latest) = &chat.latest_message {
                self.latest.insert(chat.id().to_string(), latest.clone());
            }
        }
        sort_roster(&mut roster);
        self.roster = roster;
        true
    }

    /// 记录一条新观察到的消息；返回列表是否发生变化
    pub(crate) fn merge_latest(&mut self, conversation_id: &str, message: Message) -> bool {
        if let Some(cached) = self.latest.get(conversation_id) {
            if cached.id == message.id || cached.created_at > message.created_at {
                return false;
            }
        }
        self.latest
            .insert(conversation_id.to_string(), message.clone());

        let Some(chat) = self.roster.iter_mut().find(|c| c.id() == conversation_id) else {
            return false;
        };
        chat.latest_message = Some(message);
        sort_roster(&mut self.roster);
        true
    }

    /// 会话当前是否带有某个标签；会话不在列表中时返回 `None`
    pub(crate) fn has_label(&self, conversation_id: &str, label_id: &str) -> Option<bool> {
        self.roster
            .iter()
            .find(|c| c.id() == conversation_id)
            .map(|c| c.has_label(label_id))
    }

    /// 设置会话的标签；返回是否真的发生了变化
    pub(crate) fn set_label(&mut self, conversation_id: &str, label: &Label, assigned: bool) -> bool {
        let Some(chat) = self.roster.iter_mut().find(|c| c.id() == conversation_id) else {
            return false;
        };
        let present = chat.has_label(&label.id);
        match (present, assigned) {
            (false, true) => {
                chat.labels.push(label.clone());
                true
            }
            (true, false) => {
                chat.labels.retain(|l| l.id != label.id);
                true
            }
            _ => false,
        }
    }
}

struct RosterInner {
    api: ConversationApi,
    gateway: Arc<dyn Gateway>,
    user_id: String,
    listener: Arc<dyn RosterListener>,
    state: Mutex<RosterState>,
    active: AtomicBool,
    started: AtomicBool,
    next_ticket: AtomicU64,
    subscriptions: tokio::sync::Mutex<Vec<Box<dyn Subscription>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// 会话列表同步器
pub struct RosterSyncer {
    inner: Arc<RosterInner>,
}

impl RosterSyncer {
    /// 创建同步器（使用默认空监听器）
    pub fn new(gateway: Arc<dyn Gateway>, user_id: &str) -> Self {
        Self::with_listener(gateway, user_id, Arc::new(EmptyRosterListener))
    }

    /// 创建同步器（带自定义监听器）
    pub fn with_listener(
        gateway: Arc<dyn Gateway>,
        user_id: &str,
        listener: Arc<dyn RosterListener>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RosterInner {
                api: ConversationApi::new(gateway.clone()),
                gateway,
                user_id: user_id.to_string(),
                listener,
                state: Mutex::new(RosterState::default()),
                active: AtomicBool::new(true),
                started: AtomicBool::new(false),
                next_ticket: AtomicU64::new(0),
                subscriptions: tokio::sync::Mutex::new(Vec::new()),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    /// 启动同步：立即返回句柄，首次拉取和订阅在后台任务中完成
    pub fn start(self) -> RosterHandle {
        let handle = RosterHandle { inner: self.inner };
        if handle.inner.started.swap(true, Ordering::SeqCst) {
            return handle;
        }
        info!("[Roster] 🚀 启动会话列表同步，用户ID: {}", handle.inner.user_id);
        let task = tokio::spawn(run(handle.inner.clone()));
        *lock(&handle.inner.task) = Some(task);
        handle
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 后台任务：首次拉取 → 打开订阅 → 每个推送触发一次重新拉取
async fn run(inner: Arc<RosterInner>) {
    let mut shutdown = inner.shutdown.subscribe();

    if let Err(e) = fetch_and_apply(&inner).await {
        error!("[Roster] 首次拉取会话列表失败: {}", e);
        inner.listener.on_sync_failed(e.user_message()).await;
    }
    if !inner.active.load(Ordering::SeqCst) {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let specs = [
        (
            format!("roster-members:{}", inner.user_id),
            EventSpec::new(ChangeKind::All, tables::CHAT_MEMBERS)
                .with_filter(Filter::eq("user_id", inner.user_id.as_str())),
        ),
        (
            format!("roster-messages:{}", inner.user_id),
            EventSpec::new(ChangeKind::Insert, tables::MESSAGES),
        ),
    ];
    for (channel, spec) in specs {
        match inner.gateway.subscribe(&channel, spec, tx.clone()).await {
            Ok(sub) => {
                let mut subs = inner.subscriptions.lock().await;
                if inner.active.load(Ordering::SeqCst) {
                    subs.push(sub);
                } else {
                    // 订阅期间已被停止
                    drop(subs);
                    sub.unsubscribe().await;
                    return;
                }
            }
            Err(e) => {
                error!("[Roster] 打开订阅 {} 失败: {:#}", channel, e);
                inner
                    .listener
                    .on_sync_failed(ChatError::from(e).user_message())
                    .await;
            }
        }
    }
    drop(tx);
    debug!("[Roster] 推送订阅已就绪");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                // 合并已经积压的推送，只拉取一次
                let mut pending = 1;
                while rx.try_recv().is_ok() {
                    pending += 1;
                }
                debug!(
                    "[Roster] 收到 {} 条推送（{:?} {}），重新拉取",
                    pending, event.kind, event.table
                );
                if !inner.active.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = fetch_and_apply(&inner).await {
                    warn!("[Roster] 推送触发的重新拉取失败: {}", e);
                    inner.listener.on_sync_failed(e.user_message()).await;
                }
            }
        }
    }
    debug!("[Roster] 同步任务退出");
}

/// 拉取并应用一次会话列表；返回是否应用（过期或已停止时不应用）
async fn fetch_and_apply(inner: &RosterInner) -> ChatResult<bool> {
    let ticket = inner.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
    let rows = inner.api.fetch_roster_rows(&inner.user_id).await?;
    let roster = build_roster(&inner.user_id, rows);

    if !inner.active.load(Ordering::SeqCst) {
        debug!("[Roster] 同步器已停止，丢弃拉取结果 #{}", ticket);
        return Ok(false);
    }
    let snapshot = {
        let mut state = lock(&inner.state);
        if !state.apply_fetch(ticket, roster) {
            debug!("[Roster] 丢弃过期的拉取结果 #{}", ticket);
            return Ok(false);
        }
        state.roster.clone()
    };
    info!("[Roster] ✅ 会话列表已更新，共 {} 个会话", snapshot.len());
    inner.listener.on_roster_changed(snapshot).await;
    Ok(true)
}

/// 会话列表同步句柄，可低成本克隆
#[derive(Clone)]
pub struct RosterHandle {
    inner: Arc<RosterInner>,
}

impl RosterHandle {
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// 停止同步并关闭全部订阅；可重复调用，也可以在首次拉取完成前调用
    pub async fn stop(&self) {
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
            info!("[Roster] 🛑 会话列表同步已停止，用户ID: {}", self.inner.user_id);
        }
    }

    /// 立即重新拉取一次
    pub async fn refresh(&self) -> ChatResult<()> {
        if !self.is_active() {
            return Err(ChatError::Closed);
        }
        fetch_and_apply(&self.inner).await.map(|_| ())
    }

    /// 把在别处观察到的新消息合并进列表并重新排序，不访问网络
    pub async fn merge_incoming_latest(&self, conversation_id: &str, message: Message) -> bool {
        if !self.is_active() {
            return false;
        }
        let snapshot = {
            let mut state = lock(&self.inner.state);
            if !state.merge_latest(conversation_id, message) {
                return false;
            }
            state.roster.clone()
        };
        debug!("[Roster] 快速通道更新会话 {} 的最新消息", conversation_id);
        self.inner.listener.on_roster_changed(snapshot).await;
        true
    }

    /// 当前会话列表快照
    pub fn roster(&self) -> Vec<ChatSummary> {
        lock(&self.inner.state).roster.clone()
    }

    pub fn find(&self, conversation_id: &str) -> Option<ChatSummary> {
        lock(&self.inner.state)
            .roster
            .iter()
            .find(|c| c.id() == conversation_id)
            .cloned()
    }

    /// 在当前列表上筛选
    pub fn filter(&self, query: &str, type_filter: ChatTypeFilter) -> Vec<ChatSummary> {
        filter_roster(&lock(&self.inner.state).roster, query, type_filter)
    }

    /// 在锁内修改列表状态（乐观更新使用）
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut RosterState) -> R) -> R {
        f(&mut *lock(&self.inner.state))
    }

    /// 把当前列表推给监听器
    pub(crate) async fn publish(&self) {
        if !self.is_active() {
            return;
        }
        let snapshot = self.roster();
        self.inner.listener.on_roster_changed(snapshot).await;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::im::gateway::{GatewayOp, MemoryGateway};
    use serde_json::json;
    use std::time::Duration;

    fn seeded_gateway() -> MemoryGateway {
        let gateway = MemoryGateway::new();
        gateway.seed(
            tables::USERS,
            vec![
                json!({"id": "u1", "full_name": "Me", "mobile_number": "+911111111111"}),
                json!({"id": "u2", "full_name": "Bharat", "mobile_number": "+912222222222"}),
            ],
        );
        gateway.seed(
            tables::CHATS,
            vec![
                json!({"id": "c1", "type": "private", "created_at": "2024-05-01T09:00:00Z"}),
                json!({"id": "c2", "type": "group", "name": "Ops", "created_at": "2024-05-02T09:00:00Z"}),
            ],
        );
        gateway.seed(
            tables::CHAT_MEMBERS,
            vec![
                json!({"chat_id": "c1", "user_id": "u1"}),
                json!({"chat_id": "c1", "user_id": "u2"}),
                json!({"chat_id": "c2", "user_id": "u1"}),
            ],
        );
        gateway.seed(
            tables::MESSAGES,
            vec![json!({
                "id": "m1", "chat_id": "c1", "sender_id": "u2", "content": "old",
                "type": "text", "created_at": "2024-05-01T10:00:00Z"
            })],
        );
        gateway
    }

    fn ids(roster: &[ChatSummary]) -> Vec<String> {
        roster.iter().map(|c| c.id().to_string()).collect()
    }

    #[tokio::test]
    async fn start_delivers_sorted_roster_and_refetches_on_push() {
        let gateway = seeded_gateway();
        let (listener, mut rx) = channel_listener();
        let handle = RosterSyncer::with_listener(Arc::new(gateway.clone()), "u1", listener).start();

        // c2 没有消息，按创建时间 5 月 2 日排在 c1（5 月 1 日的消息）前面
        assert_eq!(ids(&next_roster(&mut rx).await), vec!["c2", "c1"]);
        wait_subscribed(&gateway, 2).await;

        gateway
            .insert(
                tables::MESSAGES,
                json!({"chat_id": "c1", "sender_id": "u2", "content": "new", "type": "text"}),
            )
            .await
            .unwrap();
        let roster = next_roster(&mut rx).await;
        assert_eq!(ids(&roster), vec!["c1", "c2"]);
        assert_eq!(roster[0].preview(), "new");

        handle.stop().await;
    }

    #[tokio::test]
    async fn membership_change_triggers_refetch() {
        let gateway = seeded_gateway();
        gateway.seed(
            tables::CHATS,
            vec![json!({"id": "c3", "type": "group", "name": "New", "created_at": "2024-05-03T09:00:00Z"})],
        );
        let (listener, mut rx) = channel_listener();
        let handle = RosterSyncer::with_listener(Arc::new(gateway.clone()), "u1", listener).start();
        assert_eq!(next_roster(&mut rx).await.len(), 2);
        wait_subscribed(&gateway, 2).await;

        gateway
            .insert(tables::CHAT_MEMBERS, json!({"chat_id": "c3", "user_id": "u1"}))
            .await
            .unwrap();
        assert_eq!(ids(&next_roster(&mut rx).await), vec!["c3", "c2", "c1"]);
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_silences_further_pushes() {
        let gateway = seeded_gateway();
        let (listener, mut rx) = channel_listener();
        let handle = RosterSyncer::with_listener(Arc::new(gateway.clone()), "u1", listener).start();
        next_roster(&mut rx).await;
        wait_subscribed(&gateway, 2).await;

        handle.stop().await;
        handle.stop().await;
        assert!(!handle.is_active());
        assert_eq!(gateway.active_subscriptions(), 0);

        gateway
            .insert(
                tables::MESSAGES,
                json!({"chat_id": "c1", "sender_id": "u2", "content": "late", "type": "text"}),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(matches!(handle.refresh().await, Err(ChatError::Closed)));
    }

    #[tokio::test]
    async fn stop_before_setup_completes_applies_nothing() {
        let gateway = seeded_gateway();
        let (listener, mut rx) = channel_listener();
        let handle = RosterSyncer::with_listener(Arc::new(gateway.clone()), "u1", listener).start();
        handle.stop().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(handle.roster().is_empty());
        assert_eq!(gateway.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn merge_incoming_latest_resorts_without_network() {
        let gateway = seeded_gateway();
        let (listener, mut rx) = channel_listener();
        let handle = RosterSyncer::with_listener(Arc::new(gateway.clone()), "u1", listener).start();
        assert_eq!(ids(&next_roster(&mut rx).await), vec!["c2", "c1"]);
        let selects = gateway.op_count(GatewayOp::Select, tables::CHATS);

        let incoming: Message = serde_json::from_value(json!({
            "id": "m9", "chat_id": "c1", "sender_id": "u2", "content": "fast",
            "type": "text", "created_at": "2024-05-09T10:00:00Z"
        }))
        .unwrap();
        assert!(handle.merge_incoming_latest("c1", incoming.clone()).await);
        assert_eq!(ids(&next_roster(&mut rx).await), vec!["c1", "c2"]);
        assert_eq!(gateway.op_count(GatewayOp::Select, tables::CHATS), selects);

        // 同一条消息重复合并不再触发变更
        assert!(!handle.merge_incoming_latest("c1", incoming).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_roster() {
        let gateway = seeded_gateway();
        let (listener, mut rx) = channel_listener();
        let handle = RosterSyncer::with_listener(Arc::new(gateway.clone()), "u1", listener).start();
        assert_eq!(next_roster(&mut rx).await.len(), 2);

        gateway.fail_next(GatewayOp::Select, tables::CHAT_MEMBERS);
        assert!(matches!(handle.refresh().await, Err(ChatError::RemoteFailure(_))));
        assert_eq!(handle.roster().len(), 2);
        handle.stop().await;
    }

    fn summary(id: &str, latest: Option<Message>) -> ChatSummary {
        let conversation = serde_json::from_value(json!({
            "id": id, "type": "group", "name": id, "created_at": "2024-05-01T00:00:00Z"
        }))
        .unwrap();
        ChatSummary::new("u1", conversation, Vec::new(), Vec::new(), latest)
    }

    fn msg(id: &str, chat_id: &str, at: &str) -> Message {
        serde_json::from_value(json!({
            "id": id, "chat_id": chat_id, "sender_id": "u1", "content": id,
            "type": "text", "created_at": at
        }))
        .unwrap()
    }

    #[test]
    fn stale_fetch_results_are_discarded() {
        let mut state = RosterState::default();
        assert!(state.apply_fetch(2, vec![summary("a", None), summary("b", None)]));
        assert!(!state.apply_fetch(1, vec![summary("a", None)]));
        assert_eq!(state.roster().len(), 2);
    }

    #[test]
    fn refetch_never_regresses_latest_message() {
        let mut state = RosterState::default();
        state.apply_fetch(1, vec![summary("a", None), summary("b", Some(msg("m1", "b", "2024-05-02T00:00:00Z")))]);
        assert!(state.merge_latest("a", msg("m2", "a", "2024-05-03T00:00:00Z")));
        assert_eq!(state.roster()[0].id(), "a");

        // 一次没有看到 m2 的拉取（例如在 m2 写入前发出的请求）
        state.apply_fetch(2, vec![summary("a", None), summary("b", Some(msg("m1", "b", "2024-05-02T00:00:00Z")))]);
        assert_eq!(state.roster()[0].id(), "a");
        assert_eq!(
            state.roster()[0].latest_message.as_ref().map(|m| m.id.as_str()),
            Some("m2")
        );

        // 旧消息不会覆盖新消息
        assert!(!state.merge_latest("a", msg("m0", "a", "2024-05-01T00:00:00Z")));
    }

    #[tokio::test]
    async fn aborted_setup_task_releases_a_subscription_it_had_not_stored_yet() {
        let gateway = seeded_gateway();
        let syncer = RosterSyncer::new(Arc::new(gateway.clone()), "u1");
        let inner = syncer.inner.clone();
        // 占住订阅列表，后台任务拿着刚建立的订阅等锁
        let guard = inner.subscriptions.lock().await;
        let handle = syncer.start();
        wait_subscribed(&gateway, 1).await;

        inner.active.store(false, Ordering::SeqCst);
        let task = lock(&inner.task).take();
        if let Some(task) = task {
            task.abort();
        }
        drop(guard);

        for _ in 0..200 {
            if gateway.active_subscriptions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gateway.active_subscriptions(), 0);
        handle.stop().await;
    }
}
