//! 行变更推送通道（Phoenix channel 协议，基于 WebSocket）
//!
//! 每个订阅独占一条 WebSocket 连接：连接后发送 `phx_join` 声明要监听的表与过滤条件，
//! 之后收到的 `postgres_changes` 事件解析为 [`ChangePayload`] 写入调用方的通道。
//! 取消订阅时发送 `phx_leave` 并关闭连接。

use super::{ChangeKind, ChangePayload, ChangeSender, EventSpec, Subscription};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 心跳间隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Phoenix 协议帧
#[derive(Debug, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

/// `postgres_changes` 事件里的数据部分
#[derive(Debug, Deserialize)]
struct PostgresChange {
    #[serde(rename = "type")]
    kind: String,
    table: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// 把一帧文本解析为行变更；非变更帧返回 `None`
fn parse_change(text: &str) -> Result<Option<ChangePayload>> {
    let frame: PhoenixFrame = serde_json::from_str(text).context("解析推送帧失败")?;
    if frame.event != "postgres_changes" {
        debug!(
            "[Gateway/Realtime] 忽略非变更帧: topic={}, event={}",
            frame.topic, frame.event
        );
        return Ok(None);
    }
    let data = frame
        .payload
        .get("data")
        .cloned()
        .ok_or_else(|| anyhow!("变更帧缺少 data 字段"))?;
    let change: PostgresChange = serde_json::from_value(data).context("解析变更数据失败")?;
    let kind = ChangeKind::from_event(&change.kind)
        .ok_or_else(|| anyhow!("未知的变更类型: {}", change.kind))?;
    Ok(Some(ChangePayload {
        kind,
        table: change.table,
        new: change.record.filter(|v| !v.is_null()),
        old: change.old_record.filter(|v| !v.is_null()),
    }))
}

/// 构造 `phx_join` 帧
fn join_frame(topic: &str, spec: &EventSpec, access_token: &str, join_ref: u64) -> Value {
    let mut change = json!({
        "event": spec.kind.as_event(),
        "schema": "public",
        "table": spec.table,
    });
    if let Some(filter) = &spec.filter {
        change["filter"] = Value::String(filter.to_expression());
    }
    json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        },
        "ref": join_ref.to_string(),
    })
}

/// 一条推送订阅
pub struct RealtimeSubscription {
    topic: String,
    writer: Arc<Mutex<WsWriter>>,
    refs: Arc<AtomicU64>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RealtimeSubscription {
    /// 建立连接并加入频道
    pub async fn open(
        url: &str,
        api_key: &str,
        channel: &str,
        spec: EventSpec,
        sink: ChangeSender,
    ) -> Result<Self> {
        let url = format!("{}?apikey={}&vsn=1.0.0", url, api_key);
        let topic = format!("realtime:{}", channel);
        info!(
            "[Gateway/Realtime] 🔗 建立推送连接: topic={}, table={}, event={}",
            topic,
            spec.table,
            spec.kind.as_event()
        );

        let (ws_stream, response) = connect_async(&url)
            .await
            .with_context(|| format!("连接推送服务失败: {}", topic))?;
        debug!(
            "[Gateway/Realtime] WebSocket 连接成功, 状态: {}",
            response.status()
        );

        let (write, read) = ws_stream.split();
        let writer = Arc::new(Mutex::new(write));
        let refs = Arc::new(AtomicU64::new(1));

        let join = join_frame(&topic, &spec, api_key, refs.fetch_add(1, Ordering::SeqCst));
        writer
            .lock()
            .await
            .send(WsMessage::Text(join.to_string()))
            .await
            .context("发送 phx_join 失败")?;

        // 心跳
        let writer_for_heartbeat = writer.clone();
        let refs_for_heartbeat = refs.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": refs_for_heartbeat.fetch_add(1, Ordering::SeqCst).to_string(),
                });
                let mut w = writer_for_heartbeat.lock().await;
                if w.send(WsMessage::Text(frame.to_string())).await.is_err() {
                    debug!("[Gateway/Realtime] 心跳发送失败，停止心跳");
                    break;
                }
            }
        });

        let reader_topic = topic.clone();
        let reader = tokio::spawn(async move {
            Self::read_loop(reader_topic, read, spec, sink).await;
        });

        Ok(Self {
            topic,
            writer,
            refs,
            tasks: std::sync::Mutex::new(vec![heartbeat, reader]),
            closed: AtomicBool::new(false),
        })
    }

    async fn read_loop(topic: String, mut read: WsReader, spec: EventSpec, sink: ChangeSender) {
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(reason)) => {
                    info!("[Gateway/Realtime] 连接被关闭: {} {:?}", topic, reason);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("[Gateway/Realtime] ❌ 读取推送失败: {}: {}", topic, e);
                    break;
                }
            };
            match parse_change(&text) {
                Ok(Some(payload)) => {
                    // 过滤条件由服务端执行；删除事件的旧行通常只带主键，客户端无法再按列过滤
                    if !spec.accepts(&payload) {
                        continue;
                    }
                    if sink.send(payload).is_err() {
                        debug!("[Gateway/Realtime] 接收端已关闭: {}", topic);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("[Gateway/Realtime] ⚠️ 丢弃无法解析的帧: {}, 原始: {}", e, text),
            }
        }
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

/// 未取消就被释放时（例如持有它的任务被中止）也要停掉心跳和读取任务，连接随之关闭
impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            debug!("[Gateway/Realtime] 订阅未取消即被释放，停止后台任务: {}", self.topic);
        }
        self.abort_tasks();
    }
}

#[async_trait]
impl Subscription for RealtimeSubscription {
    async fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[Gateway/Realtime] 取消订阅: {}", self.topic);
        let leave = json!({
            "topic": self.topic,
            "event": "phx_leave",
            "payload": {},
            "ref": self.refs.fetch_add(1, Ordering::SeqCst).to_string(),
        });
        {
            let mut w = self.writer.lock().await;
            if let Err(e) = w.send(WsMessage::Text(leave.to_string())).await {
                debug!("[Gateway/Realtime] 发送 phx_leave 失败: {}", e);
            }
            let _ = w.close().await;
        }
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::gateway::Filter;

    #[test]
    fn parses_postgres_change_frames() {
        let text = r#"{
            "topic": "realtime:chat:c1",
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "INSERT",
                    "table": "messages",
                    "schema": "public",
                    "record": {"id": "m1", "chat_id": "c1"},
                    "old_record": null
                },
                "ids": [1]
            },
            "ref": null
        }"#;
        let payload = parse_change(text).unwrap().unwrap();
        assert_eq!(payload.kind, ChangeKind::Insert);
        assert_eq!(payload.table, "messages");
        assert_eq!(payload.row_id().as_deref(), Some("m1"));
        assert!(payload.old.is_none());

        let reply = r#"{"topic":"realtime:chat:c1","event":"phx_reply","payload":{"status":"ok"},"ref":"1"}"#;
        assert!(parse_change(reply).unwrap().is_none());
        assert!(parse_change("not json").is_err());
    }

    #[test]
    fn join_frame_carries_filter_expression() {
        let spec = EventSpec::new(ChangeKind::Insert, "messages")
            .with_filter(Filter::eq("chat_id", "c1"));
        let frame = join_frame("realtime:chat:c1", &spec, "key", 1);
        let change = &frame["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["filter"], "chat_id=eq.c1");
        assert_eq!(frame["ref"], "1");
    }

    /// 本地 WebSocket 服务端：收到 `phx_join` 后依次发出给定的帧，然后一直读到连接关闭
    async fn local_server(
        frames: Vec<String>,
    ) -> (String, tokio::sync::oneshot::Receiver<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/realtime/v1/websocket", listener.local_addr().unwrap());
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let join = ws.next().await.unwrap().unwrap();
            assert!(join.to_text().unwrap().contains("phx_join"));
            for frame in frames {
                ws.send(WsMessage::Text(frame)).await.unwrap();
            }
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
            let _ = closed_tx.send(());
        });
        (url, closed_rx)
    }

    #[tokio::test]
    async fn delete_with_key_only_old_record_reaches_filtered_subscriber() {
        let delete = json!({
            "topic": "realtime:roster-members:u1",
            "event": "postgres_changes",
            "payload": {"data": {
                "type": "DELETE",
                "table": "chat_members",
                "schema": "public",
                "record": null,
                "old_record": {"id": "cm1"}
            }},
            "ref": null
        });
        let (url, _closed) = local_server(vec![delete.to_string()]).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let spec = EventSpec::new(ChangeKind::All, "chat_members")
            .with_filter(Filter::eq("user_id", "u1"));
        let sub = RealtimeSubscription::open(&url, "key", "roster-members:u1", spec, tx)
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.kind, ChangeKind::Delete);
        assert_eq!(payload.row_id().as_deref(), Some("cm1"));
        sub.unsubscribe().await;
    }

    #[tokio::test]
    async fn dropping_without_unsubscribe_closes_the_connection() {
        let (url, closed) = local_server(Vec::new()).await;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sub = RealtimeSubscription::open(
            &url,
            "key",
            "chat:c1",
            EventSpec::new(ChangeKind::Insert, "messages"),
            tx,
        )
        .await
        .unwrap();

        drop(sub);
        tokio::time::timeout(Duration::from_secs(2), closed)
            .await
            .expect("连接未关闭")
            .unwrap();
    }
}
