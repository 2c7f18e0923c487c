//! 内存网关
//!
//! 在进程内模拟后端：表是 JSON 行数组，插入时补齐 `id` / `created_at`，并把变更同步投递给
//! 匹配的订阅。用于单元测试和 CLI 的离线演示模式，支持按操作注入一次性失败。

use super::{
    compare_values, ChangeKind, ChangePayload, ChangeSender, EventSpec, Filter, Gateway, Query,
    Subscription,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// 可注入失败的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    Select,
    Insert,
    Delete,
    Upload,
    Subscribe,
}

struct Subscriber {
    channel: String,
    spec: EventSpec,
    sink: ChangeSender,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    blobs: HashMap<String, (Vec<u8>, String)>,
    subscribers: Vec<Subscriber>,
    failures: HashSet<(GatewayOp, String)>,
    op_counts: HashMap<(GatewayOp, String), usize>,
}

/// 内存网关
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<MemoryState>>,
    seq: Arc<AtomicU64>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 直接写入初始数据，不触发推送
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut state = self.state();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// 当前表中的全部行
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    /// 让下一次对 `table` 的 `op` 操作失败（对象存储操作时 `table` 填 bucket）
    pub fn fail_next(&self, op: GatewayOp, table: &str) {
        self.state().failures.insert((op, table.to_string()));
    }

    /// 对 `table` 执行过的 `op` 次数
    pub fn op_count(&self, op: GatewayOp, table: &str) -> usize {
        self.state()
            .op_counts
            .get(&(op, table.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// 仍处于活跃状态的订阅数
    pub fn active_subscriptions(&self) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .count()
    }

    /// 已上传对象的路径
    pub fn blob_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.state().blobs.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// 记录一次调用，若注入了失败则消费掉并返回错误
    fn record(&self, state: &mut MemoryState, op: GatewayOp, table: &str) -> Result<()> {
        *state
            .op_counts
            .entry((op, table.to_string()))
            .or_default() += 1;
        if state.failures.remove(&(op, table.to_string())) {
            return Err(anyhow!("模拟的 {:?} 失败: {}", op, table));
        }
        Ok(())
    }

    fn publish(state: &mut MemoryState, payload: ChangePayload) {
        state
            .subscribers
            .retain(|s| s.active.load(Ordering::SeqCst) && !s.sink.is_closed());
        for subscriber in state.subscribers.iter() {
            if subscriber.spec.matches(&payload) {
                debug!(
                    "[Gateway/Memory] 推送 {:?} {} -> {}",
                    payload.kind, payload.table, subscriber.channel
                );
                let _ = subscriber.sink.send(payload.clone());
            }
        }
    }
}

struct MemorySubscription {
    active: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let mut state = self.state();
        self.record(&mut state, GatewayOp::Select, table)?;

        let mut rows: Vec<Value> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            // sort_by 是稳定排序，同值保持插入顺序
            rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value> {
        let mut state = self.state();
        self.record(&mut state, GatewayOp::Insert, table)?;

        let Value::Object(mut row) = record else {
            return Err(anyhow!("插入 {} 的记录必须是 JSON 对象", table));
        };
        if !row.contains_key("id") {
            row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        if !row.contains_key("created_at") {
            // 保证同一网关内的时间戳严格递增
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) as i64;
            let ts = Utc::now() + chrono::Duration::microseconds(seq);
            row.insert("created_at".to_string(), Value::String(ts.to_rfc3339()));
        }
        let row = Value::Object(row);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());

        Self::publish(
            &mut state,
            ChangePayload {
                kind: ChangeKind::Insert,
                table: table.to_string(),
                new: Some(row.clone()),
                old: None,
            },
        );
        Ok(row)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<()> {
        let mut state = self.state();
        self.record(&mut state, GatewayOp::Delete, table)?;

        let removed: Vec<Value> = match state.tables.get_mut(table) {
            Some(rows) => {
                let (removed, kept): (Vec<Value>, Vec<Value>) = rows
                    .drain(..)
                    .partition(|row| filters.iter().all(|f| f.matches(row)));
                *rows = kept;
                removed
            }
            None => Vec::new(),
        };
        for old in removed {
            Self::publish(
                &mut state,
                ChangePayload {
                    kind: ChangeKind::Delete,
                    table: table.to_string(),
                    new: None,
                    old: Some(old),
                },
            );
        }
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let mut state = self.state();
        self.record(&mut state, GatewayOp::Upload, bucket)?;
        let key = format!("{}/{}", bucket, path);
        if state.blobs.contains_key(&key) {
            return Err(anyhow!("对象已存在: {}", key));
        }
        state.blobs.insert(key, (bytes, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("memory://{}/{}", bucket, path)
    }

    async fn subscribe(
        &self,
        channel: &str,
        spec: EventSpec,
        sink: ChangeSender,
    ) -> Result<Box<dyn Subscription>> {
        let mut state = self.state();
        self.record(&mut state, GatewayOp::Subscribe, &spec.table)?;
        let active = Arc::new(AtomicBool::new(true));
        state.subscribers.push(Subscriber {
            channel: channel.to_string(),
            spec,
            sink,
            active: active.clone(),
        });
        Ok(Box::new(MemorySubscription { active }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn insert_fills_defaults_and_notifies_matching_subscribers() {
        let gateway = MemoryGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = gateway
            .subscribe(
                "chat:c1",
                EventSpec::new(ChangeKind::Insert, "messages")
                    .with_filter(Filter::eq("chat_id", "c1")),
                tx,
            )
            .await
            .unwrap();

        let row = gateway
            .insert("messages", json!({"chat_id": "c1", "content": "hi"}))
            .await
            .unwrap();
        assert!(row.get("id").is_some());
        assert!(row.get("created_at").is_some());
        gateway
            .insert("messages", json!({"chat_id": "c2", "content": "other"}))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.new.as_ref(), Some(&row));
        assert!(rx.try_recv().is_err());

        sub.unsubscribe().await;
        sub.unsubscribe().await;
        assert_eq!(gateway.active_subscriptions(), 0);
        gateway
            .insert("messages", json!({"chat_id": "c1", "content": "late"}))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn select_filters_orders_and_limits() {
        let gateway = MemoryGateway::new();
        gateway.seed(
            "messages",
            vec![
                json!({"id": "b", "chat_id": "c1", "created_at": "2024-01-02T00:00:00Z"}),
                json!({"id": "a", "chat_id": "c1", "created_at": "2024-01-01T00:00:00Z"}),
                json!({"id": "x", "chat_id": "c2", "created_at": "2024-01-03T00:00:00Z"}),
            ],
        );
        let rows = gateway
            .select(
                "messages",
                &Query::new()
                    .filter(Filter::eq("chat_id", "c1"))
                    .order("created_at", true),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let rows = gateway
            .select("messages", &Query::new().order("created_at", false).limit(1))
            .await
            .unwrap();
        assert_eq!(rows[0]["id"], "x");
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(GatewayOp::Insert, "chats");
        assert!(gateway.insert("chats", json!({})).await.is_err());
        assert!(gateway.insert("chats", json!({})).await.is_ok());
        assert_eq!(gateway.op_count(GatewayOp::Insert, "chats"), 2);
        assert_eq!(gateway.rows("chats").len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let gateway = MemoryGateway::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = gateway
            .subscribe("chat:c1", EventSpec::new(ChangeKind::Insert, "messages"), tx)
            .await
            .unwrap();
        assert_eq!(gateway.active_subscriptions(), 1);

        drop(sub);
        assert_eq!(gateway.active_subscriptions(), 0);
        gateway
            .insert("messages", json!({"chat_id": "c1", "content": "late"}))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
