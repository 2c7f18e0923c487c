//! 后端网关抽象
//!
//! 认证、关系存储、行变更推送和对象存储都由外部托管平台提供，本 crate 只通过 [`Gateway`]
//! 这组固定接口访问它们：
//!
//! - `select / insert / delete`：只支持平铺的 `eq` / `in` 过滤，关联查询在各模块的 `api.rs` 中
//!   由客户端自行拼装
//! - `upload / public_url`：对象存储
//! - `subscribe`：行变更推送，事件写入调用方提供的 mpsc 通道

pub mod memory;
pub mod realtime;
pub mod rest;

pub use memory::{GatewayOp, MemoryGateway};
pub use rest::RestGateway;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Ordering;
use tokio::sync::mpsc;

/// 过滤操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    In,
}

/// 单列过滤条件
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn in_list<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            column: column.into(),
            op: FilterOp::In,
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        }
    }

    /// 判断一行是否满足条件（内存网关使用）
    pub fn matches(&self, row: &Value) -> bool {
        let actual = row.get(&self.column).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::In => self
                .value
                .as_array()
                .map(|values| values.iter().any(|v| v == actual))
                .unwrap_or(false),
        }
    }

    /// 转成 PostgREST 风格的查询参数，例如 `("chat_id", "eq.123")`
    pub fn to_query_param(&self) -> (String, String) {
        let value = match self.op {
            FilterOp::Eq => format!("eq.{}", scalar_to_string(&self.value)),
            FilterOp::In => {
                let items = self
                    .value
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .map(|v| format!("\"{}\"", scalar_to_string(v)))
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .unwrap_or_default();
                format!("in.({})", items)
            }
        };
        (self.column.clone(), value)
    }

    /// 转成推送订阅使用的过滤表达式，例如 `chat_id=eq.123`
    pub fn to_expression(&self) -> String {
        let (column, value) = self.to_query_param();
        format!("{}={}", column, value)
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// 排序
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// 查询描述
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// 投影列，默认 `*`
    pub projection: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            projection: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, projection: impl Into<String>) -> Self {
        self.projection = projection.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 比较两个列值：都能解析成时间戳时按时间比较，其次按数字，最后按字符串
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(tx), Ok(ty)) => tx.cmp(&ty),
                _ => x.cmp(y),
            }
        }
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// 行变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// 订阅时表示“任意变更”
    All,
}

impl ChangeKind {
    pub fn as_event(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
            ChangeKind::All => "*",
        }
    }

    pub fn from_event(event: &str) -> Option<Self> {
        match event.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            "*" => Some(ChangeKind::All),
            _ => None,
        }
    }

    /// 订阅的事件类型是否覆盖实际发生的变更
    pub fn covers(&self, actual: ChangeKind) -> bool {
        *self == ChangeKind::All || *self == actual
    }
}

/// 订阅规格：变更类型 + 表 + 可选过滤
#[derive(Debug, Clone, PartialEq)]
pub struct EventSpec {
    pub kind: ChangeKind,
    pub table: String,
    pub filter: Option<Filter>,
}

impl EventSpec {
    pub fn new(kind: ChangeKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// 表和变更类型是否命中本订阅（不看过滤条件）
    pub fn accepts(&self, payload: &ChangePayload) -> bool {
        payload.table == self.table && self.kind.covers(payload.kind)
    }

    /// 判断一次变更是否命中本订阅，过滤条件按完整的新行或旧行计算
    pub fn matches(&self, payload: &ChangePayload) -> bool {
        if !self.accepts(payload) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => {
                payload.new.as_ref().map(|r| filter.matches(r)).unwrap_or(false)
                    || payload.old.as_ref().map(|r| filter.matches(r)).unwrap_or(false)
            }
        }
    }
}

/// 一次行变更推送
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePayload {
    pub kind: ChangeKind,
    pub table: String,
    /// 变更后的行（删除时为空）
    pub new: Option<Value>,
    /// 变更前的行（插入时为空）
    pub old: Option<Value>,
}

impl ChangePayload {
    /// 取变更行的 id（优先取新行）
    pub fn row_id(&self) -> Option<String> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .and_then(|row| row.get("id"))
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// 推送事件投递端
pub type ChangeSender = mpsc::UnboundedSender<ChangePayload>;

/// 推送订阅句柄
#[async_trait]
pub trait Subscription: Send + Sync {
    /// 取消订阅；可重复调用
    async fn unsubscribe(&self);
}

/// 后端网关
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>>;

    /// 插入一行并返回后端生成的完整记录
    async fn insert(&self, table: &str, record: Value) -> Result<Value>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<()>;

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn subscribe(
        &self,
        channel: &str,
        spec: EventSpec,
        sink: ChangeSender,
    ) -> Result<Box<dyn Subscription>>;
}

/// 把网关返回的 JSON 行反序列化为具体类型
pub(crate) fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| decode_row(table, row))
        .collect()
}

pub(crate) fn decode_row<T: DeserializeOwned>(table: &str, row: Value) -> Result<T> {
    serde_json::from_value(row).with_context(|| format!("解析 {} 表数据失败", table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_and_renders() {
        let row = json!({"chat_id": "c1", "user_id": "u1"});
        assert!(Filter::eq("chat_id", "c1").matches(&row));
        assert!(!Filter::eq("chat_id", "c2").matches(&row));
        assert!(Filter::in_list("user_id", ["u0", "u1"]).matches(&row));
        assert!(!Filter::in_list("user_id", Vec::<String>::new()).matches(&row));

        assert_eq!(Filter::eq("chat_id", "c1").to_expression(), "chat_id=eq.c1");
        assert_eq!(
            Filter::in_list("id", ["a", "b"]).to_query_param(),
            ("id".to_string(), "in.(\"a\",\"b\")".to_string())
        );
    }

    #[test]
    fn compare_values_orders_timestamps_chronologically() {
        let whole = json!("2024-05-01T10:00:00Z");
        let fraction = json!("2024-05-01T10:00:00.5Z");
        assert_eq!(compare_values(&whole, &fraction), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
    }

    #[test]
    fn event_spec_matches_kind_table_and_filter() {
        let spec = EventSpec::new(ChangeKind::Insert, "messages")
            .with_filter(Filter::eq("chat_id", "c1"));
        let hit = ChangePayload {
            kind: ChangeKind::Insert,
            table: "messages".to_string(),
            new: Some(json!({"id": "m1", "chat_id": "c1"})),
            old: None,
        };
        assert!(spec.matches(&hit));
        assert_eq!(hit.row_id().as_deref(), Some("m1"));

        let other_chat = ChangePayload {
            new: Some(json!({"id": "m2", "chat_id": "c2"})),
            ..hit.clone()
        };
        assert!(!spec.matches(&other_chat));

        let update = ChangePayload {
            kind: ChangeKind::Update,
            ..hit.clone()
        };
        assert!(!spec.matches(&update));
        assert!(EventSpec::new(ChangeKind::All, "messages").matches(&update));
    }
}
