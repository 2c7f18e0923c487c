//! 标签相关的远程调用

use crate::im::gateway::{decode_rows, Filter, Gateway, Query};
use crate::im::types::{tables, Label};
use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;

/// 标签 API
#[derive(Clone)]
pub struct LabelApi {
    gateway: Arc<dyn Gateway>,
}

fn assignment_filters(chat_id: &str, label_id: &str) -> [Filter; 2] {
    [
        Filter::eq("chat_id", chat_id),
        Filter::eq("label_id", label_id),
    ]
}

impl LabelApi {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// 全部标签，按名称排序
    pub async fn list_labels(&self) -> Result<Vec<Label>> {
        let rows = self
            .gateway
            .select(tables::LABELS, &Query::new().order("name", true))
            .await
            .context("查询标签列表失败")?;
        decode_rows(tables::LABELS, rows)
    }

    /// 会话上是否已有该标签
    pub async fn is_assigned(&self, chat_id: &str, label_id: &str) -> Result<bool> {
        let mut query = Query::new().select("chat_id").limit(1);
        for filter in assignment_filters(chat_id, label_id) {
            query = query.filter(filter);
        }
        let rows = self
            .gateway
            .select(tables::CHAT_LABELS, &query)
            .await
            .context("查询会话标签失败")?;
        Ok(!rows.is_empty())
    }

    pub async fn assign(&self, chat_id: &str, label_id: &str, assigned_by: &str) -> Result<()> {
        self.gateway
            .insert(
                tables::CHAT_LABELS,
                json!({
                    "chat_id": chat_id,
                    "label_id": label_id,
                    "assigned_by": assigned_by,
                    "assigned_at": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await
            .context("添加会话标签失败")?;
        Ok(())
    }

    pub async fn unassign(&self, chat_id: &str, label_id: &str) -> Result<()> {
        self.gateway
            .delete(tables::CHAT_LABELS, &assignment_filters(chat_id, label_id))
            .await
            .context("移除会话标签失败")
    }
}
