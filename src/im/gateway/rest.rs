//! HTTP 网关（PostgREST 风格的数据接口 + 对象存储）
//!
//! 认证信息（apikey / Authorization）通过 reqwest 的 default_headers 统一注入。

use super::realtime::RealtimeSubscription;
use super::{ChangeSender, EventSpec, Filter, Gateway, Query, Subscription};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

/// 基于 HTTP 的后端网关
pub struct RestGateway {
    client: reqwest::Client,
    api_base_url: String,
    realtime_url: String,
    api_key: String,
}

impl RestGateway {
    /// 创建网关；`api_key` 同时作为 apikey 头和 Bearer token
    pub fn new(api_base_url: &str, realtime_url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::HeaderName::from_static("apikey"),
                    reqwest::header::HeaderValue::from_str(api_key).context("无效的 api key")?,
                );
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                        .context("无效的 api key")?,
                );
                headers
            })
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            realtime_url: realtime_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_base_url, table)
    }

    fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
        filters.iter().map(Filter::to_query_param).collect()
    }

    /// 统一检查 HTTP 状态并读取 body
    async fn read_body(op: &str, table: &str, response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();
        let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
        if !status.is_success() {
            let body_str = String::from_utf8_lossy(&body_bytes);
            error!(
                "[Gateway/REST] {} {} 失败，HTTP状态: {}, 响应: {}",
                op, table, status, body_str
            );
            return Err(anyhow!("HTTP 错误 {}: {}", status, body_str));
        }
        Ok(body_bytes.to_vec())
    }
}

#[async_trait]
impl Gateway for RestGateway {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>> {
        let operation_id = Uuid::new_v4().to_string();
        let mut params = vec![("select".to_string(), query.projection.clone())];
        params.extend(Self::filter_params(&query.filters));
        if let Some(order) = &query.order {
            let dir = if order.ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, dir)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        debug!(
            "[Gateway/REST] 📡 select {} params={:?}, operationID={}",
            table, params, operation_id
        );

        let response = self
            .client
            .get(self.table_url(table))
            .header("operationID", &operation_id)
            .query(&params)
            .send()
            .await
            .context("请求失败")?;
        let body = Self::read_body("select", table, response).await?;
        let rows: Vec<Value> = serde_json::from_slice(&body).map_err(|e| {
            error!(
                "[Gateway/REST] select {} 反序列化失败: {:?}\n原始响应: {}",
                table,
                e,
                String::from_utf8_lossy(&body)
            );
            anyhow!("反序列化响应失败: {:?}", e)
        })?;
        debug!("[Gateway/REST] select {} 返回 {} 行", table, rows.len());
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value> {
        let operation_id = Uuid::new_v4().to_string();
        debug!(
            "[Gateway/REST] 📡 insert {}: {}, operationID={}",
            table, record, operation_id
        );
        let response = self
            .client
            .post(self.table_url(table))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .header("operationID", &operation_id)
            .json(&record)
            .send()
            .await
            .context("请求失败")?;
        let body = Self::read_body("insert", table, response).await?;
        let rows: Vec<Value> =
            serde_json::from_slice(&body).context("解析 insert 响应失败")?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow!("insert {} 未返回任何记录", table))
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<()> {
        if filters.is_empty() {
            return Err(anyhow!("拒绝不带过滤条件的 delete: {}", table));
        }
        let params = Self::filter_params(filters);
        debug!("[Gateway/REST] 📡 delete {} params={:?}", table, params);
        let response = self
            .client
            .delete(self.table_url(table))
            .query(&params)
            .send()
            .await
            .context("请求失败")?;
        Self::read_body("delete", table, response).await?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let url = format!("{}/storage/v1/object/{}/{}", self.api_base_url, bucket, path);
        info!(
            "[Gateway/REST] ⬆️ 上传对象 {}/{} ({} 字节, {})",
            bucket,
            path,
            bytes.len(),
            content_type
        );
        let response = self
            .client
            .post(&url)
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .context("上传请求失败")?;
        Self::read_body("upload", bucket, response).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.api_base_url, bucket, path
        )
    }

    async fn subscribe(
        &self,
        channel: &str,
        spec: EventSpec,
        sink: ChangeSender,
    ) -> Result<Box<dyn Subscription>> {
        let subscription =
            RealtimeSubscription::open(&self.realtime_url, &self.api_key, channel, spec, sink)
                .await?;
        Ok(Box::new(subscription))
    }
}
