//! 用户查询
//!
//! 手机号统一带国际区号前缀存储，查询前先做归一化。

use crate::im::error::{ChatError, ChatResult};
use crate::im::gateway::{decode_row, decode_rows, Filter, Gateway, Query};
use crate::im::types::{tables, User};
use anyhow::Context;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// 默认区号
pub const DEFAULT_PHONE_PREFIX: &str = "+91";

/// 归一化手机号：去掉空白，没有以 `+` 开头的区号时补上默认区号
pub fn normalize_phone(prefix: &str, raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.starts_with('+') {
        digits
    } else {
        format!("{}{}", prefix, digits)
    }
}

/// 用户相关的远程调用
#[derive(Clone)]
pub struct UserApi {
    gateway: Arc<dyn Gateway>,
}

impl UserApi {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// 按归一化后的手机号查询所有匹配用户
    pub async fn find_by_phone(&self, mobile_number: &str) -> ChatResult<Vec<User>> {
        let rows = self
            .gateway
            .select(
                tables::USERS,
                &Query::new().filter(Filter::eq("mobile_number", mobile_number)),
            )
            .await
            .context("按手机号查询用户失败")?;
        Ok(decode_rows(tables::USERS, rows)?)
    }

    /// 按手机号精确解析出唯一用户，查不到或匹配到多个都视为未找到
    pub async fn resolve_by_phone(&self, mobile_number: &str) -> ChatResult<User> {
        let mut users = self.find_by_phone(mobile_number).await?;
        match users.len() {
            1 => Ok(users.remove(0)),
            0 => Err(ChatError::NotFound("未找到该手机号对应的用户".to_string())),
            n => {
                debug!("[User] 手机号 {} 匹配到 {} 个用户", mobile_number, n);
                Err(ChatError::NotFound("该手机号匹配到多个用户".to_string()))
            }
        }
    }

    /// 批量查询用户（去重，空列表直接返回）
    pub async fn get_users(&self, ids: &[String]) -> ChatResult<Vec<User>> {
        let unique: Vec<String> = ids
            .iter()
            .filter(|id| !id.is_empty())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .gateway
            .select(
                tables::USERS,
                &Query::new().filter(Filter::in_list("id", unique)),
            )
            .await
            .context("批量查询用户失败")?;
        Ok(decode_rows(tables::USERS, rows)?)
    }

    /// 创建用户
    pub async fn create_user(
        &self,
        mobile_number: &str,
        full_name: &str,
        avatar_url: &str,
    ) -> ChatResult<User> {
        let row = self
            .gateway
            .insert(
                tables::USERS,
                json!({
                    "mobile_number": mobile_number,
                    "full_name": full_name,
                    "role": "member",
                    "avatar_url": avatar_url,
                }),
            )
            .await
            .context("创建用户失败")?;
        Ok(decode_row(tables::USERS, row)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::gateway::MemoryGateway;

    #[test]
    fn normalize_phone_adds_prefix_once() {
        assert_eq!(normalize_phone("+91", "9876543210"), "+919876543210");
        assert_eq!(normalize_phone("+91", "+919876543210"), "+919876543210");
        assert_eq!(normalize_phone("+91", " 98765 43210 "), "+919876543210");
        // 已带其他区号的号码原样保留
        assert_eq!(normalize_phone("+91", "+1 415 555 0100"), "+14155550100");
    }

    #[tokio::test]
    async fn resolve_by_phone_requires_exactly_one_match() {
        let gateway = MemoryGateway::new();
        gateway.seed(
            tables::USERS,
            vec![
                json!({"id": "u1", "full_name": "A", "mobile_number": "+911111111111"}),
                json!({"id": "u2", "full_name": "B", "mobile_number": "+912222222222"}),
                json!({"id": "u3", "full_name": "C", "mobile_number": "+912222222222"}),
            ],
        );
        let api = UserApi::new(Arc::new(gateway));
        assert_eq!(api.resolve_by_phone("+911111111111").await.unwrap().id, "u1");
        assert!(matches!(
            api.resolve_by_phone("+912222222222").await,
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            api.resolve_by_phone("+913333333333").await,
            Err(ChatError::NotFound(_))
        ));
    }
}
