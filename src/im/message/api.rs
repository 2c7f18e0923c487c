//! 消息相关的远程调用

use crate::im::gateway::{decode_row, decode_rows, Filter, Gateway, Query};
use crate::im::message::models::Attachment;
use crate::im::types::{tables, Message, MessageKind, User};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// 消息 API
#[derive(Clone)]
pub struct MessageApi {
    gateway: Arc<dyn Gateway>,
}

impl MessageApi {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// 为消息补上发送者详情
    async fn attach_senders(&self, mut messages: Vec<Message>) -> Result<Vec<Message>> {
        let mut ids: Vec<String> = messages.iter().map(|m| m.sender_id.clone()).collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(messages);
        }
        let rows = self
            .gateway
            .select(tables::USERS, &Query::new().filter(Filter::in_list("id", ids)))
            .await
            .context("查询消息发送者失败")?;
        let users: Vec<User> = decode_rows(tables::USERS, rows)?;
        let users: HashMap<String, User> = users.into_iter().map(|u| (u.id.clone(), u)).collect();
        for msg in messages.iter_mut() {
            msg.sender = users.get(&msg.sender_id).cloned();
        }
        Ok(messages)
    }

    /// 会话的全部历史消息，按创建时间升序
    pub async fn fetch_history(&self, chat_id: &str) -> Result<Vec<Message>> {
        let rows = self
            .gateway
            .select(
                tables::MESSAGES,
                &Query::new()
                    .filter(Filter::eq("chat_id", chat_id))
                    .order("created_at", true),
            )
            .await
            .with_context(|| format!("查询会话 {} 的历史消息失败", chat_id))?;
        let messages: Vec<Message> = decode_rows(tables::MESSAGES, rows)?;
        debug!("[MsgAPI] 会话 {} 共 {} 条历史消息", chat_id, messages.len());
        self.attach_senders(messages).await
    }

    /// 按 ID 查询一条完整消息（含发送者）
    pub async fn fetch_message(&self, message_id: &str) -> Result<Option<Message>> {
        let rows = self
            .gateway
            .select(
                tables::MESSAGES,
                &Query::new().filter(Filter::eq("id", message_id)).limit(1),
            )
            .await
            .with_context(|| format!("查询消息 {} 失败", message_id))?;
        let messages: Vec<Message> = decode_rows(tables::MESSAGES, rows)?;
        Ok(self.attach_senders(messages).await?.into_iter().next())
    }

    /// 写入一条消息，返回后端生成的完整记录
    pub async fn insert_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
        kind: MessageKind,
        attachment_url: Option<&str>,
    ) -> Result<Message> {
        let row = self
            .gateway
            .insert(
                tables::MESSAGES,
                json!({
                    "chat_id": chat_id,
                    "sender_id": sender_id,
                    "content": content,
                    "type": kind.as_str(),
                    "attachment_url": attachment_url,
                }),
            )
            .await
            .context("写入消息失败")?;
        decode_row(tables::MESSAGES, row)
    }

    /// 上传附件到 `{chat_id}/{随机名}.{扩展名}`，返回存储路径和公开地址
    pub async fn upload_attachment(
        &self,
        bucket: &str,
        chat_id: &str,
        attachment: &Attachment,
    ) -> Result<(String, String)> {
        let file_name = match attachment.extension() {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = format!("{}/{}", chat_id, file_name);
        self.gateway
            .upload(
                bucket,
                &path,
                attachment.bytes.clone(),
                &attachment.content_type,
            )
            .await
            .with_context(|| format!("上传附件失败: {}", attachment.file_name))?;
        let url = self.gateway.public_url(bucket, &path);
        Ok((path, url))
    }
}
