//! 会话列表的构建、排序与筛选（纯函数）

use crate::im::conversation::models::{ChatSummary, ChatTypeFilter, Member};
use crate::im::types::{ChatMemberRow, Conversation, Label, LabelAssignment, Message, User};
use std::collections::HashMap;

/// 取创建时间最新的一条消息；时间相同时后到的优先
pub fn latest_message<'a, I>(messages: I) -> Option<&'a Message>
where
    I: IntoIterator<Item = &'a Message>,
{
    messages.into_iter().fold(None, |best: Option<&Message>, msg| match best {
        Some(b) if b.created_at > msg.created_at => Some(b),
        _ => Some(msg),
    })
}

/// 按最近活动时间倒序排列
///
/// 使用稳定排序：时间相同的会话保持原有相对顺序，因此对已排好序的列表重复排序结果不变。
pub fn sort_roster(roster: &mut [ChatSummary]) {
    roster.sort_by(|a, b| b.latest_activity().cmp(&a.latest_activity()));
}

/// 按名称关键字（不区分大小写的子串匹配）和会话类型筛选
pub fn filter_roster(
    roster: &[ChatSummary],
    query: &str,
    type_filter: ChatTypeFilter,
) -> Vec<ChatSummary> {
    let needle = query.trim().to_lowercase();
    roster
        .iter()
        .filter(|chat| type_filter.accepts(chat.kind()))
        .filter(|chat| needle.is_empty() || chat.display_name.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

/// 一次全量拉取得到的原始数据
#[derive(Debug, Default, Clone)]
pub struct RosterRows {
    pub conversations: Vec<Conversation>,
    pub memberships: Vec<ChatMemberRow>,
    pub users: Vec<User>,
    pub messages: Vec<Message>,
    pub assignments: Vec<LabelAssignment>,
    pub labels: Vec<Label>,
}

/// 由原始数据拼装出排好序的会话列表
pub fn build_roster(viewer_id: &str, rows: RosterRows) -> Vec<ChatSummary> {
    let users: HashMap<&str, &User> = rows.users.iter().map(|u| (u.id.as_str(), u)).collect();
    let labels: HashMap<&str, &Label> = rows.labels.iter().map(|l| (l.id.as_str(), l)).collect();

    let mut members_by_chat: HashMap<&str, Vec<Member>> = HashMap::new();
    for row in rows.memberships.iter() {
        let members = members_by_chat.entry(row.chat_id.as_str()).or_default();
        // 成员按用户 id 去重
        if members.iter().any(|m| m.user_id == row.user_id) {
            continue;
        }
        members.push(Member {
            user_id: row.user_id.clone(),
            user: users.get(row.user_id.as_str()).map(|u| (*u).clone()),
        });
    }

    let mut messages_by_chat: HashMap<&str, Vec<&Message>> = HashMap::new();
    for msg in rows.messages.iter() {
        messages_by_chat
            .entry(msg.chat_id.as_str())
            .or_default()
            .push(msg);
    }

    let mut labels_by_chat: HashMap<&str, Vec<Label>> = HashMap::new();
    for assignment in rows.assignments.iter() {
        if let Some(label) = labels.get(assignment.label_id.as_str()) {
            let chat_labels = labels_by_chat.entry(assignment.chat_id.as_str()).or_default();
            if !chat_labels.iter().any(|l| l.id == label.id) {
                chat_labels.push((*label).clone());
            }
        }
    }

    let mut roster: Vec<ChatSummary> = rows
        .conversations
        .into_iter()
        .map(|conversation| {
            let id = conversation.id.clone();
            let latest = messages_by_chat
                .get(id.as_str())
                .and_then(|msgs| latest_message(msgs.iter().copied()))
                .map(|m| {
                    let mut m = m.clone();
                    if m.sender.is_none() {
                        m.sender = users.get(m.sender_id.as_str()).map(|u| (*u).clone());
                    }
                    m
                });
            ChatSummary::new(
                viewer_id,
                conversation,
                members_by_chat.remove(id.as_str()).unwrap_or_default(),
                labels_by_chat.remove(id.as_str()).unwrap_or_default(),
                latest,
            )
        })
        .collect();
    sort_roster(&mut roster);
    roster
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::im::types::{ChatKind, MessageKind};
    use chrono::{DateTime, TimeZone, Utc};

    pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    pub fn user(id: &str, name: &str) -> User {
        User {
            id: id.to_string(),
            full_name: name.to_string(),
            mobile_number: format!("+91{:0>10}", id.trim_start_matches('u')),
            avatar_url: None,
            role: "member".to_string(),
        }
    }

    pub fn conversation(id: &str, kind: ChatKind, name: Option<&str>, created: DateTime<Utc>) -> Conversation {
        Conversation {
            id: id.to_string(),
            kind,
            name: name.map(str::to_string),
            created_by: Some("u1".to_string()),
            created_at: created,
        }
    }

    pub fn message(id: &str, chat_id: &str, sender: &str, content: &str, created: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender.to_string(),
            sender: None,
            content: content.to_string(),
            kind: MessageKind::Text,
            attachment_url: None,
            created_at: created,
        }
    }

    pub fn membership(chat_id: &str, user_id: &str) -> ChatMemberRow {
        ChatMemberRow {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            joined_at: None,
        }
    }
}
