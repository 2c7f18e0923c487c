//! 按自然日分组与时间格式化
//!
//! 日期边界使用查看者所在时区（默认 [`chrono::Local`]），测试中传入固定偏移时区。

use crate::im::message::models::TranscriptEntry;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use std::fmt::Display;

/// 渲染后的消息记录项
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptItem {
    /// 日期分隔条
    DaySeparator(NaiveDate),
    Entry(TranscriptEntry),
}

/// 在每个自然日的第一条消息前插入日期分隔条
pub fn group_by_day<Tz: TimeZone>(entries: &[TranscriptEntry], tz: &Tz) -> Vec<TranscriptItem> {
    let mut items = Vec::with_capacity(entries.len() + 1);
    let mut current: Option<NaiveDate> = None;
    for entry in entries {
        let day = entry.message.created_at.with_timezone(tz).date_naive();
        if current != Some(day) {
            items.push(TranscriptItem::DaySeparator(day));
            current = Some(day);
        }
        items.push(TranscriptItem::Entry(entry.clone()));
    }
    items
}

/// 消息气泡上的时间，`HH:MM`
pub fn format_message_time<Tz>(at: DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%H:%M").to_string()
}

/// 会话列表中的日期，`dd-Mon-yy`
pub fn format_roster_date<Tz>(at: DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format("%d-%b-%y").to_string()
}

/// 日期分隔条上的文字
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        "今天".to_string()
    } else if Some(day) == today.checked_sub_signed(Duration::days(1)) {
        "昨天".to_string()
    } else if day.year() == today.year() {
        format!("{}月{}日", day.month(), day.day())
    } else {
        format!("{}年{}月{}日", day.year(), day.month(), day.day())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::types::{Message, MessageKind};
    use chrono::FixedOffset;

    fn entry(id: &str, at: &str) -> TranscriptEntry {
        TranscriptEntry::confirmed(Message {
            id: id.to_string(),
            chat_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            sender: None,
            content: id.to_string(),
            kind: MessageKind::Text,
            attachment_url: None,
            created_at: at.parse().unwrap(),
        })
    }

    fn separators(items: &[TranscriptItem]) -> usize {
        items
            .iter()
            .filter(|i| matches!(i, TranscriptItem::DaySeparator(_)))
            .count()
    }

    #[test]
    fn three_consecutive_days_get_three_separators() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let entries = vec![
            entry("a", "2024-05-01T12:00:00Z"),
            entry("b", "2024-05-02T12:00:00Z"),
            entry("c", "2024-05-03T12:00:00Z"),
        ];
        let items = group_by_day(&entries, &utc);
        assert_eq!(items.len(), 6);
        assert_eq!(separators(&items), 3);
        for pair in items.chunks(2) {
            assert!(matches!(pair[0], TranscriptItem::DaySeparator(_)));
            assert!(matches!(pair[1], TranscriptItem::Entry(_)));
        }
    }

    #[test]
    fn day_boundary_follows_viewer_timezone() {
        // 22:30 UTC 和次日 01:00 UTC 在 UTC+5:30 下是同一天
        let ist = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let entries = vec![
            entry("a", "2024-05-01T22:30:00Z"),
            entry("b", "2024-05-02T01:00:00Z"),
            entry("c", "2024-05-02T10:00:00Z"),
        ];
        let items = group_by_day(&entries, &ist);
        assert_eq!(separators(&items), 1);
        assert_eq!(
            items[0],
            TranscriptItem::DaySeparator(NaiveDate::from_ymd_opt(2024, 5, 2).unwrap())
        );

        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(separators(&group_by_day(&entries, &utc)), 2);
        assert!(group_by_day(&[], &utc).is_empty());
    }

    #[test]
    fn formats_times_and_labels() {
        let ist = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let at: DateTime<Utc> = "2024-05-01T20:15:00Z".parse().unwrap();
        assert_eq!(format_message_time(at, &ist), "01:45");
        assert_eq!(format_roster_date(at, &ist), "02-May-24");

        let today = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        assert_eq!(day_label(today, today), "今天");
        assert_eq!(day_label(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), today), "昨天");
        assert_eq!(day_label(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(), today), "3月9日");
        assert_eq!(
            day_label(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(), today),
            "2023年12月31日"
        );
    }
}
