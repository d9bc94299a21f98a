// messages.rs - Reading archived group messages
//
// The archive is the SQLite `messages` table filled by the importer:
//   id, source, sourceName, timestamp (ms), message, groupId, groupName,
//   attachmentPaths, attachmentDescriptions, processedAt, quoteId,
//   quoteAuthor, quoteText

use crate::error::DigestResult;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMessage {
    pub id: i64,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub attachments: Vec<PathBuf>,
    pub quote: Option<Quote>,
}

/// Messages of one group inside the requested window, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupBatch {
    pub id: String,
    pub name: String,
    pub messages: Vec<GroupMessage>,
}

/// Inclusive time bounds; `None` leaves that side open.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn last_days(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            start: Some(now - Duration::days(days)),
            end: Some(now),
        }
    }

    /// `since` starts at midnight, `until` covers the whole day.
    pub fn from_dates(since: Option<NaiveDate>, until: Option<NaiveDate>) -> Self {
        let start = since
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt));
        let end = until
            .and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999))
            .map(|dt| Utc.from_utc_datetime(&dt));
        Self { start, end }
    }

    fn start_millis(&self) -> i64 {
        self.start.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN)
    }

    fn end_millis(&self) -> i64 {
        self.end.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX)
    }
}

pub trait MessageSource {
    fn group_messages(&self, group_id: &str, window: &TimeWindow) -> DigestResult<GroupBatch>;
    fn list_groups(&self) -> DigestResult<Vec<(String, String)>>;
}

pub struct SqliteMessages {
    conn: Connection,
}

impl SqliteMessages {
    pub fn open(path: &Path) -> DigestResult<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }
}

impl MessageSource for SqliteMessages {
    fn group_messages(&self, group_id: &str, window: &TimeWindow) -> DigestResult<GroupBatch> {
        let mut stmt = self.conn.prepare(
            "SELECT id, COALESCE(sourceName, source, ''), timestamp, COALESCE(message, ''), \
                    COALESCE(groupName, ''), attachmentPaths, quoteAuthor, quoteText \
             FROM messages \
             WHERE groupId = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
             ORDER BY timestamp, id",
        )?;

        let mut group_name = String::new();
        let mut messages = Vec::new();
        let mut rows = stmt.query(params![group_id, window.start_millis(), window.end_millis()])?;
        while let Some(row) = rows.next()? {
            let millis: i64 = row.get(2)?;
            let name: String = row.get(4)?;
            let attachments: Option<String> = row.get(5)?;
            let quote_author: Option<String> = row.get(6)?;
            let quote_text: Option<String> = row.get(7)?;

            if group_name.is_empty() && !name.is_empty() {
                group_name = name;
            }

            messages.push(GroupMessage {
                id: row.get(0)?,
                sender: row.get(1)?,
                timestamp: Utc.timestamp_millis_opt(millis).single().unwrap_or_default(),
                text: row.get(3)?,
                attachments: parse_attachment_paths(attachments.as_deref()),
                quote: match (quote_author, quote_text) {
                    (Some(author), Some(text)) if !text.trim().is_empty() => Some(Quote { author, text }),
                    _ => None,
                },
            });
        }

        if group_name.is_empty() {
            group_name = group_id.to_string();
        }

        Ok(GroupBatch {
            id: group_id.to_string(),
            name: group_name,
            messages,
        })
    }

    fn list_groups(&self) -> DigestResult<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT groupId, COALESCE(groupName, '') FROM messages WHERE groupId IS NOT NULL ORDER BY groupId")?;
        let groups = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(groups)
    }
}

/// `attachmentPaths` holds either a JSON array or a comma-separated list.
pub fn parse_attachment_paths(raw: Option<&str>) -> Vec<PathBuf> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };
    let entries: Vec<String> = if raw.starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        raw.split(',').map(|s| s.to_string()).collect()
    };
    entries
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn message(id: i64, text: &str, attachments: &[&str]) -> GroupMessage {
        GroupMessage {
            id,
            sender: "Alice".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + id * 60_000).unwrap(),
            text: text.to_string(),
            attachments: attachments.iter().map(PathBuf::from).collect(),
            quote: None,
        }
    }

    fn archive() -> SqliteMessages {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT, sourceName TEXT, timestamp INTEGER, message TEXT,
                groupId TEXT, groupName TEXT, attachmentPaths TEXT,
                attachmentDescriptions TEXT, processedAt INTEGER,
                quoteId INTEGER, quoteAuthor TEXT, quoteText TEXT
            );
            INSERT INTO messages (id, source, sourceName, timestamp, message, groupId, groupName, attachmentPaths, quoteAuthor, quoteText)
            VALUES
                (1, '+100', 'Alice', 1700000000000, 'Trail photos', 'g1', 'Hikers', '[\"att/a.jpg\", \"att/b.png\"]', NULL, NULL),
                (2, '+200', NULL, 1700000600000, 'Agreed', 'g1', 'Hikers', NULL, 'Alice', 'Trail photos'),
                (3, '+300', 'Carol', 1600000000000, 'Old news', 'g1', 'Hikers', '', NULL, NULL),
                (4, '+400', 'Dan', 1700000000000, 'Rent is due', 'g2', 'Flat', 'x.gif, y.gif', NULL, NULL);",
        )
        .unwrap();
        SqliteMessages::from_connection(conn)
    }

    #[test]
    fn test_group_messages_in_window() {
        let source = archive();
        let window = TimeWindow {
            start: Some(Utc.timestamp_millis_opt(1_699_000_000_000).unwrap()),
            end: None,
        };
        let batch = source.group_messages("g1", &window).unwrap();

        assert_eq!(batch.name, "Hikers");
        assert_eq!(batch.messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(
            batch.messages[0].attachments,
            vec![PathBuf::from("att/a.jpg"), PathBuf::from("att/b.png")]
        );
        assert_eq!(batch.messages[1].sender, "+200");
        assert_eq!(
            batch.messages[1].quote,
            Some(Quote { author: "Alice".to_string(), text: "Trail photos".to_string() })
        );
    }

    #[test]
    fn test_unknown_group_is_empty() {
        let batch = archive().group_messages("nope", &TimeWindow::all()).unwrap();
        assert!(batch.messages.is_empty());
        assert_eq!(batch.name, "nope");
    }

    #[test]
    fn test_list_groups() {
        assert_eq!(
            archive().list_groups().unwrap(),
            vec![
                ("g1".to_string(), "Hikers".to_string()),
                ("g2".to_string(), "Flat".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_attachment_paths() {
        assert!(parse_attachment_paths(None).is_empty());
        assert!(parse_attachment_paths(Some("  ")).is_empty());
        assert_eq!(parse_attachment_paths(Some("x.gif, y.gif")).len(), 2);
        assert_eq!(parse_attachment_paths(Some(r#"["a.jpg"]"#)), vec![PathBuf::from("a.jpg")]);
    }

    #[test]
    fn test_window_from_dates_is_inclusive() {
        let window = TimeWindow::from_dates(
            NaiveDate::from_ymd_opt(2024, 3, 1),
            NaiveDate::from_ymd_opt(2024, 3, 7),
        );
        assert_eq!(window.start.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(window.end.unwrap().timestamp_millis() % 1000, 999);
    }
}
