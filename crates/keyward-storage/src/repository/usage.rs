//! Usage ledger queries.
//!
//! Record ids start with a millisecond UTC timestamp, so ordering by id is
//! chronological and time windows are id range scans.

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection};

use super::Collection;
use crate::error::Result;
use crate::models::{
    AppUsage, KeyUsage, ModelUsage, UsageRecord, UsageStats, RECENT_USAGE_LIMIT,
};

const ID_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_SUFFIX_LEN: usize = 6;
const ID_TIME_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Build a ledger id for a record written at `at`.
pub fn generate_usage_id(at: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_SUFFIX_CHARSET[rng.gen_range(0..ID_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{}{}", at.format(ID_TIME_FORMAT), suffix)
}

impl Collection<UsageRecord> {
    /// Records at or after `since`, newest first.
    pub fn since(conn: &Connection, since: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        // Bare timestamp prefix sorts before any id carrying the same prefix.
        let lower_bound = since.format(ID_TIME_FORMAT).to_string();
        Self::query(
            conn,
            "SELECT value FROM usage_records WHERE id >= ?1 ORDER BY id DESC",
            [lower_bound],
        )
    }

    /// One page of records, newest first.
    pub fn page(conn: &Connection, limit: u32, offset: u64) -> Result<Vec<UsageRecord>> {
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        Self::query(
            conn,
            "SELECT value FROM usage_records ORDER BY id DESC LIMIT ?1 OFFSET ?2",
            params![limit, offset],
        )
    }
}

/// Aggregate records (newest first) into ledger statistics.
pub fn aggregate_usage(records: Vec<UsageRecord>) -> UsageStats {
    let mut stats = UsageStats::default();

    for record in &records {
        stats.total_tokens += record.total_tokens;
        stats.total_cost += record.cost;
        stats.total_requests += 1;

        let app = stats
            .by_app
            .entry(record.app_id.clone())
            .or_insert_with(|| AppUsage {
                app_name: record.app_name.clone(),
                ..Default::default()
            });
        app.total_tokens += record.total_tokens;
        app.total_cost += record.cost;
        app.request_count += 1;

        let key: &mut KeyUsage = stats.by_key.entry(record.key_name.clone()).or_default();
        key.total_tokens += record.total_tokens;
        key.total_cost += record.cost;
        key.request_count += 1;

        let model = stats
            .by_model
            .entry(format!("{}/{}", record.key_name, record.model))
            .or_insert_with(|| ModelUsage {
                key: record.key_name.clone(),
                model: record.model.clone(),
                ..Default::default()
            });
        model.total_tokens += record.total_tokens;
        model.total_cost += record.cost;
        model.request_count += 1;
    }

    stats.recent_usages = records.into_iter().take(RECENT_USAGE_LIMIT).collect();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageStatus;
    use crate::repository::UsageRepo;
    use crate::schema::run_migrations;
    use chrono::Duration;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn record(at: DateTime<Utc>, app: &str, key: &str, model: &str, tokens: u64) -> UsageRecord {
        UsageRecord {
            id: generate_usage_id(at),
            app_id: app.to_string(),
            app_name: format!("{app} name"),
            key_name: key.to_string(),
            model: model.to_string(),
            prompt_tokens: tokens,
            output_tokens: 0,
            total_tokens: tokens,
            cost: tokens as f64 / 1000.0,
            endpoint: "/chat/completions".to_string(),
            status: UsageStatus::Success,
            timestamp: at,
        }
    }

    #[test]
    fn test_usage_id_format() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = generate_usage_id(at);

        assert_eq!(id.len(), 17 + ID_SUFFIX_LEN);
        assert!(id.starts_with("20240305070809123"));
        assert!(id[17..]
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn test_ids_sort_chronologically() {
        let now = Utc::now();
        let earlier = generate_usage_id(now - Duration::milliseconds(1));
        let later = generate_usage_id(now);
        assert!(earlier < later);
    }

    #[test]
    fn test_since_filters_and_orders_newest_first() {
        let conn = setup_db();
        let now = Utc::now();

        let old = record(now - Duration::days(40), "a", "k", "m", 1);
        let mid = record(now - Duration::days(2), "a", "k", "m", 2);
        let new = record(now, "a", "k", "m", 3);
        for r in [&old, &mid, &new] {
            UsageRepo::put(&conn, r).unwrap();
        }

        let found: Vec<String> = UsageRepo::since(&conn, now - Duration::days(30))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(found, vec![new.id, mid.id]);
    }

    #[test]
    fn test_page() {
        let conn = setup_db();
        let now = Utc::now();
        for i in 0..5 {
            UsageRepo::put(&conn, &record(now + Duration::seconds(i), "a", "k", "m", i as u64))
                .unwrap();
        }

        let first = UsageRepo::page(&conn, 2, 0).unwrap();
        assert_eq!(
            first.iter().map(|r| r.total_tokens).collect::<Vec<_>>(),
            vec![4, 3]
        );

        let last = UsageRepo::page(&conn, 2, 4).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].total_tokens, 0);
    }

    #[test]
    fn test_aggregate_usage() {
        let now = Utc::now();
        let records = vec![
            record(now, "a", "openai", "gpt-4", 10),
            record(now, "b", "openai", "gpt-4", 20),
            record(now, "a", "claude", "claude-3", 5),
        ];

        let stats = aggregate_usage(records);

        assert_eq!(stats.total_tokens, 35);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.by_app["a"].total_tokens, 15);
        assert_eq!(stats.by_app["a"].request_count, 2);
        assert_eq!(stats.by_app["a"].app_name, "a name");
        assert_eq!(stats.by_key["openai"].total_tokens, 30);
        assert_eq!(stats.by_model["openai/gpt-4"].request_count, 2);
        assert_eq!(stats.by_model["claude/claude-3"].model, "claude-3");
        assert_eq!(stats.recent_usages.len(), 3);
    }

    #[test]
    fn test_recent_usages_capped() {
        let now = Utc::now();
        let records: Vec<_> = (0..150)
            .map(|i| record(now - Duration::seconds(i), "a", "k", "m", 1))
            .collect();
        let newest = records[0].clone();

        let stats = aggregate_usage(records);
        assert_eq!(stats.total_requests, 150);
        assert_eq!(stats.recent_usages.len(), RECENT_USAGE_LIMIT);
        assert_eq!(stats.recent_usages[0], newest);
    }
}
