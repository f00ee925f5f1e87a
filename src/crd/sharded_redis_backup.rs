//! ShardedRedisBackup Custom Resource Definition

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ShardedRedisBackup resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "redis.oso.sh",
    version = "v1alpha1",
    kind = "ShardedRedisBackup",
    plural = "shardedredisbackups",
    singular = "shardedredisbackup",
    shortname = "srb",
    namespaced,
    status = "ShardedRedisBackupStatus",
    printcolumn = r#"{"name": "Sentinel", "type": "string", "jsonPath": ".spec.sentinelRef"}"#,
    printcolumn = r#"{"name": "Schedule", "type": "string", "jsonPath": ".spec.schedule"}"#,
    printcolumn = r#"{"name": "Paused", "type": "boolean", "jsonPath": ".spec.pause"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShardedRedisBackupSpec {
    /// Name of the Sentinel resource supervising the shards
    pub sentinel_ref: String,

    /// Cron schedule (5-field standard or 6/7-field with seconds)
    pub schedule: String,

    /// Maximum duration of a single shard backup, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Interval between snapshot checks, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Minimum size a snapshot must reach to be considered valid (e.g. "1Gi")
    #[serde(default = "default_min_size")]
    pub min_size: String,

    /// Path of the snapshot file on the Redis servers
    #[serde(default = "default_db_file")]
    pub db_file: String,

    /// Number of backup records kept per shard
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Stop scheduling new backups
    #[serde(default)]
    pub pause: bool,

    /// SSH access to the Redis servers
    pub ssh_options: SshOptions,

    /// Object storage destination
    pub s3_options: S3Options,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_min_size() -> String {
    "1Gi".to_string()
}

fn default_db_file() -> String {
    "/data/dump.rdb".to_string()
}

fn default_history_limit() -> u32 {
    10
}

/// SSH connection options
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshOptions {
    /// Remote user
    pub user: String,

    /// Secret of type kubernetes.io/ssh-auth holding the private key
    pub private_key_secret_ref: SecretRef,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Run remote commands with sudo
    #[serde(default)]
    pub sudo: bool,
}

fn default_ssh_port() -> u16 {
    22
}

/// S3 destination options
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Options {
    /// S3 bucket name
    pub bucket: String,

    /// Key prefix within the bucket
    #[serde(default)]
    pub path: String,

    /// AWS region
    pub region: String,

    /// Secret holding AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY
    pub credentials_secret_ref: SecretRef,

    /// Custom endpoint (for MinIO, Ceph, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,
}

/// Reference to a secret in the resource's namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
}

impl ShardedRedisBackupSpec {
    /// Parse the cron schedule
    pub fn parse_schedule(&self) -> Result<Schedule> {
        parse_schedule(&self.schedule)
    }

    /// Minimum snapshot size in bytes
    pub fn min_size_bytes(&self) -> Result<u64> {
        parse_quantity(&self.min_size)
            .map_err(|e| Error::config(format!("invalid 'spec.minSize' specification: {}", e)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Parse a cron expression, accepting the standard 5-field form
///
/// The `cron` crate requires a leading seconds field and numbers weekdays
/// 1 (Sunday) to 7. 5-field expressions fire at second zero and use the
/// standard 0 to 7 weekday numbering, where 0 and 7 are both Sunday.
/// Expressions with a seconds field are passed through as is.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let normalized = if fields.len() == 5 {
        let day_of_week = standard_day_of_week(fields[4])
            .map_err(|e| Error::config(format!("Invalid cron schedule '{}': {}", expr, e)))?;
        format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], day_of_week)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| Error::config(format!("Invalid cron schedule '{}': {}", expr, e)))
}

/// Translate a standard day-of-week field to the `cron` crate numbering
fn standard_day_of_week(field: &str) -> std::result::Result<String, String> {
    let items = field
        .split(',')
        .map(standard_day_of_week_item)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

fn standard_day_of_week_item(item: &str) -> std::result::Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };

    let converted = match range.split_once('-') {
        None => match weekday_number(range)? {
            Some(day) => (day % 7 + 1).to_string(),
            None => range.to_string(),
        },
        Some((start, end)) => match (weekday_number(start)?, weekday_number(end)?) {
            (Some(start), Some(end)) if start > end => {
                return Err(format!("day-of-week range '{}' is reversed", range))
            }
            // Sunday as 7 closes the range and wraps to the first weekday
            (Some(0), Some(7)) => "1-7".to_string(),
            (Some(7), Some(7)) => "1".to_string(),
            (Some(_), Some(7)) if step.is_some() => {
                return Err(format!("day-of-week range '{}' cannot end at 7 with a step", range))
            }
            (Some(start), Some(7)) => format!("{}-7,1", start + 1),
            (Some(start), Some(end)) => format!("{}-{}", start + 1, end + 1),
            (None, None) => range.to_string(),
            _ => return Err(format!("day-of-week range '{}' mixes names and numbers", range)),
        },
    };

    Ok(match step {
        Some(step) => format!("{}/{}", converted, step),
        None => converted,
    })
}

/// Numeric weekday 0 to 7, or None for names and wildcards
fn weekday_number(token: &str) -> std::result::Result<Option<u32>, String> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    match token.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(Some(day)),
        _ => Err(format!("day-of-week '{}' is out of range 0-7", token)),
    }
}

/// Parse a Kubernetes resource quantity into bytes
pub fn parse_quantity(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);

    if number.is_empty() {
        return Err(format!("'{}' has no numeric part", value));
    }

    let multiplier: u64 = match suffix.trim() {
        "" => 1,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        other => return Err(format!("unknown suffix '{}'", other)),
    };

    let number: f64 = number
        .parse()
        .map_err(|e| format!("'{}' is not a number: {}", number, e))?;

    Ok((number * multiplier as f64).round() as u64)
}

/// Lifecycle state of a backup record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum BackupState {
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

impl BackupState {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BackupState::Completed | BackupState::Failed | BackupState::Unknown
        )
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupState::Pending => "Pending",
            BackupState::Running => "Running",
            BackupState::Completed => "Completed",
            BackupState::Failed => "Failed",
            BackupState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One backup attempt of one shard at one scheduled time
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Shard name
    pub shard: String,

    /// Time the backup is due
    pub scheduled_for: DateTime<Utc>,

    /// Time the worker was launched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// ID (address) of the server the backup is taken from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    /// Alias of the server the backup is taken from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_alias: Option<String>,

    /// Current state
    pub state: BackupState,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl BackupRecord {
    /// A freshly scheduled backup
    pub fn pending(shard: impl Into<String>, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            shard: shard.into(),
            scheduled_for,
            started_at: None,
            server_id: None,
            server_alias: None,
            state: BackupState::Pending,
            message: "backup scheduled".to_string(),
        }
    }
}

/// ShardedRedisBackup status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShardedRedisBackupStatus {
    /// Backup records, most recent first
    #[serde(default)]
    pub backups: Vec<BackupRecord>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ShardedRedisBackupStatus {
    /// Most recent record of a shard in the given state
    pub fn find_last(&self, shard: &str, state: BackupState) -> Option<&BackupRecord> {
        self.backups
            .iter()
            .find(|b| b.shard == shard && b.state == state)
    }

    /// Index of the most recent record of a shard in the given state
    pub fn find_last_index(&self, shard: &str, state: BackupState) -> Option<usize> {
        self.backups
            .iter()
            .position(|b| b.shard == shard && b.state == state)
    }

    /// Whether a record for this exact shard and time already exists
    pub fn contains(&self, shard: &str, scheduled_for: DateTime<Utc>) -> bool {
        self.backups
            .iter()
            .any(|b| b.shard == shard && b.scheduled_for == scheduled_for)
    }

    /// Insert a record keeping the list ordered
    pub fn add_backup(&mut self, record: BackupRecord) {
        let at = self
            .backups
            .partition_point(|b| record_order(b, &record) == std::cmp::Ordering::Less);
        self.backups.insert(at, record);
    }

    /// Restore the canonical ordering
    pub fn sort(&mut self) {
        self.backups.sort_by(record_order);
    }
}

/// Most recent first, ties broken by shard name
fn record_order(a: &BackupRecord, b: &BackupRecord) -> std::cmp::Ordering {
    b.scheduled_for
        .cmp(&a.scheduled_for)
        .then_with(|| a.shard.cmp(&b.shard))
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, min, 0).unwrap()
    }

    #[test]
    fn test_five_field_schedule_is_normalized() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let next = schedule.after(&at(1)).next().unwrap();
        assert_eq!(next, at(5));
    }

    fn after_saturday_noon(expr: &str) -> DateTime<Utc> {
        let saturday = Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap();
        parse_schedule(expr).unwrap().after(&saturday).next().unwrap()
    }

    fn midnight(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_standard_weekday_numbers() {
        // 2024-05-05 is a Sunday, 2024-05-06 a Monday
        assert_eq!(after_saturday_noon("0 0 * * 1"), midnight(6));
        assert_eq!(after_saturday_noon("0 0 * * 0"), midnight(5));
        assert_eq!(after_saturday_noon("0 0 * * 7"), midnight(5));
        assert_eq!(after_saturday_noon("0 0 * * MON"), midnight(6));
    }

    #[test]
    fn test_standard_weekday_ranges_and_lists() {
        assert_eq!(after_saturday_noon("0 0 * * 1-5"), midnight(6));
        assert_eq!(after_saturday_noon("0 0 * * 5-7"), midnight(5));
        assert_eq!(after_saturday_noon("0 0 * * 0-6"), midnight(5));
        assert_eq!(after_saturday_noon("0 0 * * 2,4"), midnight(7));
        assert_eq!(after_saturday_noon("0 0 * * */2"), midnight(5));
    }

    #[test]
    fn test_weekday_conversion() {
        assert_eq!(standard_day_of_week("0").unwrap(), "1");
        assert_eq!(standard_day_of_week("6").unwrap(), "7");
        assert_eq!(standard_day_of_week("1-5").unwrap(), "2-6");
        assert_eq!(standard_day_of_week("5-7").unwrap(), "6-7,1");
        assert_eq!(standard_day_of_week("0-7").unwrap(), "1-7");
        assert_eq!(standard_day_of_week("1-5/2").unwrap(), "2-6/2");
        assert_eq!(standard_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(standard_day_of_week("*").unwrap(), "*");
        assert!(standard_day_of_week("8").is_err());
        assert!(standard_day_of_week("5-2").is_err());
        assert!(standard_day_of_week("3-7/2").is_err());
    }

    #[test]
    fn test_seconds_form_keeps_cron_crate_weekdays() {
        // 1 is Sunday with a seconds field
        let sunday = parse_schedule("0 0 0 * * 1").unwrap();
        let saturday = Utc.with_ymd_and_hms(2024, 5, 4, 12, 0, 0).unwrap();
        assert_eq!(sunday.after(&saturday).next().unwrap(), midnight(5));
    }

    #[test]
    fn test_invalid_schedule_is_config_error() {
        let err = parse_schedule("not-a-cron").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("1.5Ki").unwrap(), 1536);
        assert_eq!(parse_quantity("2048").unwrap(), 2048);
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("10Xi").is_err());
    }

    #[test]
    fn test_add_backup_keeps_most_recent_first() {
        let mut status = ShardedRedisBackupStatus::default();
        status.add_backup(BackupRecord::pending("shard01", at(1)));
        status.add_backup(BackupRecord::pending("shard01", at(3)));
        status.add_backup(BackupRecord::pending("shard00", at(3)));
        status.add_backup(BackupRecord::pending("shard01", at(2)));

        let order: Vec<_> = status
            .backups
            .iter()
            .map(|b| (b.shard.as_str(), b.scheduled_for))
            .collect();
        assert_eq!(
            order,
            vec![
                ("shard00", at(3)),
                ("shard01", at(3)),
                ("shard01", at(2)),
                ("shard01", at(1)),
            ]
        );
    }

    #[test]
    fn test_find_last_returns_most_recent_match() {
        let mut status = ShardedRedisBackupStatus::default();
        status.add_backup(BackupRecord::pending("shard01", at(1)));
        status.add_backup(BackupRecord::pending("shard01", at(2)));

        let last = status.find_last("shard01", BackupState::Pending).unwrap();
        assert_eq!(last.scheduled_for, at(2));
        assert!(status.find_last("shard01", BackupState::Running).is_none());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = BackupRecord::pending("shard01", at(0));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "Pending");
        assert!(json.get("scheduledFor").is_some());
        assert!(json.get("serverId").is_none());
    }
}
