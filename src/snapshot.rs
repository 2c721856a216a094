use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub websites: WebsiteCounts,
    pub databases: DatabaseCounts,
    pub containers: ContainerCounts,
    pub users: UserCounts,
    pub system: ResourceGauges,
    pub recent_activity: Vec<ActivityEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsiteCounts {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    pub ssl_issues: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseCounts {
    pub total: u64,
    pub running: u64,
    pub stopped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerCounts {
    pub total: u64,
    pub running: u64,
    pub images: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCounts {
    pub total: u64,
    pub active: u64,
    pub online: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGauges {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub uptime: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub category: ActivityCategory,
    pub message: String,
    pub timestamp: String,
    #[serde(rename = "status")]
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Website,
    Database,
    Docker,
    Email,
    Ssl,
    User,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub status: String,
    pub uptime: f64,
    #[serde(default)]
    pub load_average: Vec<f64>,
    pub memory_usage: MemoryUsage,
    pub disk_usage: DiskUsage,
    pub cpu_usage: f64,
    #[serde(default)]
    pub network_status: Option<NetworkStatus>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub active: bool,
    #[serde(default)]
    pub load_state: Option<String>,
    #[serde(default)]
    pub active_state: Option<String>,
    #[serde(default)]
    pub sub_state: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("{field} = {value} вне диапазона 0..100")]
    GaugeOutOfRange { field: &'static str, value: f64 },
    #[error("повторяющийся id события активности '{0}'")]
    DuplicateActivityId(String),
    #[error("некорректная метка времени '{timestamp}' у события '{id}'")]
    BadTimestamp { id: String, timestamp: String },
    #[error("события активности не упорядочены от новых к старым (событие '{0}')")]
    ActivityOrder(String),
}

pub trait Validate {
    fn validate(&self) -> Result<(), SnapshotError>;
}

impl Validate for DashboardSnapshot {
    fn validate(&self) -> Result<(), SnapshotError> {
        check_gauge("system.cpu_usage", self.system.cpu_usage)?;
        check_gauge("system.memory_usage", self.system.memory_usage)?;
        check_gauge("system.disk_usage", self.system.disk_usage)?;

        let mut ids = HashSet::with_capacity(self.recent_activity.len());
        let mut prev: Option<DateTime<Utc>> = None;
        for event in &self.recent_activity {
            if !ids.insert(event.id.as_str()) {
                return Err(SnapshotError::DuplicateActivityId(event.id.clone()));
            }
            let ts = event.parsed_timestamp()?;
            if let Some(prev_ts) = prev {
                if ts > prev_ts {
                    return Err(SnapshotError::ActivityOrder(event.id.clone()));
                }
            }
            prev = Some(ts);
        }
        Ok(())
    }
}

impl Validate for SystemStatus {
    fn validate(&self) -> Result<(), SnapshotError> {
        check_gauge("cpu_usage", self.cpu_usage)?;
        check_gauge("memory_usage.percent", self.memory_usage.percent)?;
        check_gauge("disk_usage.percent", self.disk_usage.percent)?;
        Ok(())
    }
}

impl ActivityEvent {
    // время без зоны считается UTC
    pub fn parsed_timestamp(&self) -> Result<DateTime<Utc>, SnapshotError> {
        let raw = self.timestamp.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| SnapshotError::BadTimestamp {
                id: self.id.clone(),
                timestamp: self.timestamp.clone(),
            })
    }

    pub fn timestamp_unix(&self) -> Option<i64> {
        self.parsed_timestamp().ok().map(|ts| ts.timestamp())
    }
}

fn check_gauge(field: &'static str, value: f64) -> Result<(), SnapshotError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(SnapshotError::GaugeOutOfRange { field, value })
    }
}
