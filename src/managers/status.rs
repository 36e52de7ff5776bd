//! Status of the backup root: archives per service, the run lock and the
//! last run

use crate::config::EngineConfig;
use crate::managers::backup::RunReport;
use crate::managers::retention::list_archives;
use crate::utils::locker::RunLock;
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

impl Health {
    /// Health by age of the newest archive
    pub fn from_age_hours(hours: i64) -> Self {
        if hours < 24 {
            Health::Healthy
        } else if hours < 48 {
            Health::Warning
        } else {
            Health::Critical
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Health::Healthy => "✓ Healthy",
            Health::Warning => "⚠ Warning",
            Health::Critical => "✗ Critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub count: usize,
    pub total_bytes: u64,
    pub latest: Option<NaiveDateTime>,
    pub health: Health,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSummary {
    pub pid: Option<u32>,
    pub hostname: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub backup_root: PathBuf,
    pub services: BTreeMap<String, ServiceStatus>,
    pub lock: Option<LockSummary>,
    pub last_run: Option<RunReport>,
}

/// Gather the status of the backup root as of `now`
pub fn collect_status_at(config: &EngineConfig, now: NaiveDateTime) -> Result<StatusReport> {
    let services = list_archives(&config.backup_dir)?
        .into_iter()
        .map(|(name, archives)| {
            let latest = archives.first().map(|a| a.timestamp);
            let health = latest
                .map(|t| Health::from_age_hours(now.signed_duration_since(t).num_hours()))
                .unwrap_or(Health::Critical);
            let status = ServiceStatus {
                count: archives.len(),
                total_bytes: archives.iter().map(|a| a.size).sum(),
                latest,
                health,
            };
            (name, status)
        })
        .collect();

    let lock = match RunLock::inspect(&config.lock_dir(), config.lock_timeout) {
        Ok(status) => status.map(|status| LockSummary {
            pid: status.record.as_ref().map(|r| r.pid),
            hostname: status.record.as_ref().map(|r| r.hostname.clone()),
            acquired_at: status.record.as_ref().map(|r| r.acquired_at),
            stale: status.is_stale(),
        }),
        Err(e) => {
            warn!("Could not inspect run lock: {}", e);
            None
        }
    };

    let last_run = match RunReport::load(&config.last_run_path()) {
        Ok(report) => report,
        Err(e) => {
            warn!("{:#}", e);
            None
        }
    };

    Ok(StatusReport {
        backup_root: config.backup_dir.clone(),
        services,
        lock,
        last_run,
    })
}

pub fn collect_status(config: &EngineConfig) -> Result<StatusReport> {
    collect_status_at(config, chrono::Local::now().naive_local())
}

/// Human readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn render_text(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Backup Status Overview ===\n");
    let _ = writeln!(out, "Backup root: {}", report.backup_root.display());

    match &report.lock {
        None => {
            let _ = writeln!(out, "Run lock: free");
        }
        Some(lock) => {
            let holder = match (&lock.pid, &lock.hostname) {
                (Some(pid), Some(host)) => format!("pid {} on {}", pid, host),
                _ => "unknown holder".to_string(),
            };
            let since = lock
                .acquired_at
                .map(|t| format!(" since {}", t.format("%Y-%m-%d %H:%M:%S UTC")))
                .unwrap_or_default();
            let stale = if lock.stale { " (stale)" } else { "" };
            let _ = writeln!(out, "Run lock: held by {}{}{}", holder, since, stale);
        }
    }

    if let Some(run) = &report.last_run {
        let (done, partial, failed, skipped) = run.counts();
        let _ = writeln!(
            out,
            "Last run: {} ({} done, {} partial, {} failed, {} skipped)",
            run.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            done,
            partial,
            failed,
            skipped
        );
    } else {
        let _ = writeln!(out, "Last run: never");
    }

    let _ = writeln!(out, "\nServices:");
    let mut names: BTreeSet<&str> = report.services.keys().map(String::as_str).collect();
    if let Some(run) = &report.last_run {
        names.extend(run.services.keys().map(String::as_str));
    }
    if names.is_empty() {
        let _ = writeln!(out, "  (no archives)");
    }
    for name in names {
        match report.services.get(name) {
            Some(status) => {
                let latest = status
                    .latest
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    out,
                    "  {} - {} archives, {}, last {} [{}]",
                    name,
                    status.count,
                    format_bytes(status.total_bytes),
                    latest,
                    status.health.label()
                );
            }
            None => {
                let _ = writeln!(out, "  {} - no archives [{}]", name, Health::Critical.label());
            }
        }
        if let Some(service) = report.last_run.as_ref().and_then(|r| r.services.get(name)) {
            let _ = writeln!(out, "    Last outcome: {}", service.outcome);
            for component in &service.components {
                let _ = writeln!(out, "      {}", component);
            }
        }
    }
    out
}
