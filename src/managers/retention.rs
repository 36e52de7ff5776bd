//! Retention of service archives
//!
//! Archives are named `<service>_<YYYYmmdd_HHMMSS>.tar.gz` in the backup
//! root. Each service's resolved policy decides which of its archives expire.

use crate::config::{ConfigResolver, RetentionPolicy};
use crate::utils::archive::TIMESTAMP_FORMAT;
use anyhow::{Context, Result};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

fn archive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.+)_(\d{8}_\d{6})\.tar\.gz$").expect("archive name pattern is valid"))
}

/// One service archive in the backup root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArchive {
    pub service: String,
    pub timestamp: NaiveDateTime,
    pub path: PathBuf,
    pub size: u64,
}

impl BackupArchive {
    /// Parse an archive file name. `None` for anything else.
    pub fn parse(path: &Path) -> Option<(String, NaiveDateTime)> {
        let name = path.file_name()?.to_str()?;
        let captures = archive_pattern().captures(name)?;
        let timestamp = NaiveDateTime::parse_from_str(&captures[2], TIMESTAMP_FORMAT).ok()?;
        Some((captures[1].to_string(), timestamp))
    }
}

/// All archives under `backup_dir` grouped by service, newest first
pub fn list_archives(backup_dir: &Path) -> Result<BTreeMap<String, Vec<BackupArchive>>> {
    let mut archives: BTreeMap<String, Vec<BackupArchive>> = BTreeMap::new();
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(archives),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", backup_dir.display())),
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read {}", backup_dir.display()))?;
        let path = entry.path();
        let Some((service, timestamp)) = BackupArchive::parse(&path) else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        archives.entry(service.clone()).or_default().push(BackupArchive {
            service,
            timestamp,
            path,
            size: metadata.len(),
        });
    }

    for list in archives.values_mut() {
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.path.cmp(&a.path)));
    }
    Ok(archives)
}

/// Archives that `policy` lets expire. `archives` must be sorted newest first.
pub fn select_expired<'a>(
    policy: &RetentionPolicy,
    archives: &'a [BackupArchive],
    now: NaiveDateTime,
) -> Vec<&'a BackupArchive> {
    match *policy {
        RetentionPolicy::TimeBased { days } => {
            let cutoff = now - ChronoDuration::days(i64::from(days));
            archives.iter().filter(|a| a.timestamp < cutoff).collect()
        }
        RetentionPolicy::CountBased { keep } => archives.iter().skip(keep as usize).collect(),
        RetentionPolicy::Mixed { daily, weekly, monthly } => {
            let mut keep: HashSet<usize> = HashSet::new();
            keep.extend(newest_per_bucket(archives, daily, |t| t.format("%Y-%m-%d").to_string()));
            keep.extend(newest_per_bucket(archives, weekly, |t| {
                let week = t.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }));
            keep.extend(newest_per_bucket(archives, monthly, |t| t.format("%Y-%m").to_string()));
            if !archives.is_empty() {
                keep.insert(0);
            }
            archives
                .iter()
                .enumerate()
                .filter(|(i, _)| !keep.contains(i))
                .map(|(_, a)| a)
                .collect()
        }
    }
}

/// Indices of the newest archive in each of the newest `count` buckets
fn newest_per_bucket<F>(archives: &[BackupArchive], count: u32, bucket: F) -> Vec<usize>
where
    F: Fn(&NaiveDateTime) -> String,
{
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for (i, archive) in archives.iter().enumerate() {
        if seen.len() >= count as usize {
            break;
        }
        if seen.insert(bucket(&archive.timestamp)) {
            kept.push(i);
        }
    }
    kept
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub deleted: Vec<PathBuf>,
    pub kept: usize,
    /// (path, error) for archives that could not be removed
    pub failures: Vec<(PathBuf, String)>,
}

impl RetentionReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct RetentionManager {
    backup_dir: PathBuf,
    resolver: Arc<ConfigResolver>,
}

impl RetentionManager {
    pub fn new(backup_dir: PathBuf, resolver: Arc<ConfigResolver>) -> Self {
        Self { backup_dir, resolver }
    }

    /// Apply retention to one service or, with `None`, to all of them
    pub fn apply_retention(&self, service: Option<&str>) -> Result<RetentionReport> {
        self.apply_at(service, chrono::Local::now().naive_local())
    }

    /// Apply retention as of `now`
    pub fn apply_at(&self, service: Option<&str>, now: NaiveDateTime) -> Result<RetentionReport> {
        let archives = list_archives(&self.backup_dir)?;
        let mut report = RetentionReport::default();

        for (name, list) in &archives {
            if service.is_some_and(|s| !s.eq_ignore_ascii_case(name)) {
                continue;
            }
            let policy = self.resolver.resolve(name).global.retention_policy;
            let expired = select_expired(&policy, list, now);
            debug!("{}: {} archives, {} expired under {}", name, list.len(), expired.len(), policy);
            report.kept += list.len() - expired.len();

            for archive in expired {
                match fs::remove_file(&archive.path) {
                    Ok(()) => {
                        info!("Deleted expired archive {}", archive.path.display());
                        report.deleted.push(archive.path.clone());
                    }
                    Err(e) => {
                        warn!("Failed to delete {}: {}", archive.path.display(), e);
                        report.failures.push((archive.path.clone(), e.to_string()));
                    }
                }
            }
        }

        if let Some(service) = service {
            if !archives.keys().any(|k| k.eq_ignore_ascii_case(service)) {
                warn!("No archives found for service '{}'", service);
            }
        }
        info!(
            "Retention finished: {} deleted, {} kept, {} failures",
            report.deleted.len(),
            report.kept,
            report.failures.len()
        );
        Ok(report)
    }
}
