//! Batch report: a summary derived from a progress record.
//!
//! [`generate`] is a pure function of the record, so a report can be
//! rebuilt at any time, including for a batch that is still running.
//! Saving and publishing are separate helpers.

use crate::error::{BatchError, StorageError};
use crate::job::join_key;
use crate::progress::ProgressRecord;
use crate::storage::ObjectStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Failed keys quoted in `error_examples`.
const ERROR_EXAMPLE_LIMIT: usize = 5;
/// Keys quoted per message in the error taxonomy.
const TAXONOMY_EXAMPLE_LIMIT: usize = 3;
/// Message prefixes of length-check rejections (`JobError::too_short`).
const TOO_SHORT_PREFIXES: [&str; 2] = ["Text too short (", "Empty extraction ("];

/// Full report, serialised as the report JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub processing_stats: ProcessingStats,
    pub performance_metrics: PerformanceMetrics,
    pub error_details: ErrorDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub timestamp: String,
    pub batch_id: String,
    /// Jobs with a terminal outcome (`success_count + error_count`).
    pub total_files: usize,
    pub success_count: usize,
    pub error_count: usize,
    /// Jobs not yet run; non-zero only for a report on an unfinished batch.
    pub pending_count: usize,
    /// `success_count / total_files` as a percentage, one decimal: `"90.0%"`.
    pub success_rate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub total_characters_extracted: u64,
    pub average_processing_time_seconds: f64,
    /// Failures caused by output below the minimum length.
    pub files_rejected_too_short: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub files_per_minute: f64,
    pub total_processing_time_minutes: f64,
    pub total_processing_time_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub unique_error_messages: Vec<String>,
    pub error_examples: Vec<String>,
    pub error_taxonomy: Vec<ErrorClass>,
}

/// One distinct error message and the jobs that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClass {
    pub message: String,
    pub count: usize,
    pub examples: Vec<String>,
}

/// Build the report for `record`.
pub fn generate(record: &ProgressRecord, batch_id: &str) -> Report {
    let success_count = record.processed.len();
    let error_count = record.failed.len();
    let total_files = success_count + error_count;

    let success_rate = if total_files == 0 {
        "0.0%".to_string()
    } else {
        format!("{:.1}%", success_count as f64 / total_files as f64 * 100.0)
    };

    let total_chars: u64 = record
        .processed
        .iter()
        .map(|e| e.chars_extracted as u64)
        .sum();
    let busy_seconds: f64 = record.processed.iter().map(|e| e.time_sec).sum();
    let average_time = if success_count == 0 {
        0.0
    } else {
        busy_seconds / success_count as f64
    };

    let span_seconds = wall_clock_span(record).unwrap_or(busy_seconds);
    let minutes = span_seconds / 60.0;
    let files_per_minute = if minutes > 0.0 {
        total_files as f64 / minutes
    } else {
        0.0
    };

    let taxonomy = error_taxonomy(record);
    let mut unique_error_messages: Vec<String> =
        taxonomy.iter().map(|c| c.message.clone()).collect();
    unique_error_messages.sort();

    Report {
        metadata: ReportMetadata {
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            batch_id: batch_id.to_string(),
            total_files,
            success_count,
            error_count,
            pending_count: record.pending.len(),
            success_rate,
        },
        processing_stats: ProcessingStats {
            total_characters_extracted: total_chars,
            average_processing_time_seconds: round(average_time, 2),
            files_rejected_too_short: record
                .failed
                .iter()
                .filter(|e| is_too_short(&e.error))
                .count(),
        },
        performance_metrics: PerformanceMetrics {
            files_per_minute: round(files_per_minute, 2),
            total_processing_time_minutes: round(minutes, 2),
            total_processing_time_seconds: round(span_seconds, 1),
        },
        error_details: ErrorDetails {
            unique_error_messages,
            error_examples: record
                .failed
                .iter()
                .take(ERROR_EXAMPLE_LIMIT)
                .map(|e| e.file.clone())
                .collect(),
            error_taxonomy: taxonomy,
        },
    }
}

fn is_too_short(error: &str) -> bool {
    TOO_SHORT_PREFIXES.iter().any(|p| error.starts_with(p))
}

/// Seconds between the earliest and latest `finished_at`, if at least two
/// entries carry one.
fn wall_clock_span(record: &ProgressRecord) -> Option<f64> {
    let stamps: Vec<_> = record
        .processed
        .iter()
        .filter_map(|e| e.finished_at)
        .chain(record.failed.iter().filter_map(|e| e.finished_at))
        .collect();
    if stamps.len() < 2 {
        return None;
    }
    let first = stamps.iter().min()?;
    let last = stamps.iter().max()?;
    Some((*last - *first).num_milliseconds() as f64 / 1000.0)
}

/// Group failures by message: most frequent first, ties by message.
fn error_taxonomy(record: &ProgressRecord) -> Vec<ErrorClass> {
    let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for entry in &record.failed {
        groups
            .entry(entry.error.as_str())
            .or_default()
            .push(entry.file.as_str());
    }
    let mut classes: Vec<ErrorClass> = groups
        .into_iter()
        .map(|(message, files)| ErrorClass {
            message: message.to_string(),
            count: files.len(),
            examples: files
                .iter()
                .take(TAXONOMY_EXAMPLE_LIMIT)
                .map(|f| f.to_string())
                .collect(),
        })
        .collect();
    // Stable sort keeps the BTreeMap's message order within equal counts.
    classes.sort_by(|a, b| b.count.cmp(&a.count));
    classes
}

fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// File name of the report for `batch_id`.
pub fn report_file_name(batch_id: &str) -> String {
    format!("processing_report_{batch_id}.json")
}

/// Write the report as pretty JSON under `dir`. Returns the path written.
pub async fn save(report: &Report, dir: &Path) -> Result<PathBuf, BatchError> {
    let path = dir.join(report_file_name(&report.metadata.batch_id));
    let write_err = |source: std::io::Error| BatchError::ReportWrite {
        path: path.clone(),
        source,
    };
    let json = serde_json::to_vec_pretty(report).map_err(|e| write_err(std::io::Error::other(e)))?;
    tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
    tokio::fs::write(&path, json).await.map_err(write_err)?;
    info!("Saved report locally to {}", path.display());
    Ok(path)
}

/// Upload the report to `<destination_prefix>/analytics/`. Returns the key.
pub async fn publish(
    report: &Report,
    store: &dyn ObjectStore,
    destination_prefix: &str,
) -> Result<String, StorageError> {
    let key = join_key(
        &join_key(destination_prefix, "analytics"),
        &report_file_name(&report.metadata.batch_id),
    );
    let json = serde_json::to_vec_pretty(report)
        .map_err(|e| StorageError::Remote(format!("report serialisation failed: {e}")))?;
    store.write(&key, json, "application/json").await?;
    info!("Uploaded report to {}/{}", store.describe().trim_end_matches('/'), key);
    Ok(key)
}
