//! Dry-run summary of the samples a filter would put into a batch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::AnalyzerType;
use crate::samples::SampleRecord;

/// Entries kept in the source distribution.
pub const TOP_SOURCES: usize = 10;

/// Rough per-sample analysis time used for the duration estimate.
pub const MINUTES_PER_SAMPLE: u64 = 3;

/// Samples of one file type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTypeCount {
    /// Lower-case extension, or `unknown`.
    pub file_type: String,
    /// Matching samples.
    pub count: u64,
    /// Their total size in bytes.
    pub size: u64,
}

/// Samples sharing one value of a catalog field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCount {
    /// Field value.
    pub value: String,
    /// Matching samples.
    pub count: u64,
}

/// What a batch over a sample filter would contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPreview {
    /// Family the batch would run on.
    pub analyzer: AnalyzerType,
    /// Matching samples.
    pub total_samples: u64,
    /// Their total size in bytes; unknown sizes count as zero.
    pub total_size: u64,
    /// By file type, largest count first.
    pub file_type_distribution: Vec<FileTypeCount>,
    /// By sample type, largest count first.
    pub sample_type_distribution: Vec<ValueCount>,
    /// By source, largest count first, at most [`TOP_SOURCES`] entries.
    pub source_distribution: Vec<ValueCount>,
    /// Enabled instances of the family.
    pub eligible_instances: u32,
    /// Minutes a batch of this size is expected to take.
    pub estimated_duration_minutes: Option<u64>,
}

impl TaskPreview {
    /// Summarize `records`.
    pub fn from_records(
        analyzer: AnalyzerType,
        records: &[SampleRecord],
        eligible_instances: u32,
    ) -> Self {
        let total_samples = records.len() as u64;
        let mut file_types: HashMap<String, (u64, u64)> = HashMap::new();
        let mut sample_types: HashMap<String, u64> = HashMap::new();
        let mut sources: HashMap<String, u64> = HashMap::new();
        let mut total_size = 0u64;

        for record in records {
            let size = record.file_size.unwrap_or(0);
            total_size = total_size.saturating_add(size);
            let slot = file_types.entry(record.file_type()).or_default();
            slot.0 += 1;
            slot.1 = slot.1.saturating_add(size);
            let kind = record.sample_type.as_deref().unwrap_or("unknown");
            *sample_types.entry(kind.to_string()).or_default() += 1;
            if let Some(source) = &record.source {
                *sources.entry(source.clone()).or_default() += 1;
            }
        }

        let mut file_type_distribution: Vec<FileTypeCount> = file_types
            .into_iter()
            .map(|(file_type, (count, size))| FileTypeCount {
                file_type,
                count,
                size,
            })
            .collect();
        file_type_distribution
            .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.file_type.cmp(&b.file_type)));
        let mut source_distribution = ranked(sources);
        source_distribution.truncate(TOP_SOURCES);

        Self {
            analyzer,
            total_samples,
            total_size,
            file_type_distribution,
            sample_type_distribution: ranked(sample_types),
            source_distribution,
            eligible_instances,
            estimated_duration_minutes: (total_samples > 0)
                .then(|| total_samples.saturating_mul(MINUTES_PER_SAMPLE)),
        }
    }
}

fn ranked(counts: HashMap<String, u64>) -> Vec<ValueCount> {
    let mut out: Vec<ValueCount> = counts
        .into_iter()
        .map(|(value, count)| ValueCount { value, count })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    out
}
