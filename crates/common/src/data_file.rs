/*
 * DataFileRecord: descriptor of one physically written output file.
 *
 * Produced by a write task, staged by the task committer and published
 * to the table by the job committer. Never mutated once staged.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Physical format of a data file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Parquet,
    Orc,
    Avro,
}

/// One written data file with its statistics and partition values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataFileRecord {
    /// Full path of the file in table storage
    pub file_path: String,
    pub file_format: FileFormat,
    pub file_size_bytes: u64,
    pub record_count: u64,
    /// Partition values keyed by partition field name; empty for unpartitioned tables
    #[serde(default)]
    pub partition: BTreeMap<String, String>,
    /// Per-column statistics keyed by field id
    #[serde(default)]
    pub column_sizes: BTreeMap<i32, u64>,
    #[serde(default)]
    pub value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    pub null_value_counts: BTreeMap<i32, u64>,
    #[serde(default)]
    pub lower_bounds: BTreeMap<i32, Vec<u8>>,
    #[serde(default)]
    pub upper_bounds: BTreeMap<i32, Vec<u8>>,
    #[serde(default)]
    pub split_offsets: Vec<u64>,
    #[serde(default)]
    pub sort_order_id: Option<i32>,
}

impl DataFileRecord {
    /// Creates a record without partition values or column statistics.
    pub fn new(
        file_path: impl Into<String>,
        file_format: FileFormat,
        file_size_bytes: u64,
        record_count: u64,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            file_format,
            file_size_bytes,
            record_count,
            partition: BTreeMap::new(),
            column_sizes: BTreeMap::new(),
            value_counts: BTreeMap::new(),
            null_value_counts: BTreeMap::new(),
            lower_bounds: BTreeMap::new(),
            upper_bounds: BTreeMap::new(),
            split_offsets: Vec::new(),
            sort_order_id: None,
        }
    }

    /// Adds a partition value.
    pub fn with_partition_value(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.partition.insert(field.into(), value.into());
        self
    }

    /// Records statistics for one column.
    pub fn with_column_stats(mut self, field_id: i32, stats: ColumnStats) -> Self {
        self.column_sizes.insert(field_id, stats.size_bytes);
        self.value_counts.insert(field_id, stats.value_count);
        self.null_value_counts.insert(field_id, stats.null_count);
        if let Some(lower) = stats.lower_bound {
            self.lower_bounds.insert(field_id, lower);
        }
        if let Some(upper) = stats.upper_bound {
            self.upper_bounds.insert(field_id, upper);
        }
        self
    }

    pub fn with_split_offsets(mut self, offsets: Vec<u64>) -> Self {
        self.split_offsets = offsets;
        self
    }

    pub fn with_sort_order_id(mut self, sort_order_id: i32) -> Self {
        self.sort_order_id = Some(sort_order_id);
        self
    }

    /// Returns true if the file belongs to an unpartitioned table.
    pub fn is_unpartitioned(&self) -> bool {
        self.partition.is_empty()
    }
}

impl fmt::Display for DataFileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {} bytes, {} rows)",
            self.file_path, self.file_format, self.file_size_bytes, self.record_count
        )
    }
}

/// Statistics for a single column of a data file.
#[derive(Debug, Clone, Default)]
pub struct ColumnStats {
    pub size_bytes: u64,
    pub value_count: u64,
    pub null_count: u64,
    pub lower_bound: Option<Vec<u8>>,
    pub upper_bound: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder_helpers() {
        let record = DataFileRecord::new("s3://wh/db/t/data/a.parquet", FileFormat::Parquet, 1024, 10)
            .with_partition_value("day", "2024-01-01")
            .with_column_stats(
                1,
                ColumnStats {
                    size_bytes: 100,
                    value_count: 10,
                    null_count: 2,
                    lower_bound: Some(vec![0]),
                    upper_bound: None,
                },
            )
            .with_split_offsets(vec![4, 512])
            .with_sort_order_id(1);

        assert!(!record.is_unpartitioned());
        assert_eq!(record.split_offsets, vec![4, 512]);
        assert_eq!(record.sort_order_id, Some(1));
        assert_eq!(record.null_value_counts.get(&1), Some(&2));
        assert!(record.upper_bounds.is_empty());
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let record: DataFileRecord = serde_json::from_str(
            r#"{"file_path":"a.orc","file_format":"orc","file_size_bytes":5,"record_count":1}"#,
        )
        .unwrap();
        assert_eq!(record.file_format, FileFormat::Orc);
        assert!(record.is_unpartitioned());
    }
}
