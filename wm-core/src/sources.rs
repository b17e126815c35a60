// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Date-range and partition arithmetic of the source resolver. Everything in
//! this module is pure; the ConfigureSources step drives it against the
//! remote state.

use crate::error::{WorkflowError, WorkflowResult};
use crate::model::{DeclaredSource, FileMetadata, Source};
use chrono::NaiveDate;
use tracing::{info, warn};

pub const DATE_FORMAT: &str = "%Y%m%d";
pub const DATE_PREFIX: &str = "data_dt=";

pub fn parse_date(date: &str) -> WorkflowResult<NaiveDate> {
    NaiveDate::parse_from_str(date, DATE_FORMAT)
        .map_err(|err| WorkflowError::configuration(format!("invalid date '{date}': {err}")))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Partition folder name for `end_date` shifted back by `offset` days.
pub fn date_path(end_date: &str, offset: u32) -> WorkflowResult<String> {
    let date = parse_date(end_date)? - chrono::Days::new(offset as u64);
    Ok(format!("{DATE_PREFIX}{}", format_date(date)))
}

/// Ordered sequence of calendar days ending at `end - offset`. The start is
/// the later of `start` and `end - offset - (number_of_days - 1)`; without
/// either bound the range collapses to the end day. Empty when the adjusted
/// end precedes the start.
pub fn extract_date_range(
    start_date: Option<&str>,
    end_date: &str,
    number_of_days: Option<u32>,
    offset_by_number_of_days: Option<u32>,
) -> WorkflowResult<Vec<String>> {
    let offset = offset_by_number_of_days.unwrap_or(0);
    let end = parse_date(end_date)? - chrono::Days::new(offset as u64);
    let start_adjusted =
        number_of_days.map(|days| end - chrono::Days::new(days.saturating_sub(1) as u64));
    let start = match start_date {
        Some(start) => {
            let start = parse_date(start)?;
            match start_adjusted {
                Some(adjusted) if start < adjusted => adjusted,
                _ => start,
            }
        }
        None => start_adjusted.unwrap_or(end),
    };
    info!("Building date range from '{start}' to '{end}'");
    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        days.push(format_date(day));
        day = day.succ_opt().ok_or_else(|| {
            WorkflowError::configuration(format!("date out of range after '{day}'"))
        })?;
    }
    Ok(days)
}

/// Days to inflate for a source. Snapshot sources widen the window to
/// `snapshot_validity_days - offset + 1` days so the most recent valid
/// snapshot can be discovered.
pub fn date_range(
    source: &Source,
    start_date: Option<&str>,
    end_date: Option<&str>,
) -> WorkflowResult<Vec<String>> {
    if !source.is_date_partitioned {
        return Ok(vec![]);
    }
    let end_date = end_date.ok_or_else(|| {
        WorkflowError::configuration(format!(
            "end date is required for date partitioned source '{}'",
            source.relation
        ))
    })?;
    let offset = source.offset_by_number_of_days;
    match source.snapshot_validity_days {
        Some(validity) => {
            let window = validity.saturating_sub(offset.unwrap_or(0)) + 1;
            extract_date_range(start_date, end_date, Some(window), offset)
        }
        None => extract_date_range(start_date, end_date, source.loads_number_of_days, offset),
    }
}

/// Reduces a path-builder listing to the paths that are actually loaded:
/// entries are grouped by their as-of-date (the listing arrives day by day),
/// the last `loads_number_of_days` groups survive, and sources that are not
/// chunk partitioned keep a single file per date.
pub fn reduce_inflated_paths(source: &Source, files: &[FileMetadata]) -> Vec<String> {
    if !source.is_date_partitioned {
        return files.iter().map(|file| file.path.clone()).collect();
    }
    let mut groups: Vec<(Option<String>, Vec<&FileMetadata>)> = Vec::new();
    for file in files {
        match groups.last_mut() {
            Some((date, group)) if *date == file.as_of_date => group.push(file),
            _ => groups.push((file.as_of_date.clone(), vec![file])),
        }
    }
    let keep = source.loads_number_of_days.unwrap_or(1) as usize;
    let skip = groups.len().saturating_sub(keep);
    let mut paths = Vec::new();
    for (date, group) in groups.into_iter().skip(skip) {
        if !source.is_chunk_partitioned && group.len() > 1 {
            warn!(
                "Source '{}' is not chunk partitioned but has {} files for date {}, keeping the first one",
                source.relation,
                group.len(),
                date.as_deref().unwrap_or("-")
            );
            paths.push(group[0].path.clone());
        } else {
            paths.extend(group.iter().map(|file| file.path.clone()));
        }
    }
    paths
}

/// Declared partitions whose date fell out of the current range. These feed
/// the invalidation set of the next load.
pub fn expired_paths(declared: &DeclaredSource, days: &[String]) -> Vec<(String, String)> {
    let mut expired = Vec::new();
    for date in &declared.dates {
        if !days.contains(&date.date) {
            for path in &date.paths {
                expired.push((declared.source.clone(), path.clone()));
            }
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Container, ContainerParams, DeclaredDate, FileType, LocalContainerParams,
    };
    use pretty_assertions::assert_eq;
    use test_r::test;

    fn range(
        start: Option<&str>,
        end: &str,
        days: Option<u32>,
        offset: Option<u32>,
    ) -> Vec<String> {
        extract_date_range(start, end, days, offset).unwrap()
    }

    fn days(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn test_source(
        is_date_partitioned: bool,
        is_chunk_partitioned: bool,
        loads_number_of_days: Option<u32>,
        offset: Option<u32>,
        snapshot_validity_days: Option<u32>,
    ) -> Source {
        Source {
            container: Container {
                name: "default".to_string(),
                params: ContainerParams::Local(LocalContainerParams {
                    data_path: "/data".to_string(),
                }),
            },
            relation: "test".to_string(),
            relative_path: "test".to_string(),
            input_format: FileType::Csv,
            extensions: vec!["csv".to_string()],
            is_chunk_partitioned,
            is_date_partitioned,
            loads_number_of_days,
            offset_by_number_of_days: offset,
            snapshot_validity_days,
            paths: vec![],
        }
    }

    #[test]
    fn range_collapses_to_end_date_without_bounds() {
        assert_eq!(range(None, "20220105", None, None), days(&["20220105"]));
    }

    #[test]
    fn range_spans_start_to_end() {
        assert_eq!(
            range(Some("20220103"), "20220105", None, None),
            days(&["20220103", "20220104", "20220105"])
        );
    }

    #[test]
    fn range_honors_offset_without_bounds() {
        assert_eq!(range(None, "20220105", None, Some(1)), days(&["20220104"]));
    }

    #[test]
    fn range_with_number_of_days_only_keeps_tail() {
        assert_eq!(
            range(None, "20220105", Some(2), None),
            days(&["20220104", "20220105"])
        );
    }

    #[test]
    fn range_with_offset_shifts_both_bounds() {
        assert_eq!(
            range(Some("20220104"), "20220105", None, Some(1)),
            days(&["20220104"])
        );
    }

    #[test]
    fn number_of_days_narrows_long_start_period() {
        assert_eq!(
            range(Some("20220101"), "20220105", Some(2), None),
            days(&["20220104", "20220105"])
        );
    }

    #[test]
    fn explicit_start_wins_over_wider_number_of_days() {
        assert_eq!(
            range(Some("20220104"), "20220105", Some(5), None),
            days(&["20220104", "20220105"])
        );
    }

    #[test]
    fn offset_and_number_of_days_compose() {
        assert_eq!(
            range(Some("20220101"), "20220105", Some(2), Some(1)),
            days(&["20220103", "20220104"])
        );
    }

    #[test]
    fn range_is_empty_when_end_precedes_start() {
        assert_eq!(range(Some("20220106"), "20220105", None, None), days(&[]));
    }

    #[test]
    fn non_partitioned_source_has_empty_range() {
        let source = test_source(false, false, None, None, None);
        assert_eq!(date_range(&source, None, None).unwrap(), days(&[]));
    }

    #[test]
    fn date_partitioned_range_requires_end_date() {
        let source = test_source(true, true, Some(1), None, None);
        assert!(date_range(&source, None, None).is_err());
    }

    #[test]
    fn single_day_source_resolves_to_end_date() {
        let source = test_source(true, true, Some(1), Some(0), None);
        assert_eq!(
            date_range(&source, None, Some("20220105")).unwrap(),
            days(&["20220105"])
        );
    }

    #[test]
    fn ten_day_source_resolves_to_trailing_window() {
        let source = test_source(true, true, Some(10), Some(0), None);
        let expected: Vec<String> = (20220106..=20220115).map(|d| d.to_string()).collect();
        assert_eq!(date_range(&source, None, Some("20220115")).unwrap(), expected);
    }

    #[test]
    fn ten_day_source_with_offset_shifts_window() {
        let source = test_source(true, true, Some(10), Some(2), None);
        let expected: Vec<String> = (20220101..=20220110).map(|d| d.to_string()).collect();
        assert_eq!(date_range(&source, None, Some("20220112")).unwrap(), expected);
    }

    #[test]
    fn zero_validity_snapshot_window_is_the_end_day() {
        let source = test_source(true, true, Some(1), Some(0), Some(0));
        assert_eq!(
            date_range(&source, None, Some("20220105")).unwrap(),
            days(&["20220105"])
        );
    }

    #[test]
    fn snapshot_window_is_widened_by_validity() {
        let source = test_source(true, true, Some(1), Some(0), Some(1));
        assert_eq!(
            date_range(&source, None, Some("20220105")).unwrap(),
            days(&["20220104", "20220105"])
        );
    }

    #[test]
    fn snapshot_window_honors_offset() {
        let source = test_source(true, true, Some(1), Some(1), Some(1));
        assert_eq!(
            date_range(&source, None, Some("20220105")).unwrap(),
            days(&["20220104"])
        );
    }

    #[test]
    fn thirty_day_snapshot_window_with_offset() {
        let source = test_source(true, true, Some(1), Some(1), Some(30));
        let expected: Vec<String> = (20220101..=20220130).map(|d| d.to_string()).collect();
        assert_eq!(date_range(&source, None, Some("20220131")).unwrap(), expected);
    }

    #[test]
    fn non_partitioned_listing_survives_unchanged() {
        let source = test_source(false, false, None, None, None);
        let files = vec![FileMetadata::new("test/test_non_part.csv")];
        assert_eq!(
            reduce_inflated_paths(&source, &files),
            vec!["test/test_non_part.csv".to_string()]
        );
    }

    #[test]
    fn only_the_last_day_group_survives_a_single_day_source() {
        let source = test_source(true, true, Some(1), Some(0), None);
        let files = vec![
            FileMetadata::dated("test/test_20220103_1.csv", "20220103"),
            FileMetadata::dated("test/test_20220104_1.csv", "20220104"),
            FileMetadata::dated("test/test_20220104_2.csv", "20220104"),
            FileMetadata::dated("test/test_20220105_1.csv", "20220105"),
            FileMetadata::dated("test/test_20220105_2.csv", "20220105"),
            FileMetadata::dated("test/test_20220105_3.csv", "20220105"),
        ];
        assert_eq!(
            reduce_inflated_paths(&source, &files),
            vec![
                "test/test_20220105_1.csv".to_string(),
                "test/test_20220105_2.csv".to_string(),
                "test/test_20220105_3.csv".to_string(),
            ]
        );
    }

    #[test]
    fn last_n_day_groups_survive_a_multi_day_source() {
        let source = test_source(true, true, Some(10), Some(0), None);
        let files: Vec<FileMetadata> = (20220101..=20220115)
            .map(|day| FileMetadata::dated(format!("test/test_{day}_1.csv"), day.to_string()))
            .collect();
        let expected: Vec<String> = (20220106..=20220115)
            .map(|day| format!("test/test_{day}_1.csv"))
            .collect();
        assert_eq!(reduce_inflated_paths(&source, &files), expected);
    }

    #[test]
    fn non_chunk_partitioned_keeps_one_file_per_date() {
        let source = test_source(true, false, Some(2), Some(0), None);
        let files = vec![
            FileMetadata::dated("test/test_20220104_1.csv", "20220104"),
            FileMetadata::dated("test/test_20220104_2.csv", "20220104"),
            FileMetadata::dated("test/test_20220105_1.csv", "20220105"),
        ];
        assert_eq!(
            reduce_inflated_paths(&source, &files),
            vec![
                "test/test_20220104_1.csv".to_string(),
                "test/test_20220105_1.csv".to_string(),
            ]
        );
    }

    #[test]
    fn declared_partition_out_of_range_is_expired() {
        let source = test_source(true, true, Some(1), Some(0), Some(1));
        let declared = DeclaredSource {
            source: "test".to_string(),
            dates: vec![DeclaredDate {
                date: "20220104".to_string(),
                paths: vec!["/test/data_dt=20220104/part-1.csv".to_string()],
            }],
        };
        let range = date_range(&source, None, Some("20220106")).unwrap();
        assert_eq!(
            expired_paths(&declared, &range),
            vec![(
                "test".to_string(),
                "/test/data_dt=20220104/part-1.csv".to_string()
            )]
        );
    }

    #[test]
    fn declared_partition_in_range_is_kept() {
        let source = test_source(true, true, Some(1), Some(0), Some(1));
        let declared = DeclaredSource {
            source: "test".to_string(),
            dates: vec![
                DeclaredDate {
                    date: "20220104".to_string(),
                    paths: vec!["/test/data_dt=20220104/part-1.csv".to_string()],
                },
                DeclaredDate {
                    date: "20220105".to_string(),
                    paths: vec!["/test/data_dt=20220105/part-1.csv".to_string()],
                },
            ],
        };
        let range = date_range(&source, None, Some("20220105")).unwrap();
        assert_eq!(expired_paths(&declared, &range), vec![]);
    }

    #[test]
    fn partially_expired_declaration_lists_only_stale_paths() {
        let source = test_source(true, true, Some(1), Some(0), Some(1));
        let declared = DeclaredSource {
            source: "test".to_string(),
            dates: vec![
                DeclaredDate {
                    date: "20220104".to_string(),
                    paths: vec!["/test/data_dt=20220104/part-1.csv".to_string()],
                },
                DeclaredDate {
                    date: "20220105".to_string(),
                    paths: vec!["/test/data_dt=20220105/part-1.csv".to_string()],
                },
            ],
        };
        let range = date_range(&source, None, Some("20220106")).unwrap();
        assert_eq!(
            expired_paths(&declared, &range),
            vec![(
                "test".to_string(),
                "/test/data_dt=20220104/part-1.csv".to_string()
            )]
        );
    }

    #[test]
    fn date_path_applies_offset() {
        assert_eq!(date_path("20220105", 0).unwrap(), "data_dt=20220105");
        assert_eq!(date_path("20220105", 2).unwrap(), "data_dt=20220103");
        assert!(date_path("2022-01-05", 0).is_err());
    }
}
