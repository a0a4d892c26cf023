// src/validate.rs

use rayon::prelude::*;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{config::Settings, frame::Frame};

/// A check that blocks the extract from being staged or loaded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("row count validation failed: {actual} rows (minimum required: {minimum})")]
    TooFewRows { actual: usize, minimum: usize },

    #[error("schema validation failed: extract has no columns")]
    NoColumns,
}

/// Thresholds the extract is held to.
#[derive(Debug, Clone, PartialEq)]
pub struct Rules {
    pub expected_columns: Vec<String>,
    pub min_row_count: usize,
    pub max_null_percentage: f64,
}

impl From<&Settings> for Rules {
    fn from(s: &Settings) -> Self {
        Self {
            expected_columns: s.expected_columns.clone(),
            min_row_count: s.min_row_count,
            max_null_percentage: s.max_null_percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NullStat {
    pub column: String,
    pub null_count: usize,
    /// Rounded to two decimals.
    pub null_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationReport {
    pub passed: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    pub null_report: Vec<NullStat>,
}

pub fn validate_row_count(frame: &Frame, minimum: usize) -> Result<(), ValidationError> {
    let actual = frame.num_rows();
    info!(rows = actual, "row count validation");
    if actual < minimum {
        return Err(ValidationError::TooFewRows { actual, minimum });
    }
    info!(rows = actual, "row count validation passed");
    Ok(())
}

/// Fails only on an empty schema. Missing expected columns come back as warnings.
pub fn validate_schema(frame: &Frame, expected: &[String]) -> Result<Vec<String>, ValidationError> {
    let actual: HashSet<&str> = frame.columns().iter().map(String::as_str).collect();
    let mut sorted: Vec<&str> = actual.iter().copied().collect();
    sorted.sort_unstable();
    info!(columns = ?sorted, "schema validation");

    let mut warnings = Vec::new();
    let mut missing: Vec<&str> = expected
        .iter()
        .map(String::as_str)
        .filter(|c| !actual.contains(c))
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        missing.dedup();
        warn!(missing = ?missing, "some expected columns are missing");
        warnings.push(format!("missing expected columns: {}", missing.join(", ")));
    }

    if actual.is_empty() {
        return Err(ValidationError::NoColumns);
    }

    info!(columns = actual.len(), "schema validation passed");
    Ok(warnings)
}

/// Null count and percentage per column, worst first (ties broken by name).
pub fn null_report(frame: &Frame) -> Vec<NullStat> {
    let rows = frame.num_rows();
    let mut report: Vec<NullStat> = (0..frame.num_columns())
        .into_par_iter()
        .map(|i| {
            let null_count = frame.column_at(i).filter(|v| v.is_none()).count();
            NullStat {
                column: frame.columns()[i].clone(),
                null_count,
                null_percentage: round2(percentage(null_count, rows)),
            }
        })
        .collect();

    report.sort_by(|a, b| {
        b.null_percentage
            .total_cmp(&a.null_percentage)
            .then_with(|| a.column.cmp(&b.column))
    });
    report
}

/// Columns over `max_percentage` nulls are reported as warnings, never as failures.
pub fn validate_null_checks(frame: &Frame, max_percentage: f64) -> (Vec<NullStat>, Vec<String>) {
    info!("null value validation");
    let report = null_report(frame);
    log_null_report(&report);

    let rows = frame.num_rows();
    let warnings: Vec<String> = report
        .iter()
        .filter(|s| percentage(s.null_count, rows) > max_percentage)
        .map(|s| {
            format!(
                "{}: {:.2}% nulls (limit: {}%)",
                s.column,
                percentage(s.null_count, rows),
                max_percentage
            )
        })
        .collect();

    if warnings.is_empty() {
        info!("null validation passed: all columns within limits");
    } else {
        for w in &warnings {
            warn!("high null percentage: {}", w);
        }
    }
    (report, warnings)
}

/// Row count, then schema, then nulls. The first failing check ends the run.
pub fn validate_frame(frame: &Frame, rules: &Rules) -> ValidationReport {
    let mut report = ValidationReport::default();

    let outcome = validate_row_count(frame, rules.min_row_count)
        .and_then(|_| validate_schema(frame, &rules.expected_columns))
        .map(|schema_warnings| {
            report.warnings.extend(schema_warnings);
            let (nulls, null_warnings) = validate_null_checks(frame, rules.max_null_percentage);
            report.null_report = nulls;
            report.warnings.extend(null_warnings);
        });

    match outcome {
        Ok(()) => {
            report.passed = true;
            info!(warnings = report.warnings.len(), "all validation checks passed");
        }
        Err(e) => {
            error!(error = %e, "validation failed");
            report.errors.push(e);
        }
    }
    report
}

pub fn log_null_report(report: &[NullStat]) {
    let width = report
        .iter()
        .map(|s| s.column.len())
        .max()
        .unwrap_or(6)
        .max(6);
    info!("{:<width$}  {:>10}  {:>8}", "column", "null_count", "null_%");
    for s in report {
        info!(
            "{:<width$}  {:>10}  {:>8.2}",
            s.column, s.null_count, s.null_percentage
        );
    }
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(columns: &[&str], rows: usize, null_every: &[(usize, usize)]) -> Frame {
        let cols: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let data = (0..rows)
            .map(|r| {
                (0..cols.len())
                    .map(|c| {
                        let nulled = null_every
                            .iter()
                            .any(|&(col, every)| col == c && r % every == 0);
                        (!nulled).then(|| format!("{r}"))
                    })
                    .collect()
            })
            .collect();
        Frame::from_rows(cols, data)
    }

    fn rules(min: usize) -> Rules {
        Rules {
            expected_columns: vec!["year".into(), "topic".into(), "data_value".into()],
            min_row_count: min,
            max_null_percentage: 50.0,
        }
    }

    #[test]
    fn too_few_rows_fails_first() {
        let f = frame(&["year"], 10, &[]);
        let report = validate_frame(&f, &rules(100));
        assert!(!report.passed);
        assert_eq!(
            report.errors,
            vec![ValidationError::TooFewRows {
                actual: 10,
                minimum: 100
            }]
        );
        assert!(report.null_report.is_empty());
        assert_eq!(
            report.errors[0].to_string(),
            "row count validation failed: 10 rows (minimum required: 100)"
        );
    }

    #[test]
    fn no_columns_fails() {
        let f = Frame::from_rows(vec![], vec![vec![]; 5]);
        let report = validate_frame(&f, &rules(1));
        assert_eq!(report.errors, vec![ValidationError::NoColumns]);
    }

    #[test]
    fn missing_columns_only_warn() {
        let f = frame(&["year", "locationabbr"], 5, &[]);
        let report = validate_frame(&f, &rules(1));
        assert!(report.passed);
        assert_eq!(
            report.warnings,
            vec!["missing expected columns: data_value, topic".to_string()]
        );
    }

    #[test]
    fn null_report_sorted_and_rounded() {
        // col 1 null on every 3rd row of 10 → rows 0,3,6,9 → 40%
        // col 2 null on every row → 100%
        let f = frame(&["year", "topic", "data_value"], 10, &[(1, 3), (2, 1)]);
        let report = null_report(&f);
        assert_eq!(report[0].column, "data_value");
        assert_eq!(report[0].null_percentage, 100.0);
        assert_eq!(report[1].column, "topic");
        assert_eq!(report[1].null_count, 4);
        assert_eq!(report[1].null_percentage, 40.0);
        assert_eq!(report[2].null_percentage, 0.0);

        let thirds = frame(&["x"], 3, &[(0, 3)]);
        assert_eq!(null_report(&thirds)[0].null_percentage, 33.33);
    }

    #[test]
    fn high_nulls_warn_but_pass() {
        let f = frame(&["year", "topic", "data_value"], 10, &[(2, 1)]);
        let report = validate_frame(&f, &rules(1));
        assert!(report.passed);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("data_value: 100.00% nulls"));
    }

    #[test]
    fn zero_rows_have_zero_percent_nulls() {
        let f = frame(&["year"], 0, &[]);
        let (report, warnings) = validate_null_checks(&f, 50.0);
        assert_eq!(report[0].null_percentage, 0.0);
        assert!(warnings.is_empty());
    }
}
