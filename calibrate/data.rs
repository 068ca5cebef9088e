//! Observation data and initial conditions.
//!
//! Case counts arrive as weekly new-case totals. They are converted to days,
//! scaled by the reporting factor and accumulated, so the observed series is
//! comparable with the model's cumulative-incidence channel.

use crate::dynamics::STATE_DIM;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DAYS_PER_WEEK: f64 = 7.0;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to open '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("'{path}' line {line}: expected {expected} numeric columns, found {found}")]
    ColumnCount {
        path: String,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("'{path}' line {line}: cannot parse '{field}' as a number")]
    NotANumber {
        path: String,
        line: u64,
        field: String,
    },
    #[error("'{0}' contains no data rows")]
    Empty(String),
    #[error("weeks and counts differ in length ({weeks} weeks, {counts} counts)")]
    LengthMismatch { weeks: usize, counts: usize },
    #[error("observation {index} is not usable: {reason}")]
    InvalidObservation { index: usize, reason: &'static str },
}

/// Observed cumulative cases at strictly increasing times.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedData {
    times: Vec<f64>,
    cumulative_cases: Vec<f64>,
}

impl ObservedData {
    /// Takes already cumulative counts. Counts may not decrease.
    pub fn new(times: Vec<f64>, cumulative_cases: Vec<f64>) -> Result<Self, DataError> {
        if times.len() != cumulative_cases.len() {
            return Err(DataError::LengthMismatch {
                weeks: times.len(),
                counts: cumulative_cases.len(),
            });
        }
        for (index, pair) in cumulative_cases.windows(2).enumerate() {
            if pair[1] < pair[0] {
                return Err(DataError::InvalidObservation {
                    index: index + 1,
                    reason: "cumulative cases decrease",
                });
            }
        }
        if let Some(index) = cumulative_cases.iter().position(|c| !c.is_finite()) {
            return Err(DataError::InvalidObservation {
                index,
                reason: "count is not finite",
            });
        }
        Ok(Self {
            times,
            cumulative_cases,
        })
    }

    /// Builds the cumulative series from weekly new-case counts.
    ///
    /// Week `w` is observed at day `7 w`. Each weekly count is multiplied by
    /// `reporting_factor` before it is added to the running total.
    pub fn from_weekly_counts(
        weeks: &[f64],
        new_cases: &[f64],
        reporting_factor: f64,
    ) -> Result<Self, DataError> {
        if weeks.len() != new_cases.len() {
            return Err(DataError::LengthMismatch {
                weeks: weeks.len(),
                counts: new_cases.len(),
            });
        }
        if let Some(index) = new_cases.iter().position(|&c| !(c >= 0.0)) {
            return Err(DataError::InvalidObservation {
                index,
                reason: "weekly count is negative or NaN",
            });
        }
        let times = weeks.iter().map(|w| w * DAYS_PER_WEEK).collect();
        let mut total = 0.0;
        let cumulative_cases = new_cases
            .iter()
            .map(|c| {
                total += c * reporting_factor;
                total
            })
            .collect();
        Self::new(times, cumulative_cases)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn cumulative_cases(&self) -> &[f64] {
        &self.cumulative_cases
    }
}

/// Epidemiological constants from which the initial state is derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialConditions {
    /// Human population.
    pub n_h: f64,
    /// Normalised vector population.
    pub n_v: f64,
    /// Reported cases at the start, before the reporting factor.
    pub ci: f64,
    /// Initially recovered humans.
    pub rhi: f64,
    /// Initially infectious vector fraction.
    pub ivi: f64,
}

impl Default for InitialConditions {
    fn default() -> Self {
        Self {
            n_h: 206.0e6,
            n_v: 1.0,
            ci: 8201.0,
            rhi: 29639.0,
            ivi: 0.00022,
        }
    }
}

impl InitialConditions {
    /// The eight-channel initial state under `reporting_factor`.
    ///
    /// Exposed and infectious humans both start at the scaled initial count,
    /// as does cumulative incidence. Exposed vectors mirror infectious ones.
    pub fn state(&self, reporting_factor: f64) -> Vec<f64> {
        let ci = self.ci * reporting_factor;
        let ehi = ci;
        let ihi = ci;
        let shi = self.n_h - ehi - ihi - self.rhi;
        let evi = self.ivi;
        let svi = self.n_v - evi - self.ivi;
        let state = vec![shi, ehi, ihi, self.rhi, svi, evi, self.ivi, ci];
        debug_assert_eq!(state.len(), STATE_DIM);
        state
    }
}

/// One parsed data row and the file line it came from.
struct NumericRow {
    line: u64,
    values: Vec<f64>,
}

/// Reads numeric rows from a whitespace separated file. Columns may be split
/// by any mix of spaces and tabs. Lines starting with `%` or `#` are comments.
fn read_numeric_rows(path: &Path) -> Result<Vec<NumericRow>, DataError> {
    let display = path.display().to_string();
    let mut text = fs::read_to_string(path).map_err(|source| DataError::Io {
        path: display.clone(),
        source,
    })?;
    // Every record ends in a bare newline, so the reader's line after a
    // record is one past the record's own line.
    text = text.replace("\r\n", "\n");
    if !text.ends_with('\n') {
        text.push('\n');
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .comment(Some(b'%'))
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    let mut record = csv::StringRecord::new();
    while reader
        .read_record(&mut record)
        .map_err(|source| DataError::Csv {
            path: display.clone(),
            source,
        })?
    {
        let line = reader.position().line().saturating_sub(1);
        // Runs of spaces produce empty fields and tabs stay inside a field.
        let fields: Vec<&str> = record.iter().flat_map(str::split_ascii_whitespace).collect();
        if fields.is_empty() || fields[0].starts_with('#') {
            continue;
        }
        let values = fields
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|_| DataError::NotANumber {
                    path: display.clone(),
                    line,
                    field: field.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(NumericRow { line, values });
    }
    if rows.is_empty() {
        return Err(DataError::Empty(display));
    }
    Ok(rows)
}

/// Loads `week new_cases` rows and returns them as two columns.
pub fn load_weekly_counts(path: &Path) -> Result<(Vec<f64>, Vec<f64>), DataError> {
    let rows = read_numeric_rows(path)?;
    let mut weeks = Vec::with_capacity(rows.len());
    let mut counts = Vec::with_capacity(rows.len());
    for row in &rows {
        if row.values.len() != 2 {
            return Err(DataError::ColumnCount {
                path: path.display().to_string(),
                line: row.line,
                expected: 2,
                found: row.values.len(),
            });
        }
        weeks.push(row.values[0]);
        counts.push(row.values[1]);
    }
    log::info!("Loaded {} weekly counts from '{}'", weeks.len(), path.display());
    Ok((weeks, counts))
}

/// Loads one parameter draw per row. Every row must have `param_count` values.
pub fn load_parameter_draws(path: &Path, param_count: usize) -> Result<Vec<Vec<f64>>, DataError> {
    let rows = read_numeric_rows(path)?;
    if let Some(row) = rows.iter().find(|r| r.values.len() != param_count) {
        return Err(DataError::ColumnCount {
            path: path.display().to_string(),
            line: row.line,
            expected: param_count,
            found: row.values.len(),
        });
    }
    log::info!("Loaded {} parameter draws from '{}'", rows.len(), path.display());
    Ok(rows.into_iter().map(|r| r.values).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn weekly_counts_are_scaled_and_cumulated() {
        let data =
            ObservedData::from_weekly_counts(&[1.0, 2.0, 3.0], &[90.0, 0.0, 45.0], 10.0 / 9.0)
                .unwrap();
        assert_eq!(data.times(), &[7.0, 14.0, 21.0]);
        assert_relative_eq!(data.cumulative_cases()[0], 100.0, epsilon = 1e-9);
        assert_relative_eq!(data.cumulative_cases()[1], 100.0, epsilon = 1e-9);
        assert_relative_eq!(data.cumulative_cases()[2], 150.0, epsilon = 1e-9);
    }

    #[test]
    fn negative_weekly_counts_are_rejected() {
        let err = ObservedData::from_weekly_counts(&[1.0, 2.0], &[5.0, -1.0], 1.0).unwrap_err();
        assert!(matches!(err, DataError::InvalidObservation { index: 1, .. }));
    }

    #[test]
    fn decreasing_cumulative_series_is_rejected() {
        assert!(ObservedData::new(vec![7.0, 14.0], vec![10.0, 9.0]).is_err());
        assert!(ObservedData::new(vec![7.0], vec![10.0, 11.0]).is_err());
    }

    #[test]
    fn reference_initial_state() {
        let state = InitialConditions::default().state(1.0);
        assert_eq!(state.len(), 8);
        assert_eq!(state[1], 8201.0);
        assert_eq!(state[2], 8201.0);
        assert_eq!(state[3], 29639.0);
        assert_eq!(state[7], 8201.0);
        assert_relative_eq!(state[..4].iter().sum::<f64>(), 206.0e6, epsilon = 1e-6);
        assert_relative_eq!(state[4..7].iter().sum::<f64>(), 1.0, epsilon = 1e-15);
        assert_eq!(state[5], state[6]);
    }

    #[test]
    fn reporting_factor_scales_initial_cases_only() {
        let base = InitialConditions::default();
        let doubled = base.state(2.0);
        assert_eq!(doubled[1], 16402.0);
        assert_eq!(doubled[7], 16402.0);
        assert_eq!(doubled[3], base.rhi);
        assert_eq!(doubled[6], base.ivi);
    }

    #[test]
    fn loads_whitespace_separated_counts_with_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "% week cases\n1  12\n2 30\n\n3   7\n").unwrap();
        let (weeks, counts) = load_weekly_counts(&path).expect("load counts");
        assert_eq!(weeks, vec![1.0, 2.0, 3.0]);
        assert_eq!(counts, vec![12.0, 30.0, 7.0]);
    }

    #[test]
    fn malformed_rows_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "1 12\n2 x\n").unwrap();
        assert!(matches!(
            load_weekly_counts(&path),
            Err(DataError::NotANumber { ref field, .. }) if field == "x"
        ));

        let draws = dir.path().join("draws.tsv");
        fs::write(&draws, "0.1\t0.2\n0.3\n").unwrap();
        assert!(matches!(
            load_parameter_draws(&draws, 2),
            Err(DataError::ColumnCount {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn tab_and_mixed_separators_are_whitespace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "1\t12\n2 \t 30\n3\t\t7\n").unwrap();
        let (weeks, counts) = load_weekly_counts(&path).expect("load tab separated counts");
        assert_eq!(weeks, vec![1.0, 2.0, 3.0]);
        assert_eq!(counts, vec![12.0, 30.0, 7.0]);
    }

    #[test]
    fn column_errors_name_the_file_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "% week cases\n\n1 12\n# skipped\n2 30 4\n").unwrap();
        assert!(matches!(
            load_weekly_counts(&path),
            Err(DataError::ColumnCount { line: 5, found: 3, .. })
        ));

        let draws = dir.path().join("draws.txt");
        fs::write(&draws, "% header\n0.1 0.2\n\n0.3\n").unwrap();
        assert!(matches!(
            load_parameter_draws(&draws, 2),
            Err(DataError::ColumnCount { line: 4, .. })
        ));
    }

    #[test]
    fn empty_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        fs::write(&path, "% nothing here\n").unwrap();
        assert!(matches!(load_weekly_counts(&path), Err(DataError::Empty(_))));
    }
}
