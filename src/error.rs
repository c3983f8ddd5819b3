//! Error taxonomy for KLARF parsing and the wafer-record model.

use thiserror::Error;

/// Failures that abort parsing or record construction.
#[derive(Debug, Error)]
pub enum KlarfError {
    /// Defect rows are present but `DiePitch` or `CenterLocation` never
    /// appeared, so actual coordinates cannot be computed.
    #[error("missing {field}: cannot compute actual coordinates for {rows} defect row(s)")]
    MissingGeometry { field: &'static str, rows: usize },

    /// A token that should be numeric failed to parse.
    #[error("malformed field on line {line}: {token:?} is not a number")]
    MalformedField { line: usize, token: String },

    /// An orientation marker outside {NOTCH, FLAT}.
    #[error("invalid orientation marker {value:?} (expected NOTCH or FLAT)")]
    InvalidEnum { value: String },

    /// A counted block (`ClassLookup n` / `SampleTestPlan n`) ended before
    /// the declared number of rows was collected.
    #[error("{section} declared {declared} rows but only {actual} were present")]
    RowCountMismatch {
        section: &'static str,
        declared: usize,
        actual: usize,
    },

    /// A defect row's width disagrees with `DefectRecordSpec`.
    #[error("defect row on line {line} has {actual} fields, DefectRecordSpec declared {expected}")]
    ColumnCountMismatch {
        line: usize,
        expected: usize,
        actual: usize,
    },

    /// `DefectRecordSpec` omitted a column required by the coordinate model.
    #[error("DefectRecordSpec is missing required column {name}")]
    MissingColumn { name: &'static str },

    /// Die pitch must be strictly positive on both axes.
    #[error("non-positive die pitch ({x}, {y})")]
    NonPositivePitch { x: f64, y: f64 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal inconsistencies detected when merging records from multiple
/// files. The incoming value wins; the caller decides whether to care.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeWarning {
    /// Wafer diameters differ (both in micrometers).
    InconsistentSampleSize { existing: f64, incoming: f64 },
    /// Die pitches differ (x, y pairs in micrometers).
    InconsistentDiePitch {
        existing: (f64, f64),
        incoming: (f64, f64),
    },
}

impl std::fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeWarning::InconsistentSampleSize { existing, incoming } => write!(
                f,
                "files contain inconsistent sample sizes: {}mm vs {}mm",
                existing / 1000.0,
                incoming / 1000.0
            ),
            MergeWarning::InconsistentDiePitch { existing, incoming } => write!(
                f,
                "files contain inconsistent die pitches: ({}, {}) vs ({}, {})",
                existing.0, existing.1, incoming.0, incoming.1
            ),
        }
    }
}
