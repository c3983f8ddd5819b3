//! KLARF data types — wafer record, defect table, and coordinate model.

#[cfg(feature = "python")]
use pyo3::prelude::*;
use std::collections::BTreeMap;
use std::str::FromStr;

use tracing::warn;

use crate::error::{KlarfError, MergeWarning};

/// Column names every defect table must carry for the coordinate model.
pub const REQUIRED_COLUMNS: [&str; 4] = ["XINDEX", "YINDEX", "XREL", "YREL"];

/// An (x, y) pair in wafer-plane micrometers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyPair {
    pub x: f64,
    pub y: f64,
}

impl XyPair {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for XyPair {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Physical orientation marker on the wafer edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrientationMarker {
    Notch,
    Flat,
}

impl FromStr for OrientationMarker {
    type Err = KlarfError;

    /// Case-insensitive; anything outside {NOTCH, FLAT} is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NOTCH" => Ok(Self::Notch),
            "FLAT" => Ok(Self::Flat),
            _ => Err(KlarfError::InvalidEnum {
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for OrientationMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Notch => write!(f, "NOTCH"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

/// Indices of the coordinate columns inside a defect table's column list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoordCols {
    pub xindex: usize,
    pub yindex: usize,
    pub xrel: usize,
    pub yrel: usize,
}

/// One defect: the cells declared by `DefectRecordSpec`, the derived
/// wafer-plane position, and the file it came from.
#[derive(Debug, Clone)]
pub struct DefectRow {
    pub cells: Vec<f64>,
    pub x_actual: f64,
    pub y_actual: f64,
    pub source: String,
}

/// Row-oriented defect table. Columns are exactly the names declared by
/// the source `DefectRecordSpec`; `XINDEX/YINDEX/XREL/YREL` are always
/// among them.
#[derive(Debug, Clone, Default)]
pub struct DefectTable {
    columns: Vec<String>,
    rows: Vec<DefectRow>,
    coords: Option<CoordCols>,
}

impl DefectTable {
    /// Build an empty table with the given column list. Fails with
    /// `MissingColumn` unless all coordinate columns are declared.
    pub fn new(columns: Vec<String>) -> Result<Self, KlarfError> {
        let find = |name: &'static str| -> Result<usize, KlarfError> {
            columns
                .iter()
                .position(|c| c == name)
                .ok_or(KlarfError::MissingColumn { name })
        };
        let coords = CoordCols {
            xindex: find("XINDEX")?,
            yindex: find("YINDEX")?,
            xrel: find("XREL")?,
            yrel: find("YREL")?,
        };
        Ok(Self {
            columns,
            rows: Vec::new(),
            coords: Some(coords),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[DefectRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell value by row index and column name (for downstream consumers
    /// doing categorical coloring and the like).
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| r.cells[col])
    }

    pub(crate) fn coords(&self) -> Option<CoordCols> {
        self.coords
    }

    /// Append one row of declared cells, deriving the actual coordinates
    /// under the given geometry.
    pub(crate) fn push_row(
        &mut self,
        cells: Vec<f64>,
        source: &str,
        pitch: XyPair,
        center: XyPair,
        line: usize,
    ) -> Result<(), KlarfError> {
        if cells.len() != self.columns.len() {
            return Err(KlarfError::ColumnCountMismatch {
                line,
                expected: self.columns.len(),
                actual: cells.len(),
            });
        }
        // columns were validated in new(), so coords is always present here
        let c = self.coords.ok_or(KlarfError::MissingColumn { name: "XINDEX" })?;
        let x_actual = cells[c.xindex] * pitch.x + cells[c.xrel] - center.x;
        let y_actual = cells[c.yindex] * pitch.y + cells[c.yrel] - center.y;
        self.rows.push(DefectRow {
            cells,
            x_actual,
            y_actual,
            source: source.to_string(),
        });
        Ok(())
    }

    /// Recompute every row's die-relative cells from its fixed actual
    /// position under new geometry. Floor division keeps
    /// `xindex*pitch + xrel == x_actual + center` exact for negative
    /// actuals too.
    pub(crate) fn rebase(&mut self, pitch: XyPair, center: XyPair) {
        let Some(c) = self.coords else { return };
        for row in &mut self.rows {
            let sx = row.x_actual + center.x;
            let sy = row.y_actual + center.y;
            row.cells[c.xindex] = (sx / pitch.x).floor();
            row.cells[c.xrel] = sx.rem_euclid(pitch.x);
            row.cells[c.yindex] = (sy / pitch.y).floor();
            row.cells[c.yrel] = sy.rem_euclid(pitch.y);
        }
    }

    /// Merge another table in, union of columns, missing cells NaN.
    pub(crate) fn absorb(&mut self, other: DefectTable) {
        if self.rows.is_empty() && self.columns.is_empty() {
            *self = other;
            return;
        }
        for col in &other.columns {
            if self.column_index(col).is_none() {
                self.columns.push(col.clone());
                for row in &mut self.rows {
                    row.cells.push(f64::NAN);
                }
            }
        }
        let mapping: Vec<Option<usize>> = self
            .columns
            .iter()
            .map(|c| other.column_index(c))
            .collect();
        for row in other.rows {
            let cells: Vec<f64> = mapping
                .iter()
                .map(|m| m.map_or(f64::NAN, |i| row.cells[i]))
                .collect();
            self.rows.push(DefectRow { cells, ..row });
        }
    }
}

/// One wafer's inspection metadata, die-grid geometry, and defect set.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "python", pyclass)]
pub struct WaferRecord {
    pub file_version: String,
    pub file_timestamp: String,
    pub inspection_station: String,
    pub sample_type: String,
    pub result_timestamp: String,
    pub lot_id: String,
    pub setup_id: String,
    pub step_id: String,
    pub wafer_id: String,
    pub slot: i64,
    pub inspection_test: i64,
    pub area_per_test: Option<f64>,

    /// Wafer diameter in micrometers.
    pub sample_size: f64,
    /// Offset of die (0,0)'s lower-left corner. Informational only; no
    /// coordinate math depends on it.
    pub die_origin: XyPair,
    pub orientation_marker: OrientationMarker,
    /// Free-form marker direction token (UP/DOWN/LEFT/RIGHT...).
    pub orientation: String,

    pub class_lookup: BTreeMap<u32, String>,
    pub sample_test_plan: Vec<(i64, i64)>,
    pub defects: DefectTable,

    // Geometry sits behind accessors: changing either one rebases the table.
    die_pitch: XyPair,
    center_location: XyPair,

    // Whether the value was declared by input or a setter, as opposed to
    // carrying the construction default. Merge warnings fire only between
    // two observed values.
    sample_size_seen: bool,
    die_pitch_seen: bool,
    center_seen: bool,
}

fn klarf_now() -> String {
    chrono::Local::now().format("%m-%d-%y %H:%M:%S").to_string()
}

impl Default for WaferRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl WaferRecord {
    /// Empty shell with documented defaults for every field.
    pub fn new() -> Self {
        let now = klarf_now();
        Self {
            file_version: "1 1".to_string(),
            file_timestamp: now.clone(),
            inspection_station: "klarfkit v0.0.4".to_string(),
            sample_type: "WAFER".to_string(),
            result_timestamp: now,
            lot_id: "XXXX".to_string(),
            setup_id: String::new(),
            step_id: String::new(),
            wafer_id: "XXXXXXXXXXX".to_string(),
            slot: 1,
            inspection_test: 1,
            area_per_test: None,
            sample_size: 300_000.0,
            die_origin: XyPair::new(0.0, 0.0),
            orientation_marker: OrientationMarker::Notch,
            orientation: "DOWN".to_string(),
            class_lookup: BTreeMap::new(),
            sample_test_plan: Vec::new(),
            defects: DefectTable::default(),
            die_pitch: XyPair::new(10_000.0, 10_000.0),
            center_location: XyPair::new(150_000.0, 150_000.0),
            sample_size_seen: false,
            die_pitch_seen: false,
            center_seen: false,
        }
    }

    pub fn die_pitch(&self) -> XyPair {
        self.die_pitch
    }

    pub fn center_location(&self) -> XyPair {
        self.center_location
    }

    /// Change the die pitch. Every row's `XACTUAL/YACTUAL` stays fixed;
    /// `XINDEX/YINDEX/XREL/YREL` are recomputed for the new pitch. A
    /// non-positive pitch is rejected before anything is touched.
    pub fn set_die_pitch(&mut self, pitch: XyPair) -> Result<(), KlarfError> {
        if pitch.x <= 0.0 || pitch.y <= 0.0 {
            return Err(KlarfError::NonPositivePitch {
                x: pitch.x,
                y: pitch.y,
            });
        }
        self.die_pitch = pitch;
        self.die_pitch_seen = true;
        self.defects.rebase(self.die_pitch, self.center_location);
        Ok(())
    }

    /// Change the wafer-center reference. Same rebasing contract as
    /// [`set_die_pitch`](Self::set_die_pitch).
    pub fn set_center_location(&mut self, center: XyPair) {
        self.center_location = center;
        self.center_seen = true;
        self.defects.rebase(self.die_pitch, self.center_location);
    }

    /// Parser hook: install geometry without rebasing (rows arrive with
    /// their actuals already derived under this geometry).
    pub(crate) fn install_geometry(&mut self, pitch: XyPair, center: XyPair) {
        self.die_pitch = pitch;
        self.center_location = center;
    }

    /// Parser hook: record which geometry fields the input declared.
    pub(crate) fn mark_observed(&mut self, sample_size: bool, pitch: bool, center: bool) {
        self.sample_size_seen = sample_size;
        self.die_pitch_seen = pitch;
        self.center_seen = center;
    }

    /// Fold another record into this one. Defect rows are appended with
    /// their provenance intact; scalar metadata and geometry take the
    /// incoming (last-seen) values. Differing `sample_size` or `die_pitch`
    /// produce warnings, never a hard error; appended rows are rebased
    /// onto the surviving geometry.
    pub fn merge(&mut self, other: WaferRecord) -> Vec<MergeWarning> {
        let mut warnings = Vec::new();

        // Compare only values both sides actually declared; construction
        // defaults don't count as observations.
        if self.sample_size_seen && other.sample_size_seen && self.sample_size != other.sample_size
        {
            let w = MergeWarning::InconsistentSampleSize {
                existing: self.sample_size,
                incoming: other.sample_size,
            };
            warn!("{w}");
            warnings.push(w);
        }
        if self.die_pitch_seen && other.die_pitch_seen && self.die_pitch != other.die_pitch {
            let w = MergeWarning::InconsistentDiePitch {
                existing: (self.die_pitch.x, self.die_pitch.y),
                incoming: (other.die_pitch.x, other.die_pitch.y),
            };
            warn!("{w}");
            warnings.push(w);
        }

        self.file_version = other.file_version;
        self.file_timestamp = other.file_timestamp;
        self.inspection_station = other.inspection_station;
        self.sample_type = other.sample_type;
        self.result_timestamp = other.result_timestamp;
        self.lot_id = other.lot_id;
        self.setup_id = other.setup_id;
        self.step_id = other.step_id;
        self.wafer_id = other.wafer_id;
        self.slot = other.slot;
        self.inspection_test = other.inspection_test;
        if other.area_per_test.is_some() {
            self.area_per_test = other.area_per_test;
        }
        if other.sample_size_seen {
            self.sample_size = other.sample_size;
        }
        self.sample_size_seen |= other.sample_size_seen;
        self.die_origin = other.die_origin;
        self.orientation_marker = other.orientation_marker;
        self.orientation = other.orientation;
        self.class_lookup.extend(other.class_lookup);
        if !other.sample_test_plan.is_empty() {
            self.sample_test_plan = other.sample_test_plan;
        }

        self.defects.absorb(other.defects);
        // last-seen geometry wins, but an undeclared incoming value never
        // displaces a declared one
        if other.die_pitch_seen {
            self.die_pitch = other.die_pitch;
        }
        if other.center_seen {
            self.center_location = other.center_location;
        }
        self.die_pitch_seen |= other.die_pitch_seen;
        self.center_seen |= other.center_seen;
        self.defects.rebase(self.die_pitch, self.center_location);

        warnings
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl WaferRecord {
    #[getter(lot_id)]
    fn py_lot_id(&self) -> &str {
        &self.lot_id
    }

    #[getter(wafer_id)]
    fn py_wafer_id(&self) -> &str {
        &self.wafer_id
    }

    #[getter(sample_size)]
    fn py_sample_size(&self) -> f64 {
        self.sample_size
    }

    #[getter(die_pitch)]
    fn py_die_pitch(&self) -> (f64, f64) {
        (self.die_pitch.x, self.die_pitch.y)
    }

    #[getter(center_location)]
    fn py_center_location(&self) -> (f64, f64) {
        (self.center_location.x, self.center_location.y)
    }

    /// Number of defect rows.
    #[getter]
    fn defect_count(&self) -> usize {
        self.defects.len()
    }

    /// Absolute wafer-plane positions, ready for a scatter plot.
    #[getter]
    fn actual_coordinates(&self) -> Vec<(f64, f64)> {
        self.defects
            .rows()
            .iter()
            .map(|r| (r.x_actual, r.y_actual))
            .collect()
    }
}
