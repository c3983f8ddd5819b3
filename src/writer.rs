//! KLARF text emission — the inverse of the parser.
//!
//! The emitted file re-derives every row's `XREL/YREL/XINDEX/YINDEX` from
//! `XACTUAL/YACTUAL` under the record's current pitch and center, so the
//! output is internally consistent even if the record was mutated after
//! load. Re-parsing the output reproduces all scalar fields and every
//! row's actual coordinates.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::KlarfError;
use crate::types::{WaferRecord, REQUIRED_COLUMNS};

/// Quote each whitespace token of a scalar value, KLARF-style.
fn quoted(value: &str) -> String {
    value
        .split_whitespace()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Serialize a record to KLARF text.
pub fn write_klarf(rec: &WaferRecord) -> String {
    let pitch = rec.die_pitch();
    let center = rec.center_location();

    let mut out = String::new();
    let mut stmt = |s: String| {
        out.push_str(&s);
        out.push_str(";\n");
    };

    stmt(format!("FileVersion {}", rec.file_version));
    stmt(format!("FileTimestamp {}", rec.file_timestamp));
    stmt(format!("InspectionStationID {}", quoted(&rec.inspection_station)));
    stmt(format!("SampleType {}", rec.sample_type));
    stmt(format!("ResultTimestamp {}", rec.result_timestamp));
    stmt(format!("LotID {}", quoted(&rec.lot_id)));
    if !rec.setup_id.is_empty() {
        stmt(format!("SetupID {}", quoted(&rec.setup_id)));
    }
    if !rec.step_id.is_empty() {
        stmt(format!("StepID {}", quoted(&rec.step_id)));
    }
    // shape code 1 = round wafer; diameter back in millimeters
    stmt(format!("SampleSize 1 {}", rec.sample_size / 1000.0));
    stmt(format!("DiePitch {} {}", pitch.x, pitch.y));
    stmt(format!("DieOrigin {} {}", rec.die_origin.x, rec.die_origin.y));
    stmt(format!("CenterLocation {} {}", center.x, center.y));
    stmt(format!("OrientationMarkType {}", rec.orientation_marker));
    stmt(format!("OrientationMarkLocation {}", rec.orientation));
    stmt(format!("WaferID {}", quoted(&rec.wafer_id)));
    stmt(format!("Slot {}", rec.slot));
    stmt(format!("InspectionTest {}", rec.inspection_test));
    if let Some(area) = rec.area_per_test {
        stmt(format!("AreaPerTest {area}"));
    }

    if !rec.class_lookup.is_empty() {
        stmt(format!("ClassLookup {}", rec.class_lookup.len()));
        for (id, desc) in &rec.class_lookup {
            stmt(format!(" {id} {}", quoted(desc)));
        }
    }

    if !rec.sample_test_plan.is_empty() {
        stmt(format!("SampleTestPlan {}", rec.sample_test_plan.len()));
        for (x, y) in &rec.sample_test_plan {
            stmt(format!(" {x} {y}"));
        }
    }

    // Canonical column order for records never fed by a DefectRecordSpec.
    let columns: Vec<String> = if rec.defects.columns().is_empty() {
        REQUIRED_COLUMNS.iter().map(|s| s.to_string()).collect()
    } else {
        rec.defects.columns().to_vec()
    };
    let mut spec_line = format!("DefectRecordSpec {}", columns.len());
    for col in &columns {
        let _ = write!(spec_line, " {col}");
    }
    stmt(spec_line);

    stmt("DefectList".to_string());
    // Emit from a rebased copy: die-relative cells come from the actuals
    // under the current geometry, not from whatever the cells held.
    let mut table = rec.defects.clone();
    table.rebase(pitch, center);
    for row in table.rows() {
        let mut line = String::from(" ");
        let mut first = true;
        for cell in &row.cells {
            if first {
                first = false;
            } else {
                line.push(' ');
            }
            let _ = write!(line, "{cell}");
        }
        stmt(line);
    }
    stmt("SummarySpec 0".to_string());
    stmt("EndOfFile".to_string());

    out
}

/// Serialize a record to a file. A `.gz` extension gets gzip output,
/// matching what the parser accepts.
pub fn write_klarf_file<P: AsRef<Path>>(rec: &WaferRecord, path: P) -> Result<(), KlarfError> {
    let path = path.as_ref();
    let text = write_klarf(rec);
    let is_gz = path.to_str().is_some_and(|s| s.ends_with(".gz"));
    if is_gz {
        let file = File::create(path)?;
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(text.as_bytes())?;
        enc.finish()?;
    } else {
        std::fs::write(path, text)?;
    }
    Ok(())
}
