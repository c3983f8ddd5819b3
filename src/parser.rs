//! KLARF section parser — line-driven state machine producing a WaferRecord.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::KlarfError;
use crate::reader::{parse_i64, Statement};
use crate::types::{DefectTable, OrientationMarker, WaferRecord, XyPair};

/// Active multi-line block, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    Scanning,
    InDefects,
    InSamplePlan,
    InClasses,
}

/// Internal parser state. `Option` fields record what the input actually
/// declared; defaults are applied only at assembly time.
struct ParserState {
    mode: ParseMode,
    expected_rows: usize,
    rows_seen: usize,

    columns: Vec<String>,
    defect_rows: Vec<(usize, Vec<f64>)>,
    classes: Vec<(u32, String)>,
    plan: Vec<(i64, i64)>,

    sample_size: Option<f64>,
    die_pitch: Option<XyPair>,
    die_origin: Option<XyPair>,
    center_location: Option<XyPair>,
    orientation_marker: Option<OrientationMarker>,
    orientation: Option<String>,
    area_per_test: Option<f64>,

    file_version: Option<String>,
    file_timestamp: Option<String>,
    inspection_station: Option<String>,
    sample_type: Option<String>,
    result_timestamp: Option<String>,
    lot_id: Option<String>,
    setup_id: Option<String>,
    step_id: Option<String>,
    wafer_id: Option<String>,
    slot: Option<i64>,
    inspection_test: Option<i64>,
}

impl ParserState {
    fn new() -> Self {
        Self {
            mode: ParseMode::Scanning,
            expected_rows: 0,
            rows_seen: 0,
            columns: Vec::new(),
            defect_rows: Vec::new(),
            classes: Vec::new(),
            plan: Vec::new(),
            sample_size: None,
            die_pitch: None,
            die_origin: None,
            center_location: None,
            orientation_marker: None,
            orientation: None,
            area_per_test: None,
            file_version: None,
            file_timestamp: None,
            inspection_station: None,
            sample_type: None,
            result_timestamp: None,
            lot_id: None,
            setup_id: None,
            step_id: None,
            wafer_id: None,
            slot: None,
            inspection_test: None,
        }
    }

    /// A counted block (ClassLookup/SampleTestPlan) must finish exactly at
    /// its declared row count; seeing a keyword first means the block was
    /// short.
    fn close_counted(&mut self) -> Result<(), KlarfError> {
        let section = match self.mode {
            ParseMode::InClasses => "ClassLookup",
            ParseMode::InSamplePlan => "SampleTestPlan",
            _ => return Ok(()),
        };
        Err(KlarfError::RowCountMismatch {
            section,
            declared: self.expected_rows,
            actual: self.rows_seen,
        })
    }

    fn enter_counted(&mut self, mode: ParseMode, expected: usize) {
        self.expected_rows = expected;
        self.rows_seen = 0;
        // a zero-row block is complete immediately
        self.mode = if expected == 0 { ParseMode::Scanning } else { mode };
    }

    /// Dispatch one statement. Explicit keyword checks always run before
    /// the collection-mode append fallthrough, so a section keyword can
    /// never be swallowed as row data of an active block.
    fn handle(&mut self, s: &Statement) -> Result<(), KlarfError> {
        match s.keyword() {
            // scalar metadata
            "FileVersion" => {
                self.close_counted()?;
                self.file_version = Some(s.rest_joined());
            }
            "FileTimestamp" => {
                self.close_counted()?;
                self.file_timestamp = Some(s.rest_joined());
            }
            "InspectionStationID" => {
                self.close_counted()?;
                self.inspection_station = Some(s.rest_joined());
            }
            "SampleType" => {
                self.close_counted()?;
                self.sample_type = Some(s.rest_joined());
            }
            "ResultTimestamp" => {
                self.close_counted()?;
                self.result_timestamp = Some(s.rest_joined());
            }
            "LotID" => {
                self.close_counted()?;
                self.lot_id = Some(s.rest_joined());
            }
            "SetupID" => {
                self.close_counted()?;
                self.setup_id = Some(s.rest_joined());
            }
            "StepID" => {
                self.close_counted()?;
                self.step_id = Some(s.rest_joined());
            }
            "WaferID" => {
                self.close_counted()?;
                self.wafer_id = Some(s.rest_joined());
            }
            "Slot" => {
                self.close_counted()?;
                self.slot = Some(parse_i64(s.line, &s.rest_joined())?);
            }
            "OrientationMarkType" | "SampleOrientationMarkType" => {
                self.close_counted()?;
                self.orientation_marker = Some(s.rest_joined().parse()?);
            }
            "OrientationMarkLocation" => {
                self.close_counted()?;
                self.orientation = Some(s.rest_joined());
            }
            "InspectionTest" => {
                self.close_counted()?;
                self.inspection_test = Some(parse_i64(s.line, &s.rest_joined())?);
            }
            // geometry
            "SampleSize" => {
                self.close_counted()?;
                // trailing token is the diameter in millimeters
                self.sample_size = Some(s.last_f64()? * 1000.0);
            }
            "DiePitch" => {
                self.close_counted()?;
                let pitch: XyPair = s.pair()?.into();
                if pitch.x <= 0.0 || pitch.y <= 0.0 {
                    return Err(KlarfError::NonPositivePitch {
                        x: pitch.x,
                        y: pitch.y,
                    });
                }
                self.die_pitch = Some(pitch);
            }
            "DieOrigin" => {
                self.close_counted()?;
                self.die_origin = Some(s.pair()?.into());
            }
            // the standard carries both spellings of the center keyword
            "CenterLocation" | "SampleCenterLocation" => {
                self.close_counted()?;
                self.center_location = Some(s.pair()?.into());
            }
            "AreaPerTest" => {
                self.close_counted()?;
                self.area_per_test = Some(s.last_f64()?);
            }
            // table starts
            "DefectRecordSpec" => {
                self.close_counted()?;
                // tokens after keyword and column count
                self.columns = s.tokens.iter().skip(2).cloned().collect();
            }
            "ClassLookup" => {
                self.close_counted()?;
                let n = s.last_count()?;
                self.enter_counted(ParseMode::InClasses, n);
            }
            "SampleTestPlan" => {
                self.close_counted()?;
                let n = s.last_count()?;
                self.enter_counted(ParseMode::InSamplePlan, n);
            }
            "DefectList" => {
                self.close_counted()?;
                self.mode = ParseMode::InDefects;
            }
            // the defect block has no row count; this is its terminator
            "SummarySpec" => {
                self.close_counted()?;
                self.mode = ParseMode::Scanning;
            }
            _ => match self.mode {
                ParseMode::InDefects => {
                    self.defect_rows.push((s.line, s.numeric_row()?));
                }
                ParseMode::InClasses => {
                    let id = s.tokens[0].parse::<u32>().map_err(|_| {
                        KlarfError::MalformedField {
                            line: s.line,
                            token: s.tokens[0].clone(),
                        }
                    })?;
                    self.classes.push((id, s.rest_joined()));
                    self.rows_seen += 1;
                    if self.rows_seen == self.expected_rows {
                        self.mode = ParseMode::Scanning;
                    }
                }
                ParseMode::InSamplePlan => {
                    if s.tokens.len() < 2 {
                        return Err(KlarfError::MalformedField {
                            line: s.line,
                            token: s.tokens.join(" "),
                        });
                    }
                    let x = parse_i64(s.line, &s.tokens[0])?;
                    let y = parse_i64(s.line, &s.tokens[1])?;
                    self.plan.push((x, y));
                    self.rows_seen += 1;
                    if self.rows_seen == self.expected_rows {
                        self.mode = ParseMode::Scanning;
                    }
                }
                ParseMode::Scanning => {
                    debug!(line = s.line, keyword = s.keyword(), "ignoring statement");
                }
            },
        }
        Ok(())
    }

    fn finish(mut self, source: &str) -> Result<WaferRecord, KlarfError> {
        // EOF inside a counted block is also an undercount
        self.close_counted()?;

        let mut rec = WaferRecord::new();

        if let Some(v) = self.file_version {
            rec.file_version = v;
        }
        if let Some(v) = self.file_timestamp {
            rec.file_timestamp = v;
        }
        if let Some(v) = self.inspection_station {
            rec.inspection_station = v;
        }
        if let Some(v) = self.sample_type {
            rec.sample_type = v;
        }
        if let Some(v) = self.result_timestamp {
            rec.result_timestamp = v;
        }
        if let Some(v) = self.lot_id {
            rec.lot_id = v;
        }
        if let Some(v) = self.setup_id {
            rec.setup_id = v;
        }
        if let Some(v) = self.step_id {
            rec.step_id = v;
        }
        if let Some(v) = self.wafer_id {
            rec.wafer_id = v;
        }
        if let Some(v) = self.slot {
            rec.slot = v;
        }
        if let Some(v) = self.inspection_test {
            rec.inspection_test = v;
        }
        if let Some(v) = self.sample_size {
            rec.sample_size = v;
        }
        if let Some(v) = self.die_origin {
            rec.die_origin = v;
        }
        if let Some(v) = self.orientation_marker {
            rec.orientation_marker = v;
        }
        if let Some(v) = self.orientation {
            rec.orientation = v;
        }
        rec.area_per_test = self.area_per_test;
        rec.class_lookup = self.classes.into_iter().collect();
        rec.sample_test_plan = self.plan;

        // Defaults for pitch/center apply only when there is nothing to
        // place; with defect rows present the geometry must come from the
        // file.
        let rows = self.defect_rows.len();
        let (pitch, center) = if rows > 0 {
            (
                self.die_pitch.ok_or(KlarfError::MissingGeometry {
                    field: "DiePitch",
                    rows,
                })?,
                self.center_location.ok_or(KlarfError::MissingGeometry {
                    field: "CenterLocation",
                    rows,
                })?,
            )
        } else {
            (
                self.die_pitch.unwrap_or(rec.die_pitch()),
                self.center_location.unwrap_or(rec.center_location()),
            )
        };
        rec.install_geometry(pitch, center);
        rec.mark_observed(
            self.sample_size.is_some(),
            self.die_pitch.is_some(),
            self.center_location.is_some(),
        );

        if !self.columns.is_empty() || rows > 0 {
            let mut table = DefectTable::new(self.columns)?;
            for (line, cells) in self.defect_rows {
                table.push_row(cells, source, pitch, center, line)?;
            }
            rec.defects = table;
        }

        Ok(rec)
    }
}

/// KLARF text parser. Stateless entry point; all state lives per call.
pub struct KlarfParser;

impl KlarfParser {
    /// Parse full KLARF text. `source` is the provenance name attached to
    /// every defect row (usually the file path).
    pub fn parse_str(text: &str, source: &str) -> Result<WaferRecord, KlarfError> {
        let mut state = ParserState::new();
        for (idx, raw) in text.lines().enumerate() {
            if let Some(statement) = Statement::parse(idx + 1, raw) {
                state.handle(&statement)?;
            }
        }
        state.finish(source)
    }
}

/// Parse a KLARF file (supports `.klarf` and `.klarf.gz`). Provenance is
/// the file path.
pub fn parse_klarf<P: AsRef<Path>>(path: P) -> Result<WaferRecord, KlarfError> {
    let name = path.as_ref().to_string_lossy().into_owned();
    parse_klarf_named(path, &name)
}

/// Parse a KLARF file, attaching `name` as the provenance of its rows.
pub fn parse_klarf_named<P: AsRef<Path>>(path: P, name: &str) -> Result<WaferRecord, KlarfError> {
    let path = path.as_ref();
    let file = File::open(path)?;

    // Detect gzip by extension
    let is_gz = path.to_str().is_some_and(|s| s.ends_with(".gz"));

    let mut text = String::new();
    if is_gz {
        let mut decoder = BufReader::new(GzDecoder::new(file));
        decoder.read_to_string(&mut text)?;
    } else {
        let mut reader = BufReader::new(file);
        reader.read_to_string(&mut text)?;
    }
    KlarfParser::parse_str(&text, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = "\
SampleSize 300.000;
DiePitch 10000 10000;
CenterLocation 150000 150000;
DefectRecordSpec 2 XINDEX YINDEX XREL YREL;
DefectList;
0 0 500 500;
SummarySpec 0;
";

    #[test]
    fn test_minimal_file() {
        let rec = KlarfParser::parse_str(MINIMAL, "minimal.klarf").unwrap();
        assert_eq!(rec.sample_size, 300_000.0);
        assert_eq!(rec.die_pitch(), XyPair::new(10_000.0, 10_000.0));
        assert_eq!(rec.defects.len(), 1);
        let row = &rec.defects.rows()[0];
        assert_eq!(row.x_actual, -149_500.0);
        assert_eq!(row.y_actual, -149_500.0);
        assert_eq!(row.source, "minimal.klarf");
    }

    #[test]
    fn test_full_header() {
        let text = "\
FileVersion 1 1;
FileTimestamp 08-12-09 09:30:00;
InspectionStationID \"ACME\" \"BrightField\" \"BF-7\";
SampleType WAFER;
ResultTimestamp 08-12-09 10:05:00;
LotID \"A123.000\";
SetupID \"recipe-7\";
StepID \"M1-post-etch\";
SampleSize 1 300;
DeviceID \"unrecognized keywords pass through\";
DiePitch 9800 12060;
DieOrigin 0 0;
CenterLocation 147000 144720;
OrientationMarkType NOTCH;
OrientationMarkLocation DOWN;
WaferID \"W-04\";
Slot 4;
InspectionTest 1;
AreaPerTest 62831.8;
ClassLookup 2;
0 \"Unclassified\";
17 \"Particle\";
SampleTestPlan 2;
0 0;
1 0;
DefectRecordSpec 6 DEFECTID XREL YREL XINDEX YINDEX CLASSNUMBER;
DefectList;
1 250.5 4000 3 2 17;
2 9000.25 1.5 -1 0 0;
SummarySpec 2 TESTNO NDEFECT;
1 2;
EndOfFile;
";
        let rec = KlarfParser::parse_str(text, "full.klarf").unwrap();
        assert_eq!(rec.file_version, "1 1");
        assert_eq!(rec.inspection_station, "ACME BrightField BF-7");
        assert_eq!(rec.lot_id, "A123.000");
        assert_eq!(rec.setup_id, "recipe-7");
        assert_eq!(rec.step_id, "M1-post-etch");
        assert_eq!(rec.wafer_id, "W-04");
        assert_eq!(rec.slot, 4);
        assert_eq!(rec.sample_size, 300_000.0);
        assert_eq!(rec.die_pitch(), XyPair::new(9_800.0, 12_060.0));
        assert_eq!(rec.center_location(), XyPair::new(147_000.0, 144_720.0));
        assert_eq!(rec.orientation_marker, OrientationMarker::Notch);
        assert_eq!(rec.orientation, "DOWN");
        assert_eq!(rec.area_per_test, Some(62_831.8));
        assert_eq!(rec.class_lookup.get(&17).map(String::as_str), Some("Particle"));
        assert_eq!(rec.sample_test_plan, vec![(0, 0), (1, 0)]);
        assert_eq!(rec.defects.len(), 2);
        assert_eq!(rec.defects.value(0, "CLASSNUMBER"), Some(17.0));
        // 3*9800 + 250.5 - 147000
        assert_eq!(rec.defects.rows()[0].x_actual, -117_349.5);
        // -1*9800 + 9000.25 - 147000
        assert_eq!(rec.defects.rows()[1].x_actual, -147_799.75);
    }

    #[test]
    fn test_summary_rows_after_defect_block_are_ignored() {
        // SummarySpec ends defect collection; its own rows fall through
        // to the ignored-statement path.
        let text = format!("{MINIMAL}1 1;\n");
        let rec = KlarfParser::parse_str(&text, "x").unwrap();
        assert_eq!(rec.defects.len(), 1);
    }

    #[test]
    fn test_keyword_never_collected_as_defect_row() {
        let text = "\
DiePitch 10000 10000;
CenterLocation 0 0;
DefectRecordSpec 1 XINDEX YINDEX XREL YREL;
DefectList;
0 0 1 1;
SampleTestPlan 1;
2 3;
SummarySpec 0;
";
        let rec = KlarfParser::parse_str(text, "x").unwrap();
        assert_eq!(rec.defects.len(), 1);
        assert_eq!(rec.sample_test_plan, vec![(2, 3)]);
    }

    #[test]
    fn test_defect_block_ends_at_eof_without_summary() {
        let text = "\
DiePitch 10000 10000;
CenterLocation 0 0;
DefectRecordSpec 1 XINDEX YINDEX XREL YREL;
DefectList;
1 1 0 0;
";
        let rec = KlarfParser::parse_str(text, "x").unwrap();
        assert_eq!(rec.defects.len(), 1);
        assert_eq!(rec.defects.rows()[0].x_actual, 10_000.0);
    }

    #[test]
    fn test_sample_prefixed_keyword_spellings() {
        let text = "\
DiePitch 9800 12060;
SampleCenterLocation 147000 144720;
SampleOrientationMarkType FLAT;
DefectRecordSpec 1 XINDEX YINDEX XREL YREL;
DefectList;
0 0 500 500;
SummarySpec 0;
";
        let rec = KlarfParser::parse_str(text, "x").unwrap();
        assert_eq!(rec.center_location(), XyPair::new(147_000.0, 144_720.0));
        assert_eq!(rec.orientation_marker, OrientationMarker::Flat);
        assert_eq!(rec.defects.rows()[0].x_actual, 500.0 - 147_000.0);
    }

    #[test]
    fn test_non_positive_die_pitch_rejected() {
        let err = KlarfParser::parse_str("DiePitch 0 10000;\n", "x");
        assert!(matches!(
            err,
            Err(KlarfError::NonPositivePitch { x: 0.0, y: 10_000.0 })
        ));
        let err = KlarfParser::parse_str("DiePitch 9800 -12060;\n", "x");
        assert!(matches!(err, Err(KlarfError::NonPositivePitch { .. })));
    }

    #[test]
    fn test_missing_geometry() {
        let text = "\
DefectRecordSpec 1 XINDEX YINDEX XREL YREL;
DefectList;
0 0 1 1;
";
        let err = KlarfParser::parse_str(text, "x");
        assert!(matches!(
            err,
            Err(KlarfError::MissingGeometry { field: "DiePitch", rows: 1 })
        ));
    }

    #[test]
    fn test_defaults_without_defects() {
        let rec = KlarfParser::parse_str("LotID \"L1\";\n", "x").unwrap();
        assert_eq!(rec.lot_id, "L1");
        assert_eq!(rec.sample_size, 300_000.0);
        assert_eq!(rec.die_pitch(), XyPair::new(10_000.0, 10_000.0));
        assert_eq!(rec.center_location(), XyPair::new(150_000.0, 150_000.0));
        assert_eq!(rec.orientation_marker, OrientationMarker::Notch);
        assert_eq!(rec.orientation, "DOWN");
        assert_eq!(rec.slot, 1);
        assert!(rec.defects.is_empty());
    }

    #[test]
    fn test_invalid_orientation_marker() {
        let err = KlarfParser::parse_str("OrientationMarkType BOGUS;\n", "x");
        assert!(matches!(err, Err(KlarfError::InvalidEnum { .. })));
        // case-insensitive acceptance, normalized form
        let rec = KlarfParser::parse_str("OrientationMarkType flat;\n", "x").unwrap();
        assert_eq!(rec.orientation_marker.to_string(), "FLAT");
    }

    #[test]
    fn test_orientation_location_is_free_form() {
        let rec = KlarfParser::parse_str("OrientationMarkLocation BOGUS;\n", "x").unwrap();
        assert_eq!(rec.orientation, "BOGUS");
    }

    #[test]
    fn test_malformed_numeric() {
        let err = KlarfParser::parse_str("DiePitch ten thousand;\n", "x");
        assert!(matches!(
            err,
            Err(KlarfError::MalformedField { line: 1, .. })
        ));
    }

    #[test]
    fn test_class_lookup_undercount_fails() {
        let text = "\
ClassLookup 3;
0 \"Unclassified\";
1 \"Particle\";
DefectRecordSpec 1 XINDEX YINDEX XREL YREL;
";
        let err = KlarfParser::parse_str(text, "x");
        assert!(matches!(
            err,
            Err(KlarfError::RowCountMismatch {
                section: "ClassLookup",
                declared: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_sample_plan_undercount_at_eof_fails() {
        let text = "SampleTestPlan 2;\n0 0;\n";
        let err = KlarfParser::parse_str(text, "x");
        assert!(matches!(
            err,
            Err(KlarfError::RowCountMismatch {
                section: "SampleTestPlan",
                ..
            })
        ));
    }

    #[test]
    fn test_column_count_mismatch() {
        let text = "\
DiePitch 10000 10000;
CenterLocation 0 0;
DefectRecordSpec 1 XINDEX YINDEX XREL YREL;
DefectList;
0 0 1;
";
        let err = KlarfParser::parse_str(text, "x");
        assert!(matches!(
            err,
            Err(KlarfError::ColumnCountMismatch { line: 5, expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_missing_required_column() {
        let text = "\
DiePitch 10000 10000;
CenterLocation 0 0;
DefectRecordSpec 1 DEFECTID XREL YREL;
DefectList;
1 2 3;
";
        let err = KlarfParser::parse_str(text, "x");
        assert!(matches!(err, Err(KlarfError::MissingColumn { name: "XINDEX" })));
    }

    #[test]
    fn test_parse_file_and_gzip_parity() {
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("wafer.klarf");
        std::fs::write(&plain, MINIMAL).unwrap();

        let gz = dir.path().join("wafer.klarf.gz");
        let f = std::fs::File::create(&gz).unwrap();
        let mut enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        enc.write_all(MINIMAL.as_bytes()).unwrap();
        enc.finish().unwrap();

        let a = parse_klarf(&plain).unwrap();
        let b = parse_klarf(&gz).unwrap();
        assert_eq!(a.sample_size, b.sample_size);
        assert_eq!(a.defects.len(), b.defects.len());
        assert_eq!(a.defects.rows()[0].x_actual, b.defects.rows()[0].x_actual);
        // provenance defaults to the path
        assert!(a.defects.rows()[0].source.ends_with("wafer.klarf"));

        let named = parse_klarf_named(&plain, "slot-04").unwrap();
        assert_eq!(named.defects.rows()[0].source, "slot-04");
    }
}
