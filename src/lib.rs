//! klarfkit-rs: KLARF wafer-inspection file parser, coordinate model, and
//! writer, with optional Python bindings.
//!
//! KLARF is the semicolon-terminated, keyword-tagged text format used by
//! semiconductor inspection equipment to report per-die defect coordinates
//! and wafer metadata. This crate parses it into a [`WaferRecord`], keeps
//! die-relative positions (`XINDEX/YINDEX/XREL/YREL`) consistent with
//! absolute wafer positions (`XACTUAL/YACTUAL`) across geometry changes,
//! and writes records back out.

pub mod error;
pub mod parser;
pub mod reader;
pub mod types;
pub mod writer;

#[cfg(feature = "python")]
mod python;

pub use error::{KlarfError, MergeWarning};
pub use parser::{parse_klarf, parse_klarf_named, KlarfParser};
pub use types::{DefectRow, DefectTable, OrientationMarker, WaferRecord, XyPair};
pub use writer::{write_klarf, write_klarf_file};
