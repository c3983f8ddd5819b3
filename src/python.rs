//! PyO3 bindings — exposes `parse_klarf_rs()` and `write_klarf_rs()` to
//! Python.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::types::WaferRecord;
use crate::{parser, writer};

/// Parse a KLARF file and return the wafer record.
///
/// Supports both `.klarf` and `.klarf.gz` files.
#[pyfunction]
fn parse_klarf_rs(path: &str) -> PyResult<WaferRecord> {
    parser::parse_klarf(path).map_err(|e| PyValueError::new_err(e.to_string()))
}

/// Serialize a wafer record back to KLARF text.
#[pyfunction]
fn write_klarf_rs(record: &WaferRecord) -> String {
    writer::write_klarf(record)
}

/// Python module: klarfkit_rs
#[pymodule]
fn klarfkit_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(parse_klarf_rs, m)?)?;
    m.add_function(wrap_pyfunction!(write_klarf_rs, m)?)?;
    m.add_class::<WaferRecord>()?;
    Ok(())
}
