//! Low-level statement reader for KLARF text.
//!
//! KLARF is one logical statement per line, terminated by `;`, with string
//! values optionally double-quoted. This module normalizes a raw line into
//! a tokenized [`Statement`] and provides checked numeric accessors that
//! report the offending line on failure.

use crate::error::KlarfError;

/// One normalized KLARF statement: trimmed, `;` and quotes stripped,
/// split on whitespace.
#[derive(Debug, Clone)]
pub struct Statement {
    /// 1-based line number in the source text.
    pub line: usize,
    pub tokens: Vec<String>,
}

impl Statement {
    /// Normalize one raw line. Returns `None` for blank lines.
    pub fn parse(line: usize, raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_end_matches(';').trim_end();
        if trimmed.is_empty() {
            return None;
        }
        let tokens: Vec<String> = trimmed
            .split_whitespace()
            .map(|t| t.trim_matches('"').to_string())
            .collect();
        if tokens.is_empty() {
            None
        } else {
            Some(Self { line, tokens })
        }
    }

    /// The keyword token (first on the line).
    pub fn keyword(&self) -> &str {
        &self.tokens[0]
    }

    /// Tokens after the keyword.
    pub fn rest(&self) -> &[String] {
        &self.tokens[1..]
    }

    /// Tokens after the keyword, re-joined with single spaces. Used for
    /// pass-through scalar fields like `InspectionStationID`.
    pub fn rest_joined(&self) -> String {
        self.rest().join(" ")
    }

    /// Parse token `idx` as f64.
    pub fn f64_at(&self, idx: usize) -> Result<f64, KlarfError> {
        parse_f64(self.line, &self.tokens[idx])
    }

    /// Parse the last token on the line as f64.
    pub fn last_f64(&self) -> Result<f64, KlarfError> {
        parse_f64(self.line, self.tokens.last().map(String::as_str).unwrap_or(""))
    }

    /// Parse the last token on the line as a row count.
    pub fn last_count(&self) -> Result<usize, KlarfError> {
        let tok = self.tokens.last().map(String::as_str).unwrap_or("");
        tok.parse::<usize>().map_err(|_| KlarfError::MalformedField {
            line: self.line,
            token: tok.to_string(),
        })
    }

    /// Parse the two tokens after the keyword as an (x, y) pair.
    pub fn pair(&self) -> Result<(f64, f64), KlarfError> {
        if self.tokens.len() < 3 {
            return Err(KlarfError::MalformedField {
                line: self.line,
                token: self.rest_joined(),
            });
        }
        Ok((self.f64_at(1)?, self.f64_at(2)?))
    }

    /// Parse every token on the line as f64 (a table row).
    pub fn numeric_row(&self) -> Result<Vec<f64>, KlarfError> {
        self.tokens
            .iter()
            .map(|t| parse_f64(self.line, t))
            .collect()
    }
}

/// Parse one token as f64, reporting the line on failure.
pub fn parse_f64(line: usize, token: &str) -> Result<f64, KlarfError> {
    token.parse::<f64>().map_err(|_| KlarfError::MalformedField {
        line,
        token: token.to_string(),
    })
}

/// Parse one token as a signed integer, reporting the line on failure.
pub fn parse_i64(line: usize, token: &str) -> Result<i64, KlarfError> {
    token.parse::<i64>().map_err(|_| KlarfError::MalformedField {
        line,
        token: token.to_string(),
    })
}
