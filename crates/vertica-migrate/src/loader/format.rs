//! Delimited text encoding of rows for the COPY stream.

use crate::config::{CopyOptions, EscapeStyle};
use crate::core::SqlValue;

/// Encodes rows into the text format announced by the COPY statement.
///
/// NULL becomes the null marker. Every other value is wrapped in the
/// enclosure character, fields are joined with the delimiter and each
/// record ends with the record terminator.
#[derive(Debug, Clone)]
pub struct RowFormatter {
    delimiter: char,
    enclosure: char,
    escape: EscapeStyle,
    null: String,
    terminator: char,
}

impl RowFormatter {
    pub fn new(options: &CopyOptions) -> Self {
        Self {
            delimiter: options.delimiter,
            enclosure: options.enclosed_by,
            escape: options.escape,
            null: options.null.clone(),
            terminator: options.record_terminator,
        }
    }

    /// Record terminator appended after every row.
    pub fn terminator(&self) -> char {
        self.terminator
    }

    /// Append one encoded record, terminator included, to `out`.
    pub fn format_row(&self, row: &[SqlValue], out: &mut String) {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            match value.to_text() {
                None => out.push_str(&self.null),
                Some(text) => self.push_enclosed(&text, out),
            }
        }
        out.push(self.terminator);
    }

    /// Encode one record into a new string.
    pub fn encode_row(&self, row: &[SqlValue]) -> String {
        let mut out = String::new();
        self.format_row(row, &mut out);
        out
    }

    fn push_enclosed(&self, text: &str, out: &mut String) {
        out.reserve(text.len() + 2);
        out.push(self.enclosure);
        for c in text.chars() {
            match self.escape {
                EscapeStyle::Backslash if c == self.enclosure || c == '\\' => {
                    out.push('\\');
                    out.push(c);
                }
                EscapeStyle::Double if c == self.enclosure => {
                    out.push(c);
                    out.push(c);
                }
                _ => out.push(c),
            }
        }
        out.push(self.enclosure);
    }
}
