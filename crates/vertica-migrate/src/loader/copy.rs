//! COPY statement construction.

use std::path::Path;

use crate::config::{CopyOptions, EscapeStyle};
use crate::core::identifier::quote_literal;

/// A `COPY ... FROM LOCAL` statement reading one named pipe.
#[derive(Debug)]
pub struct CopyStatement<'a> {
    pub table: &'a str,
    pub columns: &'a [String],
    pub source: &'a Path,
    pub rejected: Option<&'a Path>,
    pub options: &'a CopyOptions,
}

impl CopyStatement<'_> {
    pub fn to_sql(&self) -> String {
        let opts = self.options;
        let mut sql = format!("COPY {}", self.table);

        if !self.columns.is_empty() {
            sql.push_str(&format!(" ({})", self.columns.join(", ")));
        }

        sql.push_str(&format!(
            " FROM LOCAL {}",
            quote_literal(&self.source.to_string_lossy())
        ));

        if let Some(rejected) = self.rejected {
            sql.push_str(&format!(
                " REJECTED DATA {}",
                quote_literal(&rejected.to_string_lossy())
            ));
        }

        sql.push_str(&format!(" REJECTMAX {}", opts.reject_max));
        sql.push_str(&format!(" DELIMITER {}", char_literal(opts.delimiter)));
        sql.push_str(&format!(" ENCLOSED BY {}", char_literal(opts.enclosed_by)));
        if opts.escape == EscapeStyle::Double {
            sql.push_str(" NO ESCAPE");
        }
        sql.push_str(&format!(" SKIP {}", opts.skip));
        sql.push_str(&format!(" NULL {}", quote_literal(&opts.null)));
        sql.push_str(&format!(
            " RECORD TERMINATOR {}",
            char_literal(opts.record_terminator)
        ));

        // must be the last clause
        if opts.no_commit {
            sql.push_str(" NO COMMIT");
        }

        sql
    }
}

/// Render a single character as a string literal.
///
/// Control characters use the extended `E'\ooo'` octal form.
pub fn char_literal(c: char) -> String {
    if c.is_control() && (c as u32) < 0o400 {
        format!("E'\\{:03o}'", c as u32)
    } else {
        quote_literal(&c.to_string())
    }
}
