//! SQL value types exchanged with the executor.
//!
//! Values are owned so rows can cross the channel between a streaming
//! cursor and the loader feeding the target.

use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// A row as returned by an executor.
pub type Row = Vec<SqlValue>;

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// 64-bit signed integer (Vertica INT is always 64 bits).
    I64(i64),

    /// Double precision float.
    F64(f64),

    /// Exact numeric.
    Decimal(Decimal),

    /// Text data.
    Text(String),

    /// Binary or non-Unicode byte string.
    Bytes(Vec<u8>),

    /// UUID value.
    Uuid(Uuid),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Render the value as COPY text, `None` for NULL.
    ///
    /// Byte strings are decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        let text = match self {
            SqlValue::Null => return None,
            SqlValue::Bool(v) => Cow::Borrowed(if *v { "true" } else { "false" }),
            SqlValue::I64(v) => Cow::Owned(v.to_string()),
            SqlValue::F64(v) => Cow::Owned(v.to_string()),
            SqlValue::Decimal(v) => Cow::Owned(v.to_string()),
            SqlValue::Text(v) => Cow::Borrowed(v.as_str()),
            SqlValue::Bytes(v) => String::from_utf8_lossy(v),
            SqlValue::Uuid(v) => Cow::Owned(v.to_string()),
            SqlValue::Date(v) => Cow::Owned(v.format("%Y-%m-%d").to_string()),
            SqlValue::Time(v) => Cow::Owned(v.format("%H:%M:%S%.f").to_string()),
            SqlValue::DateTime(v) => Cow::Owned(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            SqlValue::DateTimeOffset(v) => {
                Cow::Owned(v.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string())
            }
        };
        Some(text)
    }

    /// Interpret the value as an integer.
    ///
    /// Text is parsed, since text-mode drivers return every column as a string.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I64(v) => Some(*v),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            SqlValue::Decimal(v) => v.trunc().to_string().parse().ok(),
            SqlValue::F64(v) if v.fract() == 0.0 => Some(*v as i64),
            SqlValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a string, `None` for NULL.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        self.to_text().map(Cow::into_owned)
    }

    /// Decode byte strings to text; other values are returned unchanged.
    #[must_use]
    pub fn into_unicode(self) -> SqlValue {
        match self {
            SqlValue::Bytes(v) => match String::from_utf8(v) {
                Ok(text) => SqlValue::Text(text),
                Err(e) => SqlValue::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
            other => other,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I64(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_has_no_text() {
        assert!(SqlValue::Null.is_null());
        assert_eq!(SqlValue::Null.to_text(), None);
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
    }

    #[test]
    fn test_to_text() {
        assert_eq!(SqlValue::from(100).to_text().unwrap(), "100");
        assert_eq!(SqlValue::from(true).to_text().unwrap(), "true");
        assert_eq!(SqlValue::from("é1").to_text().unwrap(), "é1");
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(SqlValue::from(date).to_text().unwrap(), "2024-02-29");
        let ts = date.and_hms_opt(13, 5, 0).unwrap();
        assert_eq!(SqlValue::from(ts).to_text().unwrap(), "2024-02-29 13:05:00");
    }

    #[test]
    fn test_as_i64_parses_text() {
        assert_eq!(SqlValue::Text(" 41 ".into()).as_i64(), Some(41));
        assert_eq!(SqlValue::I64(7).as_i64(), Some(7));
        assert_eq!(SqlValue::Null.as_i64(), None);
        assert_eq!(SqlValue::Text("abc".into()).as_i64(), None);
    }

    #[test]
    fn test_into_unicode_decodes_bytes() {
        let valid = SqlValue::Bytes("café".as_bytes().to_vec()).into_unicode();
        assert_eq!(valid, SqlValue::Text("café".into()));

        let invalid = SqlValue::Bytes(vec![b'a', 0xff, b'b']).into_unicode();
        assert_eq!(invalid, SqlValue::Text("a\u{fffd}b".into()));

        assert_eq!(SqlValue::I64(1).into_unicode(), SqlValue::I64(1));
    }
}
