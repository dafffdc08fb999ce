//! Typed scalar values for primary key boundaries.
//!
//! A `Datum` carries both the value and enough type information to render
//! it back into SQL and to compare it against other datums of the same
//! type. Cross-type ordering is undefined and treated as incomparable.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::utils::escape_string;

/// The coarse MySQL type classes we need for keys and boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatumType {
    Signed,
    Unsigned,
    Binary,
    Float,
    Json,
    Decimal,
    Datetime,
}

impl DatumType {
    /// Map an `information_schema` DATA_TYPE / COLUMN_TYPE pair to a datum
    /// type. COLUMN_TYPE is needed to detect the `unsigned` attribute.
    pub fn from_mysql_type(data_type: &str, column_type: &str) -> DatumType {
        match data_type.to_lowercase().as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "bigint" | "bit" | "year" => {
                if column_type.to_lowercase().contains("unsigned") {
                    DatumType::Unsigned
                } else {
                    DatumType::Signed
                }
            }
            "float" | "double" => DatumType::Float,
            "decimal" | "numeric" => DatumType::Decimal,
            "json" => DatumType::Json,
            "datetime" | "timestamp" | "date" | "time" => DatumType::Datetime,
            // char, varchar, binary, varbinary, text, blob, enum, set, ...
            _ => DatumType::Binary,
        }
    }

    /// A type is memory comparable when the encoded bytes sort the same
    /// way as the semantic value. This governs whether the replication
    /// client can buffer changes in a map keyed by the primary key.
    pub fn is_memory_comparable(&self) -> bool {
        matches!(
            self,
            DatumType::Signed | DatumType::Unsigned | DatumType::Binary
        )
    }
}

/// A single typed value, usually one column of a primary key boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tp", content = "val", rename_all = "lowercase")]
pub enum Datum {
    Signed(i64),
    Unsigned(u64),
    Binary(String),
    Float(f64),
    Json(String),
    Decimal(String),
    Datetime(String),
}

impl Datum {
    pub fn datum_type(&self) -> DatumType {
        match self {
            Datum::Signed(_) => DatumType::Signed,
            Datum::Unsigned(_) => DatumType::Unsigned,
            Datum::Binary(_) => DatumType::Binary,
            Datum::Float(_) => DatumType::Float,
            Datum::Json(_) => DatumType::Json,
            Datum::Decimal(_) => DatumType::Decimal,
            Datum::Datetime(_) => DatumType::Datetime,
        }
    }

    /// Build a datum of a known type from a MySQL value.
    pub fn from_mysql_value(value: &mysql_async::Value, tp: DatumType) -> Option<Datum> {
        use mysql_async::Value;
        match (tp, value) {
            (_, Value::NULL) => None,
            (DatumType::Signed, Value::Int(v)) => Some(Datum::Signed(*v)),
            (DatumType::Signed, Value::UInt(v)) => Some(Datum::Signed(*v as i64)),
            (DatumType::Unsigned, Value::UInt(v)) => Some(Datum::Unsigned(*v)),
            (DatumType::Unsigned, Value::Int(v)) => Some(Datum::Unsigned(*v as u64)),
            (DatumType::Float, Value::Float(v)) => Some(Datum::Float(*v as f64)),
            (DatumType::Float, Value::Double(v)) => Some(Datum::Float(*v)),
            (tp, Value::Bytes(b)) => {
                let s = String::from_utf8_lossy(b).to_string();
                Some(match tp {
                    DatumType::Signed => Datum::Signed(s.parse().ok()?),
                    DatumType::Unsigned => Datum::Unsigned(s.parse().ok()?),
                    DatumType::Float => Datum::Float(s.parse().ok()?),
                    DatumType::Decimal => Datum::Decimal(s),
                    DatumType::Json => Datum::Json(s),
                    DatumType::Datetime => Datum::Datetime(s),
                    DatumType::Binary => Datum::Binary(s),
                })
            }
            (tp, v) => {
                // Remaining numeric/date encodings round-trip through the
                // driver's SQL representation.
                let s = v.as_sql(true).trim_matches('\'').to_string();
                Some(match tp {
                    DatumType::Signed => Datum::Signed(s.parse().ok()?),
                    DatumType::Unsigned => Datum::Unsigned(s.parse().ok()?),
                    DatumType::Float => Datum::Float(s.parse().ok()?),
                    DatumType::Decimal => Datum::Decimal(s),
                    DatumType::Json => Datum::Json(s),
                    DatumType::Datetime => Datum::Datetime(s),
                    DatumType::Binary => Datum::Binary(s),
                })
            }
        }
    }

    /// Parse a datum of a known type out of its string form, as extracted
    /// from a binlog row image.
    pub fn from_key_string(s: &str, tp: DatumType) -> Option<Datum> {
        Some(match tp {
            DatumType::Signed => Datum::Signed(s.parse().ok()?),
            DatumType::Unsigned => Datum::Unsigned(s.parse().ok()?),
            DatumType::Float => Datum::Float(s.parse().ok()?),
            DatumType::Decimal => Datum::Decimal(s.to_string()),
            DatumType::Json => Datum::Json(s.to_string()),
            DatumType::Datetime => Datum::Datetime(s.to_string()),
            DatumType::Binary => Datum::Binary(s.to_string()),
        })
    }

    /// Render as a SQL literal, quoting and escaping where required.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Datum::Signed(v) => v.to_string(),
            Datum::Unsigned(v) => v.to_string(),
            Datum::Float(v) => v.to_string(),
            Datum::Decimal(v) => v.clone(),
            Datum::Binary(v) | Datum::Json(v) | Datum::Datetime(v) => {
                format!("'{}'", escape_string(v))
            }
        }
    }

    /// Advance an integer datum by `n` key values. Returns `None` on
    /// overflow or for non-integer types, which callers treat as the end
    /// of the key space.
    pub fn checked_add(&self, n: u64) -> Option<Datum> {
        match self {
            Datum::Signed(v) => {
                let n = i64::try_from(n).ok()?;
                v.checked_add(n).map(Datum::Signed)
            }
            Datum::Unsigned(v) => v.checked_add(n).map(Datum::Unsigned),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Datum::Signed(v) => u64::try_from(*v).ok(),
            Datum::Unsigned(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialOrd for Datum {
    /// Total order within a type; `None` across types.
    fn partial_cmp(&self, other: &Datum) -> Option<Ordering> {
        match (self, other) {
            (Datum::Signed(a), Datum::Signed(b)) => a.partial_cmp(b),
            (Datum::Unsigned(a), Datum::Unsigned(b)) => a.partial_cmp(b),
            (Datum::Float(a), Datum::Float(b)) => a.partial_cmp(b),
            (Datum::Binary(a), Datum::Binary(b)) => a.partial_cmp(b),
            (Datum::Decimal(a), Datum::Decimal(b)) => a.partial_cmp(b),
            (Datum::Datetime(a), Datum::Datetime(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for Datum {
    /// Type-prefixed canonical form. Used as the watermark pending-map
    /// key, so it must be deterministic across restarts.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Signed(v) => write!(f, "signed:{v}"),
            Datum::Unsigned(v) => write!(f, "unsigned:{v}"),
            Datum::Binary(v) => write!(f, "binary:{v}"),
            Datum::Float(v) => write!(f, "float:{v}"),
            Datum::Json(v) => write!(f, "json:{v}"),
            Datum::Decimal(v) => write!(f, "decimal:{v}"),
            Datum::Datetime(v) => write!(f, "datetime:{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mapping() {
        assert_eq!(
            DatumType::from_mysql_type("int", "int unsigned"),
            DatumType::Unsigned
        );
        assert_eq!(
            DatumType::from_mysql_type("bigint", "bigint"),
            DatumType::Signed
        );
        assert_eq!(
            DatumType::from_mysql_type("varchar", "varchar(255)"),
            DatumType::Binary
        );
        assert_eq!(DatumType::from_mysql_type("json", "json"), DatumType::Json);
        assert_eq!(
            DatumType::from_mysql_type("decimal", "decimal(10,2)"),
            DatumType::Decimal
        );
    }

    #[test]
    fn test_memory_comparable() {
        assert!(DatumType::Signed.is_memory_comparable());
        assert!(DatumType::Unsigned.is_memory_comparable());
        assert!(DatumType::Binary.is_memory_comparable());
        assert!(!DatumType::Float.is_memory_comparable());
        assert!(!DatumType::Json.is_memory_comparable());
        assert!(!DatumType::Decimal.is_memory_comparable());
    }

    #[test]
    fn test_ordering_within_type() {
        assert!(Datum::Signed(1) < Datum::Signed(2));
        assert!(Datum::Unsigned(u64::MAX) > Datum::Unsigned(0));
        assert!(Datum::Binary("a".into()) < Datum::Binary("b".into()));
        // Cross-type comparison is undefined.
        assert_eq!(Datum::Signed(1).partial_cmp(&Datum::Unsigned(1)), None);
    }

    #[test]
    fn test_checked_add_overflow() {
        assert_eq!(
            Datum::Unsigned(10).checked_add(5),
            Some(Datum::Unsigned(15))
        );
        assert_eq!(Datum::Unsigned(u64::MAX).checked_add(1), None);
        assert_eq!(Datum::Signed(i64::MAX).checked_add(1), None);
        assert_eq!(Datum::Binary("x".into()).checked_add(1), None);
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(Datum::Signed(-5).to_sql_literal(), "-5");
        assert_eq!(
            Datum::Binary("o'brien".into()).to_sql_literal(),
            "'o''brien'"
        );
    }

    #[test]
    fn test_canonical_form_roundtrip() {
        let d = Datum::Unsigned(42);
        let json = serde_json::to_string(&d).unwrap();
        let back: Datum = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
        assert_eq!(d.to_string(), back.to_string());
    }
}
