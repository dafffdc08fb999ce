//! Small helpers shared by the copier, replication client and checksum.

use crate::table::TableInfo;

/// Separator used when hashing a composite primary key into a map key.
pub const PRIMARY_KEY_SEPARATOR: &str = "-#-";

/// Convert a (possibly composite) primary key into a single string so it
/// can be used as a map key. The inverse is [`unhash_key`].
pub fn hash_key(key: &[String]) -> String {
    key.join(PRIMARY_KEY_SEPARATOR)
}

/// Convert a hashed key back into a value usable inside a
/// `(col1, col2) IN (...)` clause.
pub fn unhash_key(key: &str) -> String {
    let parts: Vec<String> = key
        .split(PRIMARY_KEY_SEPARATOR)
        .map(|p| format!("'{}'", escape_string(p)))
        .collect();
    if parts.len() == 1 {
        return parts.into_iter().next().unwrap();
    }
    format!("({})", parts.join(","))
}

/// Escape a string for inclusion in a single-quoted SQL literal.
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out
}

/// Render a list of hashed keys as a row-value constructor list:
/// `('1'),('2')` for single-column keys, `('1','a'),('2','b')` for
/// composite keys.
pub fn pks_to_row_value_constructor(keys: &[String]) -> String {
    keys.iter()
        .map(|k| {
            let unhashed = unhash_key(k);
            if unhashed.starts_with('(') {
                unhashed
            } else {
                format!("({unhashed})")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Quote and comma-join column names.
pub fn quote_columns(cols: &[String]) -> String {
    cols.iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Columns present in both tables, excluding generated columns on either
/// side, quoted and comma-joined for use in INSERT/SELECT column lists.
pub fn intersect_non_generated_columns(t1: &TableInfo, t2: &TableInfo) -> String {
    quote_columns(&intersect_non_generated_columns_as_slice(t1, t2))
}

/// Same intersection as [`intersect_non_generated_columns`], unquoted.
pub fn intersect_non_generated_columns_as_slice(t1: &TableInfo, t2: &TableInfo) -> Vec<String> {
    t1.non_generated_columns
        .iter()
        .filter(|c| t2.non_generated_columns.contains(c))
        .cloned()
        .collect()
}

/// Strip a trailing semicolon and surrounding whitespace from an ALTER.
pub fn trim_alter(alter: &str) -> String {
    alter.trim().trim_end_matches(';').trim().to_string()
}

/// Name of the shadow table the ALTER is applied to.
pub fn shadow_table_name(table: &str) -> String {
    format!("_{table}_new")
}

/// Name the original table is parked under during cutover.
pub fn old_table_name(table: &str) -> String {
    format!("_{table}_old")
}

/// Name of the checkpoint table.
pub fn checkpoint_table_name(table: &str) -> String {
    format!("_{table}_chkpnt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_unhash_single() {
        let key = vec!["1234".to_string()];
        let hashed = hash_key(&key);
        assert_eq!(hashed, "1234");
        assert_eq!(unhash_key(&hashed), "'1234'");
    }

    #[test]
    fn test_hash_unhash_composite() {
        let key = vec!["1234".to_string(), "abc".to_string()];
        let hashed = hash_key(&key);
        assert_eq!(hashed, "1234-#-abc");
        assert_eq!(unhash_key(&hashed), "('1234','abc')");
    }

    #[test]
    fn test_unhash_escapes_quotes() {
        assert_eq!(unhash_key("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_row_value_constructor() {
        let keys = vec!["1".to_string(), "2".to_string()];
        assert_eq!(pks_to_row_value_constructor(&keys), "('1'),('2')");

        let composite = vec![hash_key(&["1".to_string(), "a".to_string()])];
        assert_eq!(pks_to_row_value_constructor(&composite), "('1','a')");
    }

    #[test]
    fn test_trim_alter() {
        assert_eq!(trim_alter(" ADD COLUMN b INT; "), "ADD COLUMN b INT");
        assert_eq!(trim_alter("ENGINE=InnoDB"), "ENGINE=InnoDB");
    }
}
