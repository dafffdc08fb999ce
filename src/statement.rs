//! Static analysis of the requested ALTER clauses.
//!
//! The migration controls its own algorithm and locking, so clauses that
//! steer those are rejected up front, as are operations that cannot be
//! expressed as create-like/alter/backfill/cutover (renames) and ones
//! that only make sense as metadata changes (index visibility). `ADD
//! UNIQUE` is accepted but forces the checksum on, because a duplicate
//! key error during re-application cannot be told apart from a genuine
//! uniqueness violation.

use sqlparser::ast::{AlterTableOperation, Statement, TableConstraint};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::error::{Error, Result};

/// Reject ALTER clauses the engine cannot or must not run.
pub fn assert_alter_supported(alter: &str) -> Result<()> {
    if let Some(clause) = alter_contains_unsupported_clause(alter) {
        return Err(Error::UnsupportedAlter(clause));
    }
    if alter_contains_rename(alter) {
        return Err(Error::UnsupportedAlter("RENAME".to_string()));
    }
    if alter_contains_index_visibility(alter) {
        return Err(Error::UnsupportedAlter(
            "index visibility change (metadata-only; run it natively)".to_string(),
        ));
    }
    Ok(())
}

/// `ALGORITHM=` / `LOCK=` assertions conflict with the engine's own
/// choices. Detected at the token level so unparsable-but-valid MySQL
/// clauses are still caught.
pub fn alter_contains_unsupported_clause(alter: &str) -> Option<String> {
    let mut found = Vec::new();
    let tokens = tokenize(alter);
    let mut iter = tokens.iter().filter(|t| significant(t)).peekable();
    while let Some(token) = iter.next() {
        if let Token::Word(word) = token {
            let upper = word.value.to_uppercase();
            if (upper == "ALGORITHM" || upper == "LOCK")
                && matches!(iter.peek(), Some(&&Token::Eq))
            {
                found.push(format!("{upper}="));
            }
        }
    }
    if found.is_empty() {
        None
    } else {
        Some(found.join(", "))
    }
}

/// Any rename (table or column) breaks the copy's column mapping.
pub fn alter_contains_rename(alter: &str) -> bool {
    // Prefer the AST when the dialect can parse the clause.
    if let Some(ops) = parse_operations(alter) {
        return ops.iter().any(|op| {
            matches!(
                op,
                AlterTableOperation::RenameTable { .. }
                    | AlterTableOperation::RenameColumn { .. }
            )
        });
    }
    has_word(alter, "RENAME")
}

pub fn alter_contains_index_visibility(alter: &str) -> bool {
    has_word(alter, "VISIBLE") || has_word(alter, "INVISIBLE")
}

pub fn alter_contains_add_unique(alter: &str) -> bool {
    if let Some(ops) = parse_operations(alter) {
        for op in &ops {
            if let AlterTableOperation::AddConstraint(constraint) = op {
                if matches!(constraint, TableConstraint::Unique { .. }) {
                    return true;
                }
            }
        }
    }
    has_word(alter, "UNIQUE")
}

/// Best-effort AST parse of `ALTER TABLE _t_ <clauses>`. Returns `None`
/// when the dialect cannot parse the clause; callers then fall back to
/// token scanning rather than rejecting valid MySQL.
fn parse_operations(alter: &str) -> Option<Vec<AlterTableOperation>> {
    let sql = format!("ALTER TABLE `_t_` {alter}");
    let statements = Parser::parse_sql(&MySqlDialect {}, &sql).ok()?;
    match statements.into_iter().next()? {
        Statement::AlterTable { operations, .. } => Some(operations),
        _ => None,
    }
}

fn tokenize(alter: &str) -> Vec<Token> {
    Tokenizer::new(&MySqlDialect {}, alter)
        .tokenize()
        .unwrap_or_default()
}

fn significant(token: &Token) -> bool {
    !matches!(token, Token::Whitespace(_))
}

fn has_word(alter: &str, word: &str) -> bool {
    tokenize(alter).iter().any(|t| match t {
        Token::Word(w) => w.value.eq_ignore_ascii_case(word),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_add_column_is_supported() {
        assert!(assert_alter_supported("ADD COLUMN c INT").is_ok());
        assert!(assert_alter_supported("ENGINE=InnoDB").is_ok());
        assert!(assert_alter_supported("MODIFY COLUMN b BIGINT NOT NULL").is_ok());
    }

    #[test]
    fn test_algorithm_and_lock_rejected() {
        assert!(matches!(
            assert_alter_supported("ADD COLUMN c INT, ALGORITHM=INPLACE"),
            Err(Error::UnsupportedAlter(s)) if s.contains("ALGORITHM=")
        ));
        assert!(matches!(
            assert_alter_supported("ADD COLUMN c INT, LOCK=NONE"),
            Err(Error::UnsupportedAlter(s)) if s.contains("LOCK=")
        ));
        assert!(matches!(
            assert_alter_supported("ALGORITHM=COPY, LOCK=SHARED"),
            Err(Error::UnsupportedAlter(s)) if s.contains("ALGORITHM=") && s.contains("LOCK=")
        ));
    }

    #[test]
    fn test_rename_rejected() {
        assert!(assert_alter_supported("RENAME TO t2").is_err());
        assert!(assert_alter_supported("RENAME COLUMN a TO b").is_err());
    }

    #[test]
    fn test_index_visibility_rejected() {
        assert!(assert_alter_supported("ALTER INDEX idx_a INVISIBLE").is_err());
        assert!(assert_alter_supported("ALTER INDEX idx_a VISIBLE").is_err());
    }

    #[test]
    fn test_add_unique_detection() {
        assert!(alter_contains_add_unique("ADD UNIQUE INDEX u1 (b)"));
        assert!(alter_contains_add_unique("ADD CONSTRAINT u1 UNIQUE (b)"));
        assert!(!alter_contains_add_unique("ADD INDEX i1 (b)"));
        assert!(!alter_contains_add_unique("ADD COLUMN c INT"));
    }

    #[test]
    fn test_lock_word_without_assignment_is_fine() {
        // A column named "lock" must not trip the clause detector.
        assert!(assert_alter_supported("ADD COLUMN `lock` INT").is_ok());
    }
}
