//! SQL quoting, expression rewriting and advisory-lock keys.

use regex::Regex;

use crate::error::Result;

/// Quotes a SQL identifier, doubling any embedded double quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a schema-qualified identifier.
#[must_use]
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Quotes a SQL string literal, doubling any embedded single quotes.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Rewrites whole-word references to a column inside a SQL expression so a
/// user-authored expression (a CHECK body, an up/down expression) can be
/// applied against a duplicated physical column. This is a textual rewrite,
/// not a parse; generated target names are always plain lowercase
/// identifiers, so the replacement needs no quoting.
pub fn rewrite_column_refs(expression: &str, from: &str, to: &str) -> Result<String> {
    let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(from)))?;
    Ok(pattern.replace_all(expression, to).into_owned())
}

/// Advisory-lock key for a target schema.
///
/// Two engine instances must derive the same key for the same schema name
/// across processes and releases, so this uses FNV-1a rather than the
/// standard library's randomized hasher.
#[must_use]
pub fn advisory_lock_key(schema: &str) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in schema.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("public", "users"), "\"public\".\"users\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn test_rewrite_column_refs_whole_words_only() {
        let rewritten = rewrite_column_refs("age > 0 AND page_count > age", "age", "_pgroll_new_age")
            .unwrap();
        assert_eq!(rewritten, "_pgroll_new_age > 0 AND page_count > _pgroll_new_age");
    }

    #[test]
    fn test_rewrite_column_refs_quoted() {
        let rewritten = rewrite_column_refs("\"age\" IS NOT NULL", "age", "_pgroll_new_age").unwrap();
        assert_eq!(rewritten, "\"_pgroll_new_age\" IS NOT NULL");
    }

    #[test]
    fn test_advisory_lock_key_is_stable() {
        assert_eq!(advisory_lock_key("public"), advisory_lock_key("public"));
        assert_ne!(advisory_lock_key("public"), advisory_lock_key("other"));
    }
}
