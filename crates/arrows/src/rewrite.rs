// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Placeholder table rewriting for SQL fragments
//!
//! Callers write SQL against a placeholder table name (conventionally `self`)
//! and the handles rewrite it to reference a generated CTE over the real
//! physical location. This is a text transform built from two regex passes,
//! not a SQL parser:
//!
//! 1. **Table definitions.** Every `FROM` / `JOIN` keyword followed by a
//!    comma-separated list of `[schema.]table [[AS] alias]` specs. Specs whose
//!    bare table name equals the placeholder (case-insensitive) get the
//!    replacement name; schema prefixes and aliases are kept. A clause word
//!    (`ON`, `WHERE`, `JOIN`, ...) after a table is never taken as its alias.
//!    The list is re-joined with `", "`.
//! 2. **Qualified columns.** Every whole-word occurrence of the placeholder
//!    immediately followed by `.` (`self.id`, `self.*`) gets the replacement.
//!
//! Malformed input produces malformed output. Nested scopes are not
//! distinguished: every occurrence anywhere in the string is rewritten,
//! including `self.col` inside a sub-select that re-aliased `self`.

use crate::{Error, Result};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// The conventional placeholder table name.
pub const SELF_PLACEHOLDER: &str = "self";

static TABLE_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:FROM|JOIN)\s+").expect("table keyword regex"));

static TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\w+\.)?\w+").expect("table name regex"));

static TABLE_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s+(?:(AS)\s+)?(\w+)").expect("table alias regex")
});

static LIST_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*,\s*").expect("list separator regex"));

/// Words that end a table spec rather than alias it.
const CLAUSE_WORDS: &[&str] = &[
    "as", "on", "using", "where", "group", "order", "having", "limit", "offset", "fetch",
    "union", "intersect", "except", "join", "inner", "left", "right", "full", "outer", "cross",
    "natural", "lateral", "window", "qualify", "sample", "tablesample", "pivot", "unpivot",
    "returning", "set", "values",
];

static LEADING_WITH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*WITH(\s+RECURSIVE)?\s+").expect("leading WITH regex")
});

/// Compiled rewriter for one placeholder name.
#[derive(Debug, Clone)]
pub struct Rewriter {
    placeholder: String,
    column_ref: Regex,
}

impl Rewriter {
    pub fn new(placeholder: &str) -> Result<Self> {
        if placeholder.is_empty() || !placeholder.chars().all(|c| c.is_alphanumeric() || c == '_')
        {
            return Err(Error::Configuration(format!(
                "placeholder must be a plain identifier: {placeholder:?}"
            )));
        }
        let column_ref = Regex::new(&format!(r"(?i)\b{}\b\.", regex::escape(placeholder)))
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(Self {
            placeholder: placeholder.to_string(),
            column_ref,
        })
    }

    #[must_use]
    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Apply both passes. Table definitions are rewritten first.
    #[must_use]
    pub fn rewrite(&self, sql: &str, replacement: &str) -> String {
        let sql = self.rewrite_table_definitions(sql, replacement);
        self.rewrite_column_references(&sql, replacement)
    }

    fn rewrite_table_definitions(&self, sql: &str, replacement: &str) -> String {
        let placeholder = self.placeholder.to_lowercase();
        let mut out = String::with_capacity(sql.len());
        let mut pos = 0;

        while let Some(keyword) = TABLE_KEYWORD.find_at(sql, pos) {
            out.push_str(&sql[pos..keyword.end()]);
            let mut cursor = keyword.end();
            let mut specs = Vec::new();

            while let Some(name) = TABLE_NAME.find(&sql[cursor..]) {
                let mut spec = rewrite_table_name(name.as_str(), &placeholder, replacement);
                cursor += name.end();

                if let Some(alias) = TABLE_ALIAS.captures(&sql[cursor..])
                    && !CLAUSE_WORDS.contains(&alias[2].to_lowercase().as_str())
                {
                    if let Some(as_word) = alias.get(1) {
                        spec.push(' ');
                        spec.push_str(as_word.as_str());
                    }
                    spec.push(' ');
                    spec.push_str(&alias[2]);
                    cursor += alias[0].len();
                }
                specs.push(spec);

                match LIST_SEPARATOR.find(&sql[cursor..]) {
                    Some(sep) if TABLE_NAME.is_match(&sql[cursor + sep.end()..]) => {
                        cursor += sep.end();
                    }
                    _ => break,
                }
            }

            out.push_str(&specs.join(", "));
            pos = cursor;
        }
        out.push_str(&sql[pos..]);
        out
    }

    fn rewrite_column_references(&self, sql: &str, replacement: &str) -> String {
        self.column_ref
            .replace_all(sql, |_: &Captures<'_>| format!("{replacement}."))
            .into_owned()
    }
}

/// Rewrite one `[schema.]table` name.
fn rewrite_table_name(table: &str, placeholder: &str, replacement: &str) -> String {
    let (schema, name) = match table.split_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    };
    if name.to_lowercase() != placeholder {
        return table.to_string();
    }
    match schema {
        Some(schema) => format!("{schema}.{replacement}"),
        None => replacement.to_string(),
    }
}

/// Rewrite `placeholder` references in `sql` to `replacement`.
pub fn rewrite(sql: &str, placeholder: &str, replacement: &str) -> Result<String> {
    Ok(Rewriter::new(placeholder)?.rewrite(sql, replacement))
}

/// Rewrite the `self` placeholder in `fragment` to `cte_name` and prepend a
/// CTE selecting everything from `source`.
///
/// A fragment that starts its own `WITH` clause gets the generated CTE merged
/// in front of its CTE list.
pub fn wrap_in_cte(fragment: &str, cte_name: &str, source: &str) -> Result<String> {
    wrap_placeholder_in_cte(fragment, SELF_PLACEHOLDER, cte_name, source)
}

pub fn wrap_placeholder_in_cte(
    fragment: &str,
    placeholder: &str,
    cte_name: &str,
    source: &str,
) -> Result<String> {
    let rewritten = rewrite(fragment, placeholder, cte_name)?;
    let cte = format!("{cte_name} AS (SELECT * FROM {source})");

    let sql = match LEADING_WITH.captures(&rewritten) {
        Some(caps) => {
            let recursive = if caps.get(1).is_some() { " RECURSIVE" } else { "" };
            let rest = &rewritten[caps.get(0).map_or(0, |m| m.end())..];
            format!("WITH{recursive} {cte}, {rest}")
        }
        None => format!("WITH {cte}\n{}", rewritten.trim()),
    };
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_to(sql: &str, replacement: &str) -> String {
        rewrite(sql, "self", replacement).expect("valid placeholder")
    }

    #[test]
    fn test_simple_from() {
        assert_eq!(self_to("SELECT * FROM self", "t1"), "SELECT * FROM t1");
    }

    #[test]
    fn test_alias_kept_and_columns_rewritten() {
        let sql = "SELECT self.id, x.y FROM self s JOIN other o ON s.id=o.id";
        assert_eq!(
            self_to(sql, "cte1"),
            "SELECT cte1.id, x.y FROM cte1 s JOIN other o ON s.id=o.id"
        );
    }

    #[test]
    fn test_join_after_plain_table() {
        assert_eq!(
            self_to("SELECT * FROM a JOIN self ON a.id = self.id", "t1"),
            "SELECT * FROM a JOIN t1 ON a.id = t1.id"
        );
        assert_eq!(
            self_to("SELECT * FROM self LEFT JOIN b USING (id) WHERE b.x IS NULL", "t1"),
            "SELECT * FROM t1 LEFT JOIN b USING (id) WHERE b.x IS NULL"
        );
    }

    #[test]
    fn test_as_alias_kept() {
        assert_eq!(
            self_to("select a from SELF AS s where s.a > 1", "cte1"),
            "select a from cte1 AS s where s.a > 1"
        );
    }

    #[test]
    fn test_schema_prefix_kept() {
        assert_eq!(
            self_to("SELECT * FROM schema1.self", "cte1"),
            "SELECT * FROM schema1.cte1"
        );
    }

    #[test]
    fn test_partial_words_untouched() {
        let sql = "SELECT selfish.a, myself.b, self_archive.c FROM selfish JOIN myself ON 1=1 JOIN self_archive ON 1=1";
        assert_eq!(self_to(sql, "t1"), sql);
    }

    #[test]
    fn test_comma_list_normalized() {
        assert_eq!(
            self_to("SELECT * FROM a x ,self,  b", "t1"),
            "SELECT * FROM a x, t1, b"
        );
    }

    #[test]
    fn test_keyword_case_and_leading_whitespace_kept() {
        assert_eq!(
            self_to("select *\n  from\tself", "t1"),
            "select *\n  from\tt1"
        );
    }

    #[test]
    fn test_nested_subselect_rewritten() {
        assert_eq!(
            self_to(
                "SELECT * FROM (SELECT self.id FROM self WHERE self.x = 1) q",
                "t1"
            ),
            "SELECT * FROM (SELECT t1.id FROM t1 WHERE t1.x = 1) q"
        );
    }

    #[test]
    fn test_star_column_reference() {
        assert_eq!(
            self_to("SELECT Self.* FROM other", "t1"),
            "SELECT t1.* FROM other"
        );
    }

    #[test]
    fn test_custom_placeholder() {
        assert_eq!(
            rewrite("SELECT df.a FROM df", "df", "t9").expect("valid"),
            "SELECT t9.a FROM t9"
        );
    }

    #[test]
    fn test_invalid_placeholder() {
        assert!(Rewriter::new("").is_err());
        assert!(Rewriter::new("a b").is_err());
    }

    #[test]
    fn test_wrap_in_cte() {
        let sql = wrap_in_cte("SELECT count(*) FROM self", "tmp", "read_parquet('x')")
            .expect("wrap");
        assert_eq!(
            sql,
            "WITH tmp AS (SELECT * FROM read_parquet('x'))\nSELECT count(*) FROM tmp"
        );
    }

    #[test]
    fn test_wrap_merges_existing_with() {
        let sql = wrap_in_cte(
            "with a as (select * from self) select * from a",
            "tmp",
            "src",
        )
        .expect("wrap");
        assert_eq!(
            sql,
            "WITH tmp AS (SELECT * FROM src), a as (select * from tmp) select * from a"
        );

        let sql = wrap_in_cte("WITH RECURSIVE r AS (SELECT 1) SELECT * FROM r", "tmp", "src")
            .expect("wrap");
        assert!(sql.starts_with("WITH RECURSIVE tmp AS (SELECT * FROM src), r AS"));
    }
}
