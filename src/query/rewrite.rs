//! Deterministic statement rewriting and table extraction.
//!
//! Everything here works on SQL text with regular expressions. It is only
//! meant for the statement shapes an application sends, not arbitrary SQL.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// `... WHERE id = $1` or `... WHERE m.id = 42` at the end of a SELECT
static PRIMARY_KEY_LOOKUP: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?is)^select\s.+\swhere\s+(?:[a-z_][a-z0-9_]*\.)?id\s*=\s*(?:\$\d+|\?\d*|'[^']*'|\d+)$")
    .expect("Invalid primary key lookup regex")
});

static LIMIT_CLAUSE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)\blimit\s").expect("Invalid limit regex"));

static TABLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r#"(?i)\b(?:from|join|into|update)\s+"?([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)?)"?"#)
    .expect("Invalid table reference regex")
});

const WRITE_KEYWORDS: &[&str] = &[
  "INSERT", "UPDATE", "DELETE", "UPSERT", "REPLACE", "MERGE", "CREATE", "DROP", "ALTER", "TRUNCATE",
];

/// Collapse whitespace runs outside single-quoted literals and drop a
/// trailing semicolon
pub fn normalize_whitespace(sql: &str) -> String {
  let mut out = String::with_capacity(sql.len());
  let mut in_literal = false;
  let mut pending_space = false;

  for c in sql.trim().chars() {
    if in_literal {
      out.push(c);
      if c == '\'' {
        in_literal = false;
      }
      continue;
    }
    if c.is_whitespace() {
      pending_space = true;
      continue;
    }
    if pending_space && !out.is_empty() {
      out.push(' ');
    }
    pending_space = false;
    if c == '\'' {
      in_literal = true;
    }
    out.push(c);
  }

  while out.ends_with(';') || out.ends_with(' ') {
    out.pop();
  }
  out
}

/// Append `LIMIT 1` to a single-row primary key lookup that has no limit
pub fn limit_primary_key_lookup(sql: &str) -> Cow<'_, str> {
  if PRIMARY_KEY_LOOKUP.is_match(sql) && !LIMIT_CLAUSE.is_match(sql) {
    Cow::Owned(format!("{} LIMIT 1", sql))
  } else {
    Cow::Borrowed(sql)
  }
}

/// Full rewrite applied before execution
pub fn rewrite(sql: &str) -> String {
  let normalized = normalize_whitespace(sql);
  limit_primary_key_lookup(&normalized).into_owned()
}

/// Tables referenced by FROM, JOIN, INTO and UPDATE, lowercased, in order of
/// first appearance
pub fn tables_in(sql: &str) -> Vec<String> {
  let mut tables: Vec<String> = Vec::new();
  for caps in TABLE_REFERENCE.captures_iter(sql) {
    let table = caps[1].to_ascii_lowercase();
    if !tables.contains(&table) {
      tables.push(table);
    }
  }
  tables
}

/// Table name without its schema qualifier
pub fn bare_table(table: &str) -> &str {
  table.rsplit('.').next().unwrap_or(table)
}

/// Whether the statement modifies data or schema. CTEs count as writes when
/// their body contains a write keyword.
pub fn is_write(sql: &str) -> bool {
  let upper = sql.trim_start().to_ascii_uppercase();
  let first = upper
    .split(|c: char| !c.is_ascii_alphabetic())
    .find(|w| !w.is_empty())
    .unwrap_or("");

  if first == "WITH" {
    return upper
      .split(|c: char| !c.is_ascii_alphabetic())
      .any(|w| matches!(w, "INSERT" | "UPDATE" | "DELETE"));
  }
  WRITE_KEYWORDS.contains(&first)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalize_whitespace() {
    assert_eq!(
      normalize_whitespace("  SELECT *\n  FROM   messages\tWHERE id = $1 ;  "),
      "SELECT * FROM messages WHERE id = $1"
    );
  }

  #[test]
  fn test_normalize_keeps_literals() {
    assert_eq!(
      normalize_whitespace("SELECT  'a   b'  FROM t"),
      "SELECT 'a   b' FROM t"
    );
  }

  #[test]
  fn test_primary_key_lookup_gets_limit() {
    assert_eq!(
      rewrite("SELECT * FROM users WHERE id = $1"),
      "SELECT * FROM users WHERE id = $1 LIMIT 1"
    );
    assert_eq!(
      rewrite("SELECT u.name FROM users u WHERE u.id = 42"),
      "SELECT u.name FROM users u WHERE u.id = 42 LIMIT 1"
    );
  }

  #[test]
  fn test_other_shapes_untouched() {
    let with_limit = "SELECT * FROM users WHERE id = $1 LIMIT 1";
    assert_eq!(rewrite(with_limit), with_limit);

    let range = "SELECT * FROM messages WHERE conversation_id = $1";
    assert_eq!(rewrite(range), range);

    let compound = "SELECT * FROM users WHERE id = $1 AND deleted = false";
    assert_eq!(rewrite(compound), compound);

    let update = "UPDATE users SET name = $2 WHERE id = $1";
    assert_eq!(rewrite(update), update);
  }

  #[test]
  fn test_tables_in() {
    assert_eq!(
      tables_in("SELECT * FROM messages m JOIN users u ON u.id = m.user_id"),
      vec!["messages", "users"]
    );
    assert_eq!(tables_in("INSERT INTO public.Messages (body) VALUES ($1)"), vec!["public.messages"]);
    assert_eq!(tables_in("UPDATE \"users\" SET name = $1"), vec!["users"]);
    assert_eq!(tables_in("DELETE FROM messages WHERE id = $1"), vec!["messages"]);
    assert!(tables_in("SELECT 1").is_empty());
  }

  #[test]
  fn test_bare_table() {
    assert_eq!(bare_table("public.messages"), "messages");
    assert_eq!(bare_table("messages"), "messages");
  }

  #[test]
  fn test_is_write() {
    assert!(is_write("insert into messages (body) values ($1)"));
    assert!(is_write("  UPDATE users SET name = $1"));
    assert!(is_write("WITH gone AS (DELETE FROM messages RETURNING id) SELECT count(*) FROM gone"));
    assert!(!is_write("SELECT * FROM messages"));
    assert!(!is_write("WITH recent AS (SELECT * FROM messages) SELECT * FROM recent"));
  }
}
