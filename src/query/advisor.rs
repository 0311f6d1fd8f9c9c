//! Index suggestions from the slow query log.
//!
//! A slow statement on a hot table that filters on one column and sorts on
//! another is a candidate for a composite `(filter, sort)` index. Nothing
//! here touches the schema; suggestions are plain SQL text for an operator.

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use super::rewrite::{bare_table, tables_in};
use super::stats::SlowQueryRecord;
use crate::db::{validate_identifier, SqlDialect};

static WHERE_FILTER: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)\bwhere\s+(?:[a-z_][a-z0-9_]*\.)?([a-z_][a-z0-9_]*)\s*(?:=|<|>|!=|\bin\b|\blike\b|\bis\b)")
    .expect("Invalid where filter regex")
});

static ORDER_BY: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?i)\border\s+by\s+(?:[a-z_][a-z0-9_]*\.)?([a-z_][a-z0-9_]*)(?:\s+(asc|desc)\b)?")
    .expect("Invalid order by regex")
});

static INDEX_COLUMNS: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\(([^()]*)\)").expect("Invalid index column regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSuggestion {
  pub table: String,
  pub columns: Vec<String>,
  /// Ready to run `CREATE INDEX` statement
  pub statement: String,
  pub reason: String,
  /// Slow log entries with this pattern
  pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Candidate {
  table: String,
  filter: String,
  sort: String,
  descending: bool,
}

pub(crate) struct IndexAdvisor {
  hot_tables: Vec<String>,
  /// `(table, leading column, second column)` of indexes that already exist
  known: RwLock<HashSet<(String, String, String)>>,
}

impl IndexAdvisor {
  pub(crate) fn new(hot_tables: &[String]) -> Self {
    Self {
      hot_tables: hot_tables.iter().map(|t| t.to_ascii_lowercase()).collect(),
      known: RwLock::new(HashSet::new()),
    }
  }

  /// Register an existing index by its column list. Only the first two
  /// columns matter for suggestions.
  pub(crate) fn register(&self, table: &str, columns: &[String]) {
    if columns.len() < 2 {
      return;
    }
    self.known.write().insert((
      table.to_ascii_lowercase(),
      columns[0].to_ascii_lowercase(),
      columns[1].to_ascii_lowercase(),
    ));
  }

  pub(crate) fn known_count(&self) -> usize {
    self.known.read().len()
  }

  fn is_known(&self, candidate: &Candidate) -> bool {
    self.known.read().contains(&(
      candidate.table.clone(),
      candidate.filter.clone(),
      candidate.sort.clone(),
    ))
  }

  fn candidate(&self, shape: &str) -> Option<Candidate> {
    let table = tables_in(shape).into_iter().next()?;
    let bare = bare_table(&table);
    if !self.hot_tables.iter().any(|hot| hot == &table || hot == bare) {
      return None;
    }

    let filter = WHERE_FILTER.captures(shape)?[1].to_ascii_lowercase();
    let order = ORDER_BY.captures(shape)?;
    let sort = order[1].to_ascii_lowercase();
    let descending = order
      .get(2)
      .is_some_and(|d| d.as_str().eq_ignore_ascii_case("desc"));

    if filter == sort {
      return None;
    }
    Some(Candidate {
      table,
      filter,
      sort,
      descending,
    })
  }

  pub(crate) fn suggest(&self, slow: &[SlowQueryRecord], dialect: SqlDialect) -> Vec<IndexSuggestion> {
    let mut found: BTreeMap<Candidate, usize> = BTreeMap::new();
    for record in slow {
      if let Some(candidate) = self.candidate(&record.query_shape) {
        *found.entry(candidate).or_insert(0) += 1;
      }
    }

    let mut suggestions: Vec<IndexSuggestion> = found
      .into_iter()
      .filter(|(candidate, _)| !self.is_known(candidate))
      .filter_map(|(candidate, occurrences)| build_suggestion(candidate, occurrences, dialect))
      .collect();
    suggestions.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
    suggestions
  }
}

fn build_suggestion(candidate: Candidate, occurrences: usize, dialect: SqlDialect) -> Option<IndexSuggestion> {
  for ident in [&candidate.table, &candidate.filter, &candidate.sort] {
    if let Err(e) = validate_identifier(ident) {
      tracing::debug!(identifier = %ident, "skipping index suggestion: {}", e);
      return None;
    }
  }

  let name = format!(
    "idx_{}_{}_{}",
    candidate.table.replace('.', "_"),
    candidate.filter,
    candidate.sort
  );
  let sort_column = if candidate.descending {
    format!("{} DESC", candidate.sort)
  } else {
    candidate.sort.clone()
  };
  let concurrently = match dialect {
    SqlDialect::Postgres => "CONCURRENTLY ",
    SqlDialect::Sqlite => "",
  };
  let statement = format!(
    "CREATE INDEX {}IF NOT EXISTS {} ON {} ({}, {})",
    concurrently, name, candidate.table, candidate.filter, sort_column
  );

  Some(IndexSuggestion {
    reason: format!(
      "{} slow quer{} on {} filter by {} and sort by {}",
      occurrences,
      if occurrences == 1 { "y" } else { "ies" },
      candidate.table,
      candidate.filter,
      candidate.sort
    ),
    columns: vec![candidate.filter, candidate.sort],
    table: candidate.table,
    statement,
    occurrences,
  })
}

/// Column list of an index definition such as
/// `CREATE INDEX idx ON public.messages USING btree (conversation_id, created_at DESC)`
pub(crate) fn index_columns(definition: &str) -> Vec<String> {
  let Some(caps) = INDEX_COLUMNS.captures(definition) else {
    return Vec::new();
  };
  caps[1]
    .split(',')
    .filter_map(|col| col.split_whitespace().next())
    .map(|col| col.trim_matches('"').to_ascii_lowercase())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;

  fn hot() -> Vec<String> {
    vec!["messages".into(), "conversations".into(), "users".into()]
  }

  fn slow(shape: &str) -> SlowQueryRecord {
    SlowQueryRecord {
      query_shape: shape.to_string(),
      params: vec![],
      execution_time_ms: 1500.0,
      timestamp: Utc::now(),
    }
  }

  #[test]
  fn test_suggests_composite_index() {
    let advisor = IndexAdvisor::new(&hot());
    let log = vec![
      slow("SELECT * FROM messages WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT 50"),
      slow("SELECT * FROM messages WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT 50"),
    ];

    let suggestions = advisor.suggest(&log, SqlDialect::Postgres);
    assert_eq!(suggestions.len(), 1);
    let s = &suggestions[0];
    assert_eq!(s.table, "messages");
    assert_eq!(s.columns, vec!["conversation_id", "created_at"]);
    assert_eq!(s.occurrences, 2);
    assert_eq!(
      s.statement,
      "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_messages_conversation_id_created_at ON messages (conversation_id, created_at DESC)"
    );
  }

  #[test]
  fn test_sqlite_statement_has_no_concurrently() {
    let advisor = IndexAdvisor::new(&hot());
    let log = vec![slow("SELECT * FROM users WHERE org_id = ? ORDER BY name")];
    let suggestions = advisor.suggest(&log, SqlDialect::Sqlite);
    assert_eq!(
      suggestions[0].statement,
      "CREATE INDEX IF NOT EXISTS idx_users_org_id_name ON users (org_id, name)"
    );
  }

  #[test]
  fn test_skips_cold_tables_and_known_indexes() {
    let advisor = IndexAdvisor::new(&hot());
    let log = vec![
      slow("SELECT * FROM audit_log WHERE actor = $1 ORDER BY at DESC"),
      slow("SELECT * FROM messages WHERE conversation_id = $1 ORDER BY created_at DESC"),
      slow("SELECT * FROM messages WHERE conversation_id = $1"),
    ];

    advisor.register("messages", &["conversation_id".into(), "created_at".into()]);
    assert!(advisor.suggest(&log, SqlDialect::Postgres).is_empty());
  }

  #[test]
  fn test_index_columns() {
    assert_eq!(
      index_columns("CREATE INDEX idx ON public.messages USING btree (conversation_id, created_at DESC)"),
      vec!["conversation_id", "created_at"]
    );
    assert_eq!(
      index_columns("CREATE UNIQUE INDEX u ON \"users\" (\"Email\")"),
      vec!["email"]
    );
    assert!(index_columns("garbage").is_empty());
  }
}
