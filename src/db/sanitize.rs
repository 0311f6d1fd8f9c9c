//! Identifier checks for statements that cannot take bind parameters.
//!
//! Maintenance commands and index suggestions interpolate table and column
//! names into SQL text, so those names are validated first.

/// PostgreSQL truncates identifiers beyond this length
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validates a plain or schema-qualified (`schema.table`) identifier.
/// Each part must start with a letter or underscore and contain only ASCII
/// alphanumerics and underscores.
pub fn validate_identifier(s: &str) -> Result<(), SqlSanitizeError> {
  if s.is_empty() {
    return Err(SqlSanitizeError::EmptyIdentifier);
  }

  let parts: Vec<&str> = s.split('.').collect();
  if parts.len() > 2 || parts.iter().any(|p| p.is_empty()) {
    return Err(SqlSanitizeError::InvalidQualifiedName(s.to_string()));
  }

  for part in parts {
    validate_part(part)?;
  }
  Ok(())
}

fn validate_part(part: &str) -> Result<(), SqlSanitizeError> {
  if part.len() > MAX_IDENTIFIER_LENGTH {
    return Err(SqlSanitizeError::IdentifierTooLong(part.len()));
  }

  let mut chars = part.chars();
  if let Some(first) = chars.next() {
    if !first.is_ascii_alphabetic() && first != '_' {
      return Err(SqlSanitizeError::InvalidIdentifierStart(first));
    }
  }
  if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
    return Err(SqlSanitizeError::InvalidIdentifierChar(c));
  }

  let upper = part.to_ascii_uppercase();
  if SQL_KEYWORDS.contains(&upper.as_str()) {
    return Err(SqlSanitizeError::ReservedKeyword(part.to_string()));
  }
  Ok(())
}

/// SQL sanitization errors
#[derive(Debug, Clone, PartialEq)]
pub enum SqlSanitizeError {
  EmptyIdentifier,
  IdentifierTooLong(usize),
  InvalidIdentifierStart(char),
  InvalidIdentifierChar(char),
  InvalidQualifiedName(String),
  ReservedKeyword(String),
}

impl std::fmt::Display for SqlSanitizeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::EmptyIdentifier => write!(f, "Identifier cannot be empty"),
      Self::IdentifierTooLong(len) => {
        write!(
          f,
          "Identifier too long: {} > {}",
          len, MAX_IDENTIFIER_LENGTH
        )
      }
      Self::InvalidIdentifierStart(c) => {
        write!(
          f,
          "Identifier must start with letter or underscore, got '{}'",
          c
        )
      }
      Self::InvalidIdentifierChar(c) => {
        write!(f, "Invalid character in identifier: '{}'", c)
      }
      Self::InvalidQualifiedName(s) => {
        write!(f, "Expected 'table' or 'schema.table', got '{}'", s)
      }
      Self::ReservedKeyword(s) => write!(f, "'{}' is a reserved SQL keyword", s),
    }
  }
}

impl std::error::Error for SqlSanitizeError {}

/// Keywords rejected as bare identifiers
const SQL_KEYWORDS: &[&str] = &[
  "SELECT",
  "INSERT",
  "UPDATE",
  "DELETE",
  "DROP",
  "CREATE",
  "ALTER",
  "TABLE",
  "INDEX",
  "FROM",
  "WHERE",
  "AND",
  "OR",
  "NOT",
  "NULL",
  "ORDER",
  "BY",
  "LIMIT",
  "JOIN",
  "UNION",
  "GROUP",
  "HAVING",
  "INTO",
  "VALUES",
  "SET",
  "GRANT",
  "REVOKE",
  "VACUUM",
  "ANALYZE",
  "TRUNCATE",
];
