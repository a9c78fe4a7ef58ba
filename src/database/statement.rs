//! Injection-safe statement building and read/write routing.
//!
//! Table names come from an allow-list fixed at startup; every column name must
//! match `^[A-Za-z_][A-Za-z0-9_]*$`. Values only ever travel as bind parameters.

use crate::database::types::Fields;
use crate::error::{WardenError, WardenResult};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::OnceLock;

static IDENTIFIER: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> &'static Regex {
    IDENTIFIER.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is a valid regex")
    })
}

pub fn is_valid_identifier(identifier: &str) -> bool {
    identifier_regex().is_match(identifier)
}

pub fn validate_identifier(identifier: &str) -> WardenResult<()> {
    if is_valid_identifier(identifier) {
        Ok(())
    } else {
        Err(WardenError::validation(format!(
            "invalid identifier '{identifier}'"
        )))
    }
}

fn validate_fields(fields: &Fields) -> WardenResult<()> {
    fields.columns().try_for_each(validate_identifier)
}

/// A SQL string plus its positional bind parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn bind(&mut self, value: &Value) -> usize {
        self.params.push(value.clone());
        self.params.len()
    }
}

/// Tables the dynamic builders may touch
#[derive(Debug, Clone)]
pub struct TableAllowList {
    tables: HashSet<String>,
}

impl TableAllowList {
    /// Entries failing the identifier pattern are rejected up front
    pub fn new<I, S>(tables: I) -> WardenResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = HashSet::new();
        for table in tables {
            let table = table.into();
            validate_identifier(&table)?;
            set.insert(table);
        }
        Ok(Self { tables: set })
    }

    pub fn validate_table(&self, table: &str) -> WardenResult<()> {
        if !is_valid_identifier(table) {
            return Err(WardenError::validation(format!(
                "invalid table name '{table}'"
            )));
        }
        if !self.tables.contains(table) {
            return Err(WardenError::validation(format!(
                "table '{table}' is not in the allow-list"
            )));
        }
        Ok(())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// `INSERT INTO t (a, b) VALUES ($1, $2) RETURNING *`
    pub fn build_insert(&self, table: &str, data: &Fields) -> WardenResult<Statement> {
        self.validate_table(table)?;
        if data.is_empty() {
            return Err(WardenError::validation(format!(
                "insert into '{table}' requires at least one column"
            )));
        }
        validate_fields(data)?;

        let mut statement = Statement {
            sql: String::new(),
            params: Vec::with_capacity(data.len()),
        };
        let columns = data.columns().collect::<Vec<_>>().join(", ");
        let placeholders = data
            .iter()
            .map(|(_, value)| format!("${}", statement.bind(value)))
            .collect::<Vec<_>>()
            .join(", ");
        statement.sql = format!("INSERT INTO {table} ({columns}) VALUES ({placeholders}) RETURNING *");
        Ok(statement)
    }

    /// `UPDATE t SET a = $1 WHERE b = $2 RETURNING *`
    pub fn build_update(
        &self,
        table: &str,
        data: &Fields,
        conditions: &Fields,
    ) -> WardenResult<Statement> {
        self.validate_table(table)?;
        if data.is_empty() {
            return Err(WardenError::validation(format!(
                "update of '{table}' requires at least one column to set"
            )));
        }
        require_conditions(table, conditions, "update")?;
        validate_fields(data)?;
        validate_fields(conditions)?;

        let mut statement = Statement {
            sql: String::new(),
            params: Vec::with_capacity(data.len() + conditions.len()),
        };
        let assignments = data
            .iter()
            .map(|(column, value)| format!("{column} = ${}", statement.bind(value)))
            .collect::<Vec<_>>()
            .join(", ");
        let where_clause = where_clause(&mut statement, conditions);
        statement.sql = format!("UPDATE {table} SET {assignments} WHERE {where_clause} RETURNING *");
        Ok(statement)
    }

    /// `DELETE FROM t WHERE a = $1 RETURNING *`
    pub fn build_delete(&self, table: &str, conditions: &Fields) -> WardenResult<Statement> {
        self.validate_table(table)?;
        require_conditions(table, conditions, "delete")?;
        validate_fields(conditions)?;

        let mut statement = Statement {
            sql: String::new(),
            params: Vec::with_capacity(conditions.len()),
        };
        let where_clause = where_clause(&mut statement, conditions);
        statement.sql = format!("DELETE FROM {table} WHERE {where_clause} RETURNING *");
        Ok(statement)
    }

    /// `INSERT ... ON CONFLICT (k) DO UPDATE SET c = EXCLUDED.c RETURNING *`.
    /// When every column is a conflict column the statement becomes `DO NOTHING`.
    pub fn build_upsert(
        &self,
        table: &str,
        data: &Fields,
        conflict_columns: &[String],
    ) -> WardenResult<Statement> {
        if conflict_columns.is_empty() {
            return Err(WardenError::validation(format!(
                "upsert into '{table}' requires at least one conflict column"
            )));
        }
        for column in conflict_columns {
            validate_identifier(column)?;
            if data.get(column).is_none() {
                return Err(WardenError::validation(format!(
                    "conflict column '{column}' missing from upsert data"
                )));
            }
        }

        let mut statement = self.build_insert(table, data)?;
        let insert = statement
            .sql
            .trim_end_matches(" RETURNING *")
            .to_string();

        let updates = data
            .columns()
            .filter(|column| !conflict_columns.iter().any(|c| c == column))
            .map(|column| format!("{column} = EXCLUDED.{column}"))
            .collect::<Vec<_>>();

        let mut sql = format!("{insert} ON CONFLICT ({})", conflict_columns.join(", "));
        if updates.is_empty() {
            sql.push_str(" DO NOTHING");
        } else {
            let _ = write!(sql, " DO UPDATE SET {}", updates.join(", "));
        }
        sql.push_str(" RETURNING *");
        statement.sql = sql;
        Ok(statement)
    }
}

fn require_conditions(table: &str, conditions: &Fields, operation: &str) -> WardenResult<()> {
    if conditions.is_empty() {
        return Err(WardenError::validation(format!(
            "{operation} on '{table}' requires a non-empty WHERE clause"
        )));
    }
    Ok(())
}

/// `a = $n AND b IS NULL`
fn where_clause(statement: &mut Statement, conditions: &Fields) -> String {
    conditions
        .iter()
        .map(|(column, value)| match value {
            Value::Null => format!("{column} IS NULL"),
            _ => format!("{column} = ${}", statement.bind(value)),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Uppercased bare words of a statement, skipping string literals, quoted
/// identifiers, dollar-quoted bodies and comments.
fn keywords(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' => {
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\'' {
                        if chars.get(i + 1) == Some(&'\'') {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    i += 1;
                }
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '$' => {
                // Positional parameter ($1) or dollar-quoted body ($tag$ ... $tag$)
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if chars.get(i) == Some(&'$') {
                    let tag: String = chars[start..=i].iter().collect();
                    let tag_chars: Vec<char> = tag.chars().collect();
                    i += 1;
                    while i < chars.len() && !chars[i..].starts_with(&tag_chars) {
                        i += 1;
                    }
                    i += tag_chars.len();
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(chars[start..i].iter().collect::<String>().to_uppercase());
            }
            _ => i += 1,
        }
    }

    tokens
}

const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "INTO", "TRUNCATE", "CREATE", "ALTER", "DROP",
    "GRANT", "REVOKE", "COPY", "CALL", "NEXTVAL", "SETVAL",
];

/// True only for a `SELECT` (or a `WITH` whose CTEs do not mutate) without a
/// row-locking clause and without `SELECT ... INTO`.
pub fn is_read_only(sql: &str) -> bool {
    let tokens = keywords(sql);
    match tokens.first().map(String::as_str) {
        Some("SELECT") | Some("WITH") => {}
        _ => return false,
    }

    if tokens.iter().any(|t| {
        MUTATING_KEYWORDS.contains(&t.as_str()) || t.starts_with("PG_ADVISORY")
    }) {
        return false;
    }

    // FOR UPDATE / FOR NO KEY UPDATE / FOR SHARE / FOR KEY SHARE
    !tokens.windows(2).any(|pair| {
        pair[0] == "FOR" && matches!(pair[1].as_str(), "UPDATE" | "SHARE" | "NO" | "KEY")
    })
}

/// Whether the statement produces a result set that should be fetched
pub fn returns_rows(sql: &str) -> bool {
    let tokens = keywords(sql);
    matches!(
        tokens.first().map(String::as_str),
        Some("SELECT" | "WITH" | "VALUES" | "SHOW" | "TABLE" | "EXPLAIN")
    ) || tokens.iter().any(|t| t == "RETURNING")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn allow_list() -> TableAllowList {
        TableAllowList::new(crate::constants::DEFAULT_ALLOWED_TABLES.iter().copied()).unwrap()
    }

    #[test]
    fn test_validate_table() {
        let list = allow_list();
        assert!(matches!(
            list.validate_table("users"),
            Err(WardenError::ValidationError(_))
        ));
        assert!(list.validate_table("guild_settings").is_ok());
        assert!(list.validate_table("guild_settings; DROP TABLE bans").is_err());
    }

    #[test]
    fn test_build_insert_binds_every_value() {
        let data = Fields::new().with("guild_id", "123").with("prefix", "!");
        let statement = allow_list().build_insert("guild_settings", &data).unwrap();

        assert_eq!(
            statement.sql,
            "INSERT INTO guild_settings (guild_id, prefix) VALUES ($1, $2) RETURNING *"
        );
        assert_eq!(statement.params, vec![json!("123"), json!("!")]);
    }

    #[test]
    fn test_build_insert_rejects_bad_column() {
        let data = Fields::new().with("prefix) VALUES ('x'); --", "!");
        assert!(matches!(
            allow_list().build_insert("guild_settings", &data),
            Err(WardenError::ValidationError(_))
        ));
    }

    #[test]
    fn test_build_update_and_delete_require_where() {
        let list = allow_list();
        let data = Fields::new().with("prefix", "?");
        assert!(list.build_update("guild_settings", &data, &Fields::new()).is_err());
        assert!(list.build_delete("warnings", &Fields::new()).is_err());

        let statement = list
            .build_update(
                "guild_settings",
                &data,
                &Fields::new().with("guild_id", "123").with("deleted_at", Value::Null),
            )
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE guild_settings SET prefix = $1 WHERE guild_id = $2 AND deleted_at IS NULL RETURNING *"
        );
        assert_eq!(statement.params.len(), 2);

        let statement = list
            .build_delete("warnings", &Fields::new().with("id", 9))
            .unwrap();
        assert_eq!(statement.sql, "DELETE FROM warnings WHERE id = $1 RETURNING *");
    }

    #[test]
    fn test_build_upsert() {
        let list = allow_list();
        let data = Fields::new().with("guild_id", "123").with("prefix", "!");
        let statement = list
            .build_upsert("guild_settings", &data, &["guild_id".to_string()])
            .unwrap();
        assert_eq!(
            statement.sql,
            "INSERT INTO guild_settings (guild_id, prefix) VALUES ($1, $2) \
             ON CONFLICT (guild_id) DO UPDATE SET prefix = EXCLUDED.prefix RETURNING *"
        );

        let only_key = Fields::new().with("guild_id", "123");
        let statement = list
            .build_upsert("guild_settings", &only_key, &["guild_id".to_string()])
            .unwrap();
        assert!(statement.sql.contains("DO NOTHING"));

        assert!(list
            .build_upsert("guild_settings", &data, &["missing".to_string()])
            .is_err());
    }

    #[test]
    fn test_read_only_detection() {
        assert!(is_read_only("SELECT 1"));
        assert!(is_read_only("  select * from mod_cases where guild_id = $1"));
        assert!(is_read_only(
            "WITH recent AS (SELECT * FROM warnings) SELECT count(*) FROM recent"
        ));
        assert!(is_read_only("SELECT 'insert into x' AS label, \"update\" FROM t"));
        assert!(is_read_only("SELECT 1 -- FOR UPDATE\n"));

        assert!(!is_read_only("SELECT * FROM mod_cases FOR UPDATE"));
        assert!(!is_read_only("SELECT * FROM mod_cases FOR NO KEY UPDATE"));
        assert!(!is_read_only("SELECT * FROM mod_cases FOR SHARE"));
        assert!(!is_read_only("SELECT * FROM mod_cases FOR KEY SHARE"));
        assert!(!is_read_only("SELECT * INTO backup FROM mod_cases"));
        assert!(!is_read_only(
            "WITH moved AS (DELETE FROM mutes RETURNING *) SELECT * FROM moved"
        ));
        assert!(!is_read_only("INSERT INTO bans (user_id) VALUES ($1)"));
        assert!(!is_read_only("SELECT nextval('case_seq')"));
        assert!(!is_read_only("SELECT pg_advisory_xact_lock(1)"));
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT 1"));
        assert!(returns_rows("UPDATE mutes SET active = false WHERE id = $1 RETURNING *"));
        assert!(!returns_rows("UPDATE mutes SET active = false WHERE id = $1"));
        assert!(!returns_rows("DELETE FROM mutes WHERE note = 'returning soon'"));
    }

    #[test]
    fn test_dollar_quoted_bodies_are_skipped() {
        assert!(is_read_only("SELECT $body$ DELETE FROM x $body$ AS text"));
        assert!(is_read_only("SELECT * FROM t WHERE id = $1"));
    }

    proptest! {
        #[test]
        fn prop_identifier_pattern(ident in "[A-Za-z_][A-Za-z0-9_]{0,30}") {
            prop_assert!(is_valid_identifier(&ident));
        }

        #[test]
        fn prop_identifiers_with_punctuation_rejected(
            head in "[A-Za-z_]{1,8}",
            bad in "[ ;'\"()\\-*=.,]",
            tail in "[A-Za-z0-9_]{0,8}",
        ) {
            let ident = format!("{head}{bad}{tail}");
            prop_assert!(!is_valid_identifier(&ident));
        }

        #[test]
        fn prop_leading_digit_rejected(ident in "[0-9][A-Za-z0-9_]{0,10}") {
            prop_assert!(!is_valid_identifier(&ident));
        }
    }
}
