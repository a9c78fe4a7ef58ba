//! Atomic per-scope sequence generation.
//!
//! The next value is read and claimed by a single INSERT whose VALUES embeds
//! `COALESCE(MAX(seq), 0) + 1` over the scope's rows locked `FOR UPDATE`. The
//! surrounding transaction first takes `pg_advisory_xact_lock(hashtext(..))` on
//! `table:scope` so that a brand-new scope (no rows to lock yet) is serialized
//! as well.

use crate::database::statement::{validate_identifier, Statement, TableAllowList};
use crate::database::types::Fields;
use crate::error::{WardenError, WardenResult};
use serde_json::Value;

pub const ADVISORY_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtext($1))";

/// A row to insert with the next sequence value of its scope, e.g. the next
/// case number of a guild in `mod_cases`
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRequest {
    pub table: String,
    pub scope_column: String,
    pub scope_value: Value,
    pub sequence_column: String,
    /// Remaining columns of the new row
    pub fields: Fields,
}

impl SequenceRequest {
    pub fn new(
        table: impl Into<String>,
        scope_column: impl Into<String>,
        scope_value: impl Into<Value>,
        sequence_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            scope_column: scope_column.into(),
            scope_value: scope_value.into(),
            sequence_column: sequence_column.into(),
            fields: Fields::new(),
        }
    }

    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    /// `table:scope`, hashed server-side into the advisory lock id
    pub fn lock_key(&self) -> String {
        let scope = match &self.scope_value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        format!("{}:{}", self.table, scope)
    }

    /// The claiming INSERT; `$1` is the scope value
    pub fn build(&self, allow_list: &TableAllowList) -> WardenResult<Statement> {
        allow_list.validate_table(&self.table)?;
        validate_identifier(&self.scope_column)?;
        validate_identifier(&self.sequence_column)?;
        if self.scope_column == self.sequence_column {
            return Err(WardenError::validation(
                "scope and sequence columns must differ",
            ));
        }
        for column in self.fields.columns() {
            validate_identifier(column)?;
            if column == self.scope_column || column == self.sequence_column {
                return Err(WardenError::validation(format!(
                    "column '{column}' is set by the sequence generator"
                )));
            }
        }

        let table = &self.table;
        let scope = &self.scope_column;
        let seq = &self.sequence_column;

        let mut columns = vec![scope.as_str(), seq.as_str()];
        let mut placeholders = vec![
            "$1".to_string(),
            format!(
                "(SELECT COALESCE(MAX({seq}), 0) + 1 FROM (SELECT {seq} FROM {table} WHERE {scope} = $1 FOR UPDATE) AS scoped)"
            ),
        ];
        let mut params = vec![self.scope_value.clone()];
        for (column, value) in self.fields.iter() {
            params.push(value.clone());
            columns.push(column);
            placeholders.push(format!("${}", params.len()));
        }

        Ok(Statement {
            sql: format!(
                "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
                columns.join(", "),
                placeholders.join(", ")
            ),
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn allow_list() -> TableAllowList {
        TableAllowList::new(["mod_cases"]).unwrap()
    }

    #[test]
    fn test_claims_in_one_statement() {
        let request = SequenceRequest::new("mod_cases", "guild_id", "42", "case_number")
            .with_fields(Fields::new().with("action", "warn").with("moderator_id", "7"));
        let statement = request.build(&allow_list()).unwrap();

        assert_eq!(
            statement.sql,
            "INSERT INTO mod_cases (guild_id, case_number, action, moderator_id) VALUES ($1, \
             (SELECT COALESCE(MAX(case_number), 0) + 1 FROM (SELECT case_number FROM mod_cases \
             WHERE guild_id = $1 FOR UPDATE) AS scoped), $2, $3) RETURNING *"
        );
        assert_eq!(statement.params, vec![json!("42"), json!("warn"), json!("7")]);
        assert_eq!(request.lock_key(), "mod_cases:42");
    }

    #[test]
    fn test_numeric_scope_lock_key() {
        let request = SequenceRequest::new("mod_cases", "guild_id", 42, "case_number");
        assert_eq!(request.lock_key(), "mod_cases:42");
    }

    #[test]
    fn test_rejects_unsafe_requests() {
        let list = allow_list();
        assert!(SequenceRequest::new("users", "guild_id", "1", "n").build(&list).is_err());
        assert!(SequenceRequest::new("mod_cases", "guild_id;", "1", "n").build(&list).is_err());
        assert!(SequenceRequest::new("mod_cases", "n", "1", "n").build(&list).is_err());
        let clash = SequenceRequest::new("mod_cases", "guild_id", "1", "n")
            .with_fields(Fields::new().with("n", 5));
        assert!(clash.build(&list).is_err());
    }
}
