//! Backend-specific SQL for defaults restoration and read-only sessions.

use serde::{Deserialize, Serialize};

/// SQL flavour spoken by a backend link.
///
/// Only the handful of statements the lifecycle engine itself issues are
/// covered here: the alive probe, catalog/schema switching, session variables
/// and read-only mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    MySql,
    /// ANSI `SET SCHEMA` / `SET CATALOG`, used by custom drivers
    Generic,
}

impl SqlDialect {
    /// Human-readable backend name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite",
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Generic => "Generic SQL",
        }
    }

    /// Statement used by the alive probe when the driver has no native ping.
    pub fn alive_probe_sql(self) -> &'static str {
        "SELECT 1"
    }

    /// Whether the default catalog can be switched on a live link.
    pub fn supports_catalog_change(self) -> bool {
        matches!(self, Self::MySql | Self::Generic)
    }

    /// Whether the default schema can be switched on a live link.
    pub fn supports_schema_change(self) -> bool {
        matches!(self, Self::Postgres | Self::Generic)
    }

    /// Quotes an identifier for this dialect.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", name.replace('`', "``")),
            _ => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }

    /// Quotes a string literal.
    pub fn quote_literal(self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Statement switching the default catalog, if supported.
    pub fn set_catalog_sql(self, catalog: &str) -> Option<String> {
        match self {
            Self::MySql => Some(format!("USE {}", self.quote_identifier(catalog))),
            Self::Generic => Some(format!("SET CATALOG {}", self.quote_identifier(catalog))),
            Self::Sqlite | Self::Postgres => None,
        }
    }

    /// Statement switching the default schema, if supported.
    pub fn set_schema_sql(self, schema: &str) -> Option<String> {
        match self {
            Self::Postgres => Some(format!(
                "SET search_path TO {}",
                self.quote_identifier(schema)
            )),
            Self::Generic => Some(format!("SET SCHEMA {}", self.quote_identifier(schema))),
            Self::Sqlite | Self::MySql => None,
        }
    }

    /// Statement assigning a session variable.
    ///
    /// `name` must already be a validated identifier; `value` is quoted
    /// unless it is a plain number or keyword.
    pub fn set_variable_sql(self, name: &str, value: &str) -> String {
        let rendered = if is_bare_value(value) {
            value.to_string()
        } else {
            self.quote_literal(value)
        };

        match self {
            Self::Sqlite => format!("PRAGMA {} = {}", name, rendered),
            Self::MySql => format!("SET SESSION {} = {}", name, rendered),
            Self::Postgres | Self::Generic => format!("SET {} = {}", name, rendered),
        }
    }

    /// Statement making the session read-only, if it is done in SQL.
    ///
    /// SQLite is opened read-only through its connection URL instead.
    pub fn read_only_sql(self) -> Option<&'static str> {
        match self {
            Self::Postgres => Some("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY"),
            Self::MySql => Some("SET SESSION TRANSACTION READ ONLY"),
            Self::Sqlite | Self::Generic => None,
        }
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn is_bare_value(value: &str) -> bool {
    !value.is_empty()
        && (value.parse::<f64>().is_ok()
            || value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        && value.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_and_catalog_support() {
        assert!(!SqlDialect::Sqlite.supports_schema_change());
        assert!(!SqlDialect::Sqlite.supports_catalog_change());
        assert!(SqlDialect::Postgres.supports_schema_change());
        assert!(!SqlDialect::Postgres.supports_catalog_change());
        assert!(SqlDialect::MySql.supports_catalog_change());
        assert!(SqlDialect::Generic.supports_schema_change());
    }

    #[test]
    fn test_set_schema_sql() {
        assert_eq!(
            SqlDialect::Postgres.set_schema_sql("public").as_deref(),
            Some("SET search_path TO \"public\"")
        );
        assert_eq!(
            SqlDialect::Generic.set_schema_sql("we\"ird").as_deref(),
            Some("SET SCHEMA \"we\"\"ird\"")
        );
        assert_eq!(SqlDialect::Sqlite.set_schema_sql("main"), None);
        assert_eq!(
            SqlDialect::MySql.set_catalog_sql("crm").as_deref(),
            Some("USE `crm`")
        );
    }

    #[test]
    fn test_set_variable_sql() {
        assert_eq!(
            SqlDialect::Sqlite.set_variable_sql("foreign_keys", "ON"),
            "PRAGMA foreign_keys = ON"
        );
        assert_eq!(
            SqlDialect::Postgres.set_variable_sql("application_name", "dbctx cli"),
            "SET application_name = 'dbctx cli'"
        );
        assert_eq!(
            SqlDialect::Postgres.set_variable_sql("statement_timeout", "5000"),
            "SET statement_timeout = 5000"
        );
        assert_eq!(
            SqlDialect::MySql.set_variable_sql("time_zone", "+00:00"),
            "SET SESSION time_zone = '+00:00'"
        );
        assert_eq!(
            SqlDialect::Generic.set_variable_sql("note", "it's"),
            "SET note = 'it''s'"
        );
    }

    #[test]
    fn test_read_only_sql() {
        assert!(SqlDialect::Postgres.read_only_sql().is_some());
        assert!(SqlDialect::MySql.read_only_sql().is_some());
        assert!(SqlDialect::Sqlite.read_only_sql().is_none());
    }
}
