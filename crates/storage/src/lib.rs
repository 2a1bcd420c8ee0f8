use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use sqlx::{
    sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row as _, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{ProfileId, Table},
    error::{
        BackendError, ErrorKind, FOREIGN_KEY_VIOLATION, NOT_NULL_VIOLATION, UNDEFINED_COLUMN,
        UNIQUE_VIOLATION,
    },
    protocol::{Direction, Filter, FilterValue, Query, Row},
};

mod schema;

use schema::{schema_for, ColumnDefault, ColumnType, TableSchema};

const CHECK_VIOLATION: &str = "23514";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub profile_id: ProfileId,
    pub email: String,
    pub username: String,
}

enum BindValue {
    Text(String),
    Int(i64),
    Null,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to apply chat schema migrations")?;
        Ok(Self { pool })
    }

    pub async fn select_rows(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        let schema = schema_for(query.table);
        let author_column = if query.embed_author {
            Some(schema.author_column.ok_or_else(|| {
                BackendError::unknown(format!(
                    "table {} has no author relationship to embed",
                    query.table
                ))
            })?)
        } else {
            None
        };

        let mut sql = String::from("SELECT ");
        let projection = schema
            .columns
            .iter()
            .map(|column| format!("t.{0} AS {0}", column.name))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&projection);
        if author_column.is_some() {
            sql.push_str(", p.username AS author_username");
        }
        sql.push_str(&format!(" FROM {} t", schema.table.as_str()));
        if let Some(author_column) = author_column {
            sql.push_str(&format!(
                " LEFT JOIN profiles p ON p.id = t.{author_column}"
            ));
        }

        let binds = push_where_clause(&mut sql, schema, "t.", &query.filters)?;

        if !query.order.is_empty() {
            let mut terms = Vec::with_capacity(query.order.len());
            for order in &query.order {
                let column = require_column(schema, &order.column)?;
                let direction = match order.direction {
                    Direction::Ascending => "ASC",
                    Direction::Descending => "DESC",
                };
                terms.push(format!("t.{} {direction}", column));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }

        let rows = bind_all(sqlx::query(&sql), binds)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| decode_row(schema, row, author_column.is_some()))
            .collect()
    }

    pub async fn insert_row(&self, table: Table, mut row: Row) -> Result<Row, BackendError> {
        let schema = schema_for(table);
        for key in row.keys() {
            require_column(schema, key)?;
        }

        for column in schema.columns {
            if row.contains_key(column.name) {
                continue;
            }
            let default = match column.default {
                ColumnDefault::Required => continue,
                ColumnDefault::Uuid => Value::String(Uuid::new_v4().to_string()),
                ColumnDefault::Now => Value::String(format_timestamp(Utc::now())),
                ColumnDefault::True => Value::Bool(true),
            };
            row.insert(column.name.to_string(), default);
        }

        let mut names = Vec::new();
        let mut binds = Vec::new();
        for column in schema.columns {
            let Some(value) = row.get(column.name) else {
                continue;
            };
            names.push(column.name);
            binds.push(bind_value(column.name, column.ty, value)?);
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            schema.table.as_str(),
            names.join(", ")
        );
        bind_all(sqlx::query(&sql), binds)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let id = row
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::unknown("inserted row has no id"))?;
        self.select_rows(&Query::from(table).eq("id", id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::not_found(format!("inserted {table} row vanished")))
    }

    /// Deletes every row matching all filters and returns how many went away.
    pub async fn delete_rows(&self, table: Table, filters: &[Filter]) -> Result<u64, BackendError> {
        if filters.is_empty() {
            return Err(BackendError::unknown(format!(
                "refusing to delete from {table} without a filter"
            )));
        }
        let schema = schema_for(table);
        let mut sql = format!("DELETE FROM {}", schema.table.as_str());
        let binds = push_where_clause(&mut sql, schema, "", filters)?;
        let result = bind_all(sqlx::query(&sql), binds)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    pub async fn create_account(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<Account, BackendError> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| BackendError::unknown(format!("failed to hash password: {err}")))?
            .to_string();

        let profile_id = ProfileId::new_random();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("INSERT INTO profiles (id, username) VALUES (?, ?)")
            .bind(profile_id.to_string())
            .bind(username)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(
            "INSERT INTO accounts (profile_id, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(profile_id.to_string())
        .bind(email)
        .bind(password_hash)
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            let err = map_sqlx_error(err);
            if err.is_unique_violation() {
                BackendError::from_code(UNIQUE_VIOLATION, "User already registered")
            } else {
                err
            }
        })?;
        tx.commit().await.map_err(map_sqlx_error)?;

        Ok(Account {
            profile_id,
            email: email.to_string(),
            username: username.to_string(),
        })
    }

    pub async fn verify_account(&self, email: &str, password: &str) -> Result<Account, BackendError> {
        let row = sqlx::query(
            "SELECT a.profile_id, a.email, a.password_hash, p.username
             FROM accounts a JOIN profiles p ON p.id = a.profile_id
             WHERE a.email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let invalid = || BackendError::new(ErrorKind::NotAuthenticated, "Invalid login credentials");
        let row = row.ok_or_else(invalid)?;
        let stored_hash: String = row.try_get("password_hash").map_err(map_sqlx_error)?;
        let parsed = PasswordHash::new(&stored_hash)
            .map_err(|err| BackendError::unknown(format!("corrupt password hash: {err}")))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| invalid())?;

        account_from_row(&row)
    }

    pub async fn account_by_email(&self, email: &str) -> Result<Option<Account>, BackendError> {
        let row = sqlx::query(
            "SELECT a.profile_id, a.email, p.username
             FROM accounts a JOIN profiles p ON p.id = a.profile_id
             WHERE a.email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(account_from_row).transpose()
    }
}

/// Canonical text form for stored timestamps: UTC with microseconds and a
/// `Z` suffix, so string order matches time order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn account_from_row(row: &SqliteRow) -> Result<Account, BackendError> {
    let profile_id: String = row.try_get("profile_id").map_err(map_sqlx_error)?;
    Ok(Account {
        profile_id: profile_id
            .parse()
            .map_err(|err| BackendError::unknown(format!("corrupt profile id: {err}")))?,
        email: row.try_get("email").map_err(map_sqlx_error)?,
        username: row.try_get("username").map_err(map_sqlx_error)?,
    })
}

fn require_column(schema: &TableSchema, name: &str) -> Result<&'static str, BackendError> {
    schema
        .column(name)
        .map(|column| column.name)
        .ok_or_else(|| {
            BackendError::from_code(
                UNDEFINED_COLUMN,
                format!("column {}.{name} does not exist", schema.table),
            )
        })
}

fn push_where_clause(
    sql: &mut String,
    schema: &TableSchema,
    qualifier: &str,
    filters: &[Filter],
) -> Result<Vec<BindValue>, BackendError> {
    let mut binds = Vec::with_capacity(filters.len());
    for (idx, filter) in filters.iter().enumerate() {
        let column = require_column(schema, &filter.column)?;
        sql.push_str(if idx == 0 { " WHERE " } else { " AND " });
        sql.push_str(&format!("{qualifier}{column} = ?"));
        binds.push(match &filter.value {
            FilterValue::Text(value) => BindValue::Text(value.clone()),
            FilterValue::Bool(value) => BindValue::Int(i64::from(*value)),
        });
    }
    Ok(binds)
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    binds: Vec<BindValue>,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in binds {
        query = match value {
            BindValue::Text(value) => query.bind(value),
            BindValue::Int(value) => query.bind(value),
            BindValue::Null => query.bind(None::<String>),
        };
    }
    query
}

fn bind_value(column: &str, ty: ColumnType, value: &Value) -> Result<BindValue, BackendError> {
    let invalid = || {
        BackendError::unknown(format!(
            "invalid value for column {column}: {value}"
        ))
    };
    match (ty, value) {
        (_, Value::Null) => Ok(BindValue::Null),
        (ColumnType::Text, Value::String(text)) => Ok(BindValue::Text(text.clone())),
        (ColumnType::Bool, Value::Bool(flag)) => Ok(BindValue::Int(i64::from(*flag))),
        (ColumnType::Timestamp, Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|at| BindValue::Text(format_timestamp(at.with_timezone(&Utc))))
            .map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn decode_row(schema: &TableSchema, row: &SqliteRow, with_author: bool) -> Result<Row, BackendError> {
    let mut out = Row::new();
    for column in schema.columns {
        let value = match column.ty {
            ColumnType::Text | ColumnType::Timestamp => row
                .try_get::<Option<String>, _>(column.name)
                .map_err(map_sqlx_error)?
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnType::Bool => row
                .try_get::<Option<i64>, _>(column.name)
                .map_err(map_sqlx_error)?
                .map(|flag| Value::Bool(flag != 0))
                .unwrap_or(Value::Null),
        };
        out.insert(column.name.to_string(), value);
    }
    if with_author {
        let username: Option<String> = row.try_get("author_username").map_err(map_sqlx_error)?;
        out.insert(
            "profiles".to_string(),
            username
                .map(|username| json!({ "username": username }))
                .unwrap_or(Value::Null),
        );
    }
    Ok(out)
}

fn map_sqlx_error(err: sqlx::Error) -> BackendError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation => Some(UNIQUE_VIOLATION),
                sqlx::error::ErrorKind::ForeignKeyViolation => Some(FOREIGN_KEY_VIOLATION),
                sqlx::error::ErrorKind::NotNullViolation => Some(NOT_NULL_VIOLATION),
                sqlx::error::ErrorKind::CheckViolation => Some(CHECK_VIOLATION),
                _ => None,
            };
            match code {
                Some(code) => BackendError::from_code(code, db.message()),
                None => BackendError::unknown(db.message()),
            }
        }
        _ => BackendError::unknown(err.to_string()),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
