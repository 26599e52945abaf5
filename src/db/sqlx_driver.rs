//! sqlx-backed driver.
//!
//! Opens one unpooled session per [`Driver::connect`] call. Transactions are
//! driven with plain `BEGIN`/`COMMIT`/`ROLLBACK` statements so the transaction
//! stays a state of the session rather than a borrow of it.

use crate::config::DatabaseSettings;
use crate::db::driver::{Driver, DriverConnection};
use crate::db::params::{bind_mysql_params, bind_postgres_params, bind_sqlite_params};
use crate::db::types::RowToJson;
use crate::error::DriverError;
use crate::models::{DatabaseType, IsolationLevel, QueryParam, Row};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Executor};
use tracing::debug;

/// Driver that connects with sqlx using fixed [`DatabaseSettings`].
pub struct SqlxDriver {
    settings: DatabaseSettings,
}

impl SqlxDriver {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self { settings }
    }

    pub fn backend(&self) -> DatabaseType {
        self.settings.backend
    }

    fn postgres_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port)
            .username(&self.settings.user)
            .password(&self.settings.password)
            .database(&self.settings.database)
    }

    fn mysql_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.settings.host)
            .port(self.settings.port)
            .username(&self.settings.user)
            .password(&self.settings.password)
            .database(&self.settings.database)
    }

    fn sqlite_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.settings.database)
            .create_if_missing(true)
            .page_size(self.settings.page_size)
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    async fn connect(&self) -> Result<Box<dyn DriverConnection>, DriverError> {
        let connection = match self.settings.backend {
            DatabaseType::PostgreSQL => SqlxConnection::Postgres(
                PgConnection::connect_with(&self.postgres_options()).await?,
            ),
            DatabaseType::MySQL => SqlxConnection::MySql(
                MySqlConnection::connect_with(&self.mysql_options()).await?,
            ),
            DatabaseType::SQLite => SqlxConnection::Sqlite(
                SqliteConnection::connect_with(&self.sqlite_options()).await?,
            ),
        };
        debug!(backend = %self.settings.backend, "Opened database session");
        Ok(Box::new(connection))
    }

    fn name(&self) -> &'static str {
        self.settings.backend.display_name()
    }
}

/// One open sqlx session.
pub enum SqlxConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
    Sqlite(SqliteConnection),
}

impl SqlxConnection {
    async fn run_raw(&mut self, sql: &str) -> Result<(), DriverError> {
        match self {
            Self::Postgres(conn) => conn.execute(sqlx::raw_sql(sql)).await.map(|_| ())?,
            Self::MySql(conn) => conn.execute(sqlx::raw_sql(sql)).await.map(|_| ())?,
            Self::Sqlite(conn) => conn.execute(sqlx::raw_sql(sql)).await.map(|_| ())?,
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for SqlxConnection {
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        match *self {
            Self::Postgres(_) => {
                let sql = format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql());
                self.run_raw(&sql).await
            }
            Self::MySql(_) => {
                // Applies to the next transaction only
                let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql());
                self.run_raw(&sql).await?;
                self.run_raw("START TRANSACTION").await
            }
            Self::Sqlite(_) => {
                if isolation != IsolationLevel::Serializable {
                    debug!(requested = %isolation, "SQLite transactions are always serializable");
                }
                self.run_raw("BEGIN").await
            }
        }
    }

    async fn query(
        &mut self,
        statement: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, DriverError> {
        let rows: Vec<Row> = match self {
            Self::Postgres(conn) => bind_postgres_params(sqlx::query(statement), params)
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .map(RowToJson::to_json_map)
                .collect(),
            Self::MySql(conn) => bind_mysql_params(sqlx::query(statement), params)
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .map(RowToJson::to_json_map)
                .collect(),
            Self::Sqlite(conn) => bind_sqlite_params(sqlx::query(statement), params)
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .map(RowToJson::to_json_map)
                .collect(),
        };
        Ok(rows)
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.run_raw("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.run_raw("ROLLBACK").await
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        match *self {
            Self::Postgres(conn) => conn.close().await?,
            Self::MySql(conn) => conn.close().await?,
            Self::Sqlite(conn) => conn.close().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sqlite_driver(path: &str) -> SqlxDriver {
        SqlxDriver::new(DatabaseSettings::sqlite(path))
    }

    #[tokio::test]
    async fn test_sqlite_session_lifecycle() {
        let temp_file = NamedTempFile::new().unwrap();
        let driver = sqlite_driver(temp_file.path().to_str().unwrap());

        let mut conn = driver.connect().await.unwrap();
        conn.begin(IsolationLevel::ReadCommitted).await.unwrap();
        conn.query("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .await
            .unwrap();
        conn.query(
            "INSERT INTO t (id, name) VALUES (?, ?)",
            &[QueryParam::Int(1), QueryParam::from("a")],
        )
        .await
        .unwrap();
        conn.commit().await.unwrap();

        conn.begin(IsolationLevel::ReadCommitted).await.unwrap();
        conn.query("INSERT INTO t (id, name) VALUES (2, 'b')", &[])
            .await
            .unwrap();
        conn.rollback().await.unwrap();

        let rows = conn.query("SELECT id, name FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], serde_json::json!(1));
        assert_eq!(rows[0]["name"], serde_json::json!("a"));

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_commit_without_transaction_fails() {
        let temp_file = NamedTempFile::new().unwrap();
        let driver = sqlite_driver(temp_file.path().to_str().unwrap());

        let mut conn = driver.connect().await.unwrap();
        assert!(conn.commit().await.is_err());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_postgres_is_connect_error() {
        let driver = SqlxDriver::new(DatabaseSettings {
            backend: DatabaseType::PostgreSQL,
            host: "127.0.0.1".to_string(),
            port: 1,
            database: "none".to_string(),
            user: "none".to_string(),
            password: "none".to_string(),
            page_size: 4096,
        });
        assert_eq!(driver.name(), "PostgreSQL");
        assert!(driver.connect().await.is_err());
    }
}
