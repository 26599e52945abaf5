//! Positional parameter binding.
//!
//! Binds [`QueryParam`] values onto backend-specific sqlx queries, in order.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

macro_rules! bind_param {
    ($query:expr, $param:expr) => {
        match $param {
            QueryParam::Null => $query.bind(None::<String>),
            QueryParam::Bool(v) => $query.bind(*v),
            QueryParam::Int(v) => $query.bind(*v),
            QueryParam::Float(v) => $query.bind(*v),
            QueryParam::String(v) => $query.bind(v.as_str()),
            QueryParam::Bytes(v) => $query.bind(v.as_slice()),
        }
    };
}

/// Bind every parameter, in order, to a PostgreSQL query.
pub(crate) fn bind_postgres_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [QueryParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = bind_param!(query, param);
    }
    query
}

/// Bind every parameter, in order, to a MySQL query.
pub(crate) fn bind_mysql_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [QueryParam],
) -> Query<'q, MySql, MySqlArguments> {
    for param in params {
        query = bind_param!(query, param);
    }
    query
}

/// Bind every parameter, in order, to a SQLite query.
pub(crate) fn bind_sqlite_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [QueryParam],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = bind_param!(query, param);
    }
    query
}
