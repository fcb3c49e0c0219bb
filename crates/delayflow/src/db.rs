use std::str::FromStr;

use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub(crate) async fn pg_pool(url: &str) -> sqlx::Result<PgPool> {
    PgPoolOptions::new().max_connections(10).connect(url).await
}

pub(crate) async fn mysql_pool(url: &str) -> sqlx::Result<MySqlPool> {
    MySqlPoolOptions::new().max_connections(10).connect(url).await
}

/// SQLite is in-process and single-writer; one connection keeps the
/// optimistic claim updates serialized instead of fighting over the file
/// lock.
pub(crate) async fn sqlite_pool(url: &str) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}
