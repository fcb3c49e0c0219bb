pub mod model;
pub mod retry;
pub mod store;

pub(crate) mod sql;

pub mod generic;
pub mod mysql;
pub mod postgres;

pub use generic::SqliteStore;
pub use model::{Job, NewJob};
pub use mysql::MySqlStore;
pub use postgres::PgStore;
pub use store::{connect, Counts, EnqueueOptions, JobStore, Worker, DEFAULT_READ_AHEAD};
