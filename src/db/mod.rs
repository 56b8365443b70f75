//! Row-level helpers shared by the lifecycle services. Functions that lock rows take a
//! `PgConnection` so they can only run inside the caller's transaction.

pub mod apps;
pub mod organizations;
pub mod routes;
pub mod service_instances;

const UNIQUE_VIOLATION: &str = "23505";

pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false)
}
