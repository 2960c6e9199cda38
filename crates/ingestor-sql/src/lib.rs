pub mod conversations;
pub mod jobs;

/// Embedded schema migrations for the three ingestion tables.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
