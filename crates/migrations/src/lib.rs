//! Schema of the PostgreSQL queue driver: a `jobs` table, a `failed_jobs` table
//! and a `schema_revisions` table recording which revisions were applied.

mod revisions;

use indoc::formatdoc;
use revisions::{REVISIONS, SCHEMA_PLACEHOLDER};
use sqlx::{query, query_scalar, Acquire, Postgres};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Claims rely on `for update skip locked`
pub const MIN_SERVER_VERSION: u32 = 90500;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Unreadable `server_version_num`: `{0}`")]
    UnreadableServerVersion(String),
    #[error("The queue schema requires PostgreSQL 9.5 or greater (detected `server_version_num` = {0})")]
    UnsupportedServer(u32),
    #[error("Error occured while migrating: {0}")]
    SqlError(#[from] sqlx::Error),
}

/// Parses `server_version_num` and rejects servers without `skip locked`
pub fn supported_server_version(raw: &str) -> Result<u32, MigrateError> {
    let version = raw
        .trim()
        .parse::<u32>()
        .map_err(|_| MigrateError::UnreadableServerVersion(raw.to_string()))?;
    if version < MIN_SERVER_VERSION {
        return Err(MigrateError::UnsupportedServer(version));
    }
    Ok(version)
}

/// Revisions still to apply on a schema at `current`, with their numbers
fn pending_revisions(current: i32) -> impl Iterator<Item = (i32, &'static [&'static str])> {
    REVISIONS
        .iter()
        .copied()
        .zip(1..)
        .filter(move |(_, revision)| *revision > current)
        .map(|(statements, revision)| (revision, statements))
}

/// Brings the queue schema up to the latest revision.
///
/// Everything runs in one transaction holding an advisory lock keyed on the
/// schema, so concurrent drivers starting against the same database apply
/// each revision once. `escaped_schema` must already be a quoted identifier.
pub async fn migrate<'e, A>(conn: A, escaped_schema: &str) -> Result<(), MigrateError>
where
    A: Acquire<'e, Database = Postgres>,
{
    let mut tx = conn.begin().await?;

    query("select pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("jobqueue:{escaped_schema}"))
        .execute(tx.as_mut())
        .await?;

    let raw_version: String = query_scalar("select current_setting('server_version_num')")
        .fetch_one(tx.as_mut())
        .await?;
    let server_version = supported_server_version(&raw_version)?;

    query(&format!("create schema if not exists {escaped_schema}"))
        .execute(tx.as_mut())
        .await?;
    let revisions_table = formatdoc!(
        r#"
            create table if not exists {escaped_schema}.schema_revisions (
                revision int primary key,
                applied_at timestamptz not null default now()
            )
        "#
    );
    query(&revisions_table).execute(tx.as_mut()).await?;

    let current: i32 = query_scalar(&format!(
        "select coalesce(max(revision), 0) from {escaped_schema}.schema_revisions"
    ))
    .fetch_one(tx.as_mut())
    .await?;
    let latest = REVISIONS.len() as i32;
    debug!(server_version, current, latest, schema = escaped_schema, "Checking queue schema");

    if current > latest {
        warn!(
            current,
            latest, "Queue schema is newer than this build knows about, attempting to continue"
        );
    }

    let record = format!("insert into {escaped_schema}.schema_revisions (revision) values ($1)");
    for (revision, statements) in pending_revisions(current) {
        info!(revision, schema = escaped_schema, "Applying queue schema revision");
        for stmt in statements {
            let stmt = stmt.replace(SCHEMA_PLACEHOLDER, escaped_schema);
            query(&stmt).execute(tx.as_mut()).await?;
        }
        query(&record).bind(revision).execute(tx.as_mut()).await?;
    }

    tx.commit().await?;
    Ok(())
}
