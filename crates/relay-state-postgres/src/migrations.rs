use sqlx::{PgPool, Row};
use tracing::{debug, info};

use relay_core::CoreError;

use crate::errors::map_sqlx_error;

/// Embedded SQL migrations, applied in order and recorded in `relay_migrations`
pub const MIGRATIONS: &[(&str, &str)] = &[
    (
        "20240601000000_initial_schema",
        r#"
        -- Compiled process definitions, keyed by content hash
        CREATE TABLE IF NOT EXISTS relay_process_definitions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            source TEXT NOT NULL,
            graph JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );

        -- Process instances; instance_key deduplicates retried triggers
        CREATE TABLE IF NOT EXISTS relay_instances (
            id TEXT PRIMARY KEY,
            definition_id TEXT NOT NULL REFERENCES relay_process_definitions(id),
            instance_key TEXT NOT NULL,
            status TEXT NOT NULL,
            data JSONB NOT NULL,
            version BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            CONSTRAINT relay_instances_instance_key_key UNIQUE (instance_key)
        );

        CREATE INDEX IF NOT EXISTS idx_relay_instances_definition_id
            ON relay_instances(definition_id);
        "#,
    ),
    (
        "20240602000000_object_types",
        r#"
        -- Schemas of the user-defined business objects
        CREATE TABLE IF NOT EXISTS relay_object_types (
            id TEXT PRIMARY KEY,
            schema JSONB NOT NULL
        );
        "#,
    ),
];

/// Apply every migration not yet recorded
pub async fn run_migrations(pool: &PgPool) -> Result<(), CoreError> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS relay_migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("create migrations table", e))?;

    let applied: Vec<String> = sqlx::query("SELECT name FROM relay_migrations")
        .fetch_all(pool)
        .await
        .map_err(|e| map_sqlx_error("list migrations", e))?
        .iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect::<Result<_, _>>()
        .map_err(|e| map_sqlx_error("list migrations", e))?;

    for (name, sql) in pending(&applied) {
        debug!(migration = name, "Applying migration");
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin migration", e))?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(name, e))?;
        sqlx::query("INSERT INTO relay_migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(name, e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit migration", e))?;
        info!(migration = name, "Migration applied");
    }
    Ok(())
}

/// Migrations whose names are not in `applied`, in declaration order
fn pending(applied: &[String]) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
    MIGRATIONS
        .iter()
        .copied()
        .filter(move |(name, _)| !applied.iter().any(|a| a == name))
}
