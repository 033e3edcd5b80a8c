use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use fediq_infra::JobsConfig;
use fediq_infra::jobs::PostgresJobStore;
use fediq_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var("FEDIQ_LOG_FORMAT") {
        Ok(raw) => raw.parse::<LogFormat>().map_err(anyhow::Error::msg)?,
        Err(_) => LogFormat::default(),
    };
    fediq_observability::tracing::init(format);

    let config = JobsConfig::from_env().context("invalid configuration")?;
    let database_url = config.require_database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to apply job schema")?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "connected to job store"
    );

    fediq_worker::run(Arc::new(store), &config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    })
    .await?;

    Ok(())
}
