use crate::models::{AppName, AppStatus, Binding, InstalledApp, Invalidation};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::str::FromStr;

/// Durable record of what the system has promised (installed apps,
/// bindings) and what still needs doing (pending invalidations,
/// unconfigured bindings). The single source of truth for reconciliation;
/// generated files are derived from it, never the other way around.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

type AppRow = (
    String,
    String,
    Option<String>,
    String,
    Option<i64>,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
);

type BindingRow = (String, String, String, Option<DateTime<Utc>>);

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::from)?
            .create_if_missing(true);

        let min = std::time::Duration::from_millis(100);
        let max = std::time::Duration::from_secs(10);
        for duration in exponential_backoff::Backoff::new(5, min, max) {
            log::debug!("Connecting to store…");
            let pool = match SqlitePool::connect_with(options.clone()).await {
                Ok(pool) => pool,
                Err(err) => match duration {
                    Some(duration) => {
                        log::warn!("Cannot connect to store, trying again: {err}");
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    None => {
                        return Err(err.into());
                    }
                },
            };

            sqlx::migrate!().run(&pool).await?;
            return Ok(Self { pool });
        }
        unreachable!()
    }

    // A pooled `sqlite::memory:` would give every connection its own
    // database, so the test store pins a single long-lived connection.
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();
        Self { pool }
    }

    fn app_from_row(row: AppRow) -> Result<InstalledApp, StoreError> {
        let (name, display_name, version, status, port, is_system, installed_at, updated_at) = row;
        Ok(InstalledApp {
            name: AppName::from_str(&name).map_err(|err| StoreError::Corrupt {
                detail: err.to_string(),
            })?,
            display_name,
            version,
            status: AppStatus::from_str(&status)
                .map_err(|detail| StoreError::Corrupt { detail })?,
            port: port.map(|port| port as u16),
            is_system,
            installed_at,
            updated_at,
        })
    }

    fn binding_from_row(row: BindingRow) -> Result<Binding, StoreError> {
        let (consumer_app, integration, source_app, configured_at) = row;
        let corrupt = |err: crate::models::AppNameError| StoreError::Corrupt {
            detail: err.to_string(),
        };
        Ok(Binding {
            consumer_app: AppName::from_str(&consumer_app).map_err(corrupt)?,
            integration,
            source_app: AppName::from_str(&source_app).map_err(corrupt)?,
            configured_at,
        })
    }

    pub async fn installed_apps(&self) -> Result<Vec<InstalledApp>, StoreError> {
        let rows = sqlx::query_as::<_, AppRow>(
            r#"
            SELECT name, display_name, version, status, port, is_system, installed_at, updated_at
            FROM installed_apps
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::app_from_row).collect()
    }

    pub async fn installed_app(&self, name: &AppName) -> Result<Option<InstalledApp>, StoreError> {
        let row = sqlx::query_as::<_, AppRow>(
            r#"
            SELECT name, display_name, version, status, port, is_system, installed_at, updated_at
            FROM installed_apps
            WHERE name = $1
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::app_from_row).transpose()
    }

    pub async fn set_status(&self, name: &AppName, status: AppStatus) -> Result<(), StoreError> {
        if let Some(app) = self.installed_app(name).await? {
            if app.status == status {
                return Ok(());
            }
            if !app.status.may_advance_to(status) {
                log::warn!(
                    "Suppressing backward status transition for {name}: {} -> {status}",
                    app.status
                );
                return Ok(());
            }
        }

        sqlx::query(
            r#"
            UPDATE installed_apps SET status = $2, updated_at = $3 WHERE name = $1
            "#,
        )
        .bind(name.as_str())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_status_many(
        &self,
        names: &[AppName],
        status: AppStatus,
    ) -> Result<(), StoreError> {
        for name in names {
            self.set_status(name, status).await?;
        }
        Ok(())
    }

    /// Commits the installed-app rows and bindings of one install as a unit.
    pub async fn apply_install(
        &self,
        apps: &[InstalledApp],
        bindings: &[Binding],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for app in apps {
            sqlx::query(
                r#"
                INSERT INTO installed_apps
                    (name, display_name, version, status, port, is_system, installed_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT(name) DO UPDATE SET
                    display_name = excluded.display_name,
                    version = excluded.version,
                    status = excluded.status,
                    port = excluded.port,
                    is_system = excluded.is_system,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(app.name.as_str())
            .bind(&app.display_name)
            .bind(&app.version)
            .bind(app.status.as_str())
            .bind(app.port.map(|port| port as i64))
            .bind(app.is_system)
            .bind(app.installed_at)
            .bind(app.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for binding in bindings {
            sqlx::query(
                r#"
                INSERT INTO bindings (consumer_app, integration, source_app, configured_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT(consumer_app, integration, source_app) DO NOTHING
                "#,
            )
            .bind(binding.consumer_app.as_str())
            .bind(&binding.integration)
            .bind(binding.source_app.as_str())
            .bind(binding.configured_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Removes an app and every edge touching it as a unit. Runs after the
    /// rebuild has removed the underlying service.
    pub async fn apply_uninstall(&self, name: &AppName) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM bindings WHERE consumer_app = $1 OR source_app = $1")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM app_invalidations WHERE app_name = $1")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM installed_apps WHERE name = $1")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_installed_app(&self, name: &AppName) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM installed_apps WHERE name = $1")
            .bind(name.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn bindings(&self) -> Result<Vec<Binding>, StoreError> {
        let rows = sqlx::query_as::<_, BindingRow>(
            r#"
            SELECT consumer_app, integration, source_app, configured_at
            FROM bindings
            ORDER BY consumer_app, integration, source_app
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::binding_from_row).collect()
    }

    pub async fn bindings_of_consumer(&self, name: &AppName) -> Result<Vec<Binding>, StoreError> {
        let rows = sqlx::query_as::<_, BindingRow>(
            r#"
            SELECT consumer_app, integration, source_app, configured_at
            FROM bindings
            WHERE consumer_app = $1
            ORDER BY integration, source_app
            "#,
        )
        .bind(name.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::binding_from_row).collect()
    }

    pub async fn bindings_of_source(&self, name: &AppName) -> Result<Vec<Binding>, StoreError> {
        let rows = sqlx::query_as::<_, BindingRow>(
            r#"
            SELECT consumer_app, integration, source_app, configured_at
            FROM bindings
            WHERE source_app = $1
            ORDER BY consumer_app, integration
            "#,
        )
        .bind(name.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::binding_from_row).collect()
    }

    pub async fn insert_binding(&self, binding: &Binding) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bindings (consumer_app, integration, source_app, configured_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(consumer_app, integration, source_app) DO NOTHING
            "#,
        )
        .bind(binding.consumer_app.as_str())
        .bind(&binding.integration)
        .bind(binding.source_app.as_str())
        .bind(binding.configured_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_binding(
        &self,
        consumer: &AppName,
        integration: &str,
        source: &AppName,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM bindings WHERE consumer_app = $1 AND integration = $2 AND source_app = $3",
        )
        .bind(consumer.as_str())
        .bind(integration)
        .bind(source.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stamp_binding_configured(
        &self,
        consumer: &AppName,
        integration: &str,
        source: &AppName,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE bindings SET configured_at = $4
            WHERE consumer_app = $1 AND integration = $2 AND source_app = $3
            "#,
        )
        .bind(consumer.as_str())
        .bind(integration)
        .bind(source.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_binding_configured(&self, consumer: &AppName) -> Result<(), StoreError> {
        sqlx::query("UPDATE bindings SET configured_at = NULL WHERE consumer_app = $1")
            .bind(consumer.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks an app for a static-config re-check. Idempotent: marking an
    /// already-marked app keeps the earlier row.
    pub async fn mark_invalidation(&self, name: &AppName, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO app_invalidations (app_name, reason, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT(app_name) DO NOTHING
            "#,
        )
        .bind(name.as_str())
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pending_invalidations(&self) -> Result<Vec<Invalidation>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(
            r#"
            SELECT app_name, reason, created_at
            FROM app_invalidations
            ORDER BY app_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(app_name, reason, created_at)| {
                Ok(Invalidation {
                    app_name: AppName::from_str(&app_name).map_err(|err| StoreError::Corrupt {
                        detail: err.to_string(),
                    })?,
                    reason,
                    created_at,
                })
            })
            .collect()
    }

    pub async fn clear_invalidation(&self, name: &AppName) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM app_invalidations WHERE app_name = $1")
            .bind(name.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query_as::<_, (String,)>("SELECT value FROM config_cache WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn config_put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO config_cache (key, value) VALUES ($1, $2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store query failed: {err}")]
    Query {
        #[from]
        err: sqlx::Error,
    },
    #[error("Store migration failed: {err}")]
    Migration {
        #[from]
        err: sqlx::migrate::MigrateError,
    },
    #[error("Store contains invalid data: {detail}")]
    Corrupt { detail: String },
}
