//! Registered cloud configurations.

use async_trait::async_trait;
use cyclone_core::CloudConfig;
use indexmap::IndexMap;
use sqlx::PgPool;
use std::sync::Mutex;

use crate::{DbError, DbResult};

#[async_trait]
pub trait CloudRepo: Send + Sync {
    async fn create(&self, config: &CloudConfig) -> DbResult<()>;
    /// All clouds in registration order.
    async fn list(&self) -> DbResult<Vec<CloudConfig>>;
    async fn get_by_name(&self, name: &str) -> DbResult<CloudConfig>;
    async fn delete_by_name(&self, name: &str) -> DbResult<()>;
}

#[derive(sqlx::FromRow)]
struct CloudRow {
    config: serde_json::Value,
}

impl CloudRow {
    fn into_config(self) -> DbResult<CloudConfig> {
        Ok(serde_json::from_value(self.config)?)
    }
}

/// PostgreSQL implementation of CloudRepo.
pub struct PgCloudRepo {
    pool: PgPool,
}

impl PgCloudRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CloudRepo for PgCloudRepo {
    async fn create(&self, config: &CloudConfig) -> DbResult<()> {
        sqlx::query("INSERT INTO clouds (name, kind, config) VALUES ($1, $2, $3)")
            .bind(&config.name)
            .bind(&config.kind)
            .bind(serde_json::to_value(config)?)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    DbError::Duplicate(format!("cloud {}", config.name))
                }
                other => DbError::Database(other),
            })?;
        Ok(())
    }

    async fn list(&self) -> DbResult<Vec<CloudConfig>> {
        sqlx::query_as::<_, CloudRow>("SELECT config FROM clouds ORDER BY created_at ASC, name ASC")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(CloudRow::into_config)
            .collect()
    }

    async fn get_by_name(&self, name: &str) -> DbResult<CloudConfig> {
        sqlx::query_as::<_, CloudRow>("SELECT config FROM clouds WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("cloud {}", name)))?
            .into_config()
    }

    async fn delete_by_name(&self, name: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM clouds WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("cloud {}", name)));
        }
        Ok(())
    }
}

/// In-process implementation of CloudRepo.
#[derive(Default)]
pub struct MemoryCloudRepo {
    clouds: Mutex<IndexMap<String, CloudConfig>>,
}

impl MemoryCloudRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DbResult<std::sync::MutexGuard<'_, IndexMap<String, CloudConfig>>> {
        self.clouds
            .lock()
            .map_err(|_| DbError::Corrupt("cloud store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CloudRepo for MemoryCloudRepo {
    async fn create(&self, config: &CloudConfig) -> DbResult<()> {
        let mut clouds = self.lock()?;
        if clouds.contains_key(&config.name) {
            return Err(DbError::Duplicate(format!("cloud {}", config.name)));
        }
        clouds.insert(config.name.clone(), config.clone());
        Ok(())
    }

    async fn list(&self) -> DbResult<Vec<CloudConfig>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    async fn get_by_name(&self, name: &str) -> DbResult<CloudConfig> {
        self.lock()?
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("cloud {}", name)))
    }

    async fn delete_by_name(&self, name: &str) -> DbResult<()> {
        self.lock()?
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(format!("cloud {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_cloud_lifecycle() {
        let repo = MemoryCloudRepo::new();
        repo.create(&CloudConfig::docker("a", "unix:///var/run/docker.sock"))
            .await
            .unwrap();
        repo.create(&CloudConfig::docker("b", "tcp://10.0.0.2:2376"))
            .await
            .unwrap();

        let names: Vec<String> = repo.list().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(repo.get_by_name("b").await.unwrap().kind, "docker");

        repo.delete_by_name("a").await.unwrap();
        assert!(matches!(repo.get_by_name("a").await, Err(DbError::NotFound(_))));
        assert!(matches!(repo.delete_by_name("a").await, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let repo = MemoryCloudRepo::new();
        let config = CloudConfig::docker("a", "unix:///var/run/docker.sock");
        repo.create(&config).await.unwrap();
        assert!(matches!(repo.create(&config).await, Err(DbError::Duplicate(_))));
    }
}
