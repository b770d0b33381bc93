use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::TargetId;

/// A social account that scrape tasks point at.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SocialProfile {
    pub id: TargetId,
    pub platform: String,
    pub handle: String,
    pub url: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// SQL Queries
// =============================================================================

impl SocialProfile {
    fn base_query(suffix: &str) -> String {
        format!(
            "SELECT id, platform, handle, url, active, created_at, updated_at \
             FROM social_profiles {}",
            suffix
        )
    }

    /// Find or create a profile by platform + handle.
    /// If it already exists, returns the existing one without modification.
    pub async fn find_or_create(
        platform: &str,
        handle: &str,
        url: Option<&str>,
        pool: &PgPool,
    ) -> Result<Self> {
        if let Some(existing) = Self::find_by_handle(platform, handle, pool).await? {
            return Ok(existing);
        }

        sqlx::query_as::<_, Self>(
            "INSERT INTO social_profiles (id, platform, handle, url)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (platform, handle) DO UPDATE SET updated_at = social_profiles.updated_at
             RETURNING id, platform, handle, url, active, created_at, updated_at",
        )
        .bind(TargetId::new())
        .bind(platform)
        .bind(handle)
        .bind(url)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: TargetId, pool: &PgPool) -> Result<Option<Self>> {
        let q = Self::base_query("WHERE id = $1");
        sqlx::query_as::<_, Self>(&q)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_handle(platform: &str, handle: &str, pool: &PgPool) -> Result<Option<Self>> {
        let q = Self::base_query("WHERE platform = $1 AND handle = $2");
        sqlx::query_as::<_, Self>(&q)
            .bind(platform)
            .bind(handle)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_active(pool: &PgPool) -> Result<Vec<Self>> {
        let q = Self::base_query("WHERE active = true ORDER BY platform, handle");
        sqlx::query_as::<_, Self>(&q)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn set_active(id: TargetId, active: bool, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE social_profiles SET active = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(pool)
            .await?;
        Ok(())
    }
}
