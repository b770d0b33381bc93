//! Target resolution for the admission gate.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use super::models::SocialProfile;
use crate::common::TargetId;
use crate::kernel::traits::BaseTargetDirectory;

/// Resolves targets against the `social_profiles` table.
pub struct PostgresTargetDirectory {
    pool: PgPool,
}

impl PostgresTargetDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BaseTargetDirectory for PostgresTargetDirectory {
    async fn target_exists(&self, target_id: TargetId) -> Result<bool> {
        Ok(SocialProfile::find_by_id(target_id, &self.pool)
            .await?
            .is_some_and(|profile| profile.active))
    }
}

/// In-memory target set for tests and embedded use.
#[derive(Default)]
pub struct InMemoryTargetDirectory {
    targets: RwLock<HashSet<TargetId>>,
}

impl InMemoryTargetDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: impl IntoIterator<Item = TargetId>) -> Self {
        Self {
            targets: RwLock::new(targets.into_iter().collect()),
        }
    }

    /// Register a new target and return its id.
    pub fn add(&self) -> TargetId {
        let id = TargetId::new();
        self.targets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        id
    }

    pub fn remove(&self, id: TargetId) {
        self.targets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

#[async_trait]
impl BaseTargetDirectory for InMemoryTargetDirectory {
    async fn target_exists(&self, target_id: TargetId) -> Result<bool> {
        Ok(self
            .targets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&target_id))
    }
}
