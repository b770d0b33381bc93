// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - the scheduler calls them but never
// implements platform logic itself.
//
// Naming convention: Base* for trait names (e.g., BasePlatformClient)

use anyhow::Result;
use async_trait::async_trait;

use crate::common::TargetId;
use crate::kernel::tasks::{Account, ExecutionError, Task};

// =============================================================================
// Platform Client Trait (Infrastructure - scrape / analysis / discovery)
// =============================================================================

#[async_trait]
pub trait BasePlatformClient: Send + Sync {
    /// Run one attempt of `task` using the leased `account`.
    ///
    /// Returns the result document on success. Upstream calls must tolerate
    /// being repeated: an attempt whose report is lost is executed again.
    async fn execute(
        &self,
        task: &Task,
        account: &Account,
    ) -> std::result::Result<serde_json::Value, ExecutionError>;
}

// =============================================================================
// Target Directory Trait (Infrastructure - target resolution)
// =============================================================================

#[async_trait]
pub trait BaseTargetDirectory: Send + Sync {
    /// Whether `target_id` names a known, active scrape target
    async fn target_exists(&self, target_id: TargetId) -> Result<bool>;
}
