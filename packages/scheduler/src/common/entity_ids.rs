//! Typed ID definitions for scheduler entities.

pub use super::id::Id;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for scrape tasks.
pub struct ScrapeTask;

/// Marker type for scrape targets (social profiles).
pub struct ScrapeTarget;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

/// Typed ID for scrape tasks.
pub type TaskId = Id<ScrapeTask>;

/// Typed ID for the entity a task scrapes.
pub type TargetId = Id<ScrapeTarget>;
