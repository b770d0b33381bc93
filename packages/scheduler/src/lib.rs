// Social Profile Scrape Scheduler - Core
//
// Durable task scheduling for the social-profile scraping pipeline: admission
// with per-target dedup, account-constrained claiming, retry with backoff and
// recovery of tasks from lost workers.
//
// Platform clients live outside this crate; they plug in through
// kernel::traits::BasePlatformClient.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
