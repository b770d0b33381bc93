pub mod directory;
pub mod models;

pub use directory::{InMemoryTargetDirectory, PostgresTargetDirectory};
pub use models::SocialProfile;
