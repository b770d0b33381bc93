pub mod social_profile;

pub use social_profile::SocialProfile;
