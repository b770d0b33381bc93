// Business domains
pub mod social_profile;
