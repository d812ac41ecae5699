//! Target platform REST client and wire types

pub mod client;
pub mod wire;

pub use client::{post_url, CreatedPost, MediaUpload, Profile, PublishingClient};
