//! HTTP request handlers organized by functionality

pub mod artwork;
pub mod cache;
pub mod health;
pub mod tasks;
