pub mod auth;
pub mod error;
pub mod files;
pub mod groups;
pub mod messages;
pub mod middleware;
pub mod moderation;
pub mod reactions;
pub mod state;
mod views;
