//! Taskify: project and task management with an automated status workflow
//! and realtime project chat.

pub mod app;
pub mod auth;
pub mod config;
pub mod errors;
pub mod integrations;
pub mod telemetry;
pub mod workflow;
