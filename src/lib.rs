//! Crew Runner — async job execution and streaming core.

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod stream;
pub mod threads;
