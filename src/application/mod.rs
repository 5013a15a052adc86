//! Application services: governor, executor, job pipeline, scheduler, admin.

pub mod admin;
pub mod auth;
pub mod error;
pub mod executor;
pub mod governor;
pub mod jobs;
pub mod repos;
pub mod scheduler;
