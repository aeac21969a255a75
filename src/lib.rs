//! Strata: an application-tier HTTP response cache.

pub mod cache;
pub mod config;
pub mod infra;
