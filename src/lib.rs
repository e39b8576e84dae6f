//! Two HTTP services sharing a conditional cache.
//!
//! Responses are stamped with content ETags and invalidated by the record
//! mutations they were built from; outbound calls between services revalidate
//! against the same store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
