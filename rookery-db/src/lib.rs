//! Postgres adapter for the timeline stores.

pub mod client;
pub mod record;

pub use client::{DbClient, DbError};
