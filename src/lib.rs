#![forbid(unsafe_code)]

//! ReelStory backend: a short-drama catalog served over a JSON API.
//!
//! The SQLite catalog, object storage and session lookup live here so the
//! `backend` server and the `reelctl` operator tool share one implementation.

pub mod admin;
pub mod api;
pub mod catalog;
pub mod config;
pub mod session;
pub mod storage;
pub mod sync;
