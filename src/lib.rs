//! Creeds: client core for a constitutions server.
//!
//! The centre of the crate is the stream run engine: it opens one SSE run
//! stream per user turn and folds the events into a per-thread cache, a
//! session registry and a single user-facing error slot, reconciling with the
//! server's authoritative history when the run ends.
//!
//! # Quick start
//!
//! ```no_run
//! use creeds::api::ApiClient;
//! use creeds::config::load_config;
//! use creeds::runtime::StreamRunEngine;
//! use creeds::store::Stores;
//! use creeds::types::RunConfig;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let config = load_config(None).unwrap();
//! let stores = Stores::new();
//! stores.sessions.create_new_session();
//! let engine = StreamRunEngine::new(Arc::new(ApiClient::new(&config)), stores.clone());
//! let mut run = engine.stream_run("Hello!", RunConfig::default(), None, false);
//! run.finished().await;
//! let thread_id = run.thread_id().unwrap();
//! println!("{:?}", stores.threads.get(&thread_id));
//! # }
//! ```

pub mod api;
pub mod build_info;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod render;
pub mod runtime;
pub mod session;
pub mod store;
#[cfg(test)]
pub mod testsupport;
pub mod types;
