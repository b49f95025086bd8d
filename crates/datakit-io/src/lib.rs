// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # datakit-io
//!
//! The shared delivery substrate every collector writes into. Producers hand typed
//! [`point::Point`]s to the ingestion gateway ([`io::Io`]); the pipeline takes care of
//! filtering, bounded buffering, disk overflow, batching, retried delivery to one or more
//! Dataway endpoints and fan-out to secondary sinks.
//!
//! ```text
//!  producer ──► election tags ──► filter ──► feed channel ──► category queue ──┐
//!                                                 │ full                        │
//!                                                 ▼                             ▼
//!                                            disk cache ◄──── all failed ─── batcher
//!                                                 │                             │
//!                                                 └──────── drained first ─────►├──► dataway targets
//!                                                                               └──► sinks
//! ```
//!
//! The crate carries no global state: a [`config::Config`] is built once by the
//! composition root and handed to [`io::IoService::new`].

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod batcher;
pub mod cache;
pub mod config;
pub mod dataway;
pub mod election;
pub mod filter;
pub mod http;
pub mod inputs;
pub mod io;
pub mod logger;
pub mod point;
pub mod proc;
pub mod queue;
pub mod sink;
pub mod stats;

/// Attempts made per Dataway target before a batch is reported as failed.
pub(crate) const FLUSH_RETRY_COUNT: usize = 3;

pub const DATAKIT_IO_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn user_agent() -> String {
    format!("datakit-io/{DATAKIT_IO_VERSION}")
}
