//! An in-process admission-control queue for asynchronous jobs, throttled by
//! completions per trailing time window.

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod queue;
