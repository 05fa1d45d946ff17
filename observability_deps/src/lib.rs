//! Re-exports of the observability stack used by every crate in this
//! workspace.
//!
//! Crates depend on this shim rather than on `tracing` directly so that a
//! single place coordinates the version (and any future swap of the
//! underlying implementation).

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
