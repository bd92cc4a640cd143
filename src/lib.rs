//! A content-addressed, typed-artifact runtime: describe component versions,
//! store and transfer their resources through pluggable repositories, and
//! verify everything by digest along the way.
//!
//! The crate is organized around the same seams a concrete implementation
//! needs to cross: a type registry for polymorphic documents ([`scheme`]),
//! a streaming blob model with optional capabilities ([`blob`]), a virtual
//! filesystem abstraction ([`vfs`]), a plugin registry and transport for
//! out-of-process repository backends ([`plugin`]), the repository contract
//! itself ([`repository`]), a component-name resolver ([`resolver`]), a
//! layered configuration loader ([`config`]), and a directory-to-blob
//! tar/gzip pipeline ([`pathblob`]).

#![deny(unsafe_code)]

pub mod blob;
pub mod config;
pub mod digest;
pub mod error;
pub mod pathblob;
pub mod plugin;
pub mod repository;
pub mod resolver;
pub mod scheme;
pub mod vfs;

/// The crate-wide result alias: a `color_eyre` contextual error chain,
/// optionally carrying a stable [`error::OcmError`] as its root cause.
pub type Result<T> = color_eyre::Result<T>;

/// Install a `tracing` subscriber reading its filter from `RUST_LOG`
/// (falling back to `info`). Library code never calls this itself; it is
/// offered for consumers (binaries, test harnesses) the way `circe`'s own
/// binary installs its subscriber rather than `circe_lib`.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

pub use digest::Digest;
pub use error::OcmError;
