//! Stable error kinds (spec §7).
//!
//! The crate otherwise propagates errors as [`color_eyre::Report`] chains
//! (see the crate-level [`Result`](crate::Result) alias), but callers that
//! need to branch on *kind* rather than message can downcast:
//!
//! ```
//! # use ocm_core::error::OcmError;
//! # let err: color_eyre::Report = OcmError::NotFound { what: "foo".into() }.into();
//! if let Some(OcmError::NotFound { .. }) = err.downcast_ref::<OcmError>() {
//!     // handle not-found specifically
//! }
//! ```

/// A stable, matchable error kind, independent of the causal chain wrapped
/// around it by `color_eyre`.
#[derive(Debug, thiserror::Error)]
pub enum OcmError {
    /// A type string did not resolve to any registered variant.
    #[error("unknown type: {type_name}")]
    UnknownType {
        /// The offending type string.
        type_name: String,
    },

    /// JSON/YAML parsing failed.
    #[error("decode error: {detail}")]
    Decode {
        /// Human-readable detail, including a source snippet where available.
        detail: String,
    },

    /// A plugin request failed JSON Schema validation.
    #[error("schema validation failed: {detail}")]
    SchemaValidation {
        /// Validation failure detail.
        detail: String,
    },

    /// A lookup found nothing.
    #[error("not found: {what}")]
    NotFound {
        /// What was being looked up.
        what: String,
    },

    /// An add-style operation collided with an existing entry.
    #[error("conflict: {what}")]
    Conflict {
        /// What already existed.
        what: String,
    },

    /// A blob's content did not match its declared digest.
    #[error("blob digest verification failed: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the blob claimed to have.
        expected: String,
        /// The digest actually computed from the bytes read.
        actual: String,
    },

    /// The operation's context was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// A plugin transport call (HTTP/socket) failed.
    #[error("transport error: {detail}")]
    Transport {
        /// Transport failure detail.
        detail: String,
    },

    /// A plugin's child process failed to start or never became ready.
    #[error("plugin start failed: {detail}")]
    PluginStart {
        /// Start failure detail.
        detail: String,
    },

    /// A write was attempted against a read-only filesystem mount.
    #[error("filesystem is read-only")]
    ReadOnly,

    /// A filesystem operation was denied by permission bits.
    #[error("permission denied")]
    Permission,

    /// The path-to-blob tar producer encountered a symlink.
    #[error("symlinks are not supported")]
    SymlinkRejected,

    /// A path escaped the configured working directory.
    #[error("path escapes working directory")]
    WorkingDirEscape,
}
