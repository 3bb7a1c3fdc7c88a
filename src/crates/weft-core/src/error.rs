//! Error types for the runtime core
//!
//! This module defines all error conditions that can occur during graph
//! construction, behavior dispatch, provisioning, and journal writes. All
//! errors implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! EngineError
//! ├── Linkage            - Edge endpoint not registered / wrong graph
//! ├── DuplicateIdentity  - Uid or singleton label already taken
//! ├── InvalidPolicy      - Requirement violates its policy's field rules
//! ├── BindingFailure     - Behavior could not be bound at invocation time
//! ├── AcceptorFailure    - A provisioning offer's acceptor failed
//! ├── SequenceViolation  - Non-monotonic seq or journal mutation
//! ├── MarkerExists       - Journal marker name reused within its type
//! ├── TemplateValidation - Template payload has the wrong shape
//! ├── NotFound           - Lookup by uid/label/marker came up empty
//! ├── InvalidCriteria    - Conflicting dispatch criteria (task vs has_task)
//! └── Handler            - Application-defined handler failure
//! ```
//!
//! # Propagation Policy
//!
//! Dispatch never drops a handler failure silently: the caller sees either a
//! [`CallReceipt`](crate::record::CallReceipt) with
//! [`ResultCode::Error`](crate::record::ResultCode) or an `EngineError`.
//! Provisioning catches per-offer failures and records them as rejected build
//! receipts without aborting the remaining plan steps. Construction-time
//! validation (requirements, singleton labels) is fatal and never leaves a
//! partially registered object behind.

use thiserror::Error;
use uuid::Uuid;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for all runtime core operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An edge endpoint belongs to a different graph or is not registered yet.
    #[error("linkage error: {0}")]
    Linkage(String),

    /// A uid or singleton label is already registered.
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),

    /// A requirement was constructed in violation of its policy's field rules.
    #[error("invalid provisioning policy: {0}")]
    InvalidPolicy(String),

    /// A behavior could not be bound at invocation time (for example a dead
    /// weak owner with no caller fallback).
    #[error("binding failure for behavior {behavior}: {reason}")]
    BindingFailure { behavior: Uuid, reason: String },

    /// A provisioning offer's acceptor failed. Recorded per-offer; never
    /// aborts the remaining plan.
    #[error("offer acceptor failed: {0}")]
    AcceptorFailure(String),

    /// A record insert would break strict seq monotonicity, or a journal
    /// mutation (remove, in-place update) was attempted.
    #[error("sequence violation: {0}")]
    SequenceViolation(String),

    /// A journal marker name was reused within its marker type.
    #[error("marker {name:?} already exists for type {marker_type:?}")]
    MarkerExists { marker_type: String, name: String },

    /// A template payload could not be coerced into the expected shape.
    #[error("template validation failed: {0}")]
    TemplateValidation(String),

    /// A lookup by uid, label, or marker found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflicting dispatch criteria were supplied (for example `task=` and
    /// `has_task` disagreeing).
    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    /// Application-defined handler failure, surfaced as an ERROR receipt by
    /// the dispatch pipeline.
    #[error("handler error: {0}")]
    Handler(String),
}

impl EngineError {
    /// Shorthand for a [`EngineError::Handler`] error from any displayable value.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        Self::Handler(msg.to_string())
    }
}
