// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine error taxonomy.
//!
//! Transient artifact-cache errors never appear here; they are demoted to
//! cache misses at the fetch boundary. Everything else that can fail a rule
//! is a [`BuildError`].

use std::path::PathBuf;

use crate::key_factory::KeyError;
use crate::packer::PackError;
use crate::rule::StepError;
use crate::target::TargetError;

/// The reason a rule (or the whole build) failed.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Human-readable user error: missing file, misconfiguration, a rule
    /// misreporting its inputs. Never retried.
    #[error("{0}")]
    User(String),

    /// A build step returned non-success. Fatal to the owning rule.
    #[error("step `{step}` failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    /// Cooperative cancellation. Never swallowed.
    #[error("interrupted")]
    Interrupted,

    /// I/O failure during metadata or artifact handling.
    #[error("io error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key computation failed in a way the engine could not route around.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Malformed target or source path.
    #[error(transparent)]
    Target(#[from] TargetError),

    /// Artifact packing or unpacking failed.
    #[error(transparent)]
    Pack(#[from] PackError),

    /// Local builds are disabled in populate-from-remote-cache mode.
    #[error("local build required for a rule while populating from the remote cache")]
    PopulateOnlyDisabledLocal,

    /// Programmer-error invariant violation. Fatal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Convenience for I/O failures tied to a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type using the engine's [`BuildError`].
pub type Result<T> = std::result::Result<T, BuildError>;
