// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Side-band engine events.
//!
//! Events are posted through a non-blocking broadcast bus; transports (TTY
//! renderers, trace uploaders) subscribe elsewhere. Posting never waits and
//! never sits on the cache critical path.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::BuildKind;
use crate::target::BuildTarget;

/// Typed events the engine emits while building.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RuleStarted {
        target: BuildTarget,
    },
    /// `kind` is `None` when the rule failed or was canceled.
    RuleFinished {
        target: BuildTarget,
        kind: Option<BuildKind>,
    },
    CacheFetchStarted {
        target: BuildTarget,
        key: String,
    },
    CacheFetchFinished {
        target: BuildTarget,
        key: String,
        hit: bool,
    },
    CompressionStarted {
        target: BuildTarget,
    },
    CompressionFinished {
        target: BuildTarget,
        compressed_bytes: u64,
    },
    UploadStarted {
        target: BuildTarget,
    },
    UploadFinished {
        target: BuildTarget,
        ok: bool,
    },
}

/// Non-blocking fan-out of [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Post an event; dropped if nobody is listening.
    pub fn post(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
