// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The build-rule surface the engine drives.
//!
//! A rule carries declared deps, opaque build steps, declared outputs, and a
//! set of capability predicates. Capabilities default to `false`; rule kinds
//! opt in to input-based keys, dep-file keys, and manifest caching.
//!
//! Rule authors declare which fields participate in key computation by
//! enumerating [`KeyField`]s; there is no reflection. Fields that only
//! affect scheduling are marked so the input-based key skips them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::key::RuleKey;
use crate::scheduler::ResourceAmounts;
use crate::target::{BuildTarget, PathResolver, SourcePath};

/// A value fed to the key hasher.
#[derive(Debug, Clone)]
pub enum KeyValue {
    Str(String),
    Num(u64),
    Bool(bool),
    /// A source file; hashed by resolved content, not by name alone.
    Path(SourcePath),
    /// Ordered source files.
    Paths(Vec<SourcePath>),
    /// Ordered strings.
    List(Vec<String>),
    /// Unordered strings; sorted before hashing.
    Set(Vec<String>),
}

/// One rule field participating in key computation.
#[derive(Debug, Clone)]
pub struct KeyField {
    pub name: &'static str,
    pub value: KeyValue,
    /// Whether the field participates in the input-based key. Scheduling
    /// flags and other non-input fields set this to `false`.
    pub input_based: bool,
}

impl KeyField {
    pub fn new(name: &'static str, value: KeyValue) -> Self {
        Self {
            name,
            value,
            input_based: true,
        }
    }

    /// A field that influences the default key only.
    pub fn scheduling_only(name: &'static str, value: KeyValue) -> Self {
        Self {
            name,
            value,
            input_based: false,
        }
    }
}

/// Error from executing a single step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// The step could not run.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Execution context handed to steps.
pub struct StepContext {
    pub resolver: PathResolver,
}

/// An opaque, executable unit of work contributed by a rule.
#[async_trait]
pub trait Step: Send + Sync {
    fn short_name(&self) -> &str;

    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError>;
}

/// A build rule: identity, dependencies, steps, outputs, and capabilities.
pub trait BuildRule: Send + Sync {
    fn target(&self) -> &BuildTarget;

    /// Rule kind name, folded into every key.
    fn rule_type(&self) -> &str;

    /// Declared dependencies, in declaration order.
    fn deps(&self) -> Vec<BuildTarget>;

    /// Declared output paths, relative to the project root.
    fn outputs(&self) -> Vec<SourcePath>;

    /// Fields participating in key computation.
    fn key_fields(&self) -> Vec<KeyField>;

    /// The rule's build steps, in execution order.
    fn steps(&self) -> Vec<Arc<dyn Step>>;

    /// Resource vector charged while the rule's steps run.
    fn resources(&self) -> ResourceAmounts {
        ResourceAmounts::cpu(1)
    }

    fn is_cacheable(&self) -> bool {
        true
    }

    fn supports_input_based_key(&self) -> bool {
        false
    }

    fn uses_dep_file_keys(&self) -> bool {
        false
    }

    fn uses_manifest_caching(&self) -> bool {
        false
    }

    /// Whether `path` belongs to the rule's dep-file universe.
    fn covered_by_dep_file(&self, _path: &SourcePath) -> bool {
        false
    }

    /// Inputs the rule observed itself reading during the local build that
    /// just finished. Only meaningful when [`uses_dep_file_keys`] is true.
    ///
    /// [`uses_dep_file_keys`]: BuildRule::uses_dep_file_keys
    fn inputs_after_building_locally(&self) -> Vec<SourcePath> {
        Vec::new()
    }

    fn has_post_build_steps(&self) -> bool {
        false
    }

    fn post_build_steps(&self) -> Vec<Arc<dyn Step>> {
        Vec::new()
    }

    fn has_runtime_deps(&self) -> bool {
        false
    }

    /// Targets that must also have built before this rule's output is usable.
    fn runtime_deps(&self) -> Vec<BuildTarget> {
        Vec::new()
    }

    /// Summary of the rule's public surface, fed to dependents' input-based
    /// keys so implementation-only changes do not invalidate them.
    fn abi_key(&self) -> Option<RuleKey> {
        None
    }
}
