//! Source resolution and bundling.
//!
//! A resolver turns an entry file into a [`SourcePayload`]: the entry's code
//! (or an archive of it and its local dependencies) plus a bootstrap wrapper
//! that the sandbox loads. One resolver exists per supported runtime kind and
//! is selected with [`resolver_for`].

mod node;

pub use node::NodeResolver;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ResolutionError;

/// File name of the generated bootstrap inside a mounted payload.
pub const BOOTSTRAP_FILE: &str = "__bootstrap.js";

/// Runtime kind that decides how sources are bundled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    NodeJs,
}

/// How the entry file exposes its callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Defines a top-level `main` without exporting it.
    Script,
    /// Exports its callable.
    Module,
}

/// Caller options for a resolve call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Package as an archive even when there are no local dependencies.
    pub archive: bool,
}

/// Mount-ready snapshot of the function's sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePayload {
    /// Entry file relative to the project root, always `/`-separated.
    pub entry_path: String,
    pub kind: ModuleKind,
    /// Entry contents, or a gzipped tar of entry and dependencies when `is_binary`.
    pub code: Vec<u8>,
    pub is_binary: bool,
    /// Local files reached from the entry, in discovery order, entry excluded.
    pub dependencies: Vec<PathBuf>,
    /// Generated wrapper exposing `main` to the runtime.
    pub bootstrap: String,
    /// Absolute path of the entry file on the host.
    pub source_file: PathBuf,
}

impl SourcePayload {
    /// Every host file this payload was built from.
    pub fn files(&self) -> Vec<PathBuf> {
        std::iter::once(self.source_file.clone())
            .chain(self.dependencies.iter().cloned())
            .collect()
    }
}

/// Per-runtime bundling rules.
pub trait SourceResolver: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Resolve `entry` against `root` into a payload.
    fn resolve(
        &self,
        entry: &Path,
        root: &Path,
        options: ResolveOptions,
    ) -> Result<SourcePayload, ResolutionError>;
}

/// Look up the resolver for a runtime kind.
pub fn resolver_for(kind: SourceKind) -> &'static dyn SourceResolver {
    match kind {
        SourceKind::NodeJs => &NodeResolver,
    }
}

/// Rewrite a path with `/` separators regardless of the host convention.
pub fn portable_path(path: &str) -> String {
    path.replace('\\', "/")
}
