//! Node.js bundling rules.
//!
//! Walks relative `require`/`import` specifiers depth-first from the entry
//! file. Bare specifiers are libraries and are expected in the runtime image.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use tracing::{debug, instrument};

use super::{
    portable_path, ModuleKind, ResolveOptions, SourceKind, SourcePayload, SourceResolver,
};
use crate::error::ResolutionError;

/// Extensions tried, in order, when a specifier omits one.
const EXTENSIONS: &[&str] = &["js", "cjs", "mjs", "json"];

/// Resolver for Node.js actions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeResolver;

impl SourceResolver for NodeResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::NodeJs
    }

    #[instrument(skip(self, options), fields(entry = %entry.display()))]
    fn resolve(
        &self,
        entry: &Path,
        root: &Path,
        options: ResolveOptions,
    ) -> Result<SourcePayload, ResolutionError> {
        // Accept either separator convention for caller-supplied paths.
        let entry = PathBuf::from(portable_path(&entry.to_string_lossy()));
        let root = PathBuf::from(portable_path(&root.to_string_lossy()));

        let entry_file = entry
            .canonicalize()
            .map_err(|_| ResolutionError::EntryNotFound(entry.clone()))?;
        if !entry_file.is_file() {
            return Err(ResolutionError::EntryNotFound(entry));
        }
        let root = root.canonicalize().map_err(|source| ResolutionError::Read {
            path: root.clone(),
            source,
        })?;

        let relative = entry_file
            .strip_prefix(&root)
            .map_err(|_| ResolutionError::EntryOutsideRoot {
                entry: entry_file.clone(),
                root: root.clone(),
            })?;
        let entry_path = portable_path(&relative.to_string_lossy());

        let source = read_source(&entry_file)?;
        let kind = classify(&source);

        let mut visited = HashSet::from([entry_file.clone()]);
        let mut dependencies = Vec::new();
        collect_dependencies(&entry_file, &source, &root, &mut visited, &mut dependencies)?;

        let is_binary = options.archive || !dependencies.is_empty();
        let code = if is_binary {
            archive(&root, &entry_file, &dependencies)?
        } else {
            source.into_bytes()
        };

        debug!(
            entry = %entry_path,
            ?kind,
            dependencies = dependencies.len(),
            is_binary,
            "Resolved sources"
        );

        Ok(SourcePayload {
            bootstrap: bootstrap(&entry_path, kind),
            entry_path,
            kind,
            code,
            is_binary,
            dependencies,
            source_file: entry_file,
        })
    }
}

fn export_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)(\bmodule\.exports\b|\bexports\.\w+\s*=|^\s*export\s)").expect("valid regex")
    })
}

fn import_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?x)
            \brequire\s*\(\s*['"]([^'"]+)['"]\s*\)
            | \bimport\s*\(\s*['"]([^'"]+)['"]\s*\)
            | \b(?:import|export)\s+[\w*{}\s,$]+?\s+from\s*['"]([^'"]+)['"]
            | \bimport\s*['"]([^'"]+)['"]
            "#,
        )
        .expect("valid regex")
    })
}

/// Modules export their callable; everything else is a script.
fn classify(source: &str) -> ModuleKind {
    if export_pattern().is_match(source) {
        ModuleKind::Module
    } else {
        ModuleKind::Script
    }
}

/// Relative specifiers referenced by a source file, in textual order.
fn local_specifiers(source: &str) -> Vec<&str> {
    import_pattern()
        .captures_iter(source)
        .filter_map(|caps| caps.iter().skip(1).flatten().next())
        .map(|m| m.as_str())
        .filter(|spec| spec.starts_with("./") || spec.starts_with("../"))
        .collect()
}

fn collect_dependencies(
    file: &Path,
    source: &str,
    root: &Path,
    visited: &mut HashSet<PathBuf>,
    dependencies: &mut Vec<PathBuf>,
) -> Result<(), ResolutionError> {
    let dir = file.parent().unwrap_or(root);

    for specifier in local_specifiers(source) {
        let Some(resolved) = resolve_specifier(dir, specifier) else {
            return Err(ResolutionError::MissingDependency {
                specifier: specifier.to_string(),
                from: file.to_path_buf(),
            });
        };
        let resolved = resolved.canonicalize().map_err(|source| ResolutionError::Read {
            path: resolved.clone(),
            source,
        })?;

        if !resolved.starts_with(root) {
            debug!(path = %resolved.display(), "Skipping dependency outside project root");
            continue;
        }
        if !visited.insert(resolved.clone()) {
            continue;
        }
        dependencies.push(resolved.clone());

        if is_script_file(&resolved) {
            let dep_source = read_source(&resolved)?;
            collect_dependencies(&resolved, &dep_source, root, visited, dependencies)?;
        }
    }
    Ok(())
}

fn resolve_specifier(dir: &Path, specifier: &str) -> Option<PathBuf> {
    let base = dir.join(specifier);
    if base.is_file() {
        return Some(base);
    }
    let with_ext = EXTENSIONS.iter().map(|ext| {
        let mut name = base.clone().into_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    });
    with_ext
        .chain(std::iter::once(base.join("index.js")))
        .find(|candidate| candidate.is_file())
}

fn is_script_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "js" | "cjs" | "mjs"))
}

fn read_source(path: &Path) -> Result<String, ResolutionError> {
    std::fs::read_to_string(path).map_err(|source| ResolutionError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Gzipped tar of the entry and its dependencies, keyed by portable relative path.
fn archive(root: &Path, entry: &Path, dependencies: &[PathBuf]) -> Result<Vec<u8>, ResolutionError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for file in std::iter::once(entry).chain(dependencies.iter().map(PathBuf::as_path)) {
        let contents = std::fs::read(file).map_err(|source| ResolutionError::Read {
            path: file.to_path_buf(),
            source,
        })?;
        let name = file
            .strip_prefix(root)
            .map(|rel| portable_path(&rel.to_string_lossy()))
            .unwrap_or_default();

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_slice())
            .map_err(ResolutionError::Archive)?;
    }

    let encoder = builder.into_inner().map_err(ResolutionError::Archive)?;
    encoder.finish().map_err(ResolutionError::Archive)
}

/// Wrapper loaded by the sandbox; it lives next to the unpacked entry.
fn bootstrap(entry_path: &str, kind: ModuleKind) -> String {
    let entry_path = portable_path(entry_path);
    // JSON string literals are valid JS string literals.
    let entry_literal = serde_json::Value::String(format!("/{entry_path}")).to_string();

    match kind {
        ModuleKind::Module => format!(
            "const entry = require(__dirname + {entry_literal});\n\
             const fn = typeof entry === \"function\" ? entry : entry.main;\n\
             module.exports.main = (params) => fn(params);\n"
        ),
        // Scripts get a require rooted at their own file, not at the wrapper.
        ModuleKind::Script => format!(
            "const fs = require(\"fs\");\n\
             const path = require(\"path\");\n\
             const {{ createRequire }} = require(\"module\");\n\
             const filename = path.join(__dirname, {entry_literal});\n\
             const source = fs.readFileSync(filename, \"utf8\");\n\
             const scope = {{ exports: {{}} }};\n\
             const compiled = new Function(\"require\", \"module\", \"exports\", \"__filename\", \"__dirname\", source + \"\\nreturn main;\");\n\
             const main = compiled(createRequire(filename), scope, scope.exports, filename, path.dirname(filename));\n\
             module.exports.main = (params) => main(params);\n"
        ),
    }
}
