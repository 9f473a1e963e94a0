//! Cache key derivation.
//!
//! Keys are rendered from a binding's template; `hashFiles` contributes a
//! SHA-256 digest over the matched input files so that an unchanged lockfile
//! yields the same key across runs and any content change yields a new one.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};
use crate::pipeline::{render_strict, CacheBinding, TemplateContext};

/// Hash the files matched by `patterns` (relative to `workspace`).
///
/// Matches are de-duplicated and sorted so the digest is independent of
/// pattern order. Returns an empty string when nothing matches.
pub fn hash_files(workspace: &Path, patterns: &[String]) -> CacheResult<String> {
    let mut files: BTreeSet<PathBuf> = BTreeSet::new();

    for pattern in patterns {
        let root = glob::Pattern::escape(&workspace.to_string_lossy());
        let full = Path::new(&root).join(pattern);
        let entries = glob::glob(&full.to_string_lossy()).map_err(|e| CacheError::Key {
            binding: pattern.clone(),
            reason: e.to_string(),
        })?;

        for entry in entries.filter_map(Result::ok) {
            if entry.is_file() {
                files.insert(entry);
            }
        }
    }

    if files.is_empty() {
        return Ok(String::new());
    }

    let mut hasher = Sha256::new();
    for file in &files {
        let bytes = std::fs::read(file)?;
        hasher.update(Sha256::digest(&bytes));
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the cache key for a binding in an environment.
pub fn compute_key(binding: &CacheBinding, ctx: &TemplateContext<'_>) -> CacheResult<String> {
    let context = format!("cache '{}'", binding.name);
    let key = render_strict(&binding.key, ctx, &context)
        .map_err(|e| CacheError::Key { binding: binding.name.clone(), reason: e.to_string() })?;

    if key.trim().is_empty() {
        return Err(CacheError::Key {
            binding: binding.name.clone(),
            reason: "key renders to an empty string".to_string(),
        });
    }

    Ok(key)
}

/// File-name-safe form of a key.
///
/// Keys that needed rewriting get a `+<digest>` suffix. `+` is never kept by
/// the sanitizer, so a rewritten name cannot equal any key stored verbatim.
pub fn storage_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();

    if sanitized == key {
        return sanitized;
    }

    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    format!("{sanitized}+{}", &digest[..12])
}
