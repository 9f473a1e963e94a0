//! Cache restore/save lifecycle.
//!
//! A [`CacheSession`] is acquired by restoring every binding of a run and
//! saves them when it goes out of scope. Cancellation abandons the session so
//! that nothing half-built is ever published.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::archive::{pack_dir, unpack_into};
use super::key::compute_key;
use super::store::CacheStore;
use crate::error::{CacheError, CacheResult};
use crate::pipeline::{render_lenient, CacheBinding, TemplateContext};

/// Result of restoring one binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheState {
    /// A blob existed under exactly this key and was restored.
    Hit { key: String },
    /// No blob under this key; the target path was left as-is.
    Miss { key: String },
    /// The key could not be derived; the binding is skipped entirely.
    Unavailable { reason: String },
}

impl CacheState {
    /// The computed key, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Hit { key } | Self::Miss { key } => Some(key),
            Self::Unavailable { .. } => None,
        }
    }

    /// Whether the restore was an exact hit.
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }
}

/// What happened when saving one binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// The target was packed and published.
    Saved { bytes: usize },
    /// Restored from an exact hit; nothing new to publish.
    SkippedExactHit,
    /// The target path does not exist after the run.
    SkippedMissingPath,
    /// No key could be computed.
    SkippedNoKey,
    /// The run was cancelled before save.
    Abandoned,
    /// Saving failed; reported but never fatal.
    Failed { reason: String },
}

/// A binding after restore, with its resolved target path.
#[derive(Debug, Clone)]
pub struct RestoredCache {
    /// The declared binding
    pub binding: CacheBinding,

    /// Absolute target path
    pub target: PathBuf,

    /// Restore result
    pub state: CacheState,
}

/// Per-binding summary for run reports.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    /// Binding name
    pub name: String,

    /// Restore result
    pub restore: CacheState,

    /// Save result (absent while the session is still open)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save: Option<SaveOutcome>,
}

/// Resolve a binding path: `~` and `$VARS` are expanded, relative paths are
/// taken relative to the workspace.
pub fn resolve_target(path: &str, workspace: &Path) -> PathBuf {
    let expanded = shellexpand::full(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(path).into_owned());
    let expanded = PathBuf::from(expanded);

    if expanded.is_absolute() {
        expanded
    } else {
        workspace.join(expanded)
    }
}

/// Restore one binding from the store.
///
/// A missing blob is a miss, not an error. Store or unpack failures are
/// logged and also treated as a miss.
pub fn restore_cache(
    store: &dyn CacheStore,
    binding: &CacheBinding,
    ctx: &TemplateContext<'_>,
) -> RestoredCache {
    let target = resolve_target(&render_lenient(&binding.path, ctx), ctx.workspace);

    let state = match compute_key(binding, ctx) {
        Err(e) => {
            tracing::warn!(cache = %binding.name, error = %e, "Cache key unavailable, skipping");
            CacheState::Unavailable { reason: e.to_string() }
        }
        Ok(key) => match store.get(&key) {
            Ok(Some(bytes)) => match unpack_into(&bytes, &target) {
                Ok(()) => {
                    tracing::info!(cache = %binding.name, %key, path = ?target, "Cache hit");
                    CacheState::Hit { key }
                }
                Err(e) => {
                    tracing::warn!(cache = %binding.name, %key, error = %e, "Cache restore failed");
                    CacheState::Miss { key }
                }
            },
            Ok(None) => {
                tracing::info!(cache = %binding.name, %key, "Cache miss");
                CacheState::Miss { key }
            }
            Err(e) => {
                tracing::warn!(cache = %binding.name, %key, error = %e, "Cache lookup failed");
                CacheState::Miss { key }
            }
        },
    };

    RestoredCache { binding: binding.clone(), target, state }
}

/// Save one restored binding.
///
/// Exact hits are not re-saved. Errors are returned for the caller to log;
/// they never affect a run's status.
pub fn save_cache(store: &dyn CacheStore, restored: &RestoredCache) -> CacheResult<SaveOutcome> {
    let key = match &restored.state {
        CacheState::Hit { .. } => return Ok(SaveOutcome::SkippedExactHit),
        CacheState::Unavailable { .. } => return Ok(SaveOutcome::SkippedNoKey),
        CacheState::Miss { key } => key,
    };

    if !restored.target.exists() {
        return Ok(SaveOutcome::SkippedMissingPath);
    }

    let bytes = pack_dir(&restored.target)?;
    store.put(key, &bytes)?;

    tracing::info!(cache = %restored.binding.name, %key, size = bytes.len(), "Cache saved");
    Ok(SaveOutcome::Saved { bytes: bytes.len() })
}

/// Scoped cache lifecycle for one run.
///
/// Created by [`CacheSession::restore`]. Dropping the session saves every
/// binding that was not an exact hit; [`CacheSession::abandon`] disarms it.
pub struct CacheSession {
    store: Arc<dyn CacheStore>,
    entries: Option<Vec<RestoredCache>>,
}

impl CacheSession {
    /// Restore every binding, in declaration order.
    pub fn restore(
        store: Arc<dyn CacheStore>,
        bindings: &[CacheBinding],
        ctx: &TemplateContext<'_>,
    ) -> Self {
        let entries = bindings.iter().map(|b| restore_cache(store.as_ref(), b, ctx)).collect();
        Self { store, entries: Some(entries) }
    }

    /// Restore results so far.
    pub fn entries(&self) -> &[RestoredCache] {
        self.entries.as_deref().unwrap_or_default()
    }

    /// Save all bindings now and report the outcomes.
    pub fn save(mut self) -> Vec<CacheReport> {
        let entries = self.entries.take().unwrap_or_default();
        save_all(self.store.as_ref(), entries)
    }

    /// Skip saving; used when the run was cancelled.
    pub fn abandon(mut self) -> Vec<CacheReport> {
        let entries = self.entries.take().unwrap_or_default();
        if !entries.is_empty() {
            tracing::info!(bindings = entries.len(), "Run cancelled, skipping cache save");
        }
        entries
            .into_iter()
            .map(|e| CacheReport {
                name: e.binding.name,
                restore: e.state,
                save: Some(SaveOutcome::Abandoned),
            })
            .collect()
    }
}

/// Saves on every exit path that did not explicitly save or abandon.
impl Drop for CacheSession {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.take() {
            save_all(self.store.as_ref(), entries);
        }
    }
}

impl std::fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSession").field("entries", &self.entries).finish()
    }
}

fn save_all(store: &dyn CacheStore, entries: Vec<RestoredCache>) -> Vec<CacheReport> {
    entries
        .into_iter()
        .map(|entry| {
            let save = match save_cache(store, &entry) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(cache = %entry.binding.name, error = %e, "Cache save failed");
                    SaveOutcome::Failed { reason: e.to_string() }
                }
            };
            CacheReport { name: entry.binding.name, restore: entry.state, save: Some(save) }
        })
        .collect()
}

/// A store that rejects every write.
///
/// Lets callers (and tests) exercise the save-failure path.
#[derive(Debug, Default)]
pub struct ReadOnlyStore<S> {
    inner: S,
}

impl<S> ReadOnlyStore<S> {
    /// Wrap a store.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: CacheStore> CacheStore for ReadOnlyStore<S> {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, _bytes: &[u8]) -> CacheResult<()> {
        Err(CacheError::Save { key: key.to_string(), reason: "store is read-only".to_string() })
    }
}
