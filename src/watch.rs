//! Filesystem watching.
//!
//! Watches an explicit, non-recursive list of folders (the descriptor
//! enumerates nested folders up front), filters out noise, and forwards each
//! surviving change through a short-window [`Debouncer`] keyed by the changed
//! path. Within one window only the last event for a given path survives;
//! ordering across different paths is not guaranteed.

use crate::config::PROTO_OUTPUT_DIR;
use crate::debounce::Debouncer;
use crate::error::{Error, Result};
use notify::event::{Event, EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Basename suffixes that never warrant a restart: build lock files, editor
/// swap and temp files.
const IGNORE_SUFFIXES: &[&str] = &[".lock", ".swp", ".swo", "~", ".tmp", ".orig"];

/// What a filesystem change asks the supervisor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Restart,
    GenerateProtos,
    GenerateSchema,
}

/// Keeps an OS watch subscription alive. Dropping it ends the subscription.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
}

/// Subscribe to `paths` (each watched non-recursively) and forward qualifying
/// changes through `debouncer`, keyed per path, to `handler`.
///
/// `on_error` is invoked on any watcher failure; the subscription is
/// considered dead afterwards.
pub fn watch_paths(
    service: &str,
    paths: &[PathBuf],
    debouncer: Debouncer,
    handler: Arc<dyn Fn(PathBuf, EventKind) + Send + Sync>,
    on_error: Arc<dyn Fn(notify::Error) + Send + Sync>,
) -> Result<WatchHandle> {
    let service_name = service.to_string();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                if !is_relevant(&event.kind) {
                    return;
                }
                for path in &event.paths {
                    if is_ignored(path) {
                        continue;
                    }
                    tracing::debug!(service = %service_name, path = %path.display(), "change detected");
                    let handler = Arc::clone(&handler);
                    let path = path.clone();
                    let kind = event.kind;
                    debouncer.debounce(path.to_string_lossy().into_owned(), async move {
                        handler(path, kind);
                    });
                }
            }
            Err(error) => on_error(error),
        }
    })
    .map_err(|e| Error::Watch {
        service: service.to_string(),
        reason: e.to_string(),
    })?;

    for path in paths {
        if !path.exists() {
            tracing::debug!(service, path = %path.display(), "skipping missing watch path");
            continue;
        }
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watch {
                service: service.to_string(),
                reason: format!("could not watch {}: {}", path.display(), e),
            })?;
    }

    Ok(WatchHandle { _watcher: watcher })
}

/// Decide what a change under the service's own folders means.
///
/// A removed or renamed file directly under the proto output dir means the
/// generated code is gone and has to be rebuilt; a schema definition file
/// triggers schema generation; everything else restarts the service.
pub fn classify(path: &Path, kind: EventKind) -> Change {
    let removed = matches!(
        kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    let in_proto_output =
        path.parent().and_then(Path::file_name) == Some(OsStr::new(PROTO_OUTPUT_DIR));
    if removed && in_proto_output {
        return Change::GenerateProtos;
    }

    if path.extension() == Some(OsStr::new("graphql")) {
        return Change::GenerateSchema;
    }

    Change::Restart
}

/// Drop permission/metadata-only and access-only events.
fn is_relevant(kind: &EventKind) -> bool {
    !matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
    )
}

/// Drop paths whose basename is noise: hidden temp files and the configured
/// ignore suffixes.
pub fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return true;
    };
    if name.starts_with('.') {
        return true;
    }
    IGNORE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn ignores_lock_swap_and_hidden_files() {
        assert!(is_ignored(Path::new("/svc/Cargo.lock")));
        assert!(is_ignored(Path::new("/svc/src/main.rs.swp")));
        assert!(is_ignored(Path::new("/svc/src/main.rs~")));
        assert!(is_ignored(Path::new("/svc/.main.rs.tmp")));
        assert!(is_ignored(Path::new("/svc/.DS_Store")));
        assert!(!is_ignored(Path::new("/svc/src/main.rs")));
        assert!(!is_ignored(Path::new("/svc/devwatch.yaml")));
    }

    #[test]
    fn metadata_only_events_are_irrelevant() {
        assert!(!is_relevant(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_relevant(&EventKind::Access(
            notify::event::AccessKind::Read
        )));
        assert!(is_relevant(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
    }

    #[test]
    fn removed_proto_artifact_regenerates() {
        let change = classify(
            Path::new("/svc/pb/auth.rs"),
            EventKind::Remove(RemoveKind::File),
        );
        assert_eq!(change, Change::GenerateProtos);

        let change = classify(
            Path::new("/svc/pb/auth.rs"),
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
        );
        assert_eq!(change, Change::GenerateProtos);

        // A modification (not removal) under pb/ is just a restart
        let change = classify(
            Path::new("/svc/pb/auth.rs"),
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
        );
        assert_eq!(change, Change::Restart);
    }

    #[test]
    fn schema_files_regenerate_schema() {
        let change = classify(
            Path::new("/svc/schema/query.graphql"),
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
        );
        assert_eq!(change, Change::GenerateSchema);
    }

    #[test]
    fn source_changes_restart() {
        let change = classify(
            Path::new("/svc/src/main.rs"),
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
        );
        assert_eq!(change, Change::Restart);
    }
}
