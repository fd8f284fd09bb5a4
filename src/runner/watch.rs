//! Watch mode is implemented as a three-part system:
//!
//! 1. **File watcher**: Uses the `notify` crate to monitor the source roots
//!    recursively. Events are debounced, filtered down to paths some task
//!    cares about, and sent to the watch loop as change batches.
//! 2. **WebSocket server**: [`LiveReload`] keeps persistent connections with
//!    open browser tabs.
//! 3. **Client script**: the `inject` task adds a small script to every page
//!    in watch mode, which reloads the page on a `"reload"` message.
//!
//! ## The Loop
//!
//! Builds run one at a time on the calling thread. Batches that arrive
//! during a build wait in the channel; once the build finishes they are all
//! merged into a single change set, which drives the next build.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender, channel};

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};

use super::Pipeline;
use super::reload::{BuildListener, LiveReload};
use crate::core::{Environment, Mode};
use crate::error::{TsumikiError, WatchError};
use crate::scheduler::{BuildRun, CancelToken, Changes, Scheduler};
use crate::task::MATCH_OPTIONS;

/// Options of the `watch` command.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Open the served site in a browser after the first build.
    pub open: bool,
}

/// Messages consumed by the watch loop.
#[derive(Debug)]
pub enum Signal {
    Changes(Changes),
    Stop,
}

pub(crate) fn watch(pipeline: &Pipeline, options: &WatchOptions) -> Result<(), TsumikiError> {
    let config = pipeline.config().clone();
    let root = config
        .root
        .canonicalize_utf8()
        .map_err(|e| WatchError::Resolve(config.root.to_string(), e.into()))?;

    let reload = LiveReload::start(LiveReload::reserve().map_err(WatchError::Io)?)
        .map_err(WatchError::Io)?;
    tracing::debug!(port = reload.port(), "live-reload listening");

    let env = Environment::new(config.clone(), Mode::Watch).with_reload_port(reload.port());
    pipeline.clear_output()?;
    let mut scheduler = pipeline.scheduler(env);

    let cancel = CancelToken::new();
    let (tx, rx) = channel();

    {
        let cancel = cancel.clone();
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            cancel.cancel();
            let _ = tx.send(Signal::Stop);
        })
        .map_err(WatchError::Signal)?;
    }

    let mut watched = HashSet::new();
    let mut filters = Vec::new();
    for task in pipeline.graph().tasks() {
        for glob in task.globs() {
            match resolve_watch_path(&root, glob) {
                Ok((path, pattern)) => {
                    watched.insert(path);
                    filters.push(pattern);
                }
                Err(e) => tracing::warn!("not watching `{glob}`: {e}"),
            }
        }
    }

    let mut debouncer = new_debouncer(
        config.batch_delay(),
        None,
        forward_events(root.clone(), filters, tx),
    )
    .map_err(WatchError::Notify)?;

    for path in collapse_watch_paths(watched) {
        tracing::info!("watching {}", path);
        debouncer
            .watch(&path, RecursiveMode::Recursive)
            .map_err(WatchError::Notify)?;
    }

    tracing::info!("running initial build...");
    rebuild(&mut scheduler, Changes::All, &cancel, &[&reload]);
    if cancel.is_cancelled() {
        return Ok(());
    }

    #[cfg(feature = "server")]
    let _thread_http = super::http::start(config.output_path(), config.server_port);

    if options.open {
        let url = format!("http://localhost:{}/", config.server_port);
        if let Err(e) = super::browser::open(&url) {
            tracing::warn!("couldn't open {url}: {e}");
        }
    }

    tracing::info!("initial build completed, now watching for changes...");

    while let Ok(signal) = rx.recv() {
        let Some(changes) = coalesce(signal, &rx) else {
            break;
        };

        if changes.is_empty() {
            continue;
        }

        tracing::info!("change detected, re-running tasks...");
        rebuild(&mut scheduler, changes, &cancel, &[&reload]);

        if cancel.is_cancelled() {
            break;
        }
    }

    tracing::info!("stopped watching");
    Ok(())
}

/// Merge `first` with every batch already waiting in `rx`. Returns `None`
/// when the loop should stop.
pub fn coalesce(first: Signal, rx: &Receiver<Signal>) -> Option<Changes> {
    let mut changes = match first {
        Signal::Changes(changes) => changes,
        Signal::Stop => return None,
    };

    while let Ok(signal) = rx.try_recv() {
        match signal {
            Signal::Changes(more) => changes.merge(more),
            Signal::Stop => return None,
        }
    }

    Some(changes)
}

/// Run one incremental build and notify the listeners if it succeeded.
/// Failures are logged; watching continues either way.
pub fn rebuild(
    scheduler: &mut Scheduler,
    changes: Changes,
    cancel: &CancelToken,
    listeners: &[&dyn BuildListener],
) -> BuildRun {
    let run = scheduler.run(&changes, cancel);

    if run.is_success() {
        if !run.order.is_empty() {
            for listener in listeners {
                listener.notify_ready(&run);
            }
        }
        tracing::info!("rebuild complete, watching for changes...");
    } else if run.cancelled {
        tracing::info!("build cancelled");
    } else {
        for failure in run.failures() {
            tracing::error!("{failure}");
        }
        tracing::warn!("build failed, watching for changes...");
    }

    run
}

/// Build the debouncer callback: keep the event paths some task glob
/// matches, relative to `root`, and forward them as one batch.
fn forward_events(
    root: Utf8PathBuf,
    filters: Vec<Pattern>,
    tx: Sender<Signal>,
) -> impl FnMut(DebounceEventResult) + Send + 'static {
    move |result| match result {
        Ok(events) => {
            let paths = events.iter().flat_map(|e| e.event.paths.iter());
            let changed = relevant_paths(&root, &filters, paths);

            if !changed.is_empty() {
                tracing::debug!(?changed, "change batch");
                let _ = tx.send(Signal::Changes(Changes::Paths(changed)));
            }
        }
        Err(errors) => {
            for e in errors {
                tracing::error!("watch error: {e:?}");
            }
        }
    }
}

fn relevant_paths<'a>(
    root: &Utf8Path,
    filters: &[Pattern],
    paths: impl IntoIterator<Item = &'a PathBuf>,
) -> BTreeSet<Utf8PathBuf> {
    paths
        .into_iter()
        .filter(|path| filters.iter().any(|f| f.matches_path_with(path, MATCH_OPTIONS)))
        .filter_map(|path| Utf8Path::from_path(path))
        .filter_map(|path| path.strip_prefix(root).ok())
        .map(Utf8Path::to_path_buf)
        .collect()
}

/// Splits a root-relative glob into a canonicalized static root path (for
/// watching) and a compiled absolute Pattern (for matching).
pub fn resolve_watch_path(
    root: &Utf8Path,
    glob_str: impl AsRef<str>,
) -> Result<(Utf8PathBuf, Pattern), WatchError> {
    let glob_str = glob_str.as_ref();
    let path = Utf8Path::new(glob_str);
    let resolve = |e: anyhow::Error| WatchError::Resolve(glob_str.to_string(), e);

    // Split path into static root and dynamic suffix (containing wildcards)
    let components: Vec<_> = path.components().collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root_part: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix_part: Utf8PathBuf = components.iter().skip(split_idx).collect();

    // Canonicalize the static root (must exist on disk)
    let absolute_root = root
        .join(root_part)
        .canonicalize_utf8()
        .map_err(|e| resolve(e.into()))?;

    let escaped = Pattern::escape(absolute_root.as_str());

    // A concrete file is watched through its parent, so atomic writes that
    // replace the file are caught.
    let (watch_root, pattern) = if suffix_part.as_str().is_empty() && absolute_root.is_file() {
        let parent = absolute_root
            .parent()
            .unwrap_or(&absolute_root)
            .to_path_buf();
        (parent, escaped)
    } else if suffix_part.as_str().is_empty() {
        (absolute_root, format!("{escaped}/**/*"))
    } else {
        (absolute_root, format!("{escaped}/{suffix_part}"))
    };

    let pattern = Pattern::new(&pattern).map_err(|e| resolve(e.into()))?;
    Ok((watch_root, pattern))
}

/// Reduces a set of paths to the minimal set of watch roots.
///
/// If we watch `/a` and `/a/b`, we only need to watch `/a` because
/// the watcher is recursive. This function sorts the paths and filters
/// out any path that is a subdirectory of a previously accepted path.
pub(crate) fn collapse_watch_paths(paths: HashSet<Utf8PathBuf>) -> Vec<Utf8PathBuf> {
    let mut paths: Vec<_> = paths.into_iter().collect();
    paths.sort();

    let mut filtered: Vec<Utf8PathBuf> = Vec::new();
    for path in paths {
        if let Some(last) = filtered.last()
            && path.starts_with(last)
        {
            continue;
        }
        filtered.push(path);
    }

    filtered
}
