//! Configuration file watcher for hot reload.
//!
//! Filesystem events for the config file are debounced so editors and
//! orchestrators that rewrite the file in several steps trigger a single
//! reload. Reload errors are logged and the previously installed
//! configuration stays active.

use crate::config::GatewayConfig;
use crate::debounce::Debouncer;
use crate::error::{ProxyError, Result};
use crate::gateway::Gateway;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Quiet period before a burst of file events becomes one reload.
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(5);

/// Watches the configuration file and applies debounced reloads to the
/// gateway until the watch channel closes.
pub async fn watch_config(path: PathBuf, gateway: Arc<Gateway>) -> Result<()> {
    let path = path.canonicalize().unwrap_or_else(|_| path.clone());
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, mut rx) = mpsc::channel::<Event>(16);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.blocking_send(event);
        }
        Err(e) => warn!("configuration watcher error: {e}"),
    })
    .map_err(|e| ProxyError::Io(io::Error::other(e)))?;

    // watching the directory also catches writers that replace the file
    // (rename-over, symlink swap) instead of updating it in place
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| ProxyError::Io(io::Error::other(e)))?;
    info!("watching configuration {}", path.display());

    let debouncer = Debouncer::new(RELOAD_DEBOUNCE);
    while let Some(event) = rx.recv().await {
        // a delete event would bork the server; the replacement write
        // follows shortly
        if matches!(event.kind, EventKind::Remove(_)) {
            continue;
        }
        let relevant = event
            .paths
            .iter()
            .any(|p| p == &path || p.file_name() == path.file_name());
        if !relevant {
            continue;
        }

        let path = path.clone();
        let gateway = Arc::clone(&gateway);
        debouncer.call(async move {
            info!("reloading configuration");
            match GatewayConfig::from_path(&path) {
                Ok(conf) => {
                    if let Err(e) = gateway.load_config(&conf) {
                        error!("error reapplying configuration, ignoring: {e}");
                    }
                }
                Err(e) => error!("error reloading configuration, ignoring: {e}"),
            }
        });
    }

    Ok(())
}
