//! Bearer token store backed by a directory of token files.
//!
//! Every regular file under the directory holds one token. The set is
//! rebuilt on filesystem change events and once a minute regardless, so it
//! heals even when change notification is unavailable.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Minimum accepted token length in bytes.
pub const MIN_TOKEN_LEN: usize = 64;

/// Fallback reload period.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Current set of valid tokens.
///
/// Reloads build the new set off-lock and swap it in whole, so readers never
/// see a mix of old and new members.
pub struct TokenStore {
    dir: PathBuf,
    tokens: RwLock<Arc<Vec<String>>>,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log token values
        f.debug_struct("TokenStore")
            .field("dir", &self.dir)
            .field("tokens", &self.len())
            .finish()
    }
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tokens: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read the token directory and replace the whole set.
    ///
    /// Unreadable or short files are logged and skipped. Returns the number
    /// of tokens now loaded.
    pub fn reload(&self) -> usize {
        let tokens = read_token_dir(&self.dir);
        let count = tokens.len();
        *self.tokens.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(tokens);
        tracing::debug!(dir = %self.dir.display(), count, "Token set reloaded");
        count
    }

    /// Membership test. Every stored token is compared in constant time.
    pub fn contains(&self, token: &str) -> bool {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        let mut found = subtle::Choice::from(0u8);
        for stored in tokens.iter() {
            found |= stored.as_bytes().ct_eq(token.as_bytes());
        }
        found.into()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_token_dir(dir: &Path) -> Vec<String> {
    let mut tokens = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "Error walking token directory");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Could not read token file");
                continue;
            }
        };
        let token = content.trim();
        if token.len() < MIN_TOKEN_LEN {
            tracing::error!(
                path = %path.display(),
                min_len = MIN_TOKEN_LEN,
                "Token file contents too short, skipping"
            );
            continue;
        }
        tokens.push(token.to_string());
    }
    tokens
}

/// Load the initial set and keep it fresh for the life of the process.
///
/// Spawns the periodic reload loop and the directory watcher. A watcher
/// that cannot start leaves the periodic loop as the only refresh path.
pub fn spawn_reloader(store: Arc<TokenStore>) {
    if let Err(e) = std::fs::create_dir_all(store.dir()) {
        tracing::warn!(dir = %store.dir().display(), error = %e, "Could not create token directory");
    }
    tokio::spawn(run_periodic_reload(store.clone(), RELOAD_INTERVAL));
    tokio::spawn(run_watcher(store));
}

/// Reload immediately, then every `interval`.
pub async fn run_periodic_reload(store: Arc<TokenStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        reload_blocking(&store).await;
    }
}

/// Reload on every filesystem event in the token directory.
///
/// Returns when the watcher fails; the periodic loop keeps running.
pub async fn run_watcher(store: Arc<TokenStore>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    );
    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Token watcher could not be started; falling back to once-a-minute reloads"
            );
            return;
        }
    };
    if let Err(e) = watcher.watch(store.dir(), RecursiveMode::Recursive) {
        tracing::warn!(
            dir = %store.dir().display(),
            error = %e,
            "Token watcher could not watch directory; falling back to once-a-minute reloads"
        );
        return;
    }
    tracing::info!(dir = %store.dir().display(), "Watching token directory");

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                tracing::debug!(kind = ?event.kind, "Token directory event");
                reload_blocking(&store).await;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Token watcher error; falling back to once-a-minute reloads"
                );
                return;
            }
        }
    }
    drop(watcher);
}

async fn reload_blocking(store: &Arc<TokenStore>) {
    let store = store.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || store.reload()).await {
        tracing::error!(error = %e, "Token reload task failed");
    }
}
