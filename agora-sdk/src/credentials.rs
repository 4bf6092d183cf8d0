//! Credential storage shared by the request gateway and the chat stream.
//!
//! The store is the single owner of the access/refresh token pair. Both
//! fields are always written or cleared together; a partially updated pair
//! never exists. The store is injected by `Arc` into whatever needs it;
//! nothing in this crate reaches for ambient global state.
//!
//! No expiry is tracked locally: an expired access token is discovered
//! reactively through a 401, handled by the gateway.

use std::path::PathBuf;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// An access/refresh token pair minted by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

type ChangeHook = Box<dyn Fn(Option<&TokenPair>) + Send + Sync>;

/// Process-wide token storage with optional file backing.
///
/// The file backing plays the role the browser's local storage plays for a
/// web client: the pair survives process restarts. Load happens once at
/// construction; every `set`/`clear` is written through immediately.
pub struct CredentialStore {
    tokens: RwLock<Option<TokenPair>>,
    path: Option<PathBuf>,
    hooks: Mutex<Vec<ChangeHook>>,
}

impl CredentialStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            tokens: RwLock::new(None),
            path: None,
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// A store backed by a TOML session file. An existing file is loaded;
    /// a corrupt or unreadable one is ignored with a warning.
    pub fn persistent(path: PathBuf) -> Self {
        let tokens = match std::fs::read_to_string(&path) {
            Ok(s) => match toml::from_str::<TokenPair>(&s) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "bad session file, starting signed out");
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            tokens: RwLock::new(tokens),
            path: Some(path),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Current pair, if signed in.
    pub fn get(&self) -> Option<TokenPair> {
        self.tokens.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.refresh_token.clone())
    }

    /// Replace the stored pair. Both fields change together.
    pub fn set(&self, pair: TokenPair) {
        *self.tokens.write() = Some(pair.clone());
        self.persist(Some(&pair));
        self.notify(Some(&pair));
    }

    /// Drop the stored pair (sign-out, refresh failure, forced invalidation).
    pub fn clear(&self) {
        let had = self.tokens.write().take().is_some();
        self.persist(None);
        if had {
            self.notify(None);
        }
    }

    /// Register a hook invoked after every change, with the new value.
    pub fn on_change(&self, hook: ChangeHook) {
        self.hooks.lock().push(hook);
    }

    fn notify(&self, pair: Option<&TokenPair>) {
        for hook in self.hooks.lock().iter() {
            hook(pair);
        }
    }

    fn persist(&self, pair: Option<&TokenPair>) {
        let Some(path) = &self.path else { return };
        let result = match pair {
            Some(pair) => match toml::to_string_pretty(pair) {
                Ok(s) => {
                    if let Some(dir) = path.parent() {
                        let _ = std::fs::create_dir_all(dir);
                    }
                    std::fs::write(path, s)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "can't serialize session");
                    return;
                }
            },
            None => match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "can't persist session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair(a: &str, r: &str) -> TokenPair {
        TokenPair {
            access_token: a.to_string(),
            refresh_token: r.to_string(),
        }
    }

    #[test]
    fn set_replaces_both_fields() {
        let store = CredentialStore::in_memory();
        store.set(pair("a1", "r1"));
        store.set(pair("a2", "r2"));
        let current = store.get().unwrap();
        assert_eq!(current.access_token, "a2");
        assert_eq!(current.refresh_token, "r2");
    }

    #[test]
    fn clear_drops_the_pair() {
        let store = CredentialStore::in_memory();
        store.set(pair("a1", "r1"));
        store.clear();
        assert!(store.get().is_none());
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
    }

    #[test]
    fn change_hook_fires_on_set_and_clear() {
        let store = CredentialStore::in_memory();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        store.on_change(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        store.set(pair("a1", "r1"));
        store.clear();
        // A second clear on an empty store is a no-op.
        store.clear();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn persistent_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");

        let store = CredentialStore::persistent(path.clone());
        assert!(store.get().is_none());
        store.set(pair("a1", "r1"));

        let reloaded = CredentialStore::persistent(path.clone());
        assert_eq!(reloaded.get(), Some(pair("a1", "r1")));

        reloaded.clear();
        assert!(!path.exists());
        let empty = CredentialStore::persistent(path);
        assert!(empty.get().is_none());
    }

    #[test]
    fn corrupt_session_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        std::fs::write(&path, "not toml at all [[[").unwrap();
        let store = CredentialStore::persistent(path);
        assert!(store.get().is_none());
    }
}
