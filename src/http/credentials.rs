//! Bearer tokens for registry repositories.

use std::{
    collections::HashMap,
    fmt,
    num::NonZeroUsize,
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};

use lru::LruCache;
use tracing::debug;

use crate::error::{Error, Result};

/// Maximum number of scopes in the cache.
const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(n) => n,
    None => unreachable!(),
};

/// Key for the credential cache: a repository in a registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Scope {
    pub registry: String,
    pub repository: String,
}

impl Scope {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Scope {
            registry: registry.into(),
            repository: repository.into(),
        }
    }

    /// Value for the `scope` parameter in token requests.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }
}

#[derive(Clone, PartialEq)]
pub(crate) enum Credential {
    /// The registry does not require tokens.
    Anonymous,

    Bearer {
        token: String,
        expires: Option<Instant>,
    },
}

impl Credential {
    pub fn bearer(&self) -> Option<&str> {
        match self {
            Credential::Anonymous => None,
            Credential::Bearer { token, .. } => Some(token),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self {
            Credential::Bearer {
                expires: Some(e), ..
            } => now >= *e,
            _ => false,
        }
    }
}

// Tokens must never appear in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::Bearer { expires, .. } => f
                .debug_struct("Bearer")
                .field("expires", expires)
                .finish_non_exhaustive(),
        }
    }
}

/// Process-wide cache of credentials.
///
/// Concurrent calls to [`authorize`](Self::authorize) for the same scope
/// share a single call to the `fetch` function.
pub(crate) struct CredentialCache {
    state: Mutex<State>,
}

struct State {
    tokens: LruCache<Scope, Credential>,
    in_flight: HashMap<Scope, Arc<Flight>>,
}

/// Result of an in-flight fetch, shared with waiting threads.
#[derive(Default)]
struct Flight {
    result: Mutex<Option<Outcome>>,
    notifier: Condvar,
}

#[derive(Clone)]
enum Outcome {
    Acquired(Credential),

    /// The registry rejected the request for a token.
    Rejected(String),

    /// The fetch failed for reasons tied to the producer, like its
    /// deadline. Waiters try again with their own fetch.
    Abandoned,
}

impl Flight {
    fn complete(&self, outcome: Outcome) {
        let mut lock = self.result.lock().unwrap();
        *lock = Some(outcome);
        self.notifier.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut lock = self.result.lock().unwrap();
        loop {
            lock = match &*lock {
                Some(r) => return r.clone(),
                None => self.notifier.wait(lock).unwrap(),
            }
        }
    }
}

/// Complete the flight if the producer returns early (for example,
/// after a `panic!`), so waiters are never blocked forever.
struct FlightGuard<'a> {
    cache: &'a CredentialCache,
    scope: &'a Scope,
    flight: Arc<Flight>,
    done: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, result: &Result<Credential>) {
        self.done = true;

        let mut state = self.cache.state.lock().unwrap();
        state.in_flight.remove(self.scope);

        let shared = match result {
            Ok(credential) => {
                state.tokens.put(self.scope.clone(), credential.clone());
                Outcome::Acquired(credential.clone())
            }
            Err(Error::AuthFailure(e)) => Outcome::Rejected(e.clone()),
            Err(_) => Outcome::Abandoned,
        };

        drop(state);
        self.flight.complete(shared);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Ok(mut state) = self.cache.state.lock() {
                state.in_flight.remove(self.scope);
            }

            self.flight.complete(Outcome::Abandoned);
        }
    }
}

enum Role {
    Cached(Credential),
    Producer(Arc<Flight>),
    Waiter(Arc<Flight>),
}

impl CredentialCache {
    pub fn new() -> Self {
        CredentialCache {
            state: Mutex::new(State {
                tokens: LruCache::new(CACHE_CAPACITY),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Return the credential for `scope`.
    ///
    /// If there is no valid credential in the cache, it is acquired
    /// with `fetch`. Only one thread runs `fetch` for a scope; any other
    /// thread asking for the same scope waits for its result.
    ///
    /// Waiters share the error only when the registry rejected the
    /// token request. After any other failure, one of them runs its own
    /// `fetch`.
    pub fn authorize<F>(&self, scope: &Scope, fetch: F) -> Result<Credential>
    where
        F: FnOnce() -> Result<Credential>,
    {
        loop {
            match self.role(scope) {
                Role::Cached(credential) => return Ok(credential),

                Role::Waiter(flight) => match flight.wait() {
                    Outcome::Acquired(credential) => return Ok(credential),
                    Outcome::Rejected(e) => return Err(Error::AuthFailure(e)),
                    Outcome::Abandoned => {
                        debug!(
                            registry = %scope.registry,
                            repository = %scope.repository,
                            "credential request abandoned, retrying"
                        );
                    }
                },

                Role::Producer(flight) => {
                    let guard = FlightGuard {
                        cache: self,
                        scope,
                        flight,
                        done: false,
                    };

                    let result = fetch();
                    guard.finish(&result);
                    return result;
                }
            }
        }
    }

    /// Find the credential for `scope` in the cache, or the role of the
    /// current thread to acquire it.
    fn role(&self, scope: &Scope) -> Role {
        let mut state = self.state.lock().unwrap();

        match state.tokens.get(scope).cloned() {
            Some(c) if !c.is_expired(Instant::now()) => return Role::Cached(c),
            Some(_) => {
                debug!(
                    registry = %scope.registry,
                    repository = %scope.repository,
                    "credential expired"
                );
                state.tokens.pop(scope);
            }
            None => (),
        }

        match state.in_flight.get(scope) {
            Some(flight) => Role::Waiter(Arc::clone(flight)),
            None => {
                let flight = Arc::new(Flight::default());
                state.in_flight.insert(scope.clone(), Arc::clone(&flight));
                Role::Producer(flight)
            }
        }
    }

    /// Remove the credential for `scope` only if it is still `stale`.
    ///
    /// If another thread already replaced it, the new credential is kept.
    pub fn invalidate_stale(&self, scope: &Scope, stale: &Credential) {
        let mut state = self.state.lock().unwrap();
        if state.tokens.peek(scope) == Some(stale) {
            state.tokens.pop(scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    fn bearer(token: &str) -> Credential {
        Credential::Bearer {
            token: token.to_owned(),
            expires: None,
        }
    }

    #[test]
    fn single_flight() {
        const THREADS: usize = 16;

        let cache = CredentialCache::new();
        let scope = Scope::new("registry.test", "foo/bar");
        let fetches = AtomicUsize::new(0);

        let tokens: Vec<_> = thread::scope(|s| {
            let tasks: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        cache.authorize(&scope, || {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            Ok(bearer("T1"))
                        })
                    })
                })
                .collect();

            tasks.into_iter().map(|t| t.join().unwrap()).collect()
        });

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        for token in tokens {
            assert_eq!(token.unwrap().bearer(), Some("T1"));
        }

        // Cached credentials don't call `fetch`.
        let cached = cache.authorize(&scope, || unreachable!()).unwrap();
        assert_eq!(cached.bearer(), Some("T1"));
    }

    #[test]
    fn expired_and_stale_credentials() {
        let cache = CredentialCache::new();
        let scope = Scope::new("registry.test", "foo/bar");

        let expired = Credential::Bearer {
            token: "T0".to_owned(),
            expires: Some(Instant::now()),
        };

        cache.authorize(&scope, || Ok(expired)).unwrap();

        let fresh = cache.authorize(&scope, || Ok(bearer("T1"))).unwrap();
        assert_eq!(fresh.bearer(), Some("T1"));

        // A stale value does not remove a newer credential.
        cache.invalidate_stale(&scope, &bearer("T0"));
        let cached = cache.authorize(&scope, || unreachable!()).unwrap();
        assert_eq!(cached, fresh);

        cache.invalidate_stale(&scope, &fresh);
        let next = cache.authorize(&scope, || Ok(bearer("T2"))).unwrap();
        assert_eq!(next.bearer(), Some("T2"));

        cache.invalidate_stale(&scope, &next);
        let next = cache.authorize(&scope, || Ok(Credential::Anonymous)).unwrap();
        assert_eq!(next, Credential::Anonymous);
    }

    #[test]
    fn failed_fetch_is_not_cached() {
        let cache = CredentialCache::new();
        let scope = Scope::new("registry.test", "foo/bar");

        let result = cache.authorize(&scope, || Err(Error::AuthFailure("denied".into())));
        assert!(matches!(result, Err(Error::AuthFailure(_))));

        let token = cache.authorize(&scope, || Ok(bearer("T1"))).unwrap();
        assert_eq!(token.bearer(), Some("T1"));
    }

    #[test]
    fn waiters_keep_their_own_failures() {
        let cache = CredentialCache::new();
        let scope = Scope::new("registry.test", "foo/bar");

        let run = |producer: Error| {
            thread::scope(|s| {
                let first = s.spawn(|| {
                    cache.authorize(&scope, || {
                        thread::sleep(Duration::from_millis(200));
                        Err(producer)
                    })
                });

                thread::sleep(Duration::from_millis(50));
                let second = s.spawn(|| cache.authorize(&scope, || Ok(bearer("T2"))));

                (first.join().unwrap(), second.join().unwrap())
            })
        };

        // A rejected token request is shared with the waiters.
        let (first, second) = run(Error::AuthFailure("denied".into()));
        assert!(matches!(first, Err(Error::AuthFailure(_))));
        assert!(matches!(second, Err(Error::AuthFailure(_))));

        // The deadline of the producer does not fail the waiters.
        let (first, second) = run(Error::Deadline);
        assert!(matches!(first, Err(Error::Deadline)));
        assert_eq!(second.unwrap().bearer(), Some("T2"));
    }

    #[test]
    fn debug_hides_tokens() {
        let debug = format!("{:?}", bearer("secret-token"));
        assert!(!debug.contains("secret-token"));
    }
}
