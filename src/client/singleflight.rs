//! Per-key request coalescing.
//!
//! The first caller for a key starts the work on its own task; later
//! callers for the same key attach to it and receive a clone of the same
//! outcome. The work runs to completion even if every caller stops
//! awaiting, so side effects it applies are never cut short halfway.
//!
//! A run may carry a tag (the code being activated). A caller whose tag
//! differs from the run in flight is turned away instead of joining, so
//! it never receives an outcome for input it did not send.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use crate::errors::{LicenseError, LicenseResult};

type Outcome<T> = Option<LicenseResult<T>>;

struct Flight<T> {
    started_at: DateTime<Utc>,
    tag: Option<String>,
    rx: watch::Receiver<Outcome<T>>,
}

pub(crate) struct SingleFlight<K, T> {
    flights: Arc<Mutex<HashMap<K, Flight<T>>>>,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the run already in flight.
    ///
    /// Returns the outcome and whether this caller joined an existing run.
    pub(crate) async fn run<F, Fut>(
        &self,
        key: K,
        now: DateTime<Utc>,
        work: F,
    ) -> (LicenseResult<T>, bool)
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LicenseResult<T>> + Send + 'static,
    {
        self.run_tagged(key, None, now, work).await
    }

    /// Like [`run`](Self::run), but only joins a run started with the same `tag`.
    ///
    /// A mismatching caller gets [`LicenseError::Validation`] and no work is started.
    pub(crate) async fn run_tagged<F, Fut>(
        &self,
        key: K,
        tag: Option<String>,
        now: DateTime<Utc>,
        work: F,
    ) -> (LicenseResult<T>, bool)
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LicenseResult<T>> + Send + 'static,
    {
        let (mut rx, joined) = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            match flights.get(&key) {
                Some(flight) if flight.tag != tag => {
                    return (
                        Err(LicenseError::Validation(
                            "another code is already being activated; retry when it finishes"
                                .to_string(),
                        )),
                        false,
                    );
                }
                Some(flight) => (flight.rx.clone(), true),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(
                        key.clone(),
                        Flight {
                            started_at: now,
                            tag,
                            rx: rx.clone(),
                        },
                    );

                    let task = tokio::spawn(work());
                    let registry = Arc::clone(&self.flights);
                    tokio::spawn(async move {
                        let outcome = task.await.unwrap_or_else(|e| {
                            Err(LicenseError::Interrupted(format!("attempt task failed: {e}")))
                        });
                        registry
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&key);
                        let _ = tx.send(Some(outcome));
                    });

                    (rx, false)
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        let result = outcome.unwrap_or_else(|| {
            Err(LicenseError::Interrupted(
                "attempt ended without an outcome".to_string(),
            ))
        });
        (result, joined)
    }

    /// When the run for `key` started, if one is in flight.
    pub(crate) fn started_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|flight| flight.started_at)
    }

    /// Wait until every run in flight at the time of the call has finished.
    pub(crate) async fn wait_idle(&self) {
        let pending: Vec<_> = self
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|flight| flight.rx.clone())
            .collect();

        for mut rx in pending {
            let _ = rx.wait_for(Option::is_some).await;
        }
    }
}
