use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use os_api::{OS, ThreadAffinity};
use tokio::task::{JoinError, JoinHandle};
use tracing::warn;

thread_local! {
    static PINNED_CORE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Logical core the calling thread is pinned to, if any.
pub fn current_core() -> Option<usize> {
    PINNED_CORE.with(|c| c.get())
}

/// Keeps the calling thread on one logical core until dropped.
///
/// The previous OS affinity is restored on every exit path, including unwinding.
pub struct AffinityGuard {
    core: usize,
    outer_core: Option<usize>,
    restore: Option<ThreadAffinity>,
}

impl AffinityGuard {
    /// Pins the calling thread to `core`.
    ///
    /// With `os_pinning` off, or when the OS refuses, only the thread-local core
    /// marker is set and [`AffinityGuard::is_pinned`] reports `false`.
    pub fn pin(core: usize, os_pinning: bool) -> Self {
        let outer_core = PINNED_CORE.with(|c| c.replace(Some(core)));
        let restore = if os_pinning {
            match OS::pin_current_thread(core) {
                Ok(previous) => {
                    tracing::trace!(
                        core,
                        previous = format_args!("{:#x}", previous.mask()),
                        "pinned worker thread"
                    );
                    Some(previous)
                }
                Err(e) => {
                    tracing::debug!(core, error = %e, "could not pin worker thread");
                    None
                }
            }
        } else {
            None
        };
        Self {
            core,
            outer_core,
            restore,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.restore.is_some()
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            if let Err(e) = OS::restore_current_thread(&previous) {
                warn!(core = self.core, error = %e, "failed to restore thread affinity");
            }
        }
        PINNED_CORE.with(|c| c.set(self.outer_core));
    }
}

/// Result of work that ran under an [`AffinityGuard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pinned<T> {
    pub core: usize,
    /// `false` when the OS did not honour the pin, so the work may have run elsewhere.
    pub pinned: bool,
    pub value: T,
}

/// Runs units of work on blocking workers restricted to a single core.
#[derive(Clone)]
pub struct PinnedRunner {
    os_pinning: bool,
    warned: Arc<AtomicBool>,
}

impl PinnedRunner {
    pub fn new(os_pinning: bool) -> Self {
        Self {
            os_pinning,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runner that only tags work with its core and never touches OS affinity.
    pub fn unpinned() -> Self {
        Self::new(false)
    }

    /// Spawns `work` on a blocking worker pinned to `core`.
    pub fn run_pinned<F, T>(&self, core: usize, work: F) -> JoinHandle<Pinned<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let os_pinning = self.os_pinning;
        let warned = Arc::clone(&self.warned);
        tokio::task::spawn_blocking(move || {
            let guard = AffinityGuard::pin(core, os_pinning);
            if os_pinning && !guard.is_pinned() && !warned.swap(true, Ordering::Relaxed) {
                let allowed = OS::current_thread_affinity()
                    .map(|mask| format!("{mask:#x}"))
                    .unwrap_or_else(|e| e);
                warn!(
                    core,
                    allowed,
                    "thread affinity unavailable, per-core results may come from another core"
                );
            }
            let value = work();
            Pinned {
                core,
                pinned: guard.is_pinned(),
                value,
            }
        })
    }

    /// Runs `work` for every `(core, input)` job in parallel and waits for all of them.
    ///
    /// Results come back in job order.
    pub async fn run_all<I, F, T>(
        &self,
        jobs: Vec<(usize, I)>,
        work: F,
    ) -> Vec<Result<Pinned<T>, JoinError>>
    where
        I: Send + 'static,
        F: Fn(usize, I) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let work = Arc::new(work);
        let handles = jobs.into_iter().map(|(core, input)| {
            let work = Arc::clone(&work);
            self.run_pinned(core, move || work(core, input))
        });
        join_all(handles).await
    }

    /// Runs the jobs one core at a time, each finishing before the next starts.
    pub async fn run_serialized<I, F, T>(
        &self,
        jobs: Vec<(usize, I)>,
        work: F,
    ) -> Vec<Result<Pinned<T>, JoinError>>
    where
        I: Send + 'static,
        F: Fn(usize, I) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let work = Arc::new(work);
        let mut results = Vec::with_capacity(jobs.len());
        for (core, input) in jobs {
            let work = Arc::clone(&work);
            results.push(self.run_pinned(core, move || work(core, input)).await);
        }
        results
    }
}
