//! Purpose-keyed registry of background tasks.
//!
//! Each purpose has at most one live task. Submitting a new one cancels the
//! previous task of that purpose and hands out a fresh [`Ticket`]; results
//! carrying an older ticket are stale and must be dropped by the reactor.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPurpose {
    Metadata,
    CiStatus,
    Commits,
    Files,
    PrDiff,
    Patch,
    CommitDiff,
    Checkout,
}

/// Identifies one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub purpose: TaskPurpose,
    pub generation: u64,
}

struct Slot {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct TaskRegistry {
    next_generation: u64,
    slots: HashMap<TaskPurpose, Slot>,
    /// Superseded tasks that may still be winding down.
    retired: Vec<JoinHandle<()>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task for `purpose`, cancelling whatever ran for it before.
    pub fn submit<F, Fut>(&mut self, purpose: TaskPurpose, make: F) -> Ticket
    where
        F: FnOnce(CancellationToken, Ticket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.retired.retain(|h| !h.is_finished());
        if let Some(previous) = self.slots.remove(&purpose) {
            tracing::debug!("tasks: {purpose:?} #{} superseded", previous.generation);
            previous.token.cancel();
            self.retired.push(previous.handle);
        }

        self.next_generation += 1;
        let ticket = Ticket {
            purpose,
            generation: self.next_generation,
        };
        let token = CancellationToken::new();
        let handle = tokio::spawn(make(token.clone(), ticket));
        tracing::debug!("tasks: {purpose:?} #{} submitted", ticket.generation);
        self.slots.insert(
            purpose,
            Slot {
                generation: ticket.generation,
                token,
                handle,
            },
        );
        ticket
    }

    /// Whether results carrying `ticket` may still be applied.
    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.slots
            .get(&ticket.purpose)
            .is_some_and(|slot| slot.generation == ticket.generation)
    }

    /// Signal every task and hand back the handles of those still running.
    ///
    /// Every ticket issued so far becomes stale.
    pub fn cancel_all(&mut self) -> Vec<JoinHandle<()>> {
        let mut running = Vec::new();
        for (purpose, slot) in self.slots.drain() {
            slot.token.cancel();
            if !slot.handle.is_finished() {
                tracing::debug!("tasks: cancelling {purpose:?} #{}", slot.generation);
                running.push(slot.handle);
            }
        }
        running.extend(self.retired.drain(..).filter(|h| !h.is_finished()));
        running
    }
}

/// Race `fut` against cancellation. The future is dropped when the token fires.
pub async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, SyncError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(SyncError::Cancelled),
        value = fut => Ok(value),
    }
}

/// Run blocking work on the runtime's bounded blocking pool.
///
/// The closure always runs to completion (it should poll the token between
/// units of work), so awaiting this future means the work has stopped.
pub async fn run_blocking<T, F>(token: &CancellationToken, work: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, SyncError> + Send + 'static,
{
    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    let inner = token.clone();
    let result = tokio::task::spawn_blocking(move || work(&inner))
        .await
        .map_err(|e| SyncError::Worker(e.to_string()))?;
    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn newer_submission_supersedes() {
        let mut registry = TaskRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let tx1 = tx.clone();
        let first = registry.submit(TaskPurpose::Commits, move |token, ticket| async move {
            let outcome = cancellable(&token, tokio::time::sleep(Duration::from_secs(30))).await;
            let _ = tx1.send((ticket, outcome.is_ok()));
        });
        let second = registry.submit(TaskPurpose::Commits, move |_, ticket| async move {
            let _ = tx.send((ticket, true));
        });

        assert!(!registry.is_current(first));
        assert!(registry.is_current(second));

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|(t, _)| t.generation);
        assert_eq!(seen, vec![(first, false), (second, true)]);
    }

    #[tokio::test]
    async fn purposes_are_independent() {
        let mut registry = TaskRegistry::new();
        let a = registry.submit(TaskPurpose::Commits, |_, _| async {});
        let b = registry.submit(TaskPurpose::Files, |_, _| async {});
        assert!(registry.is_current(a));
        assert!(registry.is_current(b));
    }

    #[tokio::test]
    async fn cancel_all_returns_running_handles_and_stales_tickets() {
        let mut registry = TaskRegistry::new();
        let ticket = registry.submit(TaskPurpose::Metadata, |token, _| async move {
            token.cancelled().await;
        });
        let handles = registry.cancel_all();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!registry.is_current(ticket));
        assert!(registry.cancel_all().is_empty());
    }

    #[tokio::test]
    async fn blocking_work_reports_cancellation() {
        let token = CancellationToken::new();
        let ok = run_blocking(&token, |_| Ok(7)).await;
        assert_eq!(ok.unwrap(), 7);

        token.cancel();
        let err = run_blocking(&token, |_| Ok(7)).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
