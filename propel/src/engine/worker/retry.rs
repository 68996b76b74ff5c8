use crate::{engine::account::Account, error::PersistError, persistence::{DailySnapshot, Repository}};
use propel_execution::event::TradeEvent;
use std::{sync::Arc, time::Duration};
use tracing::{error, warn};

/// Deferred write owned by the persistence retry worker.
///
/// Jobs carry owned snapshots: they stay valid however stale the engine state becomes, and
/// replaying one only rewrites the same values (no balance deltas, so no double-apply).
#[derive(Debug)]
pub enum RetryJob {
    AppendEvent(TradeEvent),
    UpdateAccount(Box<Account>),
    InsertSnapshot(DailySnapshot),
}

/// Exponential backoff schedule between retry attempts, capped at the last entry.
const RETRY_BACKOFF: [Duration; 5] = [
    Duration::from_millis(200),
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(120),
];

/// Drain the retry queue, re-attempting each job on the backoff schedule.
///
/// On shutdown the remaining queue is drained with a single attempt per job so nothing is
/// silently dropped while the store is healthy.
pub async fn run_retry_worker(
    repository: Arc<dyn Repository>,
    mut jobs: tokio::sync::mpsc::UnboundedReceiver<RetryJob>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => process_job(repository.as_ref(), job).await,
                None => return,
            },
            _ = shutdown.changed() => {
                while let Ok(job) = jobs.try_recv() {
                    if let Err(persist_error) = attempt(repository.as_ref(), &job).await {
                        error!(?job, ?persist_error, "retry job dropped at shutdown");
                    }
                }
                return;
            }
        }
    }
}

async fn process_job(repository: &dyn Repository, job: RetryJob) {
    match attempt(repository, &job).await {
        Ok(()) => return,
        Err(persist_error) if !persist_error.is_transient() => {
            error!(?job, ?persist_error, "retry job failed permanently");
            return;
        }
        Err(_) => {}
    }

    for (index, delay) in RETRY_BACKOFF.iter().enumerate() {
        tokio::time::sleep(*delay).await;
        match attempt(repository, &job).await {
            Ok(()) => return,
            Err(persist_error) if !persist_error.is_transient() => {
                error!(?job, ?persist_error, "retry job failed permanently");
                return;
            }
            Err(persist_error) => {
                warn!(attempt = index + 1, ?persist_error, "retry attempt failed");
            }
        }
    }

    error!(?job, "retry job dropped after exhausting backoff schedule");
}

async fn attempt(repository: &dyn Repository, job: &RetryJob) -> Result<(), PersistError> {
    match job {
        RetryJob::AppendEvent(event) => repository.append_event(event).await,
        RetryJob::UpdateAccount(account) => repository.update_account(account).await,
        RetryJob::InsertSnapshot(snapshot) => repository.insert_daily_snapshot(snapshot).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryRepository;
    use chrono::Utc;
    use propel_execution::{AccountId, event::TradeEventKind};

    #[tokio::test(start_paused = true)]
    async fn test_retry_worker_recovers_after_outage() {
        let repository = Arc::new(InMemoryRepository::new());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        repository.set_failing(true);
        let event = TradeEvent::new(
            AccountId::random(),
            TradeEventKind::DailyReset,
            None,
            None,
            serde_json::json!({}),
            Utc::now(),
        );
        tx.send(RetryJob::AppendEvent(event)).unwrap();

        let worker = tokio::spawn(run_retry_worker(
            Arc::clone(&repository) as Arc<dyn Repository>,
            rx,
            shutdown_rx,
        ));

        // First attempt fails; the store recovers before the second attempt (200ms)
        tokio::time::sleep(Duration::from_millis(100)).await;
        repository.set_failing(false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(repository.events().len(), 1);
        drop(tx);
        worker.await.unwrap();
    }
}
