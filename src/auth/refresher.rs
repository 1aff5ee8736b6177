//! Background token renewal task.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::LinkError;

/// Bound on how long [`Refresher::shutdown`] waits for the task to exit.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Handle to the background task that periodically renews the session
/// credentials.
///
/// At most one refresher is alive per session. Cancellation is cooperative: a
/// stop flag is signalled and the task is joined with a bounded wait, so the
/// credential store is never left mid-write.
#[derive(Debug)]
pub struct Refresher {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Refresher {
    /// Spawn the renewal loop.
    ///
    /// `refresh` runs once per elapsed interval. Returning `Ok(Some(d))`
    /// re-schedules the next tick after `d` (used when the cadence follows
    /// the token's own lifetime); `Ok(None)` keeps the current interval. A
    /// failed refresh is logged and the loop keeps going — a later attempt
    /// may succeed before the access token actually expires.
    pub fn spawn<F, Fut>(interval: Duration, mut refresh: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Duration>, LinkError>> + Send,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => {}
                }
                if *stopped.borrow() {
                    break;
                }
                match refresh().await {
                    Ok(Some(next)) => {
                        tracing::debug!(next_secs = next.as_secs(), "credentials refreshed");
                        interval = next;
                    }
                    Ok(None) => {
                        tracing::debug!("credentials refreshed");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "token refresh failed; will retry");
                    }
                }
            }
        });
        Self { stop, handle }
    }

    /// Whether the background task is still running.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task to stop and join it with a bounded wait.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(SHUTDOWN_WAIT, self.handle).await.is_err() {
            tracing::warn!("token refresher did not stop within the shutdown bound");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn refreshes_on_each_interval() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let refresher = Refresher::spawn(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        refresher.shutdown().await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_long_interval() {
        let refresher = Refresher::spawn(Duration::from_secs(3600), || async { Ok(None) });
        assert!(refresher.is_alive());
        let start = std::time::Instant::now();
        refresher.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_loop_alive() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let refresher = Refresher::spawn(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LinkError::Authentication("denied".into()))
            }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(refresher.is_alive());
        refresher.shutdown().await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn returned_duration_reschedules_the_next_tick() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let refresher = Refresher::spawn(Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Duration::from_secs(3600)))
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        refresher.shutdown().await;
        // First tick fires quickly, then the hour-long reschedule holds.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
