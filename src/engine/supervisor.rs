use anyhow::anyhow;
use std::future::Future;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, Instrument};

use crate::fault;

/// A cloneable handle for observing an endpoint's stop signal from inside a task
#[derive(Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once stopping was requested. Safe to use repeatedly in `select!` loops.
    pub async fn stopped(&mut self) {
        // the supervisor being dropped counts as a stop
        let _ = self.0.wait_for(|stopped| *stopped).await;
    }
}

/// Owns all background tasks of an endpoint: every task has a name and runs in a span carrying
///  that name, all tasks see the same stop signal, and stopping joins every task that was ever
///  spawned - including tasks spawned while the stop is in progress.
///
/// A task returning `Err` is an internal fault, and terminates the process.
pub struct Supervisor {
    stop_sender: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor::new()
    }
}

impl Supervisor {
    pub fn new() -> Supervisor {
        let (stop_sender, _) = watch::channel(false);
        Supervisor {
            stop_sender,
            tasks: Default::default(),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal(self.stop_sender.subscribe())
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_sender.borrow()
    }

    pub async fn spawn<F>(&self, name: impl Into<String>, task: F)
    where F: Future<Output = anyhow::Result<()>> + Send + 'static
    {
        let name = name.into();
        let span = info_span!("task", name = %name);

        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            debug!("started");
            match task.await {
                Ok(()) => debug!("finished"),
                Err(e) => fault::fatal(&task_name, &e),
            }
        }.instrument(span));

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|(_, handle)| !handle.is_finished());
        tasks.push((name, handle));
    }

    pub async fn num_running(&self) -> usize {
        self.tasks.lock().await
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Signals all tasks to stop, and waits until they did
    pub async fn stop_and_join(&self) {
        info!("stopping");
        self.stop_sender.send_replace(true);

        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock().await);
            if tasks.is_empty() {
                break;
            }
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        fault::fatal(&name, &anyhow!("task panicked: {}", e));
                    }
                }
                trace!("joined task '{}'", name);
            }
        }
        info!("all tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_joins_all_tasks() {
        let supervisor = Supervisor::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let mut stop = supervisor.stop_signal();
            let finished = finished.clone();
            supervisor.spawn(format!("task-{}", i), async move {
                stop.stopped().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }).await;
        }
        assert_eq!(supervisor.num_running().await, 3);
        assert!(!supervisor.is_stopping());

        supervisor.stop_and_join().await;
        assert!(supervisor.is_stopping());
        assert_eq!(finished.load(Ordering::Acquire), 3);
        assert_eq!(supervisor.num_running().await, 0);
    }

    #[tokio::test]
    async fn test_stop_joins_tasks_spawned_while_stopping() {
        let supervisor = Arc::new(Supervisor::new());
        let finished = Arc::new(AtomicUsize::new(0));

        let mut stop = supervisor.stop_signal();
        let supervisor_inner = supervisor.clone();
        let finished_inner = finished.clone();
        supervisor.spawn("parent", async move {
            stop.stopped().await;
            let finished_child = finished_inner.clone();
            supervisor_inner.spawn("child", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished_child.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }).await;
            finished_inner.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }).await;

        supervisor.stop_and_join().await;
        assert_eq!(finished.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let supervisor = Supervisor::new();
        let mut stop = supervisor.stop_signal();
        assert!(!stop.is_stopped());

        supervisor.stop_and_join().await;
        assert!(stop.is_stopped());
        stop.stopped().await;
        stop.stopped().await;
    }
}
