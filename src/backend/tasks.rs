//! Supervisor for a backend's long-running tasks.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Spawned tasks plus the shutdown signal they listen on.
///
/// Each task receives its own `broadcast::Receiver<()>` from
/// [`BackgroundTasks::subscribe`] and must return once it fires.
pub struct BackgroundTasks {
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A shutdown receiver for a task about to be spawned.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        tracing::debug!(task = name, "Background task spawned");
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        if handles.is_empty() {
            return;
        }

        // No receivers left just means every task already exited
        let _ = self.shutdown.send(());

        let (names, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            match result {
                Ok(()) => tracing::debug!(task = name, "Background task stopped"),
                Err(e) => tracing::error!(task = name, error = %e, "Background task failed"),
            }
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
