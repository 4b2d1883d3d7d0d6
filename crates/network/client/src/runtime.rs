//! Verwaltung des clientseitigen Tokio-Runtimes.
//!
//! Hier laufen die Lese-Schleifen der Receiver; die Tick-Schleife bleibt auf
//! dem Thread des Aufrufers.

use std::{future::Future, sync::Arc};

use network_shared::config::RuntimeConfig;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};

/// Gemeinsamer Zugriffspunkt auf den Client-Netzwerkruntime.
#[derive(Debug, Clone)]
pub struct ClientNetworkRuntime {
    runtime: Arc<Runtime>,
}

impl ClientNetworkRuntime {
    /// Baut einen Multi-Thread-Runtime mit der konfigurierten Anzahl Worker-Threads.
    pub fn multi_thread(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("sync-io")
            .enable_all()
            .build()
            .map_err(RuntimeError::Build)?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    /// Spawnt ein Future auf dem Runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Führt ein Future auf dem aufrufenden Thread bis zum Ende aus.
    ///
    /// Must not be called from inside the runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Liefert einen Klon des Handles.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }
}

/// Fehler, die beim Aufbau des Runtimes auftreten können.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to build tokio runtime: {0}")]
    Build(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_tasks_run_on_the_runtime() {
        let runtime = ClientNetworkRuntime::multi_thread(&RuntimeConfig { worker_threads: 1 })
            .expect("runtime");
        let task = runtime.spawn(async { 21 * 2 });
        assert_eq!(runtime.block_on(task).unwrap(), 42);
    }
}
