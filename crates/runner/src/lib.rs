//! A concurrent application runner that manages long-running processes with graceful shutdown.
//!
//! This runner orchestrates named app processes and cleanup functions:
//! - Processes run concurrently until one fails or a shutdown signal arrives
//! - SIGTERM and SIGINT cancel the shared token
//! - Closers always run afterwards, bounded by a timeout
//!
//! # Example
//!
//! ```no_run
//! use sms_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Runner::new()
//!         .with_named_process("ticker", |ctx| async move {
//!             loop {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => break,
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::info!("tick");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move {
//!             tracing::info!("Cleaning up resources");
//!             Ok(())
//!         })
//!         .with_closer_timeout(Duration::from_secs(5))
//!         .run()
//!         .await
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

type BoxedResultFuture = Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send>>;

/// Type alias for an app process function.
/// Takes a cancellation token and returns a future that resolves to Result<(), anyhow::Error>
pub type AppProcess = Box<dyn FnOnce(CancellationToken) -> BoxedResultFuture + Send>;

/// Type alias for a closer function.
pub type Closer = Box<dyn FnOnce() -> BoxedResultFuture + Send>;

struct NamedProcess {
    name: String,
    process: AppProcess,
}

/// A concurrent application runner that manages long-running processes with graceful shutdown.
pub struct Runner {
    app_processes: Vec<NamedProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Creates a new Runner with a 10 second closer timeout and signal handling enabled.
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    /// Adds a named app process to the runner.
    ///
    /// App processes run concurrently. If any process returns an error,
    /// all processes are cancelled and closers are executed. The name
    /// shows up in every log line about the process.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.app_processes.push(NamedProcess {
            name: name.into(),
            process: Box::new(|token| Box::pin(process(token))),
        });
        self
    }

    /// Adds an app process named after its position
    pub fn with_app_process<F, Fut>(self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let name = format!("process-{}", self.app_processes.len());
        self.with_named_process(name, process)
    }

    /// Adds a closer to the runner.
    ///
    /// Closers are executed after all app processes have stopped,
    /// regardless of whether they stopped due to error or cancellation.
    /// All closers will attempt to execute even if some fail.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    /// Sets the timeout for executing closers. Default is 10 seconds.
    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Sets a custom cancellation token.
    ///
    /// This allows external control over process cancellation.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Disable SIGTERM/SIGINT handling, leaving shutdown to the cancellation token
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Runs all app processes until they finish, one fails, or a shutdown signal is received.
    ///
    /// Closers run afterwards in every case. Returns the first process error so
    /// the caller can pick the exit code.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let token = self.cancellation_token;
        let mut join_set = JoinSet::new();

        for NamedProcess { name, process } in self.app_processes {
            let process_token = token.clone();
            tracing::info!(process = %name, "Starting app process");
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        if self.handle_signals {
            spawn_signal_handlers(token.clone());
        }

        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((name, Ok(()))) => {
                    tracing::info!(process = %name, "App process stopped");
                }
                Ok((name, Err(err))) => {
                    tracing::error!(process = %name, "App process error: {:#}", err);
                    if first_error.is_none() {
                        first_error = Some(err.context(format!("process {} failed", name)));
                    }
                    token.cancel();
                }
                Err(err) => {
                    tracing::error!("App process panicked: {}", err);
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("app process panicked: {}", err));
                    }
                    token.cancel();
                }
            }
        }

        if !self.closers.is_empty() {
            tracing::info!("Running closers with timeout of {:?}", self.closer_timeout);

            match tokio::time::timeout(self.closer_timeout, run_closers(self.closers)).await {
                Ok(()) => tracing::info!("All closers completed"),
                Err(_) => tracing::error!("Closers timed out after {:?}", self.closer_timeout),
            }
        }

        match first_error {
            Some(err) => {
                tracing::error!("Application exiting with error: {:#}", err);
                Err(err)
            }
            None => {
                tracing::info!("Application exiting normally");
                Ok(())
            }
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => {
                tracing::error!("Error setting up signal handler: {}", err);
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
                token.cancel();
            }
            Err(err) => {
                tracing::error!("Error setting up SIGTERM handler: {}", err);
            }
        }
    });
}

/// Runs all closers concurrently.
async fn run_closers(closers: Vec<Closer>) {
    let mut closer_set = JoinSet::new();

    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    while let Some(result) = closer_set.join_next().await {
        match result {
            Ok(Ok(())) => {
                tracing::debug!("Closer completed successfully");
            }
            Ok(Err(err)) => {
                tracing::error!("Closer error: {:#}", err);
            }
            Err(err) => {
                tracing::error!("Closer panicked: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn runner() -> Runner {
        Runner::new()
            .without_signal_handlers()
            .with_closer_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_cancellation_stops_processes_and_runs_closers() {
        let closer_called = Arc::new(AtomicBool::new(false));
        let closer_flag = closer_called.clone();
        let token = CancellationToken::new();
        let cancel = token.clone();

        let runner = runner()
            .with_named_process("waiter", |ctx| async move {
                ctx.cancelled().await;
                Ok(())
            })
            .with_closer(move || async move {
                closer_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_cancellation_token(token);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        assert!(runner.run().await.is_ok());
        assert!(closer_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_process_error_cancels_others_and_is_returned() {
        let other_stopped = Arc::new(AtomicBool::new(false));
        let other_flag = other_stopped.clone();

        let result = runner()
            .with_named_process("failing", |_ctx| async move {
                Err(anyhow::anyhow!("connection lost"))
            })
            .with_named_process("healthy", move |ctx| async move {
                ctx.cancelled().await;
                other_flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .run()
            .await;

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("failing"));
        assert!(format!("{:#}", err).contains("connection lost"));
        assert!(other_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_closers_run_even_after_failure() {
        let closers_run = Arc::new(AtomicUsize::new(0));
        let first = closers_run.clone();
        let second = closers_run.clone();

        let result = runner()
            .with_app_process(|_ctx| async move { Err(anyhow::anyhow!("boom")) })
            .with_closer(move || async move {
                first.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("closer failed"))
            })
            .with_closer(move || async move {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .run()
            .await;

        assert!(result.is_err());
        assert_eq!(closers_run.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closer_timeout_does_not_hang() {
        let result = runner()
            .with_closer_timeout(Duration::from_millis(20))
            .with_closer(|| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .run()
            .await;

        assert!(result.is_ok());
    }
}
