use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use accessbot_contracts::{Event, WatchFilter};
use accessbot_kernel::Backoff;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::authority::AccessRequestAuthority;
use crate::completion::{completion, Completion, Settle};
use crate::error::{Error, Result};
use crate::watcher::Watcher;

pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Plugin logic invoked for every Put/Delete, one event at a time.
///
/// Returning an error ends the job unless the error is retryable, in which
/// case the whole watch is restarted. Handlers swallow what they can recover.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, event: Event) -> Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(CancellationToken, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, cancel: CancellationToken, event: Event) -> Result<()> {
        (self.0)(cancel, event).await
    }
}

#[derive(Debug, Clone)]
pub struct WatcherJobConfig {
    pub filter: WatchFilter,
    pub init_timeout: Duration,
    pub event_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for WatcherJobConfig {
    fn default() -> Self {
        Self {
            filter: WatchFilter::access_requests(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl WatcherJobConfig {
    pub fn from_config(cfg: &accessbot_config::Watcher) -> Self {
        Self {
            filter: WatchFilter::access_requests(),
            init_timeout: Duration::from_millis(cfg.init_timeout_ms),
            event_timeout: Duration::from_millis(cfg.event_timeout_ms),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

/// Cloneable view of whether a job has seen its first Init.
#[derive(Debug, Clone)]
pub struct Readiness(watch::Receiver<bool>);

impl Readiness {
    /// A readiness flag that never changes.
    pub fn fixed(ready: bool) -> Self {
        let (_, rx) = watch::channel(ready);
        Self(rx)
    }

    pub fn is_ready(&self) -> bool {
        *self.0.borrow()
    }
}

/// Supervisable handle over a reconnecting watch loop.
pub struct WatcherJob {
    ready: watch::Receiver<bool>,
    done: Completion,
    attempts: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl WatcherJob {
    pub fn spawn<H>(
        authority: Arc<dyn AccessRequestAuthority>,
        config: WatcherJobConfig,
        handler: H,
        cancel: &CancellationToken,
    ) -> Self
    where
        H: EventHandler + 'static,
    {
        let cancel = cancel.child_token();
        let (ready_tx, ready) = watch::channel(false);
        let (settle, done) = completion();
        let attempts = Arc::new(AtomicU64::new(0));
        let runner = Runner {
            authority,
            config,
            handler: Arc::new(handler),
            ready: ready_tx,
            attempts: attempts.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(runner.run(settle));
        Self {
            ready,
            done,
            attempts,
            cancel,
        }
    }

    /// Resolves `true` at the first successful Init, `false` if the job ended
    /// before ever becoming ready.
    pub fn wait_ready(&self) -> impl Future<Output = bool> + Send + 'static {
        let mut ready = self.ready.clone();
        let done = self.done.clone();
        async move {
            let flag = ready.clone();
            let raised = async move { ready.wait_for(|v| *v).await.is_ok() };
            tokio::select! {
                biased;
                ok = raised => ok || *flag.borrow(),
                _ = done.closed() => *flag.borrow(),
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn readiness(&self) -> Readiness {
        Readiness(self.ready.clone())
    }

    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let done = self.done.clone();
        async move { done.closed().await }
    }

    pub fn is_done(&self) -> bool {
        self.done.is_closed()
    }

    /// Fatal error the job stopped with; `None` while running or after a
    /// graceful shutdown.
    pub fn err(&self) -> Option<Error> {
        self.done.error()
    }

    /// Number of watch streams opened so far.
    pub fn watch_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Runner {
    authority: Arc<dyn AccessRequestAuthority>,
    config: WatcherJobConfig,
    handler: Arc<dyn EventHandler>,
    ready: watch::Sender<bool>,
    attempts: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Runner {
    async fn run(self, settle: Settle) {
        let result = self.run_loop().await;
        if let Err(err) = &result {
            error!(error = %err, "watcher event loop failed");
        }
        settle.settle(result.err());
    }

    async fn run_loop(&self) -> Result<()> {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);
        loop {
            let err = match self.watch_events(&mut backoff).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if self.cancel.is_cancelled() {
                debug!(error = %err, "watcher job canceled");
                return Ok(());
            }
            match err.kind() {
                crate::ErrorKind::ConnectionProblem => {
                    warn!(error = %err, "failed to connect to the access request authority, reconnecting")
                }
                crate::ErrorKind::Eof => warn!(error = %err, "watcher stream closed, reconnecting"),
                crate::ErrorKind::Canceled => {
                    debug!(error = %err, "watcher stream canceled");
                    return Ok(());
                }
                _ => return Err(err),
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    #[instrument(skip_all, fields(attempt))]
    async fn watch_events(&self, backoff: &mut Backoff) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("attempt", attempt);

        let mut watcher =
            Watcher::start(self.authority.clone(), self.config.filter.clone(), &self.cancel)
                .await?;
        watcher
            .wait_init(&self.cancel, self.config.init_timeout)
            .await?;
        backoff.reset();
        if !self.ready.send_replace(true) {
            info!("watcher job is ready");
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = watcher.events().recv() => event,
            };
            let event = match event {
                Some(event) => event,
                None => {
                    watcher.done().await;
                    return match watcher.error() {
                        Some(err) => Err(err),
                        None if self.cancel.is_cancelled() => Ok(()),
                        None => Err(Error::eof("watcher closed without an error")),
                    };
                }
            };
            if matches!(event, Event::Init) {
                continue;
            }
            self.dispatch(event).await?;
        }
    }

    async fn dispatch(&self, event: Event) -> Result<()> {
        let op = event.op_name();
        let request_id = event.request_id().unwrap_or_default().to_string();
        let event_cancel = self.cancel.child_token();
        let outcome = tokio::time::timeout(
            self.config.event_timeout,
            self.handler.handle(event_cancel.clone(), event),
        )
        .await;
        event_cancel.cancel();
        match outcome {
            Ok(result) => result.map_err(|err| {
                err.context(format!("handling {op} event for request {request_id}"))
            }),
            Err(_) => Err(Error::deadline_exceeded(format!(
                "handling {op} event for request {request_id} took longer than {:?}",
                self.config.event_timeout
            ))),
        }
    }
}
