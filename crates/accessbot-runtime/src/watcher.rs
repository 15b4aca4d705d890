use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use accessbot_contracts::{Event, RawEvent, RawOp, WatchFilter, KIND_ACCESS_REQUEST};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::authority::{AccessRequestAuthority, RawEventStream};
use crate::completion::{completion, Completion, Settle};
use crate::error::{Error, Result};

/// One stream attempt against the authority, translated into typed events.
///
/// The watcher never reconnects; it terminates on the first stream error and
/// leaves the retry decision to [`WatcherJob`](crate::WatcherJob).
pub struct Watcher {
    events: mpsc::Receiver<Event>,
    init: watch::Receiver<bool>,
    done: Completion,
    cancel: CancellationToken,
}

impl Watcher {
    pub async fn start(
        authority: Arc<dyn AccessRequestAuthority>,
        filter: WatchFilter,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let stream = authority.watch_events(&filter).await?;
        Ok(Self::from_stream(stream, cancel))
    }

    /// Wraps an already opened stream; used by `start` and by tests.
    pub fn from_stream(stream: RawEventStream, cancel: &CancellationToken) -> Self {
        let cancel = cancel.child_token();
        // Capacity one: the receive loop waits for the consumer on every event.
        let (events_tx, events) = mpsc::channel(1);
        let (init_tx, init) = watch::channel(false);
        let (settle, done) = completion();
        tokio::spawn(receive_loop(
            stream,
            events_tx,
            init_tx,
            settle,
            cancel.clone(),
        ));
        Self {
            events,
            init,
            done,
            cancel,
        }
    }

    /// Waits for the Init sentinel without consuming it from `events`.
    ///
    /// The returned future owns its handles, so any number of callers may
    /// wait concurrently, before or after Init arrived.
    pub fn wait_init(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut init = self.init.clone();
        let done = self.done.clone();
        let cancel = cancel.clone();
        async move {
            let initialized = init.clone();
            let raised = async move { init.wait_for(|v| *v).await.is_ok() };
            tokio::select! {
                biased;
                ok = raised => {
                    if ok {
                        Ok(())
                    } else {
                        Err(terminal_error(&done))
                    }
                }
                _ = done.closed() => {
                    if *initialized.borrow() {
                        Ok(())
                    } else {
                        Err(terminal_error(&done))
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    Err(Error::connection_problem("timed out waiting for watcher init"))
                }
                _ = cancel.cancelled() => Err(Error::canceled("wait for watcher init canceled")),
            }
        }
    }

    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events
    }

    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let done = self.done.clone();
        async move { done.closed().await }
    }

    pub fn is_done(&self) -> bool {
        self.done.is_closed()
    }

    /// Terminal error; `None` while running and after a clean close.
    pub fn error(&self) -> Option<Error> {
        self.done.error()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn terminal_error(done: &Completion) -> Error {
    done.error()
        .unwrap_or_else(|| Error::canceled("watcher is closed"))
}

async fn receive_loop(
    mut stream: RawEventStream,
    events: mpsc::Sender<Event>,
    init: watch::Sender<bool>,
    settle: Settle,
    cancel: CancellationToken,
) {
    let mut initialized = false;
    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break None,
            next = stream.next() => next,
        };
        let raw = match next {
            None => break Some(Error::eof("watcher stream closed")),
            Some(Err(err)) if err.is_canceled() => break None,
            Some(Err(err)) => break Some(err),
            Some(Ok(raw)) => raw,
        };
        let event = match translate(raw, initialized) {
            Ok(event) => event,
            Err(err) => break Some(err),
        };
        if matches!(event, Event::Init) {
            initialized = true;
            // Raise the flag first so wait_init never waits on the consumer.
            init.send_replace(true);
        }
        tokio::select! {
            _ = cancel.cancelled() => break None,
            sent = events.send(event) => {
                if sent.is_err() {
                    break None;
                }
            }
        }
    };
    match &result {
        Some(err) => warn!(error = %err, "watcher terminated"),
        None => debug!("watcher closed"),
    }
    settle.settle(result);
}

fn translate(raw: RawEvent, initialized: bool) -> Result<Event> {
    match raw.op {
        RawOp::Init if initialized => Err(Error::bad_parameter(
            "received a second init event on one stream",
        )),
        RawOp::Init => Ok(Event::Init),
        _ if !initialized => Err(Error::bad_parameter(format!(
            "received {:?} event before init",
            raw.op
        ))),
        RawOp::Put => {
            let resource = raw
                .resource
                .ok_or_else(|| Error::bad_parameter("put event without a resource"))?;
            if resource.kind != KIND_ACCESS_REQUEST {
                return Err(Error::bad_parameter(format!(
                    "unexpected resource kind {:?} in put event",
                    resource.kind
                )));
            }
            let mut request = resource
                .request
                .ok_or_else(|| Error::bad_parameter("put event without an access request"))?;
            if request.id.is_empty() {
                request.id = resource.name;
            }
            if request.id.is_empty() {
                return Err(Error::bad_parameter("put event without a request id"));
            }
            Ok(Event::Put(request))
        }
        RawOp::Delete => {
            let resource = raw
                .resource
                .ok_or_else(|| Error::bad_parameter("delete event without a resource"))?;
            if resource.kind != KIND_ACCESS_REQUEST {
                return Err(Error::bad_parameter(format!(
                    "unexpected resource kind {:?} in delete event",
                    resource.kind
                )));
            }
            if resource.name.is_empty() {
                return Err(Error::bad_parameter("delete event without a request id"));
            }
            Ok(Event::Delete {
                request_id: resource.name,
            })
        }
        RawOp::Unknown => Err(Error::bad_parameter("unknown event type on stream")),
    }
}
