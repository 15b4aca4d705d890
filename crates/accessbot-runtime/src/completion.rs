use tokio::sync::watch;

use crate::error::Error;

#[derive(Debug, Clone)]
enum State {
    Open,
    Closed(Option<Error>),
}

/// Write side of a one-shot terminal state. Only the first `settle` counts.
#[derive(Debug)]
pub(crate) struct Settle {
    tx: watch::Sender<State>,
}

/// Read side: `Open` until settled, then `Closed(ok)` or `Closed(err)` forever.
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    rx: watch::Receiver<State>,
}

pub(crate) fn completion() -> (Settle, Completion) {
    let (tx, rx) = watch::channel(State::Open);
    (Settle { tx }, Completion { rx })
}

impl Settle {
    pub(crate) fn settle(&self, result: Option<Error>) {
        self.tx.send_if_modified(|state| match state {
            State::Open => {
                *state = State::Closed(result);
                true
            }
            State::Closed(_) => false,
        });
    }
}

impl Drop for Settle {
    fn drop(&mut self) {
        self.settle(None);
    }
}

impl Completion {
    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self.rx.borrow(), State::Closed(_))
    }

    pub(crate) fn error(&self) -> Option<Error> {
        match &*self.rx.borrow() {
            State::Closed(err) => err.clone(),
            State::Open => None,
        }
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.rx.clone();
        // The sender settles on drop, so a closed channel also means closed.
        let _ = rx.wait_for(|state| matches!(state, State::Closed(_))).await;
    }
}
