use std::sync::Arc;
use std::time::Duration;

use accessbot_contracts::{AccessRequest, Event, RawEvent, RawOp, RawResource, WatchFilter};
use accessbot_runtime::{
    AccessRequestAuthority, ErrorKind, MemoryAuthority, RawEventStream, Result, Watcher,
};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn feed() -> (mpsc::UnboundedSender<Result<RawEvent>>, RawEventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
    .boxed();
    (tx, stream)
}

fn request(id: &str) -> AccessRequest {
    let mut req = AccessRequest::pending("alice", vec!["admin".to_string()]);
    req.id = id.to_string();
    req
}

async fn next(watcher: &mut Watcher) -> Option<Event> {
    tokio::time::timeout(Duration::from_secs(2), watcher.events().recv())
        .await
        .expect("watcher did not deliver in time")
}

#[tokio::test]
async fn init_is_observable_by_concurrent_and_late_waiters() {
    let authority = Arc::new(MemoryAuthority::new());
    let cancel = CancellationToken::new();
    let mut watcher = Watcher::start(
        authority.clone() as Arc<dyn AccessRequestAuthority>,
        WatchFilter::access_requests(),
        &cancel,
    )
    .await
    .unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| tokio::spawn(watcher.wait_init(&cancel, Duration::from_secs(2))))
        .collect();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }
    watcher
        .wait_init(&cancel, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(next(&mut watcher).await, Some(Event::Init));

    let created = authority
        .create_access_request(AccessRequest::pending("bob", vec!["dba".to_string()]))
        .await
        .unwrap();
    assert_eq!(next(&mut watcher).await, Some(Event::Put(created)));

    watcher
        .wait_init(&cancel, Duration::from_secs(2))
        .await
        .unwrap();
}

#[tokio::test]
async fn delivers_in_order_to_a_stalled_consumer() {
    let (tx, stream) = feed();
    let cancel = CancellationToken::new();
    let mut watcher = Watcher::from_stream(stream, &cancel);

    tx.send(Ok(RawEvent::init())).unwrap();
    for i in 0..50 {
        tx.send(Ok(RawEvent::put(request(&format!("r{i}"))))).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(next(&mut watcher).await, Some(Event::Init));
    for i in 0..50 {
        assert_eq!(
            next(&mut watcher).await,
            Some(Event::Put(request(&format!("r{i}"))))
        );
    }
    assert!(!watcher.is_done());
}

#[tokio::test]
async fn malformed_payload_terminates_with_bad_parameter() {
    let (tx, stream) = feed();
    let cancel = CancellationToken::new();
    let mut watcher = Watcher::from_stream(stream, &cancel);

    tx.send(Ok(RawEvent::init())).unwrap();
    tx.send(Ok(RawEvent {
        op: RawOp::Put,
        resource: Some(RawResource {
            kind: "role".to_string(),
            name: "admin".to_string(),
            request: None,
        }),
    }))
    .unwrap();

    assert_eq!(next(&mut watcher).await, Some(Event::Init));
    assert_eq!(next(&mut watcher).await, None);
    watcher.done().await;
    assert_eq!(watcher.error().unwrap().kind(), ErrorKind::BadParameter);
}

#[tokio::test]
async fn stream_end_is_eof() {
    let (tx, stream) = feed();
    let cancel = CancellationToken::new();
    let mut watcher = Watcher::from_stream(stream, &cancel);

    tx.send(Ok(RawEvent::init())).unwrap();
    drop(tx);

    assert_eq!(next(&mut watcher).await, Some(Event::Init));
    assert_eq!(next(&mut watcher).await, None);
    watcher.done().await;
    assert_eq!(watcher.error().unwrap().kind(), ErrorKind::Eof);
}

#[tokio::test]
async fn wait_init_times_out_as_connection_problem() {
    let (_tx, stream) = feed();
    let cancel = CancellationToken::new();
    let watcher = Watcher::from_stream(stream, &cancel);

    let err = watcher
        .wait_init(&cancel, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionProblem);
}

#[tokio::test]
async fn wait_init_reports_the_terminal_error() {
    let (tx, stream) = feed();
    let cancel = CancellationToken::new();
    let watcher = Watcher::from_stream(stream, &cancel);

    tx.send(Ok(RawEvent::put(request("r1")))).unwrap();
    let err = watcher
        .wait_init(&cancel, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);
}

#[tokio::test]
async fn close_ends_without_error() {
    let (_tx, stream) = feed();
    let cancel = CancellationToken::new();
    let watcher = Watcher::from_stream(stream, &cancel);

    let pending = watcher.wait_init(&cancel, Duration::from_secs(2));
    watcher.close();
    watcher.done().await;
    assert!(watcher.error().is_none());
    assert_eq!(pending.await.unwrap_err().kind(), ErrorKind::Canceled);
}

#[tokio::test]
async fn parent_cancel_closes_the_watcher() {
    let (_tx, stream) = feed();
    let cancel = CancellationToken::new();
    let watcher = Watcher::from_stream(stream, &cancel);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), watcher.done())
        .await
        .unwrap();
    assert!(watcher.is_done());
    assert!(watcher.error().is_none());
}
