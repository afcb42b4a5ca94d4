// Request Queue: serializes every transport operation onto a single worker.
//
// At most one header exchange or body read is in flight at any time. A response
// keeps the transport busy until its body has been read or its handle dropped,
// so a header phase and the matching body read are never split by another
// request on the persistent connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::MirrorError;
use crate::transport::{HttpRequest, ResponseHead, Transport};

type BodyReply = oneshot::Sender<Result<Bytes, MirrorError>>;

struct QueuedRequest {
    request: HttpRequest,
    reply: oneshot::Sender<Result<PendingResponse, MirrorError>>,
}

#[derive(Debug, Default)]
struct QueueState {
    queued: AtomicUsize,
    busy: AtomicBool,
}

/// Handle to the request queue. Cheap to clone; the worker stops once every
/// handle has been dropped and the queue has drained.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    state: Arc<QueueState>,
}

/// Completion handle returned by [`RequestQueue::enqueue`].
pub struct Completion {
    rx: oneshot::Receiver<Result<PendingResponse, MirrorError>>,
}

impl Completion {
    /// Waits until the request has been issued and its headers received.
    pub async fn response(self) -> Result<PendingResponse, MirrorError> {
        self.rx.await.map_err(|_| MirrorError::QueueClosed)?
    }
}

/// A response whose body is still held by the queue worker.
///
/// The transport stays busy until [`PendingResponse::read_body`] completes or
/// this value is dropped. Do not wait on another queued request while holding it.
pub struct PendingResponse {
    head: ResponseHead,
    body_request: oneshot::Sender<BodyReply>,
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

impl PendingResponse {
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Reads the full body through the queue worker.
    pub async fn read_body(self) -> Result<Bytes, MirrorError> {
        let (tx, rx) = oneshot::channel();
        self.body_request
            .send(tx)
            .map_err(|_| MirrorError::QueueClosed)?;
        rx.await.map_err(|_| MirrorError::QueueClosed)?
    }
}

impl RequestQueue {
    /// Spawns the worker owning `transport` on the current tokio runtime.
    pub fn spawn<T: Transport>(transport: T) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState::default());
        let handle = tokio::spawn(run_worker(transport, rx, Arc::clone(&state)));
        (Self { tx, state }, handle)
    }

    /// Appends a request to the queue.
    ///
    /// Enqueueing never waits: requests are issued in the order this method is
    /// called, whenever the transport becomes idle.
    pub fn enqueue(&self, request: HttpRequest) -> Completion {
        let (reply, rx) = oneshot::channel();
        self.state.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(rejected)) =
            self.tx.send(QueuedRequest { request, reply })
        {
            // Dropping the reply sender resolves the completion with QueueClosed.
            self.state.queued.fetch_sub(1, Ordering::SeqCst);
            drop(rejected);
        }
        Completion { rx }
    }

    /// Number of requests waiting to be issued.
    pub fn queued_len(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }

    /// Whether a transport operation is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.state.busy.load(Ordering::SeqCst)
    }
}

async fn run_worker<T: Transport>(
    transport: T,
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    state: Arc<QueueState>,
) {
    while let Some(QueuedRequest { request, reply }) = rx.recv().await {
        state.queued.fetch_sub(1, Ordering::SeqCst);

        if reply.is_closed() {
            trace!(url = %request.url, "Skipping request abandoned before issue");
            continue;
        }

        state.busy.store(true, Ordering::SeqCst);
        let url = request.url.clone();
        match transport.issue(request).await {
            Ok((head, response)) => {
                let (body_request, body_rx) = oneshot::channel();
                let pending = PendingResponse { head, body_request };
                if reply.send(Ok(pending)).is_ok() {
                    match body_rx.await {
                        Ok(body_reply) => {
                            let body = transport.read_body(response).await;
                            let _ = body_reply.send(body);
                        }
                        Err(_) => {
                            debug!(url = %url, "Response dropped without reading its body");
                        }
                    }
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
        state.busy.store(false, Ordering::SeqCst);
    }
    trace!("Request queue worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::{StatusCode, Version};
    use reqwest::header::HeaderMap;
    use std::time::{Duration, Instant};
    use url::Url;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Headers,
        Body,
    }

    #[derive(Debug, Clone)]
    struct Operation {
        path: String,
        phase: Phase,
        start: Instant,
        end: Instant,
    }

    /// Transport stub that sleeps in each phase and records when it ran.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        log: Arc<Mutex<Vec<Operation>>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl RecordingTransport {
        async fn timed(&self, path: String, phase: Phase) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(15)).await;
            let end = Instant::now();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().push(Operation {
                path,
                phase,
                start,
                end,
            });
        }

        fn phases(&self) -> Vec<(String, Phase)> {
            self.log
                .lock()
                .iter()
                .map(|op| (op.path.clone(), op.phase))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        type Response = String;

        async fn issue(
            &self,
            request: HttpRequest,
        ) -> Result<(ResponseHead, Self::Response), MirrorError> {
            let path = request.url.path().to_string();
            self.timed(path.clone(), Phase::Headers).await;
            if path.ends_with("/missing") {
                return Err(MirrorError::http_status(
                    StatusCode::NOT_FOUND,
                    request.url.as_str(),
                    "request",
                ));
            }
            let head = ResponseHead {
                status: StatusCode::OK,
                version: Version::HTTP_11,
                headers: HeaderMap::new(),
            };
            Ok((head, path))
        }

        async fn read_body(&self, response: Self::Response) -> Result<Bytes, MirrorError> {
            self.timed(response.clone(), Phase::Body).await;
            if response.ends_with("/truncated") {
                return Err(MirrorError::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-body",
                    ),
                });
            }
            Ok(Bytes::from(format!("body of {response}")))
        }
    }

    fn request(path: &str) -> HttpRequest {
        HttpRequest::get(Url::parse(&format!("http://h{path}")).expect("valid url"))
    }

    async fn fetch(queue: &RequestQueue, path: &str) -> Result<Bytes, MirrorError> {
        queue.enqueue(request(path)).response().await?.read_body().await
    }

    #[tokio::test]
    async fn issues_requests_in_fifo_order_without_overlap() {
        let transport = RecordingTransport::default();
        let (queue, _worker) = RequestQueue::spawn(transport.clone());

        let (a, b, c) = tokio::join!(
            fetch(&queue, "/a"),
            fetch(&queue, "/b"),
            fetch(&queue, "/c"),
        );
        assert_eq!(a.expect("a"), Bytes::from("body of /a"));
        assert_eq!(b.expect("b"), Bytes::from("body of /b"));
        assert_eq!(c.expect("c"), Bytes::from("body of /c"));

        let log = transport.log.lock().clone();
        let order: Vec<&str> = log
            .iter()
            .filter(|op| op.phase == Phase::Headers)
            .map(|op| op.path.as_str())
            .collect();
        assert_eq!(order, vec!["/a", "/b", "/c"]);

        for pair in log.windows(2) {
            assert!(
                pair[0].end <= pair[1].start,
                "{:?} overlaps {:?}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unread_body_holds_the_transport() {
        let transport = RecordingTransport::default();
        let (queue, _worker) = RequestQueue::spawn(transport.clone());

        let first = queue
            .enqueue(request("/first"))
            .response()
            .await
            .expect("first response");
        let second = queue.enqueue(request("/second"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.phases(), vec![("/first".to_string(), Phase::Headers)]);
        assert!(queue.is_busy());
        assert_eq!(queue.queued_len(), 1);

        let body = first.read_body().await.expect("first body");
        assert_eq!(body, Bytes::from("body of /first"));
        let second = second.response().await.expect("second response");
        drop(second);

        assert_eq!(
            transport.phases(),
            vec![
                ("/first".to_string(), Phase::Headers),
                ("/first".to_string(), Phase::Body),
                ("/second".to_string(), Phase::Headers),
            ]
        );
    }

    #[tokio::test]
    async fn dropped_response_releases_the_transport() {
        let transport = RecordingTransport::default();
        let (queue, _worker) = RequestQueue::spawn(transport.clone());

        let first = queue
            .enqueue(request("/first"))
            .response()
            .await
            .expect("first response");
        drop(first);

        let body = fetch(&queue, "/next").await.expect("next body");
        assert_eq!(body, Bytes::from("body of /next"));
        assert!(
            !transport
                .phases()
                .contains(&("/first".to_string(), Phase::Body))
        );
    }

    #[tokio::test]
    async fn failures_are_delivered_and_queue_continues() {
        let transport = RecordingTransport::default();
        let (queue, _worker) = RequestQueue::spawn(transport.clone());

        let failed = queue.enqueue(request("/missing"));
        let ok = queue.enqueue(request("/ok"));

        assert!(matches!(
            failed.response().await,
            Err(MirrorError::HttpStatus { status, .. }) if status == StatusCode::NOT_FOUND
        ));
        let body = ok
            .response()
            .await
            .expect("ok response")
            .read_body()
            .await
            .expect("ok body");
        assert_eq!(body, Bytes::from("body of /ok"));
    }

    #[tokio::test]
    async fn body_failure_is_delivered_and_queue_continues() {
        let transport = RecordingTransport::default();
        let (queue, _worker) = RequestQueue::spawn(transport.clone());

        let broken = queue.enqueue(request("/truncated"));
        let next = queue.enqueue(request("/next"));

        let response = broken.response().await.expect("headers still arrive");
        assert!(matches!(
            response.read_body().await,
            Err(MirrorError::Io { .. })
        ));

        let body = next
            .response()
            .await
            .expect("next response")
            .read_body()
            .await
            .expect("next body");
        assert_eq!(body, Bytes::from("body of /next"));
        assert_eq!(
            transport.phases(),
            vec![
                ("/truncated".to_string(), Phase::Headers),
                ("/truncated".to_string(), Phase::Body),
                ("/next".to_string(), Phase::Headers),
                ("/next".to_string(), Phase::Body),
            ]
        );
    }

    #[tokio::test]
    async fn abandoned_requests_are_not_issued() {
        let transport = RecordingTransport::default();
        let (queue, _worker) = RequestQueue::spawn(transport.clone());

        let held = queue
            .enqueue(request("/held"))
            .response()
            .await
            .expect("held response");
        drop(queue.enqueue(request("/abandoned")));
        drop(held);

        fetch(&queue, "/after").await.expect("after body");
        let paths: Vec<String> = transport.phases().into_iter().map(|(p, _)| p).collect();
        assert!(!paths.contains(&"/abandoned".to_string()));
    }
}
