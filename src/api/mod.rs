// =============================================================================
// API dispatch — serialized brokerage calls with per-queue pacing
// =============================================================================
//
// The brokerage session is effectively single-threaded: one request/response
// at a time. Components therefore never call the adapter directly; they post
// a job to one of two FIFO queues and await a completion handle:
//
//   - TR-query queue   (balance, candles, stock info, ...)  min gap 250 ms
//   - order queue      (buy / sell / cancel)                min gap 300 ms
//
// Each queue has its own consumer task; a shared async mutex stands in for
// the single API context so a query can never overlap an order. The shared
// sliding-window limiter (5/s) is applied before every dispatch.
//
// The TR queue has precedence: a `tr_busy` flag is raised around every TR
// dispatch, and the order consumer yields and re-checks while it is set
// instead of contending for the context.
//
// A job failing inside the consumer resolves its handle with the error and
// the queue simply moves on; nothing can tear the dispatcher down.
// =============================================================================

mod rate_limit;

pub use rate_limit::{RateLimiter, MAX_CALLS_PER_SECOND};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::broker::BrokerAdapter;
use crate::errors::TradingError;

/// Minimum spacing between TR-query dispatches.
pub const TR_MIN_GAP: Duration = Duration::from_millis(250);
/// Minimum spacing between order dispatches.
pub const ORDER_MIN_GAP: Duration = Duration::from_millis(300);

type ApiJob = Box<dyn FnOnce(Arc<dyn BrokerAdapter>) -> BoxFuture<'static, ()> + Send>;

/// Cloneable handle for posting work to the dispatcher.
#[derive(Clone)]
pub struct ApiHandle {
    tr_tx: mpsc::UnboundedSender<ApiJob>,
    order_tx: mpsc::UnboundedSender<ApiJob>,
}

/// Spawn the two consumer tasks with production pacing.
pub fn spawn_dispatcher(broker: Arc<dyn BrokerAdapter>, limiter: Arc<RateLimiter>) -> ApiHandle {
    spawn_dispatcher_with_gaps(broker, limiter, TR_MIN_GAP, ORDER_MIN_GAP)
}

/// Spawn with explicit gaps (tests use tighter pacing).
pub fn spawn_dispatcher_with_gaps(
    broker: Arc<dyn BrokerAdapter>,
    limiter: Arc<RateLimiter>,
    tr_gap: Duration,
    order_gap: Duration,
) -> ApiHandle {
    let (tr_tx, tr_rx) = mpsc::unbounded_channel();
    let (order_tx, order_rx) = mpsc::unbounded_channel();

    // Stand-in for the single-threaded API context: at most one adapter call
    // in flight, regardless of which queue released it.
    let context = Arc::new(tokio::sync::Mutex::new(()));
    // Raised around every TR dispatch; the order consumer defers to it.
    let tr_busy = Arc::new(AtomicBool::new(false));

    tokio::spawn(run_tr_consumer(
        tr_rx,
        broker.clone(),
        limiter.clone(),
        context.clone(),
        tr_busy.clone(),
        tr_gap,
    ));
    tokio::spawn(run_order_consumer(
        order_rx, broker, limiter, context, tr_busy, order_gap,
    ));

    ApiHandle { tr_tx, order_tx }
}

async fn run_tr_consumer(
    mut rx: mpsc::UnboundedReceiver<ApiJob>,
    broker: Arc<dyn BrokerAdapter>,
    limiter: Arc<RateLimiter>,
    context: Arc<tokio::sync::Mutex<()>>,
    tr_busy: Arc<AtomicBool>,
    gap: Duration,
) {
    while let Some(job) = rx.recv().await {
        limiter.wait_if_needed().await;
        tr_busy.store(true, Ordering::Release);
        {
            let _busy = context.lock().await;
            job(broker.clone()).await;
        }
        tr_busy.store(false, Ordering::Release);
        tokio::time::sleep(gap).await;
    }
    debug!(queue = "tr", "api consumer stopped");
}

/// How often the order consumer re-checks the TR-busy flag while deferring.
const ORDER_RECHECK: Duration = Duration::from_millis(50);

async fn run_order_consumer(
    mut rx: mpsc::UnboundedReceiver<ApiJob>,
    broker: Arc<dyn BrokerAdapter>,
    limiter: Arc<RateLimiter>,
    context: Arc<tokio::sync::Mutex<()>>,
    tr_busy: Arc<AtomicBool>,
    gap: Duration,
) {
    while let Some(job) = rx.recv().await {
        // TR precedence: yield and re-check while a TR call is mid-flight.
        while tr_busy.load(Ordering::Acquire) {
            tokio::time::sleep(ORDER_RECHECK).await;
        }
        limiter.wait_if_needed().await;
        {
            let _busy = context.lock().await;
            job(broker.clone()).await;
        }
        tokio::time::sleep(gap).await;
    }
    debug!(queue = "order", "api consumer stopped");
}

impl ApiHandle {
    fn enqueue_on<T, F, Fut>(
        tx: &mpsc::UnboundedSender<ApiJob>,
        f: F,
    ) -> oneshot::Receiver<Result<T, TradingError>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn BrokerAdapter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TradingError>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: ApiJob = Box::new(move |broker| {
            async move {
                let result = f(broker).await;
                let _ = done_tx.send(result);
            }
            .boxed()
        });
        // A closed queue leaves the handle dangling; awaiting it reports the
        // dispatcher as stopped.
        let _ = tx.send(job);
        done_rx
    }

    /// Post a query without waiting; the receiver resolves on completion.
    pub fn enqueue_query<T, F, Fut>(&self, f: F) -> oneshot::Receiver<Result<T, TradingError>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn BrokerAdapter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TradingError>> + Send + 'static,
    {
        Self::enqueue_on(&self.tr_tx, f)
    }

    /// Post an order operation without waiting.
    pub fn enqueue_order<T, F, Fut>(&self, f: F) -> oneshot::Receiver<Result<T, TradingError>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn BrokerAdapter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TradingError>> + Send + 'static,
    {
        Self::enqueue_on(&self.order_tx, f)
    }

    /// Post a query and await its result.
    pub async fn query<T, F, Fut>(&self, f: F) -> Result<T, TradingError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn BrokerAdapter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TradingError>> + Send + 'static,
    {
        self.enqueue_query(f)
            .await
            .map_err(|_| TradingError::Timeout("api dispatcher stopped".into()))?
    }

    /// Post an order operation and await its result.
    pub async fn order<T, F, Fut>(&self, f: F) -> Result<T, TradingError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn BrokerAdapter>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TradingError>> + Send + 'static,
    {
        self.enqueue_order(f)
            .await
            .map_err(|_| TradingError::Timeout("api dispatcher stopped".into()))?
    }
}
