use std::future;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span};

use crate::domain::{Request, Ticket};
use crate::queue::{QueueCore, RequestHandler};

/// A request on its way to a worker.
///
/// The permit belongs to the worker that will run it and goes back to the
/// pool when the attempt ends.
struct Dispatch {
    ticket: Ticket,
    request: Request,
    _permit: OwnedSemaphorePermit,
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Dispatch>>>;

/// Handle over a running queue: dispatcher, retry scheduler and workers.
///
/// - dropping the handle (or `request_shutdown`) stops every task
/// - `shutdown_and_join()` waits for all of them
///
/// Shutdown does not interrupt a handler that is already executing; it
/// only stops taking new work.
#[must_use = "dropping the handle shuts the queue down"]
pub struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl RunHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

pub(crate) fn spawn(core: Arc<QueueCore>, handler: Arc<dyn RequestHandler>) -> RunHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = core.config().concurrency;
    let name = core.name().to_string();

    // Permits == idle workers. The dispatcher only pops a request once it
    // holds one, so the channel never buffers more than `workers` items.
    let idle = Arc::new(Semaphore::new(workers));
    let (dispatch_tx, dispatch_rx) = mpsc::channel(workers);
    let dispatch_rx: SharedReceiver = Arc::new(Mutex::new(dispatch_rx));

    let mut joins = Vec::with_capacity(workers + 2);

    joins.push(tokio::spawn(
        dispatcher_loop(Arc::clone(&core), idle, dispatch_tx, shutdown_rx.clone())
            .instrument(info_span!("dispatcher", queue = %name)),
    ));

    joins.push(tokio::spawn(
        scheduler_loop(Arc::clone(&core), shutdown_rx.clone())
            .instrument(info_span!("retry_scheduler", queue = %name)),
    ));

    for worker_id in 0..workers {
        let span = info_span!("worker", worker = %format!("{name}-worker:{worker_id}"));
        joins.push(tokio::spawn(
            worker_loop(
                Arc::clone(&core),
                Arc::clone(&handler),
                Arc::clone(&dispatch_rx),
                shutdown_rx.clone(),
            )
            .instrument(span),
        ));
    }

    RunHandle { shutdown_tx, joins }
}

/// `true` once shutdown was requested or the handle is gone.
async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    match shutdown_rx.changed().await {
        Ok(()) => *shutdown_rx.borrow(),
        Err(_) => true,
    }
}

async fn dispatcher_loop(
    core: Arc<QueueCore>,
    idle: Arc<Semaphore>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Backpressure: wait for an idle worker before touching the list.
        let permit = tokio::select! {
            stop = shutdown_signalled(&mut shutdown_rx) => {
                if stop { break; }
                continue;
            }
            permit = Arc::clone(&idle).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some((ticket, request)) = next_request(&core, &mut shutdown_rx).await else {
            break;
        };

        debug!(id = %request.id, %ticket, "dispatching request");
        let dispatch = Dispatch {
            ticket,
            request,
            _permit: permit,
        };
        if dispatch_tx.send(dispatch).await.is_err() {
            break;
        }
    }
    debug!("dispatcher stopped");
}

/// Wait until the pending list has a head, then pop it.
/// `None` means shutdown.
async fn next_request(
    core: &QueueCore,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<(Ticket, Request)> {
    loop {
        if let Some(next) = core.dispatch_next().await {
            return Some(next);
        }

        // Idle wait. A wake sent since the check above is kept as a permit.
        tokio::select! {
            stop = shutdown_signalled(shutdown_rx) => {
                if stop { return None; }
            }
            _ = core.wait_for_wake() => {}
        }
    }
}

async fn scheduler_loop(core: Arc<QueueCore>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let next_due = core.promote_due_retries().await;

        // 次の期限 or 新しい retry の登録まで待つ
        let sleep = async {
            match next_due {
                Some(due) => tokio::time::sleep_until(due).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            stop = shutdown_signalled(&mut shutdown_rx) => {
                if stop { break; }
            }
            _ = core.wait_for_retry_change() => {}
            _ = sleep => {}
        }
    }
    debug!("retry scheduler stopped");
}

async fn worker_loop(
    core: Arc<QueueCore>,
    handler: Arc<dyn RequestHandler>,
    dispatch_rx: SharedReceiver,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let received = tokio::select! {
            stop = shutdown_signalled(&mut shutdown_rx) => {
                if stop { break; }
                continue;
            }
            received = async { dispatch_rx.lock().await.recv().await } => received,
        };

        let Some(Dispatch {
            ticket,
            request,
            _permit,
        }) = received
        else {
            break;
        };

        // 受け取るまでの間に remove されているかもしれない
        if !core.begin_attempt(ticket).await {
            info!(id = %request.id, %ticket, "request removed before it started, skipping");
            continue;
        }

        // The core lock is not held while the handler runs.
        if handler.handle(&request).await {
            core.complete(ticket).await;
        } else {
            core.fail(ticket).await;
        }
    }
    debug!("worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tokio::time::{Instant, timeout};

    use super::*;
    use crate::config::QueueConfig;
    use crate::error::QueueError;

    struct Recording {
        tx: UnboundedSender<(Request, Instant)>,
        succeed: bool,
    }

    #[async_trait]
    impl RequestHandler for Recording {
        async fn handle(&self, request: &Request) -> bool {
            let _ = self.tx.send((request.clone(), Instant::now()));
            self.succeed
        }
    }

    fn start(
        concurrency: usize,
        succeed: bool,
    ) -> (Arc<QueueCore>, RunHandle, UnboundedReceiver<(Request, Instant)>) {
        let config = QueueConfig::new("test")
            .with_concurrency(concurrency)
            .with_retry_period(Duration::from_secs(1));
        let core = Arc::new(QueueCore::new(config).unwrap());
        let (tx, rx) = unbounded_channel();
        let handle = core.run(Arc::new(Recording { tx, succeed })).unwrap();
        (core, handle, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_fifo_order_with_one_worker() {
        let (core, handle, mut rx) = start(1, true);
        for id in ["a", "b", "c"] {
            core.enqueue(id, format!("payload-{id}")).await;
        }
        core.wake();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (request, _) = rx.recv().await.unwrap();
            seen.push(request.id);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_without_wake_waits_for_a_signal() {
        let (core, handle, mut rx) = start(1, true);
        // let the dispatcher park on an empty list
        tokio::time::sleep(Duration::from_millis(10)).await;

        core.enqueue("a", "p").await;
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        core.wake();
        let (request, _) = rx.recv().await.unwrap();
        assert_eq!(request.id, "a");

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_request_is_retried_after_each_period() {
        let (core, handle, mut rx) = start(1, false);
        core.enqueue("a", "p1").await;
        core.wake();

        let (_, first) = rx.recv().await.unwrap();
        let (_, second) = rx.recv().await.unwrap();
        let (third_request, third) = rx.recv().await.unwrap();

        assert!(second - first >= Duration::from_secs(1));
        assert!(third - second >= Duration::from_secs(1));
        assert_eq!(third_request.payload, "p1");

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removed_request_is_not_retried() {
        let (core, handle, mut rx) = start(1, false);
        core.enqueue("a", "p1").await;
        core.wake();

        rx.recv().await.unwrap();
        core.remove("a").await;

        assert!(timeout(Duration::from_secs(5), rx.recv()).await.is_err());
        assert_eq!(core.counts().await.total(), 0);

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn workers_run_concurrently() {
        let (core, handle, mut rx) = start(3, true);
        for id in ["a", "b", "c", "d"] {
            core.enqueue(id, "p").await;
        }
        core.wake();

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap().0.id);
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d"]);

        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let (core, handle, _rx) = start(1, true);
        let (tx, _rx2) = unbounded_channel();

        let second = core.run(Arc::new(Recording { tx, succeed: true }));
        assert!(matches!(second, Err(QueueError::AlreadyRunning)));

        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn shutdown_joins_idle_tasks() {
        let (_core, handle, _rx) = start(2, true);
        timeout(Duration::from_secs(1), handle.shutdown_and_join())
            .await
            .expect("all tasks stop");
    }
}
