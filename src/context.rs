//! Serialized access to the backing store.
//!
//! A [`TxnContext`] owns a worker task that executes queued operations one at
//! a time, in order, against a single open transaction. The transaction is
//! reused while it covers the requested [`Mode`] and is younger than the
//! configured age budget, and committed as soon as the queue runs dry.
//!
//! Aborts of read-write transactions are recorded in a completion chain and
//! reported by the next [`TxnContext::sync`], which is the only place they
//! become visible to callers that queued work without waiting for it.

use futures::future::{BoxFuture, FutureExt};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::backend::{Backend, Mode, Transaction};
use crate::config::Durability;
use crate::error::{Error, Result};

/// A queued operation. It may be invoked twice when the first attempt finds
/// the transaction expired.
pub type Job =
    Box<dyn for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, Result<()>> + Send>;

fn job<F>(f: F) -> Job
where
    F: for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, Result<()>> + Send + 'static,
{
    Box::new(f)
}

enum Request {
    Run {
        mode: Mode,
        job: Job,
        done: Option<oneshot::Sender<Result<()>>>,
    },
    Sync {
        done: oneshot::Sender<Result<()>>,
    },
    Drain {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub struct TxnContext {
    name: String,
    requests: mpsc::UnboundedSender<Request>,
}

impl TxnContext {
    /// Spawns the worker on the current tokio runtime.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        durability: Durability,
        max_age: Duration,
    ) -> Self {
        let name = name.into();
        let (requests, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            name: name.clone(),
            backend,
            durability,
            max_age,
            requests: rx,
            current: None,
            aborted: None,
        };
        tokio::spawn(worker.run());
        Self { name, requests }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| Error::Closed)
    }

    /// Runs `f` behind every previously queued operation and returns its
    /// result.
    pub async fn run<R, F>(&self, mode: Mode, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'t> Fn(&'t mut dyn Transaction) -> BoxFuture<'t, Result<R>> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let job = job(move |txn| {
            let pending = f(txn);
            let out = out.clone();
            async move {
                let value = pending.await?;
                *out.lock()? = Some(value);
                Ok::<(), Error>(())
            }
            .boxed()
        });

        let (done, rx) = oneshot::channel();
        self.send(Request::Run {
            mode,
            job,
            done: Some(done),
        })?;
        rx.await.map_err(|_| Error::Closed)??;

        let value = slot.lock()?.take();
        value.ok_or_else(|| Error::InvalidState("operation produced no result".to_string()))
    }

    /// Queues `f` without waiting for it. Failures surface at the next
    /// [`sync`](Self::sync).
    pub fn queue<F>(&self, mode: Mode, f: F) -> Result<()>
    where
        F: for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, Result<()>> + Send + 'static,
    {
        self.send(Request::Run {
            mode,
            job: job(f),
            done: None,
        })
    }

    /// Durability barrier: commits everything queued so far and reports the
    /// first abort recorded since the previous barrier.
    pub async fn sync(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Request::Sync { done })?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Waits until every operation queued so far has executed.
    pub async fn drain(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Request::Drain { done })?;
        rx.await.map_err(|_| Error::Closed)
    }
}

struct Open {
    txn: Box<dyn Transaction>,
    mode: Mode,
    opened: Instant,
    completed: usize,
}

struct Worker {
    name: String,
    backend: Arc<dyn Backend>,
    durability: Durability,
    max_age: Duration,
    requests: mpsc::UnboundedReceiver<Request>,
    current: Option<Open>,
    aborted: Option<Error>,
}

impl Worker {
    async fn run(mut self) {
        let mut next = self.requests.recv().await;
        while let Some(request) = next {
            self.handle(request).await;
            next = match self.requests.try_recv() {
                Ok(request) => Some(request),
                Err(_) => {
                    // queue ran dry
                    self.finish().await;
                    self.requests.recv().await
                }
            };
        }
        self.finish().await;
        tracing::debug!(context = %self.name, "Transaction context closed");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Run {
                mode,
                mut job,
                done,
            } => {
                let result = self.execute(mode, &mut job).await;
                match done {
                    Some(done) => {
                        let _ = done.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::debug!(context = %self.name, error = %e, "Queued operation failed");
                        }
                    }
                }
            }
            Request::Sync { done } => {
                self.finish().await;
                let result = match self.aborted.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                let _ = done.send(result);
            }
            Request::Drain { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn execute(&mut self, mode: Mode, job: &mut Job) -> Result<()> {
        let mut retried = false;
        loop {
            let txn = self.transaction(mode).await?;
            let result = (*job)(txn).await;
            match result {
                Ok(()) => {
                    if let Some(open) = self.current.as_mut() {
                        open.completed += 1;
                    }
                    return Ok(());
                }
                Err(Error::TransactionInactive) if !retried => {
                    tracing::debug!(context = %self.name, "Retrying on a fresh transaction");
                    retried = true;
                    self.discard(&Error::TransactionInactive).await;
                }
                Err(e) => {
                    self.discard(&e).await;
                    return Err(e);
                }
            }
        }
    }

    /// The open transaction, replaced first when it cannot serve `mode` or
    /// has outlived the age budget.
    async fn transaction(&mut self, mode: Mode) -> Result<&mut dyn Transaction> {
        let reusable = match &self.current {
            Some(open) if open.mode.covers(mode) => {
                let fresh = open.opened.elapsed() < self.max_age;
                if !fresh {
                    tracing::debug!(context = %self.name, "Refreshing aged transaction");
                }
                fresh
            }
            _ => false,
        };

        if !reusable {
            self.finish().await;
            let txn = self.backend.begin(mode, self.durability).await?;
            self.current = Some(Open {
                txn,
                mode,
                opened: Instant::now(),
                completed: 0,
            });
        }

        match self.current.as_mut() {
            Some(open) => Ok(open.txn.as_mut()),
            None => Err(Error::InvalidState("no open transaction".to_string())),
        }
    }

    /// Commits the open transaction, if any.
    async fn finish(&mut self) {
        if let Some(open) = self.current.take() {
            let (mode, completed) = (open.mode, open.completed);
            if let Err(e) = open.txn.commit().await {
                if mode == Mode::ReadWrite && completed > 0 {
                    self.record_abort(&e);
                }
            }
        }
    }

    /// Aborts the open transaction after a failed operation.
    async fn discard(&mut self, cause: &Error) {
        if let Some(open) = self.current.take() {
            let (mode, completed) = (open.mode, open.completed);
            open.txn.abort().await;
            if mode == Mode::ReadWrite && completed > 0 {
                self.record_abort(cause);
            }
        }
    }

    fn record_abort(&mut self, cause: &Error) {
        tracing::warn!(context = %self.name, error = %cause, "Transaction aborted");
        if self.aborted.is_none() {
            self.aborted = Some(Error::Aborted(cause.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::block::{Block, BlockKey, KeyRange};
    use crate::config::BackendConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(backend: &MemoryBackend, max_age: Duration) -> TxnContext {
        TxnContext::new(
            "test",
            Arc::new(backend.clone()),
            Durability::Default,
            max_age,
        )
    }

    fn put(ctx: &TxnContext, offset: u64, byte: u8) {
        ctx.queue(Mode::ReadWrite, move |txn| {
            async move {
                txn.put(BlockKey::new("db", offset, 0), Block::page(vec![byte; 4]))
                    .await
            }
            .boxed()
        })
        .unwrap();
    }

    async fn offsets(ctx: &TxnContext) -> Vec<u64> {
        ctx.run(Mode::ReadOnly, |txn| {
            async move {
                let keys = txn.get_all_keys(KeyRange::file("db"), None).await?;
                Ok::<Vec<u64>, Error>(keys.into_iter().map(|k| k.offset).collect())
            }
            .boxed()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_operations_run_in_order() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Duration::from_secs(4));

        for i in 0..5u64 {
            put(&ctx, i * 512, i as u8);
        }
        assert_eq!(offsets(&ctx).await, vec![0, 512, 1024, 1536, 2048]);
    }

    #[tokio::test]
    async fn test_burst_shares_one_transaction() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Duration::from_secs(4));

        for i in 0..10u64 {
            put(&ctx, i * 512, 1);
        }
        ctx.sync().await.unwrap();
        assert_eq!(backend.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_aged_transaction_is_replaced() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Duration::ZERO);

        for i in 0..10u64 {
            put(&ctx, i * 512, 1);
        }
        ctx.sync().await.unwrap();
        assert_eq!(backend.stats().commits, 10);
        assert_eq!(offsets(&ctx).await.len(), 10);
    }

    #[tokio::test]
    async fn test_stale_transaction_retried_once() {
        let backend =
            MemoryBackend::open(BackendConfig::in_memory().transaction_expiry(Duration::from_millis(10)))
                .unwrap();
        let ctx = context(&backend, Duration::from_secs(4));

        put(&ctx, 512, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        ctx.run(Mode::ReadWrite, move |txn| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                txn.put(BlockKey::new("db", 1024, 0), Block::page(vec![2; 4]))
                    .await
            }
            .boxed()
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // the expired transaction took the earlier write with it
        assert!(matches!(ctx.sync().await, Err(Error::Aborted(_))));
        assert!(ctx.sync().await.is_ok());
        assert_eq!(offsets(&ctx).await, vec![1024]);
    }

    #[tokio::test]
    async fn test_second_failure_propagates() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Duration::from_secs(4));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<()> = ctx
            .run(Mode::ReadOnly, move |_txn| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(Error::TransactionInactive) }.boxed()
            })
            .await;
        assert!(matches!(result, Err(Error::TransactionInactive)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_aborts_pending_writes() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Duration::from_secs(4));

        put(&ctx, 512, 1);
        let result: Result<()> = ctx
            .run(Mode::ReadWrite, |_txn| {
                async move { Err(Error::InvalidData("boom".to_string())) }.boxed()
            })
            .await;
        assert!(matches!(result, Err(Error::InvalidData(_))));

        assert!(matches!(ctx.sync().await, Err(Error::Aborted(_))));
        assert!(offsets(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_queue() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend, Duration::from_secs(4));

        put(&ctx, 0, 1);
        ctx.drain().await.unwrap();
        // the worker commits once idle
        ctx.sync().await.unwrap();
        assert_eq!(backend.stats().blocks, 1);
    }
}
