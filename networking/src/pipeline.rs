/// Bounded multi-stage worker pipeline.
///
/// A pipeline is an ordered chain of stages. Each stage owns a bounded input
/// queue and a pool of workers; a worker takes one item, runs the stage's
/// transform on it, and the transform emits zero or more items into the next
/// stage's queue (or the pipeline output, for the last stage).
///
/// ## Ordering
///
/// A stage with one worker processes and emits strictly in input order. With
/// several workers the stage shares one input queue and ordering across workers
/// is not guaranteed.
///
/// ## Backpressure
///
/// Every queue is bounded. `submit` and `Emitter::emit` suspend while the
/// receiving queue is full, so a slow stage throttles everything upstream.
///
/// ## End of work
///
/// A transform returning [`Flow::Finish`] marks its stage finished: sibling
/// workers stop at their next read, items still queued for the stage are
/// dropped, and the stage's input closes once every worker is gone. The next
/// stage then drains what is already queued and exits too, and so on;
/// `receive` then yields `None`.
///
/// ## Cancellation
///
/// All workers watch a shared [`Shutdown`] token. Cancelling it (or a
/// transform returning an error, which records the failure on the token)
/// stops every worker at its next suspension point.
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_QUEUE_CAPACITY: usize = 2;

/// Cancellation token carrying the first fatal failure.
///
/// One token guards a whole run; narrower ones mark a single stage or peer
/// as done.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    cancelled: watch::Sender<bool>,
    failure: Mutex<Option<anyhow::Error>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                cancelled,
                failure: Mutex::new(None),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Record `error` (unless a failure is already recorded) and cancel.
    pub fn fail(&self, error: anyhow::Error) {
        {
            let mut failure = self.inner.failure.lock();
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub fn take_failure(&self) -> Option<anyhow::Error> {
        self.inner.failure.lock().take()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// What a stage worker does after processing an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// No more work will come from this stage.
    Finish,
}

/// A pipeline stage transform.
#[async_trait]
pub trait Stage<I: Send + 'static, O: Send + 'static>: Send + Sync + 'static {
    async fn process(&self, item: I, out: &Emitter<O>) -> Result<Flow>;
}

/// The next stage stopped taking items; the emitting stage winds down too.
#[derive(Debug, thiserror::Error)]
#[error("downstream stage closed")]
pub struct DownstreamClosed;

/// Handle a transform uses to push results downstream.
pub struct Emitter<O> {
    tx: mpsc::Sender<O>,
}

impl<O: Send> Emitter<O> {
    pub async fn emit(&self, item: O) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow::Error::new(DownstreamClosed))
    }
}

/// Cloneable handle feeding the first stage of a pipeline.
pub struct Submitter<I> {
    tx: mpsc::Sender<I>,
}

impl<I> Clone for Submitter<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<I: Send> Submitter<I> {
    pub async fn submit(&self, item: I) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow!("pipeline input closed"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageConfig {
    pub name: &'static str,
    pub workers: usize,
    pub capacity: usize,
}

impl StageConfig {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            workers: DEFAULT_WORKERS,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

type Attach<O> = Box<dyn FnOnce(mpsc::Sender<O>, &mut JoinSet<()>) + Send>;

/// Builds a pipeline stage by stage.
///
/// A stage's workers are spawned once the queue they emit into exists, i.e.
/// when the next stage is added or the pipeline is built.
pub struct PipelineBuilder<I, O> {
    input: mpsc::Sender<I>,
    attach: Attach<O>,
    shutdown: Shutdown,
    workers: JoinSet<()>,
}

impl<I: Send + 'static, O: Send + 'static> PipelineBuilder<I, O> {
    pub fn new<S: Stage<I, O>>(shutdown: Shutdown, config: StageConfig, stage: S) -> Self {
        let (input, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            input,
            attach: attach_stage(rx, config, stage, shutdown.clone()),
            shutdown,
            workers: JoinSet::new(),
        }
    }

    /// Handle for feeding the first stage, usable before the pipeline is built.
    pub fn submitter(&self) -> Submitter<I> {
        Submitter {
            tx: self.input.clone(),
        }
    }

    pub fn then<P: Send + 'static, S: Stage<O, P>>(
        self,
        config: StageConfig,
        stage: S,
    ) -> PipelineBuilder<I, P> {
        let PipelineBuilder {
            input,
            attach,
            shutdown,
            mut workers,
        } = self;

        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        attach(tx, &mut workers);

        PipelineBuilder {
            input,
            attach: attach_stage(rx, config, stage, shutdown.clone()),
            shutdown,
            workers,
        }
    }

    pub fn build(self) -> Pipeline<I, O> {
        let PipelineBuilder {
            input,
            attach,
            shutdown,
            mut workers,
        } = self;

        let (tx, output) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        attach(tx, &mut workers);

        Pipeline {
            input: Submitter { tx: input },
            output,
            shutdown,
            workers,
        }
    }
}

fn attach_stage<I, O, S>(
    rx: mpsc::Receiver<I>,
    config: StageConfig,
    stage: S,
    shutdown: Shutdown,
) -> Attach<O>
where
    I: Send + 'static,
    O: Send + 'static,
    S: Stage<I, O>,
{
    Box::new(move |tx, workers| spawn_stage(rx, tx, config, Arc::new(stage), shutdown, workers))
}

fn spawn_stage<I, O, S>(
    rx: mpsc::Receiver<I>,
    tx: mpsc::Sender<O>,
    config: StageConfig,
    stage: Arc<S>,
    shutdown: Shutdown,
    workers: &mut JoinSet<()>,
) where
    I: Send + 'static,
    O: Send + 'static,
    S: Stage<I, O>,
{
    let input = Arc::new(AsyncMutex::new(rx));
    // Workers never take the input lock to stop; an idle sibling may hold it.
    let finished = Shutdown::new();

    for worker in 0..config.workers.max(1) {
        let input = input.clone();
        let finished = finished.clone();
        let emitter = Emitter { tx: tx.clone() };
        let stage = stage.clone();
        let shutdown = shutdown.clone();
        let name = config.name;

        workers.spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    _ = finished.cancelled() => None,
                    item = recv_shared(&input) => item,
                };
                let Some(item) = next else {
                    break;
                };

                let flow = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    flow = stage.process(item, &emitter) => flow,
                };

                match flow {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Finish) => {
                        debug!(stage = name, worker, "Stage finished");
                        finished.cancel();
                        break;
                    }
                    Err(err) if err.is::<DownstreamClosed>() => {
                        debug!(stage = name, worker, "Downstream closed, stopping stage");
                        finished.cancel();
                        break;
                    }
                    Err(err) => {
                        warn!(stage = name, worker, error = %err, "Stage failed");
                        shutdown.fail(err);
                        break;
                    }
                }
            }
        });
    }
}

async fn recv_shared<I>(input: &AsyncMutex<mpsc::Receiver<I>>) -> Option<I> {
    input.lock().await.recv().await
}

/// A running pipeline.
pub struct Pipeline<I, O> {
    input: Submitter<I>,
    output: mpsc::Receiver<O>,
    shutdown: Shutdown,
    workers: JoinSet<()>,
}

impl<I: Send + 'static, O: Send + 'static> Pipeline<I, O> {
    /// Feed the first stage, suspending while its queue is full.
    pub async fn submit(&self, item: I) -> Result<()> {
        self.input.submit(item).await
    }

    pub fn submitter(&self) -> Submitter<I> {
        self.input.clone()
    }

    /// Next output item, or `None` once the pipeline has drained or stopped.
    pub async fn receive(&mut self) -> Option<O> {
        tokio::select! {
            biased;
            item = self.output.recv() => item,
            _ = self.shutdown.cancelled() => None,
        }
    }

    pub fn try_receive(&mut self) -> Option<O> {
        self.output.try_recv().ok()
    }

    /// Stop every worker and release queued items.
    pub fn close(&mut self) {
        self.workers.abort_all();
        self.output.close();
    }
}

impl<I, O> Drop for Pipeline<I, O> {
    fn drop(&mut self) {
        self.workers.abort_all();
    }
}
