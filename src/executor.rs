//! Fixed-size worker pool running requests against a [`Service`]
//!
//! Requests go through a bounded queue and are picked up by whichever worker
//! is free, so there is no ordering between them.

use crate::error::{Result, ShmError};
use crate::service::{Request, Response, Service};
use crate::shm::Attach;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

const DEFAULT_THREADS: usize = 1;
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads
    pub threads: usize,
    /// Requests that may wait for a worker before `submit` blocks
    pub queue_depth: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(ShmError::InvalidConfig("threads must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(ShmError::InvalidConfig(
                "queue_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

struct Job {
    request: Request,
    reply: flume::Sender<Result<Response>>,
}

/// Outcome of a submitted request
pub struct Pending {
    reply: flume::Receiver<Result<Response>>,
}

impl Pending {
    /// Block until a worker has handled the request
    pub fn wait(self) -> Result<Response> {
        match self.reply.recv() {
            Ok(result) => result,
            Err(_) => Err(ShmError::Shutdown),
        }
    }
}

pub struct Executor {
    queue: Option<flume::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    /// Spawn `config.threads` workers sharing `service`
    pub fn start<A: Attach + 'static>(config: ExecutorConfig, service: Service<A>) -> Result<Self> {
        Self::start_with(config, service, spawn_worker)
    }

    fn start_with<A, S>(config: ExecutorConfig, service: Service<A>, mut spawn: S) -> Result<Self>
    where
        A: Attach + 'static,
        S: FnMut(usize, flume::Receiver<Job>, Arc<Service<A>>) -> io::Result<JoinHandle<()>>,
    {
        config.validate()?;

        let (queue, jobs) = flume::bounded::<Job>(config.queue_depth);
        let service = Arc::new(service);
        let mut executor = Self {
            queue: Some(queue),
            workers: Vec::with_capacity(config.threads),
        };

        for index in 0..config.threads {
            match spawn(index, jobs.clone(), service.clone()) {
                Ok(worker) => executor.workers.push(worker),
                Err(e) => {
                    // Closes the queue so the workers already running exit, then joins them
                    executor.shutdown();
                    return Err(ShmError::Spawn(e));
                }
            }
        }

        debug!(threads = config.threads, queue_depth = config.queue_depth, "executor started");
        Ok(executor)
    }

    /// Queue a request, blocking while the queue is full
    pub fn submit(&self, request: Request) -> Result<Pending> {
        let queue = self.queue.as_ref().ok_or(ShmError::Shutdown)?;
        let (reply, pending) = flume::bounded(1);
        queue
            .send(Job { request, reply })
            .map_err(|_| ShmError::Shutdown)?;
        Ok(Pending { reply: pending })
    }

    /// Submit and wait for the response
    pub fn call(&self, request: Request) -> Result<Response> {
        self.submit(request)?.wait()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting requests, drain the queue and join the workers
    pub fn shutdown(&mut self) {
        if self.queue.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        debug!("executor stopped");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker<A: Attach + 'static>(
    index: usize,
    jobs: flume::Receiver<Job>,
    service: Arc<Service<A>>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("shmview-worker-{index}"))
        .spawn(move || run_worker(index, jobs, service))
}

fn run_worker<A: Attach>(index: usize, jobs: flume::Receiver<Job>, service: Arc<Service<A>>) {
    while let Ok(Job { request, reply }) = jobs.recv() {
        let result = service.call(&request);
        match &result {
            Err(e) if e.is_request_error() => {
                warn!(worker = index, batch_id = request.batch_id, error = %e, "request failed")
            }
            Err(e) => {
                error!(worker = index, batch_id = request.batch_id, error = %e, "request failed")
            }
            Ok(_) => {}
        }
        // The submitter may have stopped waiting
        let _ = reply.send(result);
    }
    debug!(worker = index, "worker exiting");
}
