//! Fixed DSP worker pool.
//!
//! Workers are spawned once at engine start, pinned to max priority, and
//! fed node jobs level by level. The audio thread dispatches a level,
//! keeps one node for itself, then spins on an atomic countdown barrier;
//! no locks are taken on the cycle path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use thread_priority::ThreadPriority;
use tracing::debug;

use crate::graph::{CycleCtx, ProcessGraph};

/// One node to process. Raw pointers are sound because the dispatching
/// thread blocks on the barrier until every job of the level completed,
/// keeping graph and context alive and unaliased.
struct Job {
    graph: *const ProcessGraph,
    ctx: *const (),
    node: u32,
}

// SAFETY: see `Job` docs; the barrier protocol serializes lifetime.
unsafe impl Send for Job {}

/// Fixed pool of DSP workers. `worker_threads == 0` processes levels
/// inline on the calling thread (the default for offline rendering and
/// tests).
pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_threads: usize) -> Self {
        let pending = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        if worker_threads == 0 {
            return Self {
                job_tx: None,
                pending,
                shutdown,
                threads: Vec::new(),
            };
        }

        let (job_tx, job_rx) = bounded::<Job>(1024);
        let threads = (0..worker_threads)
            .map(|i| {
                let rx: Receiver<Job> = job_rx.clone();
                let pending = Arc::clone(&pending);
                let shutdown = Arc::clone(&shutdown);
                std::thread::Builder::new()
                    .name(format!("ostinato-dsp-{i}"))
                    .spawn(move || {
                        let _ = thread_priority::set_current_thread_priority(ThreadPriority::Max);
                        worker_loop(rx, pending, shutdown);
                    })
                    .expect("failed to spawn dsp worker")
            })
            .collect();

        debug!(worker_threads, "dsp worker pool started");
        Self {
            job_tx: Some(job_tx),
            pending,
            shutdown,
            threads,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    /// Process every node of one topological level, returning after all
    /// are done.
    pub fn process_level(&self, graph: &ProcessGraph, level: &[u32], ctx: &CycleCtx) {
        match &self.job_tx {
            None => {
                for &idx in level {
                    graph.process_node(idx, ctx);
                }
            }
            Some(tx) => {
                if level.len() == 1 {
                    graph.process_node(level[0], ctx);
                    return;
                }
                // Hand all but the last node to the pool; the caller takes
                // the last one instead of idling at the barrier.
                let (shared, local) = level.split_at(level.len() - 1);
                self.pending.store(shared.len(), Ordering::Release);
                for &idx in shared {
                    let job = Job {
                        graph: graph as *const ProcessGraph,
                        ctx: ctx as *const CycleCtx as *const (),
                        node: idx,
                    };
                    if tx.try_send(job).is_err() {
                        // Queue full: run it here rather than stall.
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                        graph.process_node(idx, ctx);
                    }
                }
                graph.process_node(local[0], ctx);
                while self.pending.load(Ordering::Acquire) != 0 {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.job_tx = None;
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Job>, pending: Arc<AtomicUsize>, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(job) => {
                // SAFETY: the dispatcher blocks on the barrier until this
                // job completes, so the pointers are live; the level
                // schedule guarantees exclusive access to the node.
                let graph = unsafe { &*job.graph };
                let ctx = unsafe { &*(job.ctx as *const CycleCtx) };
                graph.process_node(job.node, ctx);
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}
