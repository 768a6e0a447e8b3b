//! SMP barrier coordination: `MB`, `WMB`, `TRAPB`, `IMB`, `FETCH`, `RPCC`/`RS`/`RC`, per §4.9.

use {
    crate::{
        error::{FaultContext, MemoryFault},
        stats::BarrierStats,
    },
    crossbeam_channel::{bounded, Sender},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
    tracing::{error, trace},
};

/// Which barrier primitive was submitted. `Fetch`/`FetchM` additionally name the line to
/// prefetch; the others carry no extra data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Memory barrier: drain all prior writes before any subsequent one is issued.
    Mb,
    /// Write-memory barrier: drain prior writes only (reads may pass).
    Wmb,
    /// Trap barrier: wait for in-flight traps on the issuing CPU to retire.
    Trapb,
    /// Exception barrier: same wait as `Trapb` under a different mnemonic.
    Excb,
    /// Instruction-memory barrier: invalidate the instruction cache and flush fetch.
    Imb,
    /// Prefetch a line for read.
    Fetch,
    /// Prefetch a line and request `Modified` ownership.
    FetchM,
}

/// A submitted barrier request.
pub struct BarrierRequest {
    pub kind: BarrierKind,
    pub cpu_id: usize,
    pub seq: u64,
}

/// What the engine does to fulfil one barrier kind. An embedder supplies these as closures over
/// its own CPU/cache/coherence state at construction time (the "construction-time builder, no
/// runtime type tests" pattern of §9) rather than the engine reaching into global state.
pub trait BarrierHandler: Send + Sync {
    fn drain_writes(&self, cpu_id: usize) -> Result<(), MemoryFault>;
    fn drain_write_only(&self, cpu_id: usize) -> Result<(), MemoryFault>;
    fn await_trap_retirement(&self, cpu_id: usize) -> Result<(), MemoryFault>;
    fn invalidate_instruction_cache(&self, cpu_id: usize) -> Result<(), MemoryFault>;
    fn prefetch(&self, cpu_id: usize, modified: bool) -> Result<(), MemoryFault>;
}

/// Coordinates barrier completion across a small worker pool, per §4.9. `submit` blocks the
/// calling CPU thread until its own barrier completes or times out; per-CPU submission order is
/// therefore naturally FIFO because each CPU thread only ever has one `submit` in flight.
pub struct BarrierEngine {
    sender: Sender<QueuedBarrier>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    pub stats: BarrierStats,
    timeout: Duration,
}

struct QueuedBarrier {
    request: BarrierRequest,
    reply: Sender<Result<(), MemoryFault>>,
}

impl BarrierEngine {
    pub fn new(handler: Arc<dyn BarrierHandler>, worker_count: usize, timeout: Duration) -> Self {
        let (sender, receiver) = bounded::<QueuedBarrier>(256);
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("barrier-worker-{worker_id}"))
                .spawn(move || {
                    while let Ok(queued) = receiver.recv() {
                        if shutdown.load(Ordering::Acquire) {
                            let _ = queued.reply.send(Err(timeout_fault(queued.request.cpu_id)));
                            continue;
                        }
                        let result = Self::execute(&handler, &queued.request);
                        let _ = queued.reply.send(result);
                    }
                })
                .expect("failed to spawn barrier worker thread");
            workers.push(handle);
        }
        Self { sender, workers: Mutex::new(workers), shutdown, stats: BarrierStats::default(), timeout }
    }

    fn execute(handler: &Arc<dyn BarrierHandler>, request: &BarrierRequest) -> Result<(), MemoryFault> {
        match request.kind {
            BarrierKind::Mb => handler.drain_writes(request.cpu_id),
            BarrierKind::Wmb => handler.drain_write_only(request.cpu_id),
            BarrierKind::Trapb | BarrierKind::Excb => handler.await_trap_retirement(request.cpu_id),
            BarrierKind::Imb => handler.invalidate_instruction_cache(request.cpu_id),
            BarrierKind::Fetch => handler.prefetch(request.cpu_id, false),
            BarrierKind::FetchM => handler.prefetch(request.cpu_id, true),
        }
    }

    /// Submit a barrier and block until it completes or the configured timeout elapses.
    pub fn submit(&self, kind: BarrierKind, cpu_id: usize, seq: u64) -> Result<(), MemoryFault> {
        let (reply_tx, reply_rx) = bounded(1);
        let queued = QueuedBarrier { request: BarrierRequest { kind, cpu_id, seq }, reply: reply_tx };
        if self.sender.send_timeout(queued, self.timeout).is_err() {
            self.stats.timed_out.incr();
            error!(cpu_id, ?kind, "barrier queue full, timed out before dispatch");
            return Err(timeout_fault(cpu_id));
        }
        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => {
                if result.is_ok() {
                    self.stats.completed.incr();
                    trace!(cpu_id, ?kind, seq, "barrier completed");
                } else {
                    self.stats.timed_out.incr();
                }
                result
            }
            Err(_) => {
                self.stats.timed_out.incr();
                error!(cpu_id, ?kind, "barrier timed out awaiting completion");
                Err(timeout_fault(cpu_id))
            }
        }
    }

    /// Drain pending work and mark the engine inactive; further `submit` calls time out
    /// immediately instead of deadlocking against a stopped worker pool.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn timeout_fault(cpu_id: usize) -> MemoryFault {
    MemoryFault::BarrierTimeout {
        ctx: FaultContext::new(crate::addr::VirtualAddress(0), crate::addr::AccessType::Read, cpu_id, 0),
    }
}
