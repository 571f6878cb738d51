// Bounded fan-out from one capture reader to a fixed set of workers
pub mod handler;

pub use handler::{Disposition, HandlerConfig, Outcome, PacketHandler};

use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

use crate::capture::{CaptureSource, SourceEvent};
use crate::packet::CapturedDatagram;

/// What the producer does when every queue slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for a worker to free a slot (backpressure onto the capture reader)
    Block,
    /// Discard the datagram and count it
    Drop,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop" => Ok(OverflowPolicy::Drop),
            other => Err(format!("unknown overflow policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Draining,
    Stopped,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Running,
            1 => PipelineState::Draining,
            _ => PipelineState::Stopped,
        }
    }
}

/// Read-only view of a pool's state that outlives `shutdown`.
#[derive(Debug, Clone)]
pub struct PipelineStateHandle(Arc<AtomicU8>);

impl PipelineStateHandle {
    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub pin_cores: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: 100,
            overflow: OverflowPolicy::Block,
            pin_cores: true,
        }
    }
}

#[derive(Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub not_ntp: AtomicU64,
    pub ignored: AtomicU64,
    pub filtered: AtomicU64,
    pub logged: AtomicU64,
    pub log_errors: AtomicU64,
    pub responses: AtomicU64,
    pub send_errors: AtomicU64,
    pub dropped: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            not_ntp: self.not_ntp.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            logged: self.logged.load(Ordering::Relaxed),
            log_errors: self.log_errors.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub not_ntp: u64,
    pub ignored: u64,
    pub filtered: u64,
    pub logged: u64,
    pub log_errors: u64,
    pub responses: u64,
    pub send_errors: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    Dropped,
}

/// Fixed pool of worker threads behind a bounded, closable queue.
///
/// Running → Draining when `close` (or `shutdown`) closes the queue; Draining → Stopped
/// once every worker has emptied it and exited. Anything accepted onto the
/// queue is processed before Stopped.
pub struct WorkerPool {
    sender: Option<Sender<CapturedDatagram>>,
    handles: Vec<thread::JoinHandle<()>>,
    state: Arc<AtomicU8>,
    stats: Arc<PipelineStats>,
    overflow: OverflowPolicy,
}

impl WorkerPool {
    pub fn start(config: &PoolConfig, handler: Arc<PacketHandler>) -> Self {
        let worker_count = config.workers.max(1);
        let (sender, receiver) = channel::bounded::<CapturedDatagram>(config.queue_capacity.max(1));

        let core_ids = if config.pin_cores {
            match core_affinity::get_core_ids() {
                Some(ids) if !ids.is_empty() => Some(Arc::new(ids)),
                _ => {
                    info!("CPU affinity not supported on this platform, continuing without core pinning");
                    None
                }
            }
        } else {
            None
        };

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let receiver = receiver.clone();
            let handler = handler.clone();
            let core_ids = core_ids.clone();

            let handle = thread::Builder::new()
                .name(format!("ntp-worker-{}", worker_id))
                .spawn(move || {
                    if let Some(cores) = &core_ids {
                        let core = cores[worker_id % cores.len()];
                        if core_affinity::set_for_current(core) {
                            debug!("Worker {} pinned to CPU core {}", worker_id, core.id);
                        }
                    }
                    run_worker(worker_id, receiver, &handler);
                });

            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("Failed to spawn worker {}: {}", worker_id, e),
            }
        }

        info!(
            "Started {} worker threads (queue capacity {}, overflow {:?})",
            handles.len(),
            config.queue_capacity,
            config.overflow
        );

        Self {
            sender: Some(sender),
            handles,
            state: Arc::new(AtomicU8::new(PipelineState::Running as u8)),
            stats: handler.stats(),
            overflow: config.overflow,
        }
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn state_handle(&self) -> PipelineStateHandle {
        PipelineStateHandle(self.state.clone())
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Hand a datagram to the workers according to the overflow policy.
    pub fn submit(&self, datagram: CapturedDatagram) -> Result<Submitted> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Pipeline is no longer accepting packets"))?;

        match self.overflow {
            OverflowPolicy::Block => {
                sender
                    .send(datagram)
                    .map_err(|_| anyhow::anyhow!("All workers have exited"))?;
                Ok(Submitted::Queued)
            }
            OverflowPolicy::Drop => match sender.try_send(datagram) {
                Ok(()) => Ok(Submitted::Queued),
                Err(TrySendError::Full(_)) => {
                    PipelineStats::bump(&self.stats.dropped);
                    Ok(Submitted::Dropped)
                }
                Err(TrySendError::Disconnected(_)) => Err(anyhow::anyhow!("All workers have exited")),
            },
        }
    }

    /// Stop accepting datagrams. Workers keep going until the queue is empty.
    pub fn close(&mut self) {
        if self.sender.take().is_some() {
            self.state.store(PipelineState::Draining as u8, Ordering::Release);
            debug!("Queue closed, draining");
        }
    }

    /// Close the queue, wait for the workers to drain it, and report totals.
    pub fn shutdown(mut self) -> StatsSnapshot {
        self.close();
        self.join_workers();
        self.stats.snapshot()
    }

    fn join_workers(&mut self) {
        for (i, handle) in self.handles.drain(..).enumerate() {
            if let Err(e) = handle.join() {
                warn!("Error joining worker thread {}: {:?}", i, e);
            }
        }
        self.state.store(PipelineState::Stopped as u8, Ordering::Release);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.state() != PipelineState::Stopped {
            self.close();
            self.join_workers();
        }
    }
}

fn run_worker(worker_id: usize, receiver: Receiver<CapturedDatagram>, handler: &PacketHandler) {
    let mut processed = 0u64;
    // Ends once the queue is closed and empty
    for datagram in receiver.iter() {
        handler.handle(&datagram);
        processed += 1;
    }
    debug!("Worker {} shutting down after {} packets", worker_id, processed);
}

/// Read from `source` and feed the pool until the source is exhausted or
/// `running` is cleared. Returns the number of datagrams read.
pub fn drive_capture(source: &mut dyn CaptureSource, pool: &WorkerPool, running: &AtomicBool) -> Result<u64> {
    let mut count = 0u64;

    while running.load(Ordering::Relaxed) {
        match source.next_event()? {
            SourceEvent::Datagram(datagram) => {
                count += 1;
                if pool.submit(datagram)? == Submitted::Dropped {
                    debug!("Queue full, dropped datagram #{}", count);
                }
            }
            SourceEvent::Idle => continue,
            SourceEvent::Exhausted => {
                info!("Capture source {} exhausted after {} datagrams", source.describe(), count);
                break;
            }
        }
    }

    Ok(count)
}
