// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The threaded command pipeline: a fixed ring of [`CommandChunk`]s moving
through record, encode, submit, and completion stages.

Four monotonic sequence counters describe the pipeline. `ready_for_encode`
is the sequence the producer is currently recording into; `ready_for_commit`
is the newest committed sequence; `chunk_ongoing` is the newest sequence
submitted to the device; `cpu_coherent` is the newest sequence whose GPU
work has finished and whose chunk has been reset. At all times

```text
cpu_coherent <= chunk_ongoing <= ready_for_commit < ready_for_encode
ready_for_commit <= cpu_coherent + RING_SIZE
```

The last inequality is backpressure: a chunk's ring slot is reused only
once the submission `RING_SIZE` sequences earlier is coherent, so the
producer blocks in [`Recorder::current_chunk`] rather than overwrite work
the GPU may still be reading.

Exactly one stage owns a chunk at a time; the counters are the handoff.
The producer owns the slot for `ready_for_encode`; the encode thread owns
slots in `(chunk_ongoing, ready_for_commit]`; the finish thread owns the
slot it is resetting at `cpu_coherent + 1`. Completion callbacks may arrive
out of submission order (the backend makes no ordering promise across
command buffers); the finish thread buffers them and retires strictly in
sequence order, so `cpu_coherent` never advances past an unfinished
submission.
*/

use crate::chunk::{ChunkError, CommandChunk, EncodeContext, GpuAllocation};
use crate::imp;
use crate::pool::PoolReturn;
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, mpsc};
use std::time::{Duration, Instant};

/// Chunks in flight before the producer blocks.
pub const RING_SIZE: usize = 8;

/// Default capacity of each chunk's CPU argument heap.
pub const CHUNK_CPU_HEAP_SIZE: usize = 0x80_0000;

/// Default capacity of each chunk's GPU argument heap.
pub const CHUNK_GPU_HEAP_SIZE: u64 = 0x20_0000;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Capacity of each chunk's CPU argument heap, bytes.
    pub chunk_cpu_heap_size: usize,
    /// Capacity of each chunk's GPU argument heap, bytes.
    pub chunk_gpu_heap_size: u64,
    /// Prefix for thread names and backing-buffer labels.
    pub label: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            chunk_cpu_heap_size: CHUNK_CPU_HEAP_SIZE,
            chunk_gpu_heap_size: CHUNK_GPU_HEAP_SIZE,
            label: "causeway".to_string(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error("chunk heap allocation failed: {0}")]
    Heap(#[from] imp::Error),
    #[error("could not spawn pipeline thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitError {
    /// An earlier heap overflow poisoned the chunk. The chunk has been
    /// reset; the recorded work is lost and was never submitted.
    #[error("chunk poisoned by a heap overflow; submission dropped")]
    ChunkFailed,
}

#[derive(thiserror::Error, Debug)]
pub enum FenceError {
    #[error("fence {seq} not coherent after {waited:?} (coherent at {coherent})")]
    Timeout {
        seq: u64,
        coherent: u64,
        waited: Duration,
    },
    #[error("submission {failed_seq} failed on the device: {source}")]
    Device {
        failed_seq: u64,
        #[source]
        source: imp::Error,
    },
    #[error("queue stopped before fence {seq} became coherent")]
    Stopped { seq: u64 },
}

pub(crate) struct Shared {
    pub(crate) device: imp::Device,
    chunks: Box<[UnsafeCell<CommandChunk>]>,
    ready_for_encode: AtomicU64,
    ready_for_commit: AtomicU64,
    chunk_ongoing: AtomicU64,
    cpu_coherent: AtomicU64,
    stopped: AtomicBool,
    //waiters of every kind park here; all counter advances notify it
    wake: Mutex<()>,
    cond: Condvar,
    device_errors: Mutex<BTreeMap<u64, imp::Error>>,
    //pool-return guards held until their keyed sequence is coherent
    deferred_returns: Mutex<Vec<(u64, PoolReturn)>>,
}

//Safety: the UnsafeCell ring is the only non-Sync state. The sequence
//counters partition the slots between producer, encode thread, and finish
//thread (module doc), so no slot is ever borrowed from two threads at once.
unsafe impl Sync for Shared {}

impl Shared {
    fn slot(seq: u64) -> usize {
        (seq % RING_SIZE as u64) as usize
    }

    fn notify(&self) {
        let _guard = self.wake.lock().unwrap();
        self.cond.notify_all();
    }

    fn debug_assert_counters(&self) {
        //loaded in chain order, so a counter racing forward cannot produce
        //a false violation
        let coherent = self.cpu_coherent.load(Ordering::Acquire);
        let ongoing = self.chunk_ongoing.load(Ordering::Acquire);
        let commit = self.ready_for_commit.load(Ordering::Acquire);
        let encode = self.ready_for_encode.load(Ordering::Acquire);
        debug_assert!(coherent <= ongoing, "coherent {coherent} > ongoing {ongoing}");
        debug_assert!(ongoing <= commit, "ongoing {ongoing} > committed {commit}");
        debug_assert!(commit < encode, "committed {commit} >= recording {encode}");
        debug_assert!(
            commit <= coherent + RING_SIZE as u64,
            "committed {commit} overruns coherent {coherent} by more than the ring"
        );
    }
}

/**
The producer-side handle: records operations into the current chunk and
commits chunks into the pipeline.

There is exactly one `Recorder` per queue and it is not `Clone`; single
ownership of the recording stage is what makes `emit` and `commit` safe
without a lock around the chunk. The handle is `Send`, so the recording
thread may change between commits, never during one.
*/
pub struct Recorder {
    shared: Arc<Shared>,
}

impl Recorder {
    /// The sequence currently being recorded. Becomes the fence value of
    /// the next [`commit`](Self::commit).
    pub fn current_seq(&self) -> u64 {
        self.shared.ready_for_encode.load(Ordering::Acquire)
    }

    /// Newest sequence whose GPU work has completed.
    pub fn coherent(&self) -> u64 {
        self.shared.cpu_coherent.load(Ordering::Acquire)
    }

    pub fn device(&self) -> &imp::Device {
        &self.shared.device
    }

    /**
    The chunk being recorded.

    Blocks while the ring slot is still owned by an in-flight submission;
    this is the pipeline's backpressure point.
    */
    pub fn current_chunk(&mut self) -> &mut CommandChunk {
        let seq = self.shared.ready_for_encode.load(Ordering::Acquire);
        if seq > RING_SIZE as u64 {
            let floor = seq - RING_SIZE as u64;
            if self.shared.cpu_coherent.load(Ordering::Acquire) < floor {
                logwise::trace_sync!(
                    "ring full at sequence {seq}; waiting for {floor} to become coherent",
                    seq = seq,
                    floor = floor
                );
                let mut guard = self.shared.wake.lock().unwrap();
                while self.shared.cpu_coherent.load(Ordering::Acquire) < floor {
                    assert!(
                        !self.shared.stopped.load(Ordering::Acquire),
                        "queue stopped while the recorder is live; drop the Recorder before the CommandQueue"
                    );
                    guard = self.shared.cond.wait(guard).unwrap();
                }
            }
        }
        //safety: the producer exclusively owns the slot for `seq` (we are
        //the only Recorder), and the wait above ensured the previous tenant
        //of the slot was reset by the finish thread
        unsafe { &mut *self.shared.chunks[Shared::slot(seq)].get() }
    }

    /// Records one deferred operation into the current chunk.
    pub fn emit<F>(&mut self, op: F) -> Result<(), ChunkError>
    where
        F: FnMut(&mut EncodeContext) + Send + 'static,
    {
        self.current_chunk().emit(op)
    }

    /// Allocates GPU-visible argument data tied to the current chunk.
    pub fn allocate_gpu(&mut self, size: u64, align: u64) -> Result<GpuAllocation, ChunkError> {
        self.current_chunk().allocate_gpu(size, align)
    }

    /**
    Holds `guard` until the sequence currently being recorded is coherent,
    then lets it drop back to its pool.

    Retirements key to the coherence counter rather than living in the
    chunk arena: a poisoned chunk is reset without ever submitting, and a
    reset must never release memory an earlier submission still reads.
    */
    pub(crate) fn release_at_coherence(&mut self, guard: PoolReturn) {
        let release_at = self.shared.ready_for_encode.load(Ordering::Acquire);
        self.shared
            .deferred_returns
            .lock()
            .unwrap()
            .push((release_at, guard));
    }

    /**
    Publishes the current chunk to the encode thread and starts recording
    the next sequence. Returns the committed sequence, usable with
    [`CommandQueue::wait_cpu_fence`].

    A poisoned chunk is reset and never submitted; the sequence is reused
    for the next recording.
    */
    pub fn commit(&mut self) -> Result<u64, CommitError> {
        let seq = self.shared.ready_for_encode.load(Ordering::Acquire);
        let chunk = self.current_chunk();
        if chunk.failed() {
            chunk.reset();
            return Err(CommitError::ChunkFailed);
        }
        self.shared.ready_for_commit.store(seq, Ordering::Release);
        self.shared.ready_for_encode.store(seq + 1, Ordering::Release);
        self.shared.debug_assert_counters();
        self.shared.notify();
        Ok(seq)
    }
}

/**
The queue owner: spawns the encode and finish threads at construction and
joins them on drop.

Constructed with [`CommandQueue::new`], which also yields the queue's one
[`Recorder`]. Drop the recorder first; dropping the queue stops the
pipeline.
*/
pub struct CommandQueue {
    shared: Arc<Shared>,
    encode_thread: Option<std::thread::JoinHandle<()>>,
    finish_thread: Option<std::thread::JoinHandle<()>>,
    completion_tx: Option<mpsc::Sender<(u64, Result<(), imp::Error>)>>,
}

impl CommandQueue {
    pub fn new(
        device: imp::Device,
        options: QueueOptions,
    ) -> Result<(CommandQueue, Recorder), QueueError> {
        let mut chunks = Vec::with_capacity(RING_SIZE);
        for i in 0..RING_SIZE {
            let heap = device.new_buffer(
                options.chunk_gpu_heap_size,
                imp::BufferOptions::default(),
                &format!("{} gpu heap {i}", options.label),
            )?;
            chunks.push(UnsafeCell::new(CommandChunk::new(
                options.chunk_cpu_heap_size,
                heap,
            )));
        }
        let shared = Arc::new(Shared {
            device,
            chunks: chunks.into_boxed_slice(),
            ready_for_encode: AtomicU64::new(1),
            ready_for_commit: AtomicU64::new(0),
            chunk_ongoing: AtomicU64::new(0),
            cpu_coherent: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            wake: Mutex::new(()),
            cond: Condvar::new(),
            device_errors: Mutex::new(BTreeMap::new()),
            deferred_returns: Mutex::new(Vec::new()),
        });

        let (completion_tx, completion_rx) = mpsc::channel();

        let encode_shared = shared.clone();
        let encode_tx = completion_tx.clone();
        let encode_thread = std::thread::Builder::new()
            .name(format!("{} encode", options.label))
            .spawn(move || encode_loop(encode_shared, encode_tx))?;

        let finish_shared = shared.clone();
        let finish_thread = std::thread::Builder::new()
            .name(format!("{} finish", options.label))
            .spawn(move || finish_loop(finish_shared, completion_rx))?;

        logwise::info_sync!(
            "command queue started: ring of {ring} chunks, cpu heap {cpu} bytes, gpu heap {gpu} bytes",
            ring = RING_SIZE,
            cpu = options.chunk_cpu_heap_size,
            gpu = options.chunk_gpu_heap_size
        );
        let queue = CommandQueue {
            shared: shared.clone(),
            encode_thread: Some(encode_thread),
            finish_thread: Some(finish_thread),
            completion_tx: Some(completion_tx),
        };
        Ok((queue, Recorder { shared }))
    }

    /// Newest sequence whose GPU work has completed.
    pub fn coherent(&self) -> u64 {
        self.shared.cpu_coherent.load(Ordering::Acquire)
    }

    /// Newest committed sequence.
    pub fn committed(&self) -> u64 {
        self.shared.ready_for_commit.load(Ordering::Acquire)
    }

    /**
    Blocks until sequence `seq` is coherent, then reports any device
    failure at or before it.

    Coherence advances even through failed submissions, so a waiter is
    never stranded by a device error; the error is surfaced here instead.
    Returns [`FenceError::Timeout`] if `timeout` elapses first.
    */
    pub fn wait_cpu_fence(&self, seq: u64, timeout: Option<Duration>) -> Result<(), FenceError> {
        let start = Instant::now();
        {
            let mut guard = self.shared.wake.lock().unwrap();
            loop {
                let coherent = self.shared.cpu_coherent.load(Ordering::Acquire);
                if coherent >= seq {
                    break;
                }
                if self.shared.stopped.load(Ordering::Acquire) {
                    return Err(FenceError::Stopped { seq });
                }
                match timeout {
                    Some(limit) => {
                        let waited = start.elapsed();
                        if waited >= limit {
                            return Err(FenceError::Timeout {
                                seq,
                                coherent,
                                waited,
                            });
                        }
                        let (g, _) = self
                            .shared
                            .cond
                            .wait_timeout(guard, limit - waited)
                            .unwrap();
                        guard = g;
                    }
                    None => guard = self.shared.cond.wait(guard).unwrap(),
                }
            }
        }
        let errors = self.shared.device_errors.lock().unwrap();
        if let Some((&failed_seq, source)) = errors.range(..=seq).next_back() {
            return Err(FenceError::Device {
                failed_seq,
                source: source.clone(),
            });
        }
        Ok(())
    }

    /**
    Parks the calling thread until `cpu_coherent` moves past `observed`,
    returning the new value. Cheaper than a fence when the caller only
    wants to re-poll some coherence-gated condition.
    */
    pub fn yield_until_coherence_update(&self, observed: u64) -> u64 {
        let mut guard = self.shared.wake.lock().unwrap();
        loop {
            let coherent = self.shared.cpu_coherent.load(Ordering::Acquire);
            if coherent > observed || self.shared.stopped.load(Ordering::Acquire) {
                return coherent;
            }
            guard = self.shared.cond.wait(guard).unwrap();
        }
    }

    /// Device failures recorded so far, by sequence. Entries are sticky.
    pub fn device_errors(&self) -> Vec<(u64, imp::Error)> {
        self.shared
            .device_errors
            .lock()
            .unwrap()
            .iter()
            .map(|(&s, e)| (s, e.clone()))
            .collect()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.notify();
        if let Some(handle) = self.encode_thread.take() {
            let _ = handle.join();
        }
        //flush whatever the device still owes us so the finish thread can
        //retire every submitted sequence before the channel closes
        self.shared.device.drain();
        self.completion_tx.take();
        if let Some(handle) = self.finish_thread.take() {
            let _ = handle.join();
        }
        logwise::info_sync!(
            "command queue stopped at coherent sequence {coherent}",
            coherent = self.shared.cpu_coherent.load(Ordering::Acquire)
        );
    }
}

fn encode_loop(shared: Arc<Shared>, completions: mpsc::Sender<(u64, Result<(), imp::Error>)>) {
    loop {
        let ongoing = shared.chunk_ongoing.load(Ordering::Acquire);
        let commit = shared.ready_for_commit.load(Ordering::Acquire);
        if commit > ongoing {
            for seq in ongoing + 1..=commit {
                let cmdbuf = {
                    //safety: seq is in (chunk_ongoing, ready_for_commit], the
                    //slot range this thread owns
                    let chunk = unsafe { &mut *shared.chunks[Shared::slot(seq)].get() };
                    chunk.encode(shared.device.new_command_buffer())
                };
                let tx = completions.clone();
                shared.device.submit(
                    cmdbuf,
                    Box::new(move |result| {
                        //the queue may already be tearing down; a closed
                        //channel just means nobody is waiting
                        let _ = tx.send((seq, result));
                    }),
                );
                shared.chunk_ongoing.store(seq, Ordering::Release);
            }
            continue;
        }
        if shared.stopped.load(Ordering::Acquire) {
            return;
        }
        let guard = shared.wake.lock().unwrap();
        //re-check under the lock so a commit between the loads and here is
        //not a lost wakeup
        if shared.ready_for_commit.load(Ordering::Acquire) == ongoing
            && !shared.stopped.load(Ordering::Acquire)
        {
            drop(shared.cond.wait(guard).unwrap());
        }
    }
}

fn finish_loop(shared: Arc<Shared>, completions: mpsc::Receiver<(u64, Result<(), imp::Error>)>) {
    let mut pending: BTreeMap<u64, Result<(), imp::Error>> = BTreeMap::new();
    while let Ok((seq, result)) = completions.recv() {
        pending.insert(seq, result);
        //retire strictly in sequence order; later completions wait in
        //`pending` until their predecessors arrive
        loop {
            let next = shared.cpu_coherent.load(Ordering::Acquire) + 1;
            let Some(result) = pending.remove(&next) else {
                break;
            };
            if let Err(e) = result {
                logwise::error_sync!(
                    "submission {seq} failed on the device: {error}",
                    seq = next,
                    error = logwise::privacy::LogIt(&e)
                );
                shared.device_errors.lock().unwrap().insert(next, e);
            }
            {
                //safety: completion of seq `next` means the GPU is done with
                //the chunk; producer and encode thread moved past it long ago
                let chunk = unsafe { &mut *shared.chunks[Shared::slot(next)].get() };
                chunk.reset();
            }
            shared.cpu_coherent.store(next, Ordering::Release);
            //dropping a deferred return pushes its buffer back to its pool
            shared
                .deferred_returns
                .lock()
                .unwrap()
                .retain(|(release_at, _)| *release_at > next);
            shared.notify();
        }
    }
}

#[cfg(all(test, not(feature = "backend_wgpu")))]
mod tests {
    use super::*;

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn small_options() -> QueueOptions {
        QueueOptions {
            chunk_cpu_heap_size: 4096,
            chunk_gpu_heap_size: 256,
            label: "test queue".to_string(),
        }
    }

    #[test]
    fn commits_complete_in_order() {
        let device = imp::Device::new();
        let (queue, mut recorder) = CommandQueue::new(device.clone(), small_options()).unwrap();
        let mut last = 0;
        for i in 0..3u32 {
            recorder
                .emit(move |ctx: &mut EncodeContext| ctx.debug_marker(&format!("chunk {i}")))
                .unwrap();
            last = recorder.commit().unwrap();
        }
        assert_eq!(last, 3);
        queue.wait_cpu_fence(last, WAIT).unwrap();
        assert_eq!(queue.coherent(), 3);
        let completed = device.completed_commands();
        assert_eq!(completed.len(), 3);
        for (i, commands) in completed.iter().enumerate() {
            match &commands[0] {
                imp::Command::DebugMarker(m) => assert_eq!(m, &format!("chunk {i}")),
                other => panic!("unexpected command {other:?}"),
            }
        }
        drop(recorder);
    }

    #[test]
    fn counters_track_the_pipeline_stages() {
        let device = imp::Device::paused();
        let (queue, mut recorder) = CommandQueue::new(device.clone(), small_options()).unwrap();
        recorder.commit().unwrap();
        recorder.commit().unwrap();
        //both are committed and (soon) submitted, neither coherent
        queue
            .wait_cpu_fence(1, Some(Duration::from_millis(100)))
            .unwrap_err();
        assert_eq!(queue.committed(), 2);
        assert_eq!(queue.coherent(), 0);
        while device.outstanding_count() < 2 {
            std::thread::yield_now();
        }

        assert!(device.complete_next());
        queue.wait_cpu_fence(1, WAIT).unwrap();
        assert_eq!(queue.coherent(), 1);

        assert!(device.complete_next());
        queue.wait_cpu_fence(2, WAIT).unwrap();
        assert_eq!(queue.coherent(), 2);
        drop(recorder);
    }

    #[test]
    fn out_of_order_completion_is_retired_in_order() {
        let device = imp::Device::paused();
        let (queue, mut recorder) = CommandQueue::new(device.clone(), small_options()).unwrap();
        recorder.commit().unwrap();
        recorder.commit().unwrap();
        //wait for both submissions to reach the device
        while device.outstanding_count() < 2 {
            std::thread::yield_now();
        }
        //finish the newer submission first; coherence must not advance
        assert!(device.complete_last());
        let err = queue
            .wait_cpu_fence(1, Some(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, FenceError::Timeout { coherent: 0, .. }));
        //now the older one; both retire
        assert!(device.complete_next());
        queue.wait_cpu_fence(2, WAIT).unwrap();
        drop(recorder);
    }

    #[test]
    fn device_failure_surfaces_without_stalling_coherence() {
        let device = imp::Device::paused();
        let (queue, mut recorder) = CommandQueue::new(device.clone(), small_options()).unwrap();
        recorder
            .emit(|ctx: &mut EncodeContext| ctx.debug_marker("doomed"))
            .unwrap();
        recorder.commit().unwrap();
        recorder.commit().unwrap();
        while device.outstanding_count() < 2 {
            std::thread::yield_now();
        }
        assert!(device.fail_next("lost context"));
        assert!(device.complete_next());

        let err = queue.wait_cpu_fence(1, WAIT).unwrap_err();
        assert!(matches!(err, FenceError::Device { failed_seq: 1, .. }));
        //coherence still advanced through the failure
        assert_eq!(queue.yield_until_coherence_update(1), 2);
        assert_eq!(queue.device_errors().len(), 1);
        drop(recorder);
    }

    #[test]
    fn poisoned_chunk_is_dropped_and_the_sequence_reused() {
        let device = imp::Device::new();
        let mut options = small_options();
        options.chunk_cpu_heap_size = 96;
        let (queue, mut recorder) = CommandQueue::new(device.clone(), options).unwrap();
        let big = [0u8; 256];
        recorder
            .emit(move |_ctx: &mut EncodeContext| {
                let _ = &big;
            })
            .unwrap_err();
        assert_eq!(recorder.commit().unwrap_err(), CommitError::ChunkFailed);
        //nothing was submitted and the sequence is available again
        assert_eq!(device.submitted_count(), 0);
        recorder
            .emit(|ctx: &mut EncodeContext| ctx.debug_marker("recovered"))
            .unwrap();
        let seq = recorder.commit().unwrap();
        assert_eq!(seq, 1);
        queue.wait_cpu_fence(seq, WAIT).unwrap();
        drop(recorder);
    }

    #[test]
    fn empty_commits_flow_through() {
        let device = imp::Device::new();
        let (queue, mut recorder) = CommandQueue::new(device, small_options()).unwrap();
        for _ in 0..20 {
            recorder.commit().unwrap();
        }
        queue.wait_cpu_fence(20, WAIT).unwrap();
        drop(recorder);
    }
}
