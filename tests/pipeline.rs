// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! End-to-end pipeline behavior against the in-process backend: ring
//! backpressure, fence blocking, and deferred destruction at retirement.
#![cfg(not(feature = "backend_wgpu"))]

use causeway::queue::{CommandQueue, FenceError, QueueOptions, RING_SIZE};
use causeway::{EncodeContext, imp};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn test_options() -> QueueOptions {
    QueueOptions {
        chunk_cpu_heap_size: 4096,
        chunk_gpu_heap_size: 256,
        label: "pipeline test".to_string(),
    }
}

#[test]
fn the_ring_applies_backpressure_after_eight_commits() {
    let device = imp::Device::paused();
    let (queue, recorder) = CommandQueue::new(device.clone(), test_options()).unwrap();

    let committed = Arc::new(AtomicU64::new(0));
    let producer_committed = committed.clone();
    let producer = std::thread::spawn(move || {
        let mut recorder = recorder;
        for _ in 0..RING_SIZE + 2 {
            recorder.commit().unwrap();
            producer_committed.fetch_add(1, Ordering::Release);
        }
        recorder
    });

    //the first eight commits go through without any completion
    while committed.load(Ordering::Acquire) < RING_SIZE as u64 {
        std::thread::yield_now();
    }
    //the ninth must stall: its ring slot belongs to sequence 1 until that
    //submission is coherent
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(committed.load(Ordering::Acquire), RING_SIZE as u64);
    assert_eq!(queue.coherent(), 0);

    //completing sequence 1 releases exactly one more commit
    assert!(device.complete_next());
    queue.wait_cpu_fence(1, WAIT).unwrap();
    while committed.load(Ordering::Acquire) < RING_SIZE as u64 + 1 {
        std::thread::yield_now();
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(committed.load(Ordering::Acquire), RING_SIZE as u64 + 1);

    //and the rest drain normally; keep draining because the producer's
    //last commit may land after a drain pass
    while queue.coherent() < RING_SIZE as u64 + 2 {
        device.drain();
        std::thread::yield_now();
    }
    let recorder = producer.join().unwrap();
    queue.wait_cpu_fence(RING_SIZE as u64 + 2, WAIT).unwrap();
    drop(recorder);
}

#[test]
fn fences_block_until_the_gpu_is_actually_done() {
    let device = imp::Device::paused();
    let (queue, mut recorder) = CommandQueue::new(device.clone(), test_options()).unwrap();
    recorder
        .emit(|ctx: &mut EncodeContext| ctx.debug_marker("slow frame"))
        .unwrap();
    let fence = recorder.commit().unwrap();

    //submission has happened, completion has not; the fence must not
    //return early
    let err = queue
        .wait_cpu_fence(fence, Some(Duration::from_millis(300)))
        .unwrap_err();
    assert!(matches!(err, FenceError::Timeout { coherent: 0, .. }));

    while device.outstanding_count() < 1 {
        std::thread::yield_now();
    }
    assert!(device.complete_next());
    queue.wait_cpu_fence(fence, WAIT).unwrap();
    drop(recorder);
}

#[test]
fn captures_are_destroyed_only_at_retirement() {
    struct SetOnDrop(Arc<AtomicBool>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    let device = imp::Device::paused();
    let (queue, mut recorder) = CommandQueue::new(device.clone(), test_options()).unwrap();
    let dropped = Arc::new(AtomicBool::new(false));
    let tracker = SetOnDrop(dropped.clone());
    let ran = Arc::new(AtomicBool::new(false));
    let ran_flag = ran.clone();
    recorder
        .emit(move |_ctx: &mut EncodeContext| {
            let _ = &tracker;
            ran_flag.store(true, Ordering::Release);
        })
        .unwrap();
    let fence = recorder.commit().unwrap();

    //the op has encoded (submission exists) but its capture must survive
    //until the GPU finishes and the chunk resets
    while device.outstanding_count() < 1 {
        std::thread::yield_now();
    }
    assert!(ran.load(Ordering::Acquire));
    assert!(!dropped.load(Ordering::Acquire));

    assert!(device.complete_next());
    queue.wait_cpu_fence(fence, WAIT).unwrap();
    assert!(dropped.load(Ordering::Acquire));
    drop(recorder);
}

#[test]
fn a_deep_pipeline_replays_every_frame_in_order() {
    let device = imp::Device::new();
    let (queue, mut recorder) = CommandQueue::new(device.clone(), test_options()).unwrap();
    let frames = 40u32;
    for frame in 0..frames {
        recorder
            .emit(move |ctx: &mut EncodeContext| {
                ctx.begin_render_pass(&imp::RenderTargets {
                    label: format!("frame {frame}"),
                })
            })
            .unwrap();
        recorder
            .emit(|ctx: &mut EncodeContext| ctx.draw(3, 1))
            .unwrap();
        recorder.commit().unwrap();
    }
    queue.wait_cpu_fence(frames as u64, WAIT).unwrap();

    let completed = device.completed_commands();
    assert_eq!(completed.len(), frames as usize);
    for (i, commands) in completed.iter().enumerate() {
        match &commands[0] {
            imp::Command::BeginRenderPass { label } => {
                assert_eq!(label, &format!("frame {i}"));
            }
            other => panic!("unexpected command {other:?}"),
        }
        //the context closed the pass the frame left open
        assert!(matches!(commands.last(), Some(imp::Command::EndRenderPass)));
    }
    drop(recorder);
}
