mod common;

use chorus_voice::{SchedulerPolicy, SynthesisScheduler, VoiceError};
use common::{plain_chunks, voice, MockBackend};
use std::sync::Arc;
use std::time::Duration;

fn policy(max_concurrency: usize, buffer_ahead_count: usize, pause: bool, delay_ms: u64) -> SchedulerPolicy {
    SchedulerPolicy {
        max_concurrency,
        delay_between_requests_ms: delay_ms,
        buffer_ahead_count,
        pause_until_first_complete: pause,
    }
}

#[tokio::test(start_paused = true)]
async fn earlier_chunk_is_delivered_first_even_when_slower() {
    let backend = Arc::new(
        MockBackend::new(10)
            .with_delay(0, Duration::from_millis(500))
            .with_delay(1, Duration::from_millis(200)),
    );
    let scheduler = SynthesisScheduler::new(backend.clone(), policy(2, 1, false, 0)).unwrap();

    let mut stream = scheduler.run(plain_chunks(2), voice());
    let first = stream.next().await.expect("first result").expect("should succeed");
    let second = stream.next().await.expect("second result").expect("should succeed");
    assert_eq!(first.chunk_index, 0);
    assert_eq!(second.chunk_index, 1);
    assert!(stream.next().await.is_none());

    // Both ran concurrently, chunk 1 finished first.
    assert_eq!(backend.max_in_flight(), 2);
    assert_eq!(backend.calls(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn pause_until_first_complete_holds_back_later_chunks() {
    let backend = Arc::new(MockBackend::new(10).with_delay(0, Duration::from_millis(300)));
    let scheduler = SynthesisScheduler::new(backend.clone(), policy(2, 2, true, 0)).unwrap();

    let mut stream = scheduler.run(plain_chunks(3), voice());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.calls(), vec![0]);

    let mut indices = Vec::new();
    while let Some(result) = stream.next().await {
        indices.push(result.expect("should succeed").chunk_index);
    }
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(backend.calls(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn concurrency_opens_up_after_first_chunk() {
    let backend = Arc::new(
        MockBackend::new(10)
            .with_default_delay(Duration::from_millis(100))
            .with_delay(0, Duration::from_millis(300)),
    );
    let scheduler = SynthesisScheduler::new(backend.clone(), policy(2, 3, true, 0)).unwrap();

    let mut stream = scheduler.run(plain_chunks(4), voice());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.calls(), vec![0]);
    assert_eq!(backend.max_in_flight(), 1);

    let mut indices = Vec::new();
    while let Some(result) = stream.next().await {
        indices.push(result.expect("should succeed").chunk_index);
    }
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(backend.max_in_flight(), 2);

    // Chunks 1 and 2 start together once chunk 0 is back.
    let times = backend.call_times();
    assert_eq!(times[1], times[2]);
    assert!(times[3] >= times[1] + Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn buffer_ahead_bounds_dispatch() {
    let backend = Arc::new(MockBackend::new(10).with_default_delay(Duration::from_millis(100)));
    let scheduler = SynthesisScheduler::new(backend.clone(), policy(4, 0, false, 0)).unwrap();

    let mut stream = scheduler.run(plain_chunks(4), voice());
    let mut count = 0;
    while let Some(result) = stream.next().await {
        result.expect("should succeed");
        count += 1;
    }
    assert_eq!(count, 4);
    assert_eq!(backend.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn dispatch_starts_are_spaced_by_delay() {
    let backend = Arc::new(MockBackend::new(10).with_default_delay(Duration::from_millis(1000)));
    let scheduler = SynthesisScheduler::new(backend.clone(), policy(3, 5, false, 50)).unwrap();

    let mut stream = scheduler.run(plain_chunks(3), voice());
    while let Some(result) = stream.next().await {
        result.expect("should succeed");
    }

    let times = backend.call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(50), "gap too short: {:?}", pair[1] - pair[0]);
    }
    assert_eq!(backend.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_chunk_is_delivered_in_its_slot() {
    let backend = Arc::new(MockBackend::new(10).failing_at(1));
    let scheduler = SynthesisScheduler::new(backend, policy(2, 2, false, 0)).unwrap();

    let mut stream = scheduler.run(plain_chunks(3), voice());
    assert_eq!(stream.next().await.unwrap().unwrap().chunk_index, 0);
    let err = stream.next().await.unwrap().expect_err("chunk 1 should fail");
    assert!(matches!(err, VoiceError::SynthesisFailed { chunk_index: 1, .. }));
    assert_eq!(err.chunk_index(), Some(1));
    assert_eq!(stream.next().await.unwrap().unwrap().chunk_index, 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_further_dispatch() {
    let backend = Arc::new(MockBackend::new(10).with_default_delay(Duration::from_millis(100)));
    let scheduler = SynthesisScheduler::new(backend.clone(), policy(1, 1, true, 0)).unwrap();

    let mut stream = scheduler.run(plain_chunks(5), voice());
    assert_eq!(stream.total(), 5);
    stream.next().await.unwrap().unwrap();
    stream.cancel();
    while stream.next().await.is_some() {}

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(backend.calls().len() <= 2, "dispatched after cancel: {:?}", backend.calls());
}

#[tokio::test]
async fn empty_input_ends_immediately() {
    let backend = Arc::new(MockBackend::new(10));
    let scheduler = SynthesisScheduler::new(backend.clone(), SchedulerPolicy::default()).unwrap();
    let mut stream = scheduler.run(Vec::new(), voice());
    assert!(stream.next().await.is_none());
    assert!(backend.calls().is_empty());
}

#[test]
fn zero_concurrency_is_rejected() {
    let backend = Arc::new(MockBackend::new(10));
    let err = SynthesisScheduler::new(backend, policy(0, 1, true, 0)).expect_err("should reject");
    assert!(matches!(err, VoiceError::InvalidOptions(_)));
}

#[tokio::test(start_paused = true)]
async fn panicking_request_fails_its_own_chunk() {
    let backend = Arc::new(
        MockBackend::new(10)
            .with_delay(0, Duration::from_millis(300))
            .panicking_at(1),
    );
    let scheduler = SynthesisScheduler::new(backend.clone(), policy(3, 3, false, 0)).unwrap();

    let mut stream = scheduler.run(plain_chunks(3), voice());
    let first = stream.next().await.expect("first result");
    assert_eq!(first.expect("chunk 0 should succeed").chunk_index, 0);

    match stream.next().await.expect("second result") {
        Err(VoiceError::SynthesisFailed { chunk_index, .. }) => assert_eq!(chunk_index, 1),
        other => panic!("unexpected result: {other:?}"),
    }

    let third = stream.next().await.expect("third result");
    assert_eq!(third.expect("chunk 2 should succeed").chunk_index, 2);
    assert!(stream.next().await.is_none());
}
