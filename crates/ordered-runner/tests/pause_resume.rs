//! Pause and resume behaviour of the ordered runner.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ordered_runner::{BacklogThrottle, OrderedRunner, ThrottleConfig, ThrottleEvent};

fn record_into(delivered: &Arc<Mutex<Vec<usize>>>) -> impl FnMut(u64, usize) + Send + 'static {
    let delivered = delivered.clone();
    move |_, index| delivered.lock().push(index)
}

async fn sleep_ms(delay: u64) -> u64 {
    tokio::time::sleep(Duration::from_millis(delay)).await;
    delay
}

#[tokio::test(start_paused = true)]
async fn paused_runner_delivers_nothing_until_resumed() {
    let runner = OrderedRunner::new(2);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    runner.pause();

    let run = tokio::spawn({
        let runner = runner.clone();
        let on_finish = record_into(&delivered);
        async move { runner.run(vec![30, 10, 20], sleep_ms, on_finish).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(delivered.lock().is_empty());

    runner.resume();
    run.await.unwrap().unwrap();
    assert_eq!(*delivered.lock(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn pause_mid_run_lets_in_flight_tasks_finish() {
    let runner = OrderedRunner::new(2);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(AtomicUsize::new(0));

    let work = {
        let started = started.clone();
        move |delay: u64| {
            started.fetch_add(1, Ordering::SeqCst);
            sleep_ms(delay)
        }
    };
    let run = tokio::spawn({
        let runner = runner.clone();
        let on_finish = record_into(&delivered);
        async move { runner.run(vec![50; 6], work, on_finish).await }
    });

    // Tasks 0 and 1 are delivered, 2 and 3 are in flight.
    tokio::time::sleep(Duration::from_millis(60)).await;
    runner.pause();
    assert_eq!(*delivered.lock(), vec![0, 1]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(started.load(Ordering::SeqCst), 4);
    assert_eq!(delivered.lock().len(), 2);

    runner.resume();
    run.await.unwrap().unwrap();
    assert_eq!(*delivered.lock(), vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn toggling_pause_keeps_order_and_delivers_once() {
    let runner = OrderedRunner::new(3);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let delays: Vec<u64> = (0..20).map(|i| (i * 37 % 90) + 5).collect();

    let run = tokio::spawn({
        let runner = runner.clone();
        let on_finish = record_into(&delivered);
        async move { runner.run(delays, sleep_ms, on_finish).await }
    });

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(35)).await;
        runner.pause();
        tokio::time::sleep(Duration::from_millis(15)).await;
        runner.resume();
    }
    run.await.unwrap().unwrap();

    assert_eq!(*delivered.lock(), (0..20).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn throttle_pauses_runner_on_backlog() {
    let runner = OrderedRunner::new(4);
    let throttle = Arc::new(BacklogThrottle::new(ThrottleConfig {
        enabled: true,
        high_watermark: 3,
        low_watermark: 1,
        check_interval: Duration::from_millis(5),
    }));
    let mut events = throttle.subscribe();
    let backlog = Arc::new(Mutex::new(0usize));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();

    // The consumer drains one item every 40 ms.
    let consumer = tokio::spawn({
        let backlog = backlog.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_millis(40)).await;
                let mut backlog = backlog.lock();
                *backlog = backlog.saturating_sub(1);
            }
        }
    });
    let monitor = throttle
        .clone()
        .start_monitoring(
            {
                let backlog = backlog.clone();
                move || *backlog.lock()
            },
            Arc::new(runner.pause_handle()),
            cancel.clone(),
        )
        .unwrap();

    let on_finish = {
        let backlog = backlog.clone();
        let delivered = delivered.clone();
        move |_: u64, index: usize| {
            *backlog.lock() += 1;
            delivered.lock().push(index);
        }
    };
    runner.run(vec![5; 16], sleep_ms, on_finish).await.unwrap();
    cancel.cancel();
    monitor.await.unwrap();
    consumer.abort();

    assert_eq!(*delivered.lock(), (0..16).collect::<Vec<_>>());
    assert!(matches!(events.try_recv(), Ok(ThrottleEvent::Paused { .. })));
    assert!(matches!(events.try_recv(), Ok(ThrottleEvent::Resumed { .. })));
    assert!(!runner.is_paused());
}
