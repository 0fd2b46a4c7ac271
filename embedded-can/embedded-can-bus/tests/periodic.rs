use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use embedded_can::{Frame, StandardId};
use embedded_can_bus::{
    BusError, BusOptions, CanFrame, FrameKind, PeriodicTarget, PeriodicTxScheduler, PeriodicUpdate,
    QueuedCanBus, Repeat, VirtualBus,
};
use tokio::time::sleep;

fn frame(data: &[u8]) -> CanFrame {
    CanFrame::new(StandardId::new(0x321).unwrap(), data).unwrap()
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn finite_repeat_completes_once_and_stops() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let scheduler = PeriodicTxScheduler::new(
        PeriodicTarget::Port(bus.open_port()),
        frame(&[0xAA]),
        Duration::from_millis(10),
        false,
    )
    .with_repeat(Repeat::Times(3));
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    scheduler.on_complete(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    scheduler.start().unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(bus.log().len(), 3);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(!scheduler.is_running());
    scheduler.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_repeat_needs_an_update_to_restart() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let scheduler = PeriodicTxScheduler::new(
        PeriodicTarget::Port(bus.open_port()),
        frame(&[0xBB]),
        Duration::from_millis(10),
        false,
    )
    .with_repeat(Repeat::Times(2));
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    scheduler.on_complete(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    scheduler.start().unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.log().len(), 2);
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    assert!(matches!(scheduler.start(), Err(BusError::Unsupported(_))));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.log().len(), 2);
    assert_eq!(completions.load(Ordering::SeqCst), 1);

    scheduler
        .update(PeriodicUpdate {
            repeat: Some(Repeat::Times(1)),
            ..PeriodicUpdate::default()
        })
        .unwrap();
    scheduler.start().unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.log().len(), 3);
    assert_eq!(completions.load(Ordering::SeqCst), 2);
    scheduler.stop().await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stop_is_idempotent_and_final() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let scheduler = PeriodicTxScheduler::new(
        PeriodicTarget::Port(bus.open_port()),
        frame(&[1]),
        Duration::from_millis(10),
        true,
    );
    scheduler.start().unwrap();
    // Starting again while running changes nothing.
    scheduler.start().unwrap();
    sleep(Duration::from_millis(25)).await;

    scheduler.stop().await;
    scheduler.stop().await;
    let sent = bus.log().len();
    assert_eq!(sent, 3);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.log().len(), sent);
    assert!(!scheduler.is_running());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn update_applies_without_restart() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let scheduler = PeriodicTxScheduler::new(
        PeriodicTarget::Port(bus.open_port()),
        frame(&[1]),
        Duration::from_millis(10),
        false,
    );
    scheduler.start().unwrap();
    sleep(Duration::from_millis(15)).await;

    scheduler
        .update(PeriodicUpdate {
            frame: Some(frame(&[2])),
            period: Some(Duration::from_millis(50)),
            repeat: None,
        })
        .unwrap();
    sleep(Duration::from_millis(85)).await;
    scheduler.stop().await;

    let log = bus.log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].frame.data(), &[1]);
    assert_eq!(log[1].frame.data(), &[2]);
    assert_eq!(log[1].at - log[0].at, Duration::from_millis(50));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failures_are_swallowed() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let port = bus.open_port();
    port.reject_next(2);
    let scheduler = PeriodicTxScheduler::new(
        PeriodicTarget::Port(port),
        frame(&[7]),
        Duration::from_millis(10),
        true,
    )
    .with_repeat(Repeat::Times(4));
    scheduler.start().unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(bus.log().len(), 2);
    assert!(!scheduler.is_running());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn queue_target_shares_the_transmit_queue() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let queue = Arc::new(QueuedCanBus::new(bus.open_port(), &BusOptions::default()).unwrap());
    let scheduler = PeriodicTxScheduler::new(
        PeriodicTarget::Queue(queue.clone()),
        frame(&[3]),
        Duration::from_millis(20),
        true,
    )
    .with_repeat(Repeat::Times(2));
    scheduler.start().unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(bus.log().len(), 2);
    queue.dispose().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn zero_period_is_refused() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let scheduler = PeriodicTxScheduler::new(
        PeriodicTarget::Port(bus.open_port()),
        frame(&[0]),
        Duration::ZERO,
        false,
    );
    assert!(scheduler.start().is_err());
}
