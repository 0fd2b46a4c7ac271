use core::time::Duration;

use embedded_can::{Frame, StandardId};
use embedded_can_bus::{
    BusError, BusOptions, CanFrame, FrameClass, FrameKind, QueuedCanBus, VirtualBus,
};

fn frame(id: u16, data: &[u8]) -> CanFrame {
    CanFrame::new(StandardId::new(id).unwrap(), data).unwrap()
}

fn opts(min_gap_us: u64, capacity: usize) -> BusOptions {
    BusOptions {
        min_frame_gap_us: min_gap_us,
        queue_capacity: capacity,
        ..BusOptions::default()
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn frames_leave_in_fifo_order() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let queue = QueuedCanBus::new(bus.open_port(), &opts(0, 16)).unwrap();

    let mut handles = Vec::new();
    for i in 0..5u8 {
        handles.push(
            queue
                .enqueue(frame(0x100, &[i]), FrameClass::Data, Duration::MAX)
                .await
                .unwrap(),
        );
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let sent: Vec<u8> = bus.log().iter().map(|l| l.frame.data()[0]).collect();
    assert_eq!(sent, vec![0, 1, 2, 3, 4]);
    queue.dispose().await.unwrap();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn data_frames_respect_min_gap_but_control_frames_do_not() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let queue = QueuedCanBus::new(bus.open_port(), &opts(1_000, 16)).unwrap();

    let d1 = queue
        .enqueue(frame(0x100, &[1]), FrameClass::Data, Duration::MAX)
        .await
        .unwrap();
    let fc = queue
        .enqueue(frame(0x100, &[0x30, 0, 0]), FrameClass::Control, Duration::MAX)
        .await
        .unwrap();
    let d2 = queue
        .enqueue(frame(0x100, &[2]), FrameClass::Data, Duration::MAX)
        .await
        .unwrap();
    let d3 = queue
        .enqueue(frame(0x100, &[3]), FrameClass::Data, Duration::MAX)
        .await
        .unwrap();
    d1.await.unwrap();
    fc.await.unwrap();
    d2.await.unwrap();
    d3.await.unwrap();

    let log = bus.log();
    assert_eq!(log.len(), 4);
    assert_eq!(log[1].at, log[0].at, "flow control is not delayed");
    assert!(log[2].at - log[0].at >= Duration::from_millis(1));
    assert!(log[3].at - log[2].at >= Duration::from_millis(1));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn full_queue_fails_after_wait_budget() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let queue = QueuedCanBus::new(bus.open_port(), &opts(10_000, 1)).unwrap();

    let mut handles = Vec::new();
    for i in 0..3u8 {
        handles.push(
            queue
                .enqueue(frame(0x100, &[i]), FrameClass::Data, Duration::MAX)
                .await
                .unwrap(),
        );
    }
    let err = queue
        .enqueue(frame(0x100, &[9]), FrameClass::Data, Duration::from_millis(1))
        .await
        .unwrap_err();
    assert_eq!(err, BusError::QueueFull);

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(bus.log().len(), 3);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn rejected_frame_is_reported_and_not_retried() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let port = bus.open_port();
    let queue = QueuedCanBus::new(port.clone(), &opts(0, 4)).unwrap();

    port.reject_next(1);
    assert_eq!(
        queue.send(frame(0x100, &[1])).await,
        Err(BusError::TransmitRejected)
    );
    queue.send(frame(0x100, &[2])).await.unwrap();

    let log = bus.log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].frame.data(), &[2]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cancelled_write_never_reaches_the_port() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let queue = QueuedCanBus::new(bus.open_port(), &opts(1_000_000, 4)).unwrap();

    queue.send(frame(0x100, &[1])).await.unwrap();
    let second = queue
        .enqueue(frame(0x100, &[2]), FrameClass::Data, Duration::MAX)
        .await
        .unwrap();
    second.cancel();
    assert_eq!(second.await, Err(BusError::Cancelled));
    assert_eq!(bus.log().len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dispose_resolves_pending_writes() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let queue = QueuedCanBus::new(bus.open_port(), &opts(1_000_000, 4)).unwrap();

    let first = queue
        .enqueue(frame(0x100, &[1]), FrameClass::Data, Duration::MAX)
        .await
        .unwrap();
    let second = queue
        .enqueue(frame(0x100, &[2]), FrameClass::Data, Duration::MAX)
        .await
        .unwrap();
    queue.dispose().await.unwrap();

    assert!(matches!(first.await, Ok(()) | Err(BusError::Disposed)));
    assert_eq!(second.await, Err(BusError::Disposed));
    assert!(queue.is_disposed());
    assert_eq!(
        queue.send(frame(0x100, &[3])).await,
        Err(BusError::Disposed)
    );
    // A second dispose is a no-op.
    queue.dispose().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn fd_frame_refused_on_classic_queue() {
    let bus = VirtualBus::new(FrameKind::Classic);
    let queue = QueuedCanBus::new(bus.open_port(), &BusOptions::default()).unwrap();
    let fd = CanFrame::with_kind(StandardId::new(0x10).unwrap(), &[0u8; 16], FrameKind::Fd).unwrap();
    assert!(matches!(
        queue.send(fd).await,
        Err(BusError::Unsupported(_))
    ));
}
