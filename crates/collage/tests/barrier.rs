//! Distributed barrier rendezvous across three real nodes.

mod support;

use std::time::{Duration, Instant};

use collage::{Barrier, Error, LocalNode, ObjectHandle, Version};
use support::listening_node;

/// Three nodes, with `b` and `c` connected to `a`, and the barrier
/// mastered on `a`.
async fn barrier_cluster(
    height: u32,
) -> (
    (LocalNode, ObjectHandle<Barrier>),
    (LocalNode, ObjectHandle<Barrier>),
    (LocalNode, ObjectHandle<Barrier>),
) {
    let a = listening_node().await;
    let b = listening_node().await;
    let c = listening_node().await;
    b.connect(a.listen_addr().unwrap()).await.unwrap();
    c.connect(a.listen_addr().unwrap()).await.unwrap();

    let master = ObjectHandle::new(Barrier::new(a.id(), height));
    let id = a.register_object(&master).await.unwrap();

    let slave_b = ObjectHandle::new(Barrier::unmapped());
    b.map_object(&slave_b, id, Version::HEAD).await.unwrap();
    let slave_c = ObjectHandle::new(Barrier::unmapped());
    c.map_object(&slave_c, id, Version::HEAD).await.unwrap();

    assert_eq!(slave_b.with(|barrier| barrier.height()), height);
    ((a, master), (b, slave_b), (c, slave_c))
}

#[tokio::test]
async fn all_participants_enter_and_leave() {
    let ((a, master), (b, slave_b), (c, slave_c)) = barrier_cluster(3).await;

    let (ra, rb, rc) = tokio::join!(
        master.enter(None),
        slave_b.enter(None),
        slave_c.enter(None),
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    // The master dropped its per-version bookkeeping.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(master.with(|barrier| barrier.open_rounds()), 0);

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn barrier_can_be_reentered() {
    let ((a, master), (b, slave_b), (c, slave_c)) = barrier_cluster(3).await;

    for _ in 0..3 {
        let (ra, rb, rc) = tokio::join!(
            master.enter(None),
            slave_b.enter(None),
            slave_c.enter(None),
        );
        ra.unwrap();
        rb.unwrap();
        rc.unwrap();
    }

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn missing_participant_times_out() {
    let ((a, master), (b, slave_b), (c, slave_c)) = barrier_cluster(3).await;
    let timeout = Duration::from_millis(500);

    let started = Instant::now();
    let (rb, rc) = tokio::join!(slave_b.enter(Some(timeout)), slave_c.enter(Some(timeout)));
    let elapsed = started.elapsed();

    assert!(matches!(rb, Err(Error::BarrierTimeout)), "{rb:?}");
    assert!(matches!(rc, Err(Error::BarrierTimeout)), "{rc:?}");
    assert!(
        elapsed >= Duration::from_millis(400) && elapsed < Duration::from_millis(900),
        "timed out after {elapsed:?}"
    );

    // The late third entrant completes the round and is released at once.
    tokio::time::timeout(Duration::from_secs(2), master.enter(Some(Duration::from_secs(2))))
        .await
        .expect("late entrant must not block")
        .unwrap();

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn trivial_barrier_returns_immediately() {
    let a = listening_node().await;
    let master = ObjectHandle::new(Barrier::new(a.id(), 1));
    a.register_object(&master).await.unwrap();

    master.enter(Some(Duration::from_millis(100))).await.unwrap();
    a.close().await;
}
