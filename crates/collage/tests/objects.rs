//! End-to-end object replication between two real nodes over loopback.

mod support;

use std::time::Duration;

use collage::{ChangeType, Error, ObjectHandle, Version};
use support::{connected_pair, Blob};

#[tokio::test]
async fn register_and_map_round_trip() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![1, 2, 3, 4]));
    let id = a.register_object(&master).await.unwrap();
    assert_eq!(master.version(), Version::FIRST);

    let slave = ObjectHandle::new(Blob::slave());
    let version = b.map_object(&slave, id, Version::OLDEST).await.unwrap();

    assert_eq!(version, Version::FIRST);
    assert_eq!(slave.version(), master.head_version());
    assert_eq!(slave.with(|blob| blob.data.clone()), vec![1, 2, 3, 4]);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn commit_versions_are_strictly_increasing() {
    let (a, b) = connected_pair().await;
    drop(b);

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![0]));
    a.register_object(&master).await.unwrap();

    let mut last = master.version();
    for round in 0u8..5 {
        master.with_mut(|blob| blob.set(vec![round]));
        let version = master.commit().await.unwrap();
        assert!(version > last, "{version} not after {last}");
        assert_eq!(version, master.head_version());
        last = version;
    }

    // A clean commit does not advance the head.
    assert_eq!(master.commit().await.unwrap(), last);
    a.close().await;
}

#[tokio::test]
async fn delta_catch_up_applies_in_order() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Delta, vec![0]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    b.map_object(&slave, id, Version::HEAD).await.unwrap();
    assert_eq!(slave.version(), Version::FIRST);

    for round in 1u8..=3 {
        master.with_mut(|blob| blob.set(vec![round; 4]));
        master.commit().await.unwrap();
    }
    assert_eq!(master.head_version(), Version(4));

    let synced = slave.sync(Version(4)).await.unwrap();
    assert_eq!(synced, Version(4));
    slave.with(|blob| {
        assert_eq!(blob.data, vec![3; 4]);
        assert_eq!(blob.unpacks, 3);
        assert_eq!(
            blob.unpack_order,
            vec![vec![1; 4], vec![2; 4], vec![3; 4]]
        );
    });

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn unbuffered_map_gets_head_without_history() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Unbuffered, vec![1]));
    let id = a.register_object(&master).await.unwrap();

    master.with_mut(|blob| blob.set(vec![2]));
    assert_eq!(master.commit().await.unwrap(), Version(2));
    // A clean commit keeps the head.
    assert_eq!(master.commit().await.unwrap(), Version(2));

    let slave = ObjectHandle::new(Blob::slave());
    let version = b.map_object(&slave, id, Version::OLDEST).await.unwrap();

    assert_eq!(version, Version(2));
    slave.with(|blob| {
        assert_eq!(blob.data, vec![2]);
        assert_eq!(blob.instance_applies, 1);
        assert_eq!(blob.unpacks, 0, "no history was replayed");
    });

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn auto_obsolete_bounds_the_mapping_window() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![0]));
    let id = a.register_object(&master).await.unwrap();
    master.set_auto_obsolete(3);

    for round in 1u8..=6 {
        master.with_mut(|blob| blob.set(vec![round]));
        master.commit().await.unwrap();
    }
    assert_eq!(master.head_version(), Version(7));

    let slave = ObjectHandle::new(Blob::slave());
    let version = b.map_object(&slave, id, Version::OLDEST).await.unwrap();
    assert_eq!(version, Version(7 - 3 + 1));

    let head = slave.sync(Version::HEAD).await.unwrap();
    assert_eq!(head, Version(7));
    assert_eq!(slave.with(|blob| blob.data.clone()), vec![6]);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn second_map_is_served_from_the_instance_cache() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![9, 9]));
    let id = a.register_object(&master).await.unwrap();

    let first = ObjectHandle::new(Blob::slave());
    b.map_object(&first, id, Version::OLDEST).await.unwrap();
    let sent_after_first = a.stats().instance_frames_sent;
    assert!(sent_after_first > 0);

    let second = ObjectHandle::new(Blob::slave());
    let version = b.map_object(&second, id, Version::OLDEST).await.unwrap();
    assert_eq!(version, Version::FIRST);
    assert_eq!(second.with(|blob| blob.data.clone()), vec![9, 9]);

    // The master instructed cache reuse: no further instance bytes flowed.
    assert_eq!(a.stats().instance_frames_sent, sent_after_first);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn slave_commit_reaches_the_master() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Delta, vec![0]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    b.map_object(&slave, id, Version::HEAD).await.unwrap();

    slave.with_mut(|blob| blob.set(vec![42, 43]));
    let commit_version = slave.commit().await.unwrap();
    assert!(commit_version.is_slave_commit());

    let applied = master.sync(Version::NEXT).await.unwrap();
    assert_eq!(applied, commit_version);
    master.with(|blob| {
        assert_eq!(blob.data, vec![42, 43]);
        assert_eq!(blob.unpacks, 1);
    });

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn max_versions_gates_the_master() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![0]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    b.map_object(&slave, id, Version::HEAD).await.unwrap();
    slave.set_max_versions(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    master.with_mut(|blob| blob.set(vec![1]));
    assert_eq!(master.commit().await.unwrap(), Version(2));

    // The slave capped the master one version ahead; the next commit
    // blocks until the slave catches up.
    master.with_mut(|blob| blob.set(vec![2]));
    let gated = tokio::time::timeout(Duration::from_millis(300), master.commit()).await;
    assert!(gated.is_err(), "commit should be gated by the slave cap");

    assert_eq!(slave.sync(Version(2)).await.unwrap(), Version(2));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let version = tokio::time::timeout(Duration::from_secs(2), master.commit())
        .await
        .expect("commit unblocked by the raised cap")
        .unwrap();
    assert_eq!(version, Version(3));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn mapping_a_future_version_waits_for_the_commit() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![0]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    let map = tokio::spawn({
        let b = b.clone();
        let slave = slave.clone();
        async move { b.map_object(&slave, id, Version(3)).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!map.is_finished(), "map must wait for version 3");

    for round in 1u8..=2 {
        master.with_mut(|blob| blob.set(vec![round]));
        master.commit().await.unwrap();
    }

    let version = map.await.unwrap().unwrap();
    assert_eq!(version, Version(3));
    assert_eq!(slave.with(|blob| blob.data.clone()), vec![2]);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn static_objects_deliver_once() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Static, vec![7; 8]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    let version = b.map_object(&slave, id, Version::OLDEST).await.unwrap();
    assert_eq!(version, Version::FIRST);
    assert_eq!(slave.with(|blob| blob.data.clone()), vec![7; 8]);

    // Further syncs are no-ops for static slaves.
    assert_eq!(slave.sync(Version::HEAD).await.unwrap(), Version::FIRST);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn sync_object_refreshes_a_stale_slave() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![1]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    b.map_object(&slave, id, Version::HEAD).await.unwrap();

    // Already current: the master instructs cache reuse.
    assert!(!b.sync_object(&slave).await.unwrap());

    master.with_mut(|blob| blob.set(vec![2]));
    master.commit().await.unwrap();

    assert!(b.sync_object(&slave).await.unwrap());
    assert_eq!(slave.version(), Version(2));
    assert_eq!(slave.with(|blob| blob.data.clone()), vec![2]);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn push_delivers_to_registered_handler() {
    let (a, b) = connected_pair().await;
    let group = uuid::Uuid::new_v4();
    let type_id = uuid::Uuid::new_v4();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    b.register_push_handler(group, move |event| {
        let _ = tx.send(event);
    });

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![5, 6, 7]));
    let id = a.register_object(&master).await.unwrap();
    a.push_object(&master, group, type_id, &[b.id()]).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("push delivered")
        .expect("handler invoked");
    assert_eq!(event.group, group);
    assert_eq!(event.type_id, type_id);
    assert_eq!(event.id, id);

    let applied = event.apply(Blob::slave()).unwrap();
    assert_eq!(applied.with(|blob| blob.data.clone()), vec![5, 6, 7]);

    // Exactly one delivery.
    assert!(rx.try_recv().is_err());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn unmap_unsubscribes_from_commits() {
    let (a, b) = connected_pair().await;

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![0]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    b.map_object(&slave, id, Version::HEAD).await.unwrap();
    b.unmap_object(&slave).await.unwrap();
    assert!(!slave.is_attached());

    let sent_before = a.stats().instance_frames_sent;
    master.with_mut(|blob| blob.set(vec![1]));
    master.commit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        a.stats().instance_frames_sent,
        sent_before,
        "no subscribers remain after unmap"
    );

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn map_of_unknown_object_fails() {
    let (a, b) = connected_pair().await;
    drop(a);

    let slave = ObjectHandle::new(Blob::slave());
    let result = b
        .map_object(&slave, uuid::Uuid::new_v4(), Version::HEAD)
        .await;
    assert!(matches!(result, Err(Error::MapFailed(_))));
    assert!(!slave.is_attached());

    b.close().await;
}
