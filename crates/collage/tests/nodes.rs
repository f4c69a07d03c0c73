//! Node-level behaviour: handshakes, duplicate connects, discovery and
//! disconnect handling.

mod support;

use std::time::Duration;

use collage::{ChangeType, ObjectHandle, Version};
use support::{listening_node, Blob};

#[tokio::test]
async fn simultaneous_connect_resolves_to_one_connection() {
    let a = listening_node().await;
    let b = listening_node().await;

    let (from_a, from_b) = tokio::join!(
        a.connect(b.listen_addr().unwrap()),
        b.connect(a.listen_addr().unwrap()),
    );
    let from_a = from_a.unwrap();
    let from_b = from_b.unwrap();

    assert_eq!(from_a.id(), b.id());
    assert_eq!(from_b.id(), a.id());
    assert!(a.get_node(b.id()).is_some());
    assert!(b.get_node(a.id()).is_some());

    // The surviving connection works in both directions: replicate an
    // object across it.
    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![1, 2]));
    let id = a.register_object(&master).await.unwrap();

    let slave = ObjectHandle::new(Blob::slave());
    b.map_object(&slave, id, Version::HEAD).await.unwrap();
    assert_eq!(slave.with(|blob| blob.data.clone()), vec![1, 2]);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn find_master_node_walks_connected_peers() {
    let a = listening_node().await;
    let b = listening_node().await;
    let c = listening_node().await;
    // c knows both a and b; only b masters the object.
    c.connect(a.listen_addr().unwrap()).await.unwrap();
    c.connect(b.listen_addr().unwrap()).await.unwrap();

    let master = ObjectHandle::new(Blob::master(ChangeType::Instance, vec![1]));
    let id = b.register_object(&master).await.unwrap();

    assert_eq!(c.find_master_node(id).await.unwrap(), b.id());
    // The master's own node resolves itself without asking anyone.
    assert_eq!(b.find_master_node(id).await.unwrap(), b.id());

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn disconnect_clears_the_peer() {
    let a = listening_node().await;
    let b = listening_node().await;
    b.connect(a.listen_addr().unwrap()).await.unwrap();
    assert!(b.get_node(a.id()).is_some());

    a.close().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(b.get_node(a.id()).is_none(), "peer entry must be dropped");
    // Discovery over no peers fails fast instead of hanging.
    let lookup = tokio::time::timeout(
        Duration::from_secs(1),
        b.find_master_node(uuid::Uuid::new_v4()),
    )
    .await
    .expect("must not hang");
    assert!(lookup.is_err());

    b.close().await;
}

#[tokio::test]
async fn send_token_serialises_heavy_senders() {
    let a = listening_node().await;

    let token = a.acquire_send_token(None).await.unwrap();
    let contended = a.acquire_send_token(Some(Duration::from_millis(100))).await;
    assert!(matches!(contended, Err(collage::Error::Timeout)));

    drop(token);
    a.acquire_send_token(Some(Duration::from_millis(100)))
        .await
        .expect("token released");

    a.close().await;
}

#[tokio::test]
async fn attach_receives_custom_commands_without_replication() {
    // Command-only objects participate in dispatch but have no versions.
    let a = listening_node().await;
    let handle = ObjectHandle::new(Blob::master(ChangeType::None, vec![]));
    let id = uuid::Uuid::new_v4();

    a.attach_object(&handle, id).await.unwrap();
    assert!(handle.is_attached());
    assert_eq!(handle.version(), Version::NONE);

    a.detach_object(&handle).await.unwrap();
    assert!(!handle.is_attached());

    a.close().await;
}
