//! Shared fixtures for the integration tests: listening nodes on loopback
//! and a byte-blob object exercising every change type.
#![allow(dead_code)]

use std::time::Duration;

use collage::{ChangeType, DataIStream, DataOStream, Globals, LocalNode, Object};

pub fn test_globals() -> Globals {
    Globals {
        timeout: Duration::from_secs(5),
        ..Globals::default()
    }
}

/// Honor `RUST_LOG` when debugging a test run.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

pub async fn listening_node() -> LocalNode {
    init_tracing();
    let node = LocalNode::new(test_globals());
    node.listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("listen");
    node
}

/// Two listening nodes with `b` connected to `a`.
pub async fn connected_pair() -> (LocalNode, LocalNode) {
    let a = listening_node().await;
    let b = listening_node().await;
    b.connect(a.listen_addr().unwrap()).await.expect("connect");
    (a, b)
}

/// A byte payload with call counters, usable under any change type.
pub struct Blob {
    change: ChangeType,
    pub data: Vec<u8>,
    pub dirty: bool,
    pub instance_applies: u32,
    pub unpacks: u32,
    pub unpack_order: Vec<Vec<u8>>,
}

impl Blob {
    pub fn master(change: ChangeType, data: Vec<u8>) -> Blob {
        Blob {
            change,
            data,
            dirty: false,
            instance_applies: 0,
            unpacks: 0,
            unpack_order: Vec::new(),
        }
    }

    pub fn slave() -> Blob {
        Blob::master(ChangeType::None, Vec::new())
    }

    pub fn set(&mut self, data: Vec<u8>) {
        self.data = data;
        self.dirty = true;
    }
}

impl Object for Blob {
    fn change_type(&self) -> ChangeType {
        self.change
    }

    fn get_instance_data(&mut self, os: &mut DataOStream) {
        os.write(&self.data);
        self.dirty = false;
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) -> collage::Result<()> {
        self.data = is.read()?;
        self.instance_applies += 1;
        Ok(())
    }

    fn pack(&mut self, os: &mut DataOStream) {
        os.write(&self.data);
        self.dirty = false;
    }

    fn unpack(&mut self, is: &mut DataIStream) -> collage::Result<()> {
        self.data = is.read()?;
        self.unpacks += 1;
        self.unpack_order.push(self.data.clone());
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}
