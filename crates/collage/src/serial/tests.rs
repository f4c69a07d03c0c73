use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::command::{
    CommandType, ICommand, NodeCommand, ObjectCommand, ObjectDataICommand, ObjectICommand,
    OCommand, COMMAND_MIN_SIZE,
};
use crate::compress::CompressorRegistry;
use crate::ident::{NodeId, ObjectId, ObjectVersion, Version};
use crate::object::{INSTANCE_ALL, INSTANCE_NONE};
use crate::serial::{
    build_data_frames, DataIStream, DataOStream, DataStreamHeader, ObjectDataIStream, StreamKind,
};

fn registry() -> Arc<CompressorRegistry> {
    Arc::new(CompressorRegistry::builtin())
}

fn header(instance_carrier: bool) -> DataStreamHeader {
    DataStreamHeader {
        command_type: if instance_carrier {
            CommandType::Node
        } else {
            CommandType::Object
        },
        command: if instance_carrier {
            NodeCommand::ObjectInstance as u32
        } else {
            ObjectCommand::Delta as u32
        },
        object_id: ObjectId::new_v4(),
        instance_id: if instance_carrier { INSTANCE_NONE } else { INSTANCE_ALL },
        version: Version::FIRST,
        node_id: NodeId::nil(),
        master_instance_id: 42,
        instance_carrier,
    }
}

/// Run frames through the full receive parse path into a readable stream.
fn reassemble(frames: &[Bytes], instance_carrier: bool) -> ObjectDataIStream {
    let mut stream = ObjectDataIStream::new(false, registry());
    for frame in frames {
        let buf = Arc::new(Buffer::from_vec(frame.to_vec()));
        let cmd = ICommand::parse(buf, false, NodeId::nil()).unwrap();
        let cmd = ObjectICommand::parse(cmd).unwrap();
        let data = ObjectDataICommand::parse(cmd, instance_carrier).unwrap();
        stream.add_data_command(&data, StreamKind::Instance);
    }
    assert!(stream.is_ready());
    stream
}

#[test]
fn typed_round_trip() {
    let mut os = DataOStream::new(60_000);
    os.write(&0xabu8)
        .write(&-5i8)
        .write(&0x1234u16)
        .write(&-30_000i16)
        .write(&0xdead_beefu32)
        .write(&-7i32)
        .write(&u64::MAX)
        .write(&i64::MIN)
        .write(&0x0123_4567_89ab_cdef_0123_4567_89ab_cdefu128)
        .write(&1.5f32)
        .write(&-2.25f64)
        .write(&true)
        .write(&false)
        .write("hello collage")
        .write(&vec![1u32, 2, 3, 4])
        .write(&[9u64, 8, 7]);

    let mut map = BTreeMap::new();
    map.insert("one".to_string(), 1u32);
    map.insert("two".to_string(), 2u32);
    os.write(&map);

    let mut hash_map = HashMap::new();
    hash_map.insert(7u32, "seven".to_string());
    os.write(&hash_map);

    let mut set = BTreeSet::new();
    set.insert(3u16);
    set.insert(1u16);
    os.write(&set);

    let mut hash_set = HashSet::new();
    hash_set.insert(99u64);
    os.write(&hash_set);

    let reference = ObjectVersion::new(ObjectId::new_v4(), Version(17));
    os.write(&reference);

    let frames = build_data_frames(&header(true), &os.finish(), None, 1023);
    let mut stream = reassemble(&frames, true);
    let is = stream.stream();

    assert_eq!(is.read::<u8>().unwrap(), 0xab);
    assert_eq!(is.read::<i8>().unwrap(), -5);
    assert_eq!(is.read::<u16>().unwrap(), 0x1234);
    assert_eq!(is.read::<i16>().unwrap(), -30_000);
    assert_eq!(is.read::<u32>().unwrap(), 0xdead_beef);
    assert_eq!(is.read::<i32>().unwrap(), -7);
    assert_eq!(is.read::<u64>().unwrap(), u64::MAX);
    assert_eq!(is.read::<i64>().unwrap(), i64::MIN);
    assert_eq!(
        is.read::<u128>().unwrap(),
        0x0123_4567_89ab_cdef_0123_4567_89ab_cdef
    );
    assert_eq!(is.read::<f32>().unwrap(), 1.5);
    assert_eq!(is.read::<f64>().unwrap(), -2.25);
    assert!(is.read::<bool>().unwrap());
    assert!(!is.read::<bool>().unwrap());
    assert_eq!(is.read::<String>().unwrap(), "hello collage");
    assert_eq!(is.read::<Vec<u32>>().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(is.read::<[u64; 3]>().unwrap(), [9, 8, 7]);
    assert_eq!(is.read::<BTreeMap<String, u32>>().unwrap(), map);
    assert_eq!(is.read::<HashMap<u32, String>>().unwrap(), hash_map);
    assert_eq!(is.read::<BTreeSet<u16>>().unwrap(), set);
    assert_eq!(is.read::<HashSet<u64>>().unwrap(), hash_set);
    assert_eq!(is.read::<ObjectVersion>().unwrap(), reference);
    assert!(!is.has_data());
}

#[test]
fn under_read_is_a_hard_error() {
    let mut os = DataOStream::new(60_000);
    os.write(&7u32);
    let frames = build_data_frames(&header(false), &os.finish(), None, 1023);
    let mut stream = reassemble(&frames, false);

    assert_eq!(stream.stream().read::<u32>().unwrap(), 7);
    assert!(matches!(
        stream.stream().read::<u32>(),
        Err(crate::Error::UnexpectedEnd)
    ));
}

#[test]
fn chunked_compressed_reassembly() {
    // A compressible payload far beyond the flush threshold, so the
    // stream splits into many frames, each compressed independently.
    let payload: Vec<u8> = (0..32usize)
        .flat_map(|i| vec![i as u8; 1000])
        .collect();

    let mut os = DataOStream::new(1024);
    os.write(&payload);

    let compressor = registry().default_compressor().unwrap();
    let frames = build_data_frames(&header(true), &os.finish(), Some(&compressor), 128);
    assert!(frames.len() > 1, "expected a chunked stream");

    let mut stream = reassemble(&frames, true);
    assert_eq!(stream.stream().read::<Vec<u8>>().unwrap(), payload);
    assert!(!stream.has_data());
}

#[test]
fn incompressible_payload_passes_through() {
    // High-entropy bytes defeat the compressor; the stream latches
    // incompressible and ships raw.
    let payload: Vec<u8> = (0..4096u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect();
    let mut os = DataOStream::new(60_000);
    os.write(&payload);

    let compressor = registry().default_compressor().unwrap();
    let frames = build_data_frames(&header(true), &os.finish(), Some(&compressor), 128);

    let mut stream = reassemble(&frames, true);
    assert_eq!(stream.stream().read::<Vec<u8>>().unwrap(), payload);
}

#[test]
fn endianness_swap_on_read() {
    // A foreign-endian origin's scalars arrive byte-swapped; the reader
    // flips them back.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x1234_5678u32.swap_bytes().to_ne_bytes());
    bytes.extend_from_slice(&0x0102_0304_0506_0708u64.swap_bytes().to_ne_bytes());
    bytes.extend_from_slice(&2.5f32.to_bits().swap_bytes().to_ne_bytes());

    let mut is = DataIStream::from_bytes(Bytes::from(bytes), true, registry());
    assert_eq!(is.read::<u32>().unwrap(), 0x1234_5678);
    assert_eq!(is.read::<u64>().unwrap(), 0x0102_0304_0506_0708);
    assert_eq!(is.read::<f32>().unwrap(), 2.5);
}

#[test]
fn frames_are_padded_to_the_minimum() {
    let mut cmd = OCommand::node(NodeCommand::Ping);
    cmd.write(&NodeId::new_v4());
    let frame = cmd.finish();
    assert_eq!(frame.len(), COMMAND_MIN_SIZE);

    // And a parse of the padded frame sees only the logical payload.
    let buf = Arc::new(Buffer::from_vec(frame.to_vec()));
    let parsed = ICommand::parse(buf, false, NodeId::nil()).unwrap();
    assert_eq!(parsed.command(), NodeCommand::Ping as u32);
    assert_eq!(parsed.remaining(), 16);
}

#[test]
fn sequence_duplicates_are_dropped() {
    let mut os = DataOStream::new(60_000);
    os.write(&41u32);
    let frames = build_data_frames(&header(true), &os.finish(), None, 1023);
    assert_eq!(frames.len(), 1);

    let buf = Arc::new(Buffer::from_vec(frames[0].to_vec()));
    let cmd = ICommand::parse(buf, false, NodeId::nil()).unwrap();
    let cmd = ObjectICommand::parse(cmd).unwrap();
    let data = ObjectDataICommand::parse(cmd, true).unwrap();

    let mut queue = crate::serial::DataIStreamQueue::new();
    assert!(queue.add_data_command(&data, StreamKind::Instance, &registry()));
    assert_eq!(queue.queued_len(), 1);
}
