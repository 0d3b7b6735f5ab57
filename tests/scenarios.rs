//! End-to-end scenarios driving the real matching engine and a live
//! blocking HTTP range-fetch client against a loopback server, the way
//! a full run strings `ZsyncState` and `RangeFetch` together.

use std::io::{Read, Write};
use std::net::TcpListener;

use zsync::checksum::{rsum_block, strong_checksum};
use zsync::controlfile::ControlFile;
use zsync::httpfetch::{FetchConfig, RangeFetch};
use zsync::receiver::PlainReceiver;
use zsync::rangemap::RangeMap;
use zsync::scratch::ScratchStore;
use zsync::sigtable::SignatureTable;
use zsync::state::ZsyncState;
use zsync::url::HttpUrl;

const BLOCKSIZE: u64 = 4;

fn control_file(blocks: &[&[u8]]) -> ControlFile {
    let mut sigs = SignatureTable::new(blocks.len() as u32, 1, 4, 16);
    for (i, b) in blocks.iter().enumerate() {
        sigs.add_target_block(i as u32, rsum_block(b), &strong_checksum(b, 4));
    }
    sigs.build_hash();
    ControlFile {
        filelen: (blocks.len() as u64) * BLOCKSIZE,
        blocksize: BLOCKSIZE,
        blocks: blocks.len() as u32,
        filename: Some("out.dat".into()),
        zfilename: None,
        mtime: None,
        urls: vec!["http://127.0.0.1:0/out.dat".into()],
        zurls: Vec::new(),
        sha1: None,
        recompress: None,
        zmap: None,
        signatures: sigs,
    }
}

/// Serves exactly one HTTP/1.1 connection, replying to the first request
/// line it reads with a fixed, pre-built response and then closing.
fn serve_once(body: &'static [u8]) -> (std::thread::JoinHandle<()>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf); // drain the request, ignore its content
        stream.write_all(body).unwrap();
    });
    (handle, port)
}

#[test]
fn single_block_delta_is_fetched_and_assembled() {
    let dir = tempfile::tempdir().unwrap();
    let cf = control_file(&[b"aaaa", b"bbbb", b"cccc"]);
    let mut state = ZsyncState::new(cf, dir.path()).unwrap();

    // Seed has block 1 wrong; blocks 0 and 2 should match locally.
    let seed_path = dir.path().join("seed.dat");
    std::fs::File::create(&seed_path)
        .unwrap()
        .write_all(b"aaaaXXXXcccc")
        .unwrap();
    state.feed_seed_file(&seed_path).unwrap();
    assert_eq!(state.blocks_matched_locally(), 2);

    let ranges = state.needed_byte_ranges();
    assert_eq!(ranges, vec![(4, 7)]);

    let response = b"HTTP/1.1 206 Partial Content\r\n\
Content-Range: bytes 4-7/12\r\n\
Content-Length: 4\r\n\
Connection: close\r\n\
\r\n\
bbbb";
    let (server, port) = serve_once(response);

    let url = HttpUrl::parse(&format!("http://127.0.0.1:{port}/out.dat")).unwrap();
    let mut rf = RangeFetch::new(&url, FetchConfig::default());
    rf.add_ranges(&ranges);

    let mut receiver = PlainReceiver::new(state.blocksize);
    let mut buf = vec![0u8; 4096];
    while let Some(block) = rf.get_range_block(&mut buf).unwrap() {
        let (sigs, store, reg) = state.core_mut();
        receiver.receive_data(&block.data, block.offset, sigs, store, reg).unwrap();
    }
    let (sigs, store, reg) = state.core_mut();
    receiver.finish(sigs, store, reg).unwrap();
    server.join().unwrap();

    assert!(state.needed_byte_ranges().is_empty());
    assert_eq!(state.blocks_todo(), 0);
}

#[test]
fn multipart_byteranges_response_delivers_every_part() {
    let dir = tempfile::tempdir().unwrap();
    let cf = control_file(&[b"aaaa", b"bbbb", b"cccc", b"dddd"]);
    let mut state = ZsyncState::new(cf, dir.path()).unwrap();

    // No seed at all: blocks 0 and 2 need fetching, 1 and 3 too — but we
    // only request two disjoint ranges here to exercise the multipart path.
    let ranges = vec![(0u64, 3u64), (8u64, 11u64)];

    let body = b"\
--ZSYNCBOUND\r\n\
Content-Range: bytes 0-3/16\r\n\
\r\n\
aaaa\r\n\
--ZSYNCBOUND\r\n\
Content-Range: bytes 8-11/16\r\n\
\r\n\
cccc\r\n\
--ZSYNCBOUND--\r\n";
    let response: Vec<u8> = [
        b"HTTP/1.1 206 Partial Content\r\n".as_slice(),
        b"Content-Type: multipart/byteranges; boundary=ZSYNCBOUND\r\n",
        b"Connection: close\r\n",
        b"\r\n",
        body.as_slice(),
    ]
    .concat();
    let response: &'static [u8] = Box::leak(response.into_boxed_slice());

    let (server, port) = serve_once(response);
    let url = HttpUrl::parse(&format!("http://127.0.0.1:{port}/out.dat")).unwrap();
    let mut rf = RangeFetch::new(&url, FetchConfig::default());
    rf.add_ranges(&ranges);

    let mut got = Vec::new();
    let mut buf = vec![0u8; 4096];
    while let Some(block) = rf.get_range_block(&mut buf).unwrap() {
        got.push((block.offset, block.data));
    }
    server.join().unwrap();

    assert_eq!(got.len(), 2);
    assert_eq!(got[0], (0, b"aaaa".to_vec()));
    assert_eq!(got[1], (8, b"cccc".to_vec()));

    for (offset, data) in &got {
        let (sigs, store, reg) = state.core_mut();
        let mut receiver = PlainReceiver::new(state.blocksize);
        receiver.receive_data(data, *offset, sigs, store, reg).unwrap();
    }
    assert_eq!(state.blocks_todo(), 2); // blocks 0 and 2 committed; 1 and 3 still missing
}

#[test]
fn resuming_a_part_file_as_a_seed_skips_already_fetched_blocks() {
    // Mirrors the on-disk `.part` resume path: a previous run's partial
    // scratch file is fed back in as a seed before any network traffic.
    let dir = tempfile::tempdir().unwrap();
    let cf = control_file(&[b"aaaa", b"bbbb", b"cccc"]);

    let mut first = ZsyncState::new(cf, dir.path()).unwrap();
    {
        let (sigs, store, reg) = first.core_mut();
        store.write_blocks(b"aaaa", 0, 0, sigs, reg).unwrap();
        store.write_blocks(b"cccc", 2, 2, sigs, reg).unwrap();
    }
    let (part_path, _file) = first.finish().unwrap();

    let cf2 = control_file(&[b"aaaa", b"bbbb", b"cccc"]);
    let mut second = ZsyncState::new(cf2, dir.path()).unwrap();
    second.feed_seed_file(&part_path).unwrap();

    let ranges = second.needed_byte_ranges();
    assert_eq!(ranges, vec![(4, 7)]);
}

#[test]
fn range_map_merges_adjacent_block_ranges_into_one_request() {
    let mut reg = RangeMap::new(4);
    reg.add(0);
    reg.add(2);
    let needed = reg.needed_ranges(0, 3);
    assert_eq!(needed, vec![(1, 2), (3, 4)]);
}
