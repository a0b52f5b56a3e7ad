use std::collections::VecDeque;

use crate::sluice::config::MAX_FEED_LINE;
use crate::sluice::proxy::feed::FeedConn;
use crate::tests::common;

fn ingest_all(chunks: &[&[u8]]) -> (VecDeque<Vec<u8>>, usize) {
    let mut conn = FeedConn::new(common::next_addr());
    let mut queue = VecDeque::new();
    let mut queued_bytes = 0;
    for chunk in chunks {
        conn.ingest(chunk, &mut queue, &mut queued_bytes);
    }
    (queue, queued_bytes)
}

#[test]
fn test_single_line() {
    let (queue, bytes) = ingest_all(&[b"127.0.0.1:9100\n"]);
    assert_eq!(queue, vec![b"127.0.0.1:9100".to_vec()]);
    assert_eq!(bytes, 14);
}

#[test]
fn test_multiple_lines_one_chunk() {
    let (queue, _) = ingest_all(&[b"a:1\nb:2\nc:3\n"]);
    assert_eq!(
        queue,
        vec![b"a:1".to_vec(), b"b:2".to_vec(), b"c:3".to_vec()]
    );
}

#[test]
fn test_line_split_across_chunks() {
    let (queue, _) = ingest_all(&[b"127.0.0", b".1:91", b"00\n"]);
    assert_eq!(queue, vec![b"127.0.0.1:9100".to_vec()]);
}

#[test]
fn test_partial_line_not_delivered() {
    let (queue, bytes) = ingest_all(&[b"127.0.0.1"]);
    assert!(queue.is_empty());
    assert_eq!(bytes, 0);
}

#[test]
fn test_crlf_stripped() {
    let (queue, _) = ingest_all(&[b"127.0.0.1:9100\r\n"]);
    assert_eq!(queue, vec![b"127.0.0.1:9100".to_vec()]);
}

#[test]
fn test_empty_lines_skipped() {
    let (queue, _) = ingest_all(&[b"\n\na:1\n\n"]);
    assert_eq!(queue, vec![b"a:1".to_vec()]);
}

#[test]
fn test_oversize_line_capped_but_delivered() {
    let long = vec![b'x'; MAX_FEED_LINE * 3];
    let mut chunk = long.clone();
    chunk.push(b'\n');
    chunk.extend_from_slice(b"a:1\n");
    let (queue, _) = ingest_all(&[&chunk]);
    // the oversize message still arrives (it is rejected downstream at
    // admission time), and the following line is intact
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].len(), MAX_FEED_LINE);
    assert_eq!(queue[1], b"a:1".to_vec());
}
