// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use h1_client_rs::client::buffers::{RecvBuffer, SendBuffer};

#[test]
fn send_buffer_partial_writes_preserve_order() {
    // One 10 KiB chunk accepted by the socket in 3 KiB increments must come
    // out as exactly one logical delivery with no byte reordering.
    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    let mut buf = SendBuffer::default();
    buf.push(Bytes::from(payload.clone()));

    let mut sent = Vec::new();
    while let Some(head) = buf.head() {
        let take = head.len().min(3 * 1024);
        sent.extend_from_slice(&head[..take]);
        buf.advance(take);
    }
    assert!(buf.is_empty());
    assert_eq!(sent, payload);
}

#[test]
fn send_buffer_drops_empty_chunks_and_counts_pending() {
    let mut buf = SendBuffer::default();
    buf.push(Bytes::new());
    assert!(buf.is_empty());
    buf.push(Bytes::from_static(b"abc"));
    buf.push(Bytes::from_static(b"de"));
    assert_eq!(buf.pending(), 5);
    buf.advance(3);
    assert_eq!(buf.pending(), 2);
    buf.clear();
    assert!(buf.is_empty());
}

#[test]
fn recv_buffer_extracts_across_chunk_boundaries() {
    // recv_mode == n with the buffer split across 3 chunks straddling the
    // boundary yields exactly n bytes and retains the remainder.
    let mut buf = RecvBuffer::default();
    buf.push(Bytes::from_static(b"ab"));
    buf.push(Bytes::from_static(b"cd"));
    buf.push(Bytes::from_static(b"efgh"));
    assert_eq!(buf.len(), 8);

    let taken = buf.extract(5);
    assert_eq!(taken.as_ref(), b"abcde");
    assert_eq!(buf.len(), 3);
    assert_eq!(buf.drain_all().as_ref(), b"fgh");
    assert!(buf.is_empty());
}

#[test]
fn recv_buffer_takes_lines_with_crlf() {
    let mut buf = RecvBuffer::default();
    buf.push(Bytes::from_static(b"5\r\nhel"));
    let line = buf.take_line().expect("line available");
    assert_eq!(line.as_ref(), b"5\r\n");
    assert_eq!(buf.len(), 3);
    // No CRLF in the remainder yet.
    assert!(buf.take_line().is_none());
    buf.push(Bytes::from_static(b"lo\r\n"));
    let line = buf.take_line().expect("line completed across chunks");
    assert_eq!(line.as_ref(), b"hello\r\n");
}

#[test]
fn recv_buffer_takes_header_blocks() {
    let mut buf = RecvBuffer::default();
    buf.push(Bytes::from_static(b"Content-Length: 5\r\nConnection: keep"));
    assert!(buf.take_header_block().is_none(), "block not terminated yet");
    buf.push(Bytes::from_static(b"-alive\r\n\r\nhello"));
    let lines = buf.take_header_block().expect("terminated block");
    let lines: Vec<&[u8]> = lines.iter().map(|l| l.as_ref()).collect();
    assert_eq!(
        lines,
        vec![
            b"Content-Length: 5\r\n".as_slice(),
            b"Connection: keep-alive\r\n".as_slice(),
            b"\r\n".as_slice(),
        ]
    );
    // The body stays behind.
    assert_eq!(buf.drain_all().as_ref(), b"hello");
}

#[test]
fn recv_buffer_empty_header_block_is_one_blank_line() {
    let mut buf = RecvBuffer::default();
    buf.push(Bytes::from_static(b"\r\nrest"));
    let lines = buf.take_header_block().expect("blank block");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].as_ref(), b"\r\n");
    assert_eq!(buf.len(), 4);
}
