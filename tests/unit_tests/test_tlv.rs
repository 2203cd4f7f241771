// SPDX-License-Identifier: MIT
// Copyright (C) 2024-2026 Andrei Maltsev

use urpc_rs::{
    errors::UrpcError,
    models::tlv::{self, TLV_HEAD_LEN, TlvIter, TlvType, TlvWriter},
};

fn stream() -> Vec<u8> {
    let mut w = TlvWriter::new();
    w.push(TlvType::ChannelInfo, b"chan");
    w.push(TlvType::QueueInfo, b"queue-0");
    w.push(TlvType::QueueInfo, b"queue-1");
    w.finish()
}

#[test]
fn search_and_search_next() {
    let buf = stream();
    let first = tlv::search(&buf, TlvType::QueueInfo)
        .expect("well-formed")
        .expect("present");
    assert_eq!(first.value, b"queue-0");
    let second = tlv::search_next(&buf, &first, TlvType::QueueInfo)
        .expect("well-formed")
        .expect("present");
    assert_eq!(second.value, b"queue-1");
    assert!(
        tlv::search_next(&buf, &second, TlvType::QueueInfo)
            .expect("well-formed")
            .is_none()
    );
    assert!(
        tlv::search(&buf, TlvType::CryptoKey)
            .expect("well-formed")
            .is_none()
    );
}

#[test]
fn left_len_counts_from_element() {
    let buf = stream();
    let first = tlv::search(&buf, TlvType::ChannelInfo)
        .expect("well-formed")
        .expect("present");
    assert_eq!(first.left_len(buf.len()), buf.len());
}

#[test]
fn iteration_consumes_full_buffer_or_errors() {
    let buf = stream();
    let mut total = 0usize;
    for el in TlvIter::new(&buf) {
        total += el.expect("well-formed element").total_len();
    }
    assert_eq!(total, buf.len(), "iterator must account for every byte");
}

#[test]
fn declared_len_exactly_filling_buffer_is_accepted() {
    let mut w = TlvWriter::new();
    w.push(TlvType::MemInfo, &[0xaa; 24]);
    let buf = w.finish();
    let el = tlv::search(&buf, TlvType::MemInfo)
        .expect("well-formed")
        .expect("present");
    assert_eq!(el.value.len(), 24);
    assert_eq!(el.total_len(), buf.len());
}

#[test]
fn declared_len_past_buffer_is_rejected() {
    let mut w = TlvWriter::new();
    w.push(TlvType::MemInfo, &[0xaa; 24]);
    let mut buf = w.finish();
    // inflate len beyond the remaining bytes
    let len = 25u32.to_le_bytes();
    buf[4..8].copy_from_slice(&len);
    let err = tlv::search(&buf, TlvType::MemInfo).expect_err("must reject");
    assert!(matches!(err, UrpcError::Protocol(_)));
}

#[test]
fn truncated_head_is_rejected() {
    let buf = vec![0u8; TLV_HEAD_LEN - 1];
    assert!(tlv::search(&buf, TlvType::MemInfo).is_err());
}

#[test]
fn malformed_element_stops_iteration_with_error() {
    let mut w = TlvWriter::new();
    w.push(TlvType::QueueInfo, b"ok");
    let mut buf = w.finish();
    let bogus = 1000u32.to_le_bytes();
    buf[4..8].copy_from_slice(&bogus);
    let mut iter = TlvIter::new(&buf);
    assert!(iter.next().expect("one item").is_err());
    assert!(iter.next().is_none(), "iteration must stop after the error");
}

#[test]
fn array_roundtrip() {
    let mut elems = TlvWriter::new();
    elems.push(TlvType::QueueInfo, b"a");
    elems.push(TlvType::QueueInfo, b"bb");
    let elems = elems.finish();
    let mut w = TlvWriter::new();
    w.push_array(2, &elems);
    let buf = w.finish();

    let arr = tlv::search(&buf, TlvType::Array)
        .expect("well-formed")
        .expect("present");
    let (num, body) = arr.as_array().expect("array shape");
    assert_eq!(num, 2);
    let inner: Vec<_> = TlvIter::new(body)
        .collect::<Result<_, _>>()
        .expect("inner elements");
    assert_eq!(inner.len(), 2);
    assert_eq!(inner[1].value, b"bb");
}
