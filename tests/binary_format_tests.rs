//! Integration tests for the binary capture format
//!
//! Files are produced through a full capture session and read back with
//! the capture reader; malformed inputs are hand-built byte streams.

use shadowtrace::collaborators::StaticNameResolver;
use shadowtrace::config::CaptureConfig;
use shadowtrace::error::CaptureError;
use shadowtrace::event::{EventTag, TraceEvent};
use shadowtrace::serializer::binary::{
    blocks_to_snapshot, read_capture, read_capture_file, thread_file_path, HEADER_SIZE,
    RECORD_SIZE,
};
use shadowtrace::session::CaptureSession;
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

fn header(thread_id: i64, frame_count: i64) -> Vec<u8> {
    let mut bytes = thread_id.to_le_bytes().to_vec();
    bytes.extend_from_slice(&frame_count.to_le_bytes());
    bytes
}

fn record(timestamp: i64, function_id: u64, tag: u8) -> Vec<u8> {
    let mut bytes = timestamp.to_le_bytes().to_vec();
    bytes.extend_from_slice(&function_id.to_le_bytes());
    bytes.push(tag);
    bytes
}

#[test]
fn test_session_capture_reads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.bin");
    let config = CaptureConfig {
        binary_path: Some(path.clone()),
        ..CaptureConfig::default()
    };
    let session = CaptureSession::builder(config).build();

    session.on_function_enter(100, 1);
    session.on_function_enter(200, 1);
    session.on_exception_catcher_enter(200, 1);
    session.on_function_leave(200, 1);
    session.on_function_leave(100, 1);
    session.on_function_enter(300, 2);
    session.on_function_leave(300, 2);
    session.shutdown();

    let blocks = read_capture_file(&path).unwrap();
    assert_eq!(blocks.len(), 2);

    let tags: Vec<_> = blocks[0].events.iter().map(TraceEvent::tag).collect();
    assert_eq!(
        tags,
        vec![
            EventTag::Started,
            EventTag::Started,
            EventTag::ExceptionCatchEnter,
            EventTag::Finished,
            EventTag::Finished,
        ]
    );
    let function_ids: Vec<_> = blocks[0].events.iter().map(TraceEvent::function_id).collect();
    assert_eq!(function_ids, vec![100, 200, 200, 200, 100]);

    let snapshot = blocks_to_snapshot(blocks);
    assert_eq!(snapshot.thread(2).map(<[TraceEvent]>::len), Some(2));

    let size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size, 2 * HEADER_SIZE + 7 * RECORD_SIZE);
}

#[test]
fn test_split_capture_one_file_per_thread() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("split.bin");
    let config = CaptureConfig {
        binary_path: Some(base.clone()),
        split_binary_files: true,
        ..CaptureConfig::default()
    };
    let names = StaticNameResolver::new().with_name(5, "App.Run");
    let session = CaptureSession::builder(config)
        .names(Arc::new(names))
        .build();

    for thread_id in [3u64, 9] {
        session.on_function_enter(5, thread_id);
        session.on_function_leave(5, thread_id);
    }
    session.shutdown();

    assert!(!base.exists());
    for thread_id in [3u64, 9] {
        let path = thread_file_path(&base, thread_id);
        let blocks = read_capture_file(&path).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].thread_id, thread_id as i64);
        assert_eq!(blocks[0].frame_count, 2);
    }
}

#[test]
fn test_empty_stream_has_no_blocks() {
    let blocks = read_capture(&mut Cursor::new(Vec::<u8>::new())).unwrap();
    assert!(blocks.is_empty());
}

#[test]
fn test_truncated_header_is_error() {
    let mut bytes = header(1, 0);
    bytes.truncate(12);
    let result = read_capture(&mut Cursor::new(bytes));
    assert!(matches!(result, Err(CaptureError::Truncated(_))));
}

#[test]
fn test_truncated_record_is_error() {
    let mut bytes = header(1, 2);
    bytes.extend(record(10, 1, 0));
    bytes.extend(&record(20, 1, 1)[..9]);
    let result = read_capture(&mut Cursor::new(bytes));
    assert!(matches!(result, Err(CaptureError::Truncated(_))));
}

#[test]
fn test_unknown_tag_is_error() {
    let mut bytes = header(4, 1);
    bytes.extend(record(10, 1, 9));
    let result = read_capture(&mut Cursor::new(bytes));
    assert!(matches!(
        result,
        Err(CaptureError::UnknownEventTag {
            tag: 9,
            thread_id: 4
        })
    ));
}

#[test]
fn test_negative_frame_count_is_error() {
    let bytes = header(4, -1);
    let result = read_capture(&mut Cursor::new(bytes));
    assert!(matches!(
        result,
        Err(CaptureError::NegativeFrameCount { count: -1, .. })
    ));
}

#[test]
fn test_hand_built_stream_parses() {
    let mut bytes = header(7, 2);
    bytes.extend(record(1, 0xdead, 0));
    bytes.extend(record(2, 0xdead, 1));
    bytes.extend(header(8, 0));

    let blocks = read_capture(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].events[0], TraceEvent::started(0xdead, 1));
    assert_eq!(blocks[0].events[1], TraceEvent::finished(0xdead, 2));
    assert!(blocks[1].events.is_empty());
}
