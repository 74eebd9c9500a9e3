use super::binary::{read_capture_file, thread_file_path, HEADER_SIZE, RECORD_SIZE};
use super::streaming::ChannelTransport;
use super::*;
use crate::collaborators::{NameResolver, StaticNameResolver};
use crate::error::CaptureError;
use crate::event::TraceEvent;
use crate::method_filter::MethodFilter;
use tempfile::TempDir;

fn names() -> Arc<dyn NameResolver> {
    Arc::new(
        StaticNameResolver::new()
            .with_name(1, "MyApp.Main")
            .with_name(2, "MyApp.Worker.Run")
            .with_name(3, "System.Threading.Monitor.Enter"),
    )
}

fn two_thread_snapshot() -> SessionSnapshot {
    SessionSnapshot::from_threads(vec![
        (
            11,
            vec![
                TraceEvent::started(1, 10),
                TraceEvent::started(3, 20),
                TraceEvent::finished(3, 30),
                TraceEvent::finished(1, 40),
            ],
        ),
        (
            12,
            vec![
                TraceEvent::started(2, 15),
                TraceEvent::exception_catch(2, 16),
                TraceEvent::finished(2, 25),
            ],
        ),
    ])
}

fn binary(dir: &TempDir, split: bool, filter: Option<&str>) -> Serializer {
    let config = CaptureConfig {
        binary_path: Some(dir.path().join("capture.bin")),
        split_binary_files: split,
        ..CaptureConfig::default()
    };
    let mut serializer =
        Serializer::Binary(BinarySerializer::new(MethodFilter::from_pattern(filter, names())));
    serializer.init(&config);
    serializer
}

#[test]
fn test_binary_single_file_layout() {
    let dir = TempDir::new().unwrap();
    let serializer = binary(&dir, false, None);
    assert_eq!(serializer.kind(), SerializerKind::Binary);

    let stats = serializer.serialize(&two_thread_snapshot()).unwrap();
    assert_eq!(stats.threads, 2);
    assert_eq!(stats.events_written, 7);
    assert_eq!(stats.files, vec![dir.path().join("capture.bin")]);

    let size = std::fs::metadata(dir.path().join("capture.bin")).unwrap().len();
    assert_eq!(size, 2 * HEADER_SIZE + 7 * RECORD_SIZE);

    let blocks = read_capture_file(&dir.path().join("capture.bin")).unwrap();
    let ids: Vec<_> = blocks.iter().map(|b| b.thread_id).collect();
    assert_eq!(ids, vec![11, 12]);
    assert_eq!(blocks[1].events[1], TraceEvent::exception_catch(2, 16));
}

#[test]
fn test_binary_split_files_per_thread() {
    let dir = TempDir::new().unwrap();
    let serializer = binary(&dir, true, None);
    let stats = serializer.serialize(&two_thread_snapshot()).unwrap();

    assert_eq!(stats.files.len(), 2);
    for (thread_id, expected) in [(11u64, 4i64), (12, 3)] {
        let path = thread_file_path(&dir.path().join("capture.bin"), thread_id);
        assert!(path.ends_with(format!("capture_{thread_id}.bin")));

        let blocks = read_capture_file(&path).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].frame_count, expected);
    }
}

#[test]
fn test_binary_frame_count_reflects_filter() {
    let dir = TempDir::new().unwrap();
    let serializer = binary(&dir, false, Some(r"^MyApp\."));
    let stats = serializer.serialize(&two_thread_snapshot()).unwrap();
    assert_eq!(stats.events_written, 5);
    assert_eq!(stats.events_filtered, 2);

    let blocks = read_capture_file(&dir.path().join("capture.bin")).unwrap();
    assert_eq!(blocks[0].frame_count, 2);
    assert!(blocks[0].events.iter().all(|e| e.function_id() == 1));
}

#[test]
fn test_filter_matching_nothing_writes_empty_blocks() {
    let dir = TempDir::new().unwrap();
    let serializer = binary(&dir, false, Some("^Nothing$"));
    let stats = serializer.serialize(&two_thread_snapshot()).unwrap();
    assert_eq!(stats.events_written, 0);

    let blocks = read_capture_file(&dir.path().join("capture.bin")).unwrap();
    assert_eq!(blocks.len(), 2);
    assert!(blocks.iter().all(|b| b.frame_count == 0 && b.events.is_empty()));
}

#[test]
fn test_binary_missing_directory_disables() {
    let dir = TempDir::new().unwrap();
    let config = CaptureConfig {
        binary_path: Some(dir.path().join("missing").join("capture.bin")),
        ..CaptureConfig::default()
    };
    let mut serializer = Serializer::Binary(BinarySerializer::new(MethodFilter::all(names())));
    serializer.init(&config);

    assert!(!serializer.is_enabled());
    assert!(matches!(
        serializer.serialize(&two_thread_snapshot()),
        Err(CaptureError::SerializerDisabled("binary"))
    ));
}

#[test]
fn test_debug_file_written_through_enum() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("capture.txt");
    let config = CaptureConfig {
        debug_path: Some(path.clone()),
        serializer: SerializerKind::Debug,
        ..CaptureConfig::default()
    };
    let mut serializer =
        Serializer::Debug(DebugSerializer::new(MethodFilter::all(names()), names()));
    serializer.init(&config);
    assert_eq!(serializer.name(), "debug");

    let stats = serializer.serialize(&two_thread_snapshot()).unwrap();
    assert_eq!(stats.files, vec![path.clone()]);

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("[START]: Thread(11)"));
    assert!(text.contains("[START]: Thread(12)"));
    assert!(text.contains("[CATCH]: MyApp.Worker.Run"));
}

#[test]
fn test_streaming_init_through_enum() {
    let (transport, rx) = ChannelTransport::new();
    let mut serializer = Serializer::Streaming(Arc::new(StreamingSerializer::new(
        Arc::new(transport),
        MethodFilter::all(names()),
        names(),
    )));
    assert!(!serializer.is_enabled());

    serializer.init(&CaptureConfig::default());
    assert!(serializer.is_enabled());

    let stats = serializer.serialize(&two_thread_snapshot()).unwrap();
    assert_eq!(stats.events_written, 7);
    assert!(stats.files.is_empty());
    // one MethodInfo per distinct function plus every event
    assert_eq!(rx.try_iter().count(), 3 + 7);
}

#[test]
fn test_each_pass_starts_with_empty_filter_cache() {
    let dir = TempDir::new().unwrap();
    let filter = MethodFilter::from_pattern(Some("MyApp"), names());
    let mut serializer = BinarySerializer::new(filter.clone());
    serializer.init(&CaptureConfig {
        binary_path: Some(dir.path().join("capture.bin")),
        ..CaptureConfig::default()
    });

    serializer.serialize(&two_thread_snapshot()).unwrap();
    assert_eq!(filter.cached_decisions(), 0);
}
