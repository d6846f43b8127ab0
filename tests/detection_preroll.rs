use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use nvr_core::media::mp4::inspect::read_summary;
use nvr_core::recording::{EventKind, MemorySink, MemoryStore, RecordingStore};
use nvr_core::{NvrConfig, Runtime, StreamConfig};

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut done: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    done()
}

fn motion_stream(url: &str) -> StreamConfig {
    let mut stream = StreamConfig::new("cam1", url).with_detection("motion", 0);
    stream.fps = 10;
    stream.pre_roll_seconds = 5;
    stream.post_roll_seconds = 5;
    stream
}

fn runtime(dir: &Path, stream: StreamConfig) -> (Arc<Runtime>, Arc<MemoryStore>, Arc<MemorySink>) {
    let mut config = NvrConfig::with_storage(dir);
    config.streams = vec![stream];
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let rt = Runtime::with_services(config, store.clone(), sink.clone()).expect("runtime");
    (rt, store, sink)
}

fn completed(store: &MemoryStore) -> Vec<PathBuf> {
    store
        .list_recordings(Some("cam1"))
        .unwrap()
        .into_iter()
        .filter(|r| r.is_complete)
        .map(|r| PathBuf::from(r.file_path))
        .collect()
}

#[test]
fn detection_recording_holds_the_pre_roll() {
    let dir = tempdir().unwrap();
    let (rt, store, sink) = runtime(
        dir.path(),
        motion_stream("stub://cam1?fps=10&speed=2&motion_at=6&motion_for=1.5"),
    );

    rt.start_stream("cam1").unwrap();
    assert_eq!(rt.prebuffers().active_count(), 1);
    assert!(!rt.recordings().is_recording("cam1"));

    assert!(
        wait_for(Duration::from_secs(20), || sink.count(EventKind::DetectionHit) > 0),
        "motion never detected"
    );
    assert!(wait_for(Duration::from_secs(2), || rt.recordings().is_recording("cam1")));

    assert!(
        wait_for(Duration::from_secs(20), || !completed(&store).is_empty()),
        "post-roll never expired"
    );
    let files = completed(&store);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with(dir.path().join("mp4").join("cam1")));

    // 60 buffered packets span 5.9s, so the first kept keyframe is at least
    // five seconds before the hit; post-roll follows it.
    let summary = read_summary(&files[0]).unwrap();
    let video = &summary.tracks[0];
    assert_eq!(video.sync_samples.first(), Some(&1));
    assert!(
        video.duration_seconds() >= 6.5,
        "recording covers only {:.2}s",
        video.duration_seconds()
    );
    assert!(wait_for(Duration::from_secs(5), || sink.count(EventKind::RecordingStop) == 1));
    assert_eq!(sink.count(EventKind::RecordingStart), 1);
    rt.shutdown();
}

#[test]
fn quiet_stream_never_records() {
    let dir = tempdir().unwrap();
    let (rt, store, sink) = runtime(dir.path(), motion_stream("stub://cam1?fps=10&speed=4"));

    rt.start_stream("cam1").unwrap();
    assert!(wait_for(Duration::from_secs(10), || rt.detection().stats().frames >= 4));
    assert_eq!(sink.count(EventKind::DetectionHit), 0);
    assert!(!rt.recordings().is_recording("cam1"));
    let buffer = rt.prebuffers().get("cam1").expect("pre-roll buffer");
    assert_eq!(buffer.lock().unwrap().capacity(), 60);

    rt.shutdown();
    assert!(store.list_recordings(None).unwrap().is_empty());
    assert!(!dir.path().join("mp4").join("cam1").exists());
}
