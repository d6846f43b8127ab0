use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use nvr_core::media::mp4::inspect::read_summary;
use nvr_core::recording::{EventKind, MemorySink, MemoryStore, RecordingStore};
use nvr_core::{NvrConfig, Runtime, StreamConfig, StreamStatus};

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

fn runtime(
    dir: &Path,
    streams: Vec<StreamConfig>,
    concurrent_detections: usize,
) -> (Arc<Runtime>, Arc<MemoryStore>, Arc<MemorySink>) {
    let mut config = NvrConfig::with_storage(dir);
    config.streams = streams;
    config.concurrent_detections = concurrent_detections;
    config.shutdown_timeout = Duration::from_secs(5);
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let rt = Runtime::with_services(config, store.clone(), sink.clone()).expect("runtime");
    (rt, store, sink)
}

fn watched(name: &str) -> StreamConfig {
    let mut stream = StreamConfig::new(name, &format!("stub://{}?fps=10&speed=4", name))
        .with_detection("motion", 0);
    stream.fps = 10;
    stream
}

#[test]
fn detection_budget_is_shared_without_refusing_streams() {
    let dir = tempdir().unwrap();
    let (rt, _store, _sink) = runtime(
        dir.path(),
        vec![watched("cam1"), watched("cam2"), watched("cam3")],
        2,
    );

    assert_eq!(rt.start_all(), 3);
    for name in ["cam1", "cam2", "cam3"] {
        assert!(rt.wait_connected(name, Duration::from_secs(5)), "{} not connected", name);
    }
    assert!(wait_for(Duration::from_secs(10), || rt.detection().stats().frames >= 9));

    let admission = rt.detection().admission();
    assert_eq!(admission.capacity(), 2);
    assert!(admission.peak() <= 3);
    assert_eq!(rt.detection().stats().failures, 0);
    assert_eq!(rt.detection().stream_count(), 3);
    for name in ["cam1", "cam2", "cam3"] {
        assert_eq!(rt.streams().get(name).unwrap().status(), StreamStatus::Active);
    }

    rt.shutdown();
    assert_eq!(admission.active(), 0);
    assert_eq!(rt.detection().stream_count(), 0);
}

#[test]
fn shutdown_finalizes_recordings_and_releases_buffers() {
    let dir = tempdir().unwrap();
    let (rt, store, sink) = runtime(
        dir.path(),
        vec![
            watched("cam1").with_recording(true),
            watched("cam2").with_recording(true),
        ],
        2,
    );

    assert_eq!(rt.start_all(), 2);
    let buffers: Vec<_> = ["cam1", "cam2"]
        .iter()
        .map(|name| rt.prebuffers().get(name).expect("pre-roll buffer"))
        .collect();
    assert!(wait_for(Duration::from_secs(10), || {
        ["cam1", "cam2"].iter().all(|name| {
            rt.health()
                .iter()
                .any(|h| h.name == *name && h.recording && h.frames_received >= 40)
        })
    }));

    let report = rt.shutdown();
    assert!(report.forced.is_empty(), "forced: {:?}", report.forced);
    assert!(report.stopped.iter().any(|c| c == "recording supervisor"));

    for name in ["cam1", "cam2"] {
        let state = rt.streams().get(name).unwrap();
        assert_eq!(state.status(), StreamStatus::Inactive);
        assert!(!state.callbacks_enabled());
    }
    assert!(rt.active_streams().is_empty());
    assert_eq!(rt.readers().count(), 0);
    assert_eq!(rt.recordings().active_count(), 0);

    let rows = store.list_recordings(None).unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(row.is_complete, "{} left incomplete", row.file_path);
        assert!(row.end_time.is_some());
        let summary = read_summary(&PathBuf::from(&row.file_path)).unwrap();
        assert!(summary.top_level.iter().any(|b| b == "moov"));
        assert!(summary.tracks[0].dts.len() >= 40);
    }
    assert_eq!(sink.count(EventKind::RecordingStart), 2);
    assert_eq!(sink.count(EventKind::RecordingStop), 2);

    assert_eq!(rt.prebuffers().active_count(), 0);
    for buffer in buffers {
        let buffer = buffer.lock().unwrap();
        let stats = buffer.stats();
        assert!(stats.packets_in > 0);
        assert_eq!(stats.packets_in, stats.packets_released);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.current_bytes, 0);
    }
}

#[test]
fn stream_restarts_after_stop() {
    let dir = tempdir().unwrap();
    let (rt, store, _sink) = runtime(dir.path(), vec![watched("cam1").with_recording(true)], 1);

    for _ in 0..2 {
        rt.start_stream("cam1").unwrap();
        assert!(rt.wait_connected("cam1", Duration::from_secs(5)));
        assert!(wait_for(Duration::from_secs(10), || rt.recordings().is_recording("cam1")));
        // a few GOPs at 40 packets per second
        std::thread::sleep(Duration::from_millis(1500));
        rt.stop_stream("cam1").unwrap();
        assert_eq!(rt.prebuffers().active_count(), 0);
    }

    let rows = store.list_recordings(Some("cam1")).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.is_complete));
    assert_ne!(rows[0].file_path, rows[1].file_path);
    rt.shutdown();
}
