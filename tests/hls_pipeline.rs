use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use nvr_core::recording::{MemorySink, MemoryStore};
use nvr_core::{NvrConfig, Runtime, StreamConfig, StreamStatus};

fn runtime(dir: &Path, streams: Vec<StreamConfig>) -> Arc<Runtime> {
    let mut config = NvrConfig::with_storage(dir);
    config.streams = streams;
    Runtime::with_services(config, Arc::new(MemoryStore::new()), Arc::new(MemorySink::new()))
        .expect("runtime")
}

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

#[test]
fn live_stream_produces_playlist_and_segments() {
    let dir = tempdir().unwrap();
    let mut stream = StreamConfig::new("cam1", "stub://cam1?fps=10&speed=4");
    stream.segment_duration = 4;
    let rt = runtime(dir.path(), vec![stream]);

    rt.start_stream("cam1").unwrap();
    assert!(rt.wait_connected("cam1", Duration::from_secs(5)));
    let playlist = rt.hls_playlist("cam1").expect("hls output");
    assert_eq!(playlist, dir.path().join("hls").join("cam1").join("index.m3u8"));

    let listed = wait_for(Duration::from_secs(20), || {
        fs::read_to_string(&playlist)
            .map(|text| text.matches("#EXTINF").count() >= 2)
            .unwrap_or(false)
    });
    assert!(listed, "two segments never reached the playlist");

    let text = fs::read_to_string(&playlist).unwrap();
    assert!(text.starts_with("#EXTM3U\n"));
    assert!(text.contains("#EXT-X-TARGETDURATION:4\n"), "{}", text);
    assert!(text.contains("index0.ts"));
    assert!(text.contains("index1.ts"));
    let segments = fs::read_dir(playlist.parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "ts"))
        .count();
    assert!(segments >= 2);

    rt.stop_stream("cam1").unwrap();
    let text = fs::read_to_string(&playlist).unwrap();
    assert!(text.ends_with("#EXT-X-ENDLIST\n"));
    assert_eq!(rt.streams().get("cam1").unwrap().status(), StreamStatus::Inactive);
    rt.shutdown();
}

#[test]
fn streaming_off_without_detection_skips_hls() {
    let dir = tempdir().unwrap();
    let mut stream = StreamConfig::new("cam1", "stub://cam1?fps=10");
    stream.streaming_enabled = false;
    let rt = runtime(dir.path(), vec![stream]);

    rt.start_stream("cam1").unwrap();
    assert!(rt.wait_connected("cam1", Duration::from_secs(5)));
    assert!(rt.hls_playlist("cam1").is_none());
    assert!(!dir.path().join("hls").join("cam1").join("index.m3u8").exists());
    rt.shutdown();
}

#[test]
fn refused_source_ends_in_error() {
    let dir = tempdir().unwrap();
    let rt = runtime(
        dir.path(),
        vec![StreamConfig::new("cam1", "stub://cam1?fail_open=1")],
    );

    rt.start_stream("cam1").unwrap();
    assert!(!rt.wait_connected("cam1", Duration::from_millis(500)));
    let state = rt.streams().get("cam1").unwrap();
    assert!(wait_for(Duration::from_secs(10), || state.status() == StreamStatus::Error));
    assert!(state.last_error().unwrap().contains("could not open"));
    let health = rt.health();
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].frames_received, 0);
    assert!(!health[0].recording);
    rt.shutdown();
}
