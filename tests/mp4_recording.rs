use std::sync::Arc;

use tempfile::tempdir;

use nvr_core::media::mp4::inspect::read_summary;
use nvr_core::media::{open_input, Demuxer, Interrupter, ReadEvent};
use nvr_core::recording::{Mp4Writer, RecordingStore, SqliteStore};
use nvr_core::{Packet, Protocol, StreamInfo};

fn open(url: &str) -> Box<dyn Demuxer> {
    open_input(url, Protocol::Tcp, &Interrupter::new()).expect("open synthetic source")
}

fn next_packet(demuxer: &mut dyn Demuxer) -> (Packet, StreamInfo) {
    loop {
        match demuxer.read().expect("read") {
            ReadEvent::Packet(packet) => {
                let info = demuxer
                    .streams()
                    .iter()
                    .find(|s| s.index == packet.stream_index)
                    .cloned()
                    .expect("stream info");
                return (packet, info);
            }
            ReadEvent::Again => continue,
            ReadEvent::Eof => panic!("source ended early"),
        }
    }
}

#[test]
fn recording_starts_on_first_keyframe() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cam1").join("recording.mp4");
    let mut source = open("stub://cam1?fps=10&speed=0");
    let mut writer = Mp4Writer::new(&path, "cam1");

    // join mid-GOP
    let _ = next_packet(source.as_mut());
    let mut accepted = Vec::new();
    for _ in 0..29 {
        let (packet, info) = next_packet(source.as_mut());
        let keyframe = packet.is_keyframe;
        accepted.push((writer.write_packet(&packet, &info).unwrap(), keyframe));
    }

    assert!(accepted[..9].iter().all(|(written, _)| !written));
    assert_eq!(accepted[9], (true, true));
    assert_eq!(writer.dropped_packets(), 9);
    assert_eq!(writer.video_packets(), 20);

    let summary = writer.close().unwrap();
    assert!(summary.size_bytes > 1024);
    assert_eq!(summary.video_packets, 20);

    let file = read_summary(&path).unwrap();
    let moov = file.top_level.iter().position(|b| b == "moov").unwrap();
    let mdat = file.top_level.iter().position(|b| b == "mdat").unwrap();
    assert!(moov < mdat);
    assert_eq!(file.title.as_deref(), Some("cam1"));
    let video = &file.tracks[0];
    assert_eq!((video.width, video.height), (640, 480));
    assert_eq!(video.timescale, 90_000);
    assert_eq!(video.dts.len(), 20);
    assert_eq!(video.dts[0], 0);
    assert_eq!(video.dts[1], 9_000);
    assert_eq!(video.sync_samples, vec![1, 11]);
}

#[test]
fn missing_timestamps_still_give_increasing_dts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gaps.mp4");
    let mut source = open("stub://cam1?fps=25&speed=0&missing_ts=3");
    let mut writer = Mp4Writer::new(&path, "cam1");

    for _ in 0..100 {
        let (packet, info) = next_packet(source.as_mut());
        writer.write_packet(&packet, &info).unwrap();
    }
    writer.close().unwrap();

    let file = read_summary(&path).unwrap();
    let video = &file.tracks[0];
    assert_eq!(video.dts.len(), 100);
    assert!(video.dts.windows(2).all(|w| w[1] > w[0]), "{:?}", video.dts);
    assert!(video
        .pts
        .iter()
        .zip(&video.dts)
        .all(|(pts, dts)| *pts >= *dts && *pts - *dts <= 90_000));
}

#[test]
fn audio_track_follows_video() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("av.mp4");
    let mut source = open("stub://cam1?fps=10&speed=0&audio=aac");
    let mut writer = Mp4Writer::new(&path, "cam1");

    for _ in 0..120 {
        let (packet, info) = next_packet(source.as_mut());
        writer.write_packet(&packet, &info).unwrap();
    }
    assert!(writer.has_audio());
    let summary = writer.close().unwrap();
    assert!(summary.audio_packets > 0);

    let file = read_summary(&path).unwrap();
    assert_eq!(file.tracks.len(), 2);
    assert_eq!(file.tracks[0].handler, "vide");
    let audio = &file.tracks[1];
    assert_eq!(audio.handler, "soun");
    assert_eq!(audio.timescale, 48_000);
    assert!(audio.dts.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn closed_recording_lands_in_sqlite() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn RecordingStore> =
        Arc::new(SqliteStore::open(&dir.path().join("nvr.db")).unwrap());
    let path = dir.path().join("cam1").join("stored.mp4");
    let mut source = open("stub://cam1?fps=10&speed=0");
    let mut writer = Mp4Writer::new(&path, "cam1").with_store(store.clone());

    for _ in 0..30 {
        let (packet, info) = next_packet(source.as_mut());
        writer.write_packet(&packet, &info).unwrap();
    }
    let summary = writer.close().unwrap();
    let id = summary.recording_id.expect("row written");

    let rows = store.list_recordings(Some("cam1")).unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.id, id);
    assert!(row.is_complete);
    assert_eq!(row.file_path, path.to_string_lossy());
    assert_eq!(row.size_bytes, summary.size_bytes);
    assert_eq!((row.width, row.height, row.fps), (640, 480, 10));
    assert_eq!(row.codec, "h264");
    assert!(store.active_recording("cam1").unwrap().is_none());

    // closing twice does not add a second row
    writer.close().unwrap();
    assert_eq!(store.list_recordings(None).unwrap().len(), 1);
}
