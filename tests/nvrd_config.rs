use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use nvr_core::config::NvrConfig;
use nvr_core::error::NvrError;
use nvr_core::{BufferMode, Protocol};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "NVR_CONFIG",
        "NVR_STORAGE_PATH",
        "NVR_MP4_STORAGE_PATH",
        "NVR_RECORD_MP4_DIRECTLY",
        "NVR_MODELS_PATH",
        "NVR_API_DETECTION_URL",
        "NVR_DB_PATH",
        "NVR_MAX_STREAMS",
        "NVR_CONCURRENT_DETECTIONS",
        "NVR_SHUTDOWN_TIMEOUT_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "storage_path": "/srv/nvr",
        "mp4_storage_path": "/mnt/recordings",
        "max_streams": 4,
        "prebuffer_mode": "hybrid",
        "mp4_segment_duration": 300,
        "mqtt": { "host": "broker.local", "topic_prefix": "cams" },
        "streams": [
            {
                "name": "front_door",
                "url": "rtsp://10.0.0.5/stream1",
                "protocol": "udp",
                "segment_duration": 4,
                "record": true
            },
            {
                "name": "yard",
                "url": "rtsp://10.0.0.6/stream1",
                "detect_enabled": true,
                "detect_model": "motion",
                "detect_interval": 1,
                "pre_roll_seconds": 5,
                "post_roll_seconds": 20
            }
        ]
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("NVR_CONFIG", file.path());
    std::env::set_var("NVR_RECORD_MP4_DIRECTLY", "yes");
    std::env::set_var("NVR_CONCURRENT_DETECTIONS", "3");
    std::env::set_var("NVR_SHUTDOWN_TIMEOUT_SECS", "15");

    let cfg = NvrConfig::load().expect("load config");

    assert_eq!(cfg.storage_path.to_str(), Some("/srv/nvr"));
    assert_eq!(cfg.hls_root().to_str(), Some("/srv/nvr/hls"));
    assert_eq!(cfg.mp4_root().to_str(), Some("/mnt/recordings"));
    assert_eq!(cfg.max_streams, 4);
    assert_eq!(cfg.concurrent_detections, 3);
    assert_eq!(cfg.shutdown_timeout, Duration::from_secs(15));
    assert_eq!(cfg.prebuffer_mode, BufferMode::Hybrid);
    assert_eq!(cfg.mp4_segment_duration, Duration::from_secs(300));
    let mqtt = cfg.mqtt.as_ref().expect("mqtt settings");
    assert_eq!(mqtt.host, "broker.local");
    assert_eq!(mqtt.port, 1883);
    assert_eq!(mqtt.topic_prefix, "cams");

    assert_eq!(cfg.streams.len(), 2);
    let front = &cfg.streams[0];
    assert_eq!(front.protocol, Protocol::Udp);
    assert_eq!(front.segment_duration, 4);
    assert!(front.record);
    assert!(!front.wants_detection());
    let yard = &cfg.streams[1];
    assert!(yard.wants_detection());
    assert_eq!(yard.post_roll_seconds, 20);
    assert!(yard.streaming_enabled);

    clear_env();
}

#[test]
fn toml_config_is_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
storage_path = "/data/nvr"
hls_list_size = 8

[[streams]]
name = "garage"
url = "stub://garage?fps=5"
fps = 5
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = NvrConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.hls_list_size, 8);
    assert_eq!(cfg.streams[0].name, "garage");
    assert_eq!(cfg.streams[0].fps, 5);
    assert_eq!(cfg.mp4_root().to_str(), Some("/data/nvr/mp4"));

    clear_env();
}

#[test]
fn bad_override_is_a_config_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("NVR_MAX_STREAMS", "many");
    let err = NvrConfig::load().expect_err("invalid override");
    assert!(matches!(NvrError::classify(&err), Some(NvrError::Config(_))));

    clear_env();
}

#[test]
fn invalid_streams_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for streams in [
        r#"[{ "name": "bad name!", "url": "rtsp://x" }]"#,
        r#"[{ "name": "cam", "url": "rtsp://x" }, { "name": "cam", "url": "rtsp://y" }]"#,
        r#"[{ "name": "cam", "url": "" }]"#,
    ] {
        let mut file = NamedTempFile::new().expect("temp config");
        let json = format!(r#"{{ "streams": {} }}"#, streams);
        std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
        let err = NvrConfig::load_from(Some(file.path())).expect_err(streams);
        assert!(
            matches!(NvrError::classify(&err), Some(NvrError::Config(_))),
            "{}: {:#}",
            streams,
            err
        );
    }

    clear_env();
}
