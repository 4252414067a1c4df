//! End-to-end pipeline tests over the synthetic driver and the in-memory
//! bus: no hardware, no broker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framecast::{
    BusConnector, ConfigStore, FeatureType, InMemoryBus, MessageBus, PixelFormat, ShutdownToken,
    Supervisor, SyntheticDriver, SyntheticSourceSpec,
};

const BASE_CONFIG: &str = r#"
[ImageEncoding]
ImageFormat = "jpg"
JpegCompressionQuality = 90
ThreadCount = 1

[FrameBuffers]
TotalCount = 10
QueueCapacity = 256
OverflowPolicy = "drop-oldest"

[Operation]
NoImagesTimeout_s = 0.0

[Logging]
LogTemperature = true
LogExposureTime = false
LogGain = false
"#;

fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("framecast.toml");
    std::fs::write(&path, contents).expect("write config");
    path
}

fn spawn_supervisor(
    driver: Arc<SyntheticDriver>,
    bus: Arc<InMemoryBus>,
    config: &Path,
    token: &ShutdownToken,
) -> thread::JoinHandle<()> {
    let connector: BusConnector = Box::new(move |_store: &mut ConfigStore| {
        Ok(bus.clone() as Arc<dyn MessageBus>)
    });
    let mut supervisor = Supervisor::new(driver, connector, config.to_path_buf(), token.clone());
    thread::spawn(move || {
        let _ = supervisor.run();
    })
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn assert_counters_strictly_increase(bus: &InMemoryBus) {
    let published = bus.published();
    for pair in published.windows(2) {
        assert!(
            pair[1].counter > pair[0].counter,
            "counters must strictly increase: {} after {}",
            pair[1].counter,
            pair[0].counter
        );
    }
    let mut ids: Vec<_> = published.iter().map(|message| message.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), published.len(), "identifiers must be unique");
}

#[test]
fn publishes_every_complete_frame_exactly_once() {
    let spec = SyntheticSourceSpec {
        id: "stub://camera-0".to_string(),
        rows: 24,
        cols: 32,
        frame_interval: Duration::from_millis(1),
        frame_limit: Some(105),
        incomplete_every: Some(21),
        ..SyntheticSourceSpec::default()
    };
    let driver = Arc::new(SyntheticDriver::new(vec![spec]));
    let bus = Arc::new(InMemoryBus::new());
    let dir = tempfile::tempdir().expect("temp dir");
    let config = write_config(&dir, BASE_CONFIG);
    let token = ShutdownToken::new();

    let supervisor = spawn_supervisor(driver.clone(), bus.clone(), &config, &token);

    // 105 deliveries, every 21st incomplete: exactly 100 published images.
    assert!(
        wait_until(Duration::from_secs(30), || bus.published_count() == 100),
        "expected 100 published messages, got {}",
        bus.published_count()
    );
    // Give stragglers a chance to prove there are none.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(bus.published_count(), 100);

    token.cancel();
    supervisor.join().expect("supervisor thread");

    assert_counters_strictly_increase(&bus);
    let published = bus.published();
    for message in &published {
        assert_eq!(message.rows, 24);
        assert_eq!(message.cols, 32);
        assert_eq!(message.format, "jpg");
        assert_eq!(message.jpeg_quality, Some(90));
        assert!(message.id.ends_with(".jpg"));
        assert!(!message.data.is_empty());
    }
    // Only one session ran, so the source was opened exactly once.
    assert_eq!(driver.open_count(), 1);
}

#[test]
fn watchdog_restarts_a_stalled_session() {
    let spec = SyntheticSourceSpec {
        id: "stub://camera-0".to_string(),
        rows: 8,
        cols: 8,
        frame_interval: Duration::from_millis(1),
        frame_limit: Some(3),
        ..SyntheticSourceSpec::default()
    };
    let driver = Arc::new(SyntheticDriver::new(vec![spec]));
    let bus = Arc::new(InMemoryBus::new());
    let dir = tempfile::tempdir().expect("temp dir");
    let config = write_config(
        &dir,
        &BASE_CONFIG.replace("NoImagesTimeout_s = 0.0", "NoImagesTimeout_s = 1.0"),
    );
    let token = ShutdownToken::new();

    let supervisor = spawn_supervisor(driver.clone(), bus.clone(), &config, &token);

    // Each session delivers 3 frames and stalls; the watchdog tears it down
    // and the supervisor starts a fresh one.
    assert!(
        wait_until(Duration::from_secs(30), || driver.open_count() >= 2),
        "watchdog never restarted the session"
    );
    assert!(
        wait_until(Duration::from_secs(30), || bus.published_count() >= 6),
        "expected frames from at least two sessions, got {}",
        bus.published_count()
    );

    token.cancel();
    supervisor.join().expect("supervisor thread");

    // Counters are never reused across restarts.
    assert_counters_strictly_increase(&bus);
    assert!(driver.open_count() >= 2);
}

#[test]
fn steady_frames_keep_the_watchdog_quiet() {
    let spec = SyntheticSourceSpec {
        id: "stub://camera-0".to_string(),
        rows: 8,
        cols: 8,
        frame_interval: Duration::from_millis(100),
        ..SyntheticSourceSpec::default()
    };
    let driver = Arc::new(SyntheticDriver::new(vec![spec]));
    let bus = Arc::new(InMemoryBus::new());
    let dir = tempfile::tempdir().expect("temp dir");
    let config = write_config(
        &dir,
        &BASE_CONFIG.replace("NoImagesTimeout_s = 0.0", "NoImagesTimeout_s = 2.0"),
    );
    let token = ShutdownToken::new();

    let supervisor = spawn_supervisor(driver.clone(), bus.clone(), &config, &token);

    assert!(
        wait_until(Duration::from_secs(10), || bus.published_count() >= 1),
        "no frames published"
    );
    // Frames arrive every 100 ms against a 2-second timeout: no restart.
    thread::sleep(Duration::from_secs(3));
    assert_eq!(driver.open_count(), 1, "watchdog restarted a live session");

    token.cancel();
    supervisor.join().expect("supervisor thread");
}

#[test]
fn configuration_change_restarts_the_session() {
    let spec = SyntheticSourceSpec {
        id: "stub://camera-0".to_string(),
        rows: 8,
        cols: 8,
        frame_interval: Duration::from_millis(50),
        ..SyntheticSourceSpec::default()
    };
    let driver = Arc::new(SyntheticDriver::new(vec![spec]));
    let bus = Arc::new(InMemoryBus::new());
    let dir = tempfile::tempdir().expect("temp dir");
    let config = write_config(&dir, BASE_CONFIG);
    let token = ShutdownToken::new();

    let supervisor = spawn_supervisor(driver.clone(), bus.clone(), &config, &token);
    assert!(
        wait_until(Duration::from_secs(10), || bus.published_count() >= 1),
        "session never came up"
    );

    // Edit the file behind the supervisor's back.
    let current = std::fs::read_to_string(&config).expect("read config");
    std::fs::write(
        &config,
        format!("{}\n[SourceParameters]\nExposureTime = 20000.0\n", current),
    )
    .expect("edit config");

    assert!(
        wait_until(Duration::from_secs(10), || driver.open_count() >= 2),
        "config change did not restart the session"
    );

    token.cancel();
    supervisor.join().expect("supervisor thread");
}

#[test]
fn unknown_pixel_format_is_published_degraded() {
    let spec = SyntheticSourceSpec {
        id: "stub://camera-0".to_string(),
        rows: 8,
        cols: 8,
        pixel_format: PixelFormat::Unknown(0x99),
        frame_interval: Duration::from_millis(1),
        frame_limit: Some(3),
        ..SyntheticSourceSpec::default()
    };
    let driver = Arc::new(SyntheticDriver::new(vec![spec]));
    let bus = Arc::new(InMemoryBus::new());
    let dir = tempfile::tempdir().expect("temp dir");
    let config = write_config(&dir, BASE_CONFIG);
    let token = ShutdownToken::new();

    let supervisor = spawn_supervisor(driver.clone(), bus.clone(), &config, &token);
    assert!(
        wait_until(Duration::from_secs(10), || bus.published_count() == 3),
        "degraded frames must still be published, got {}",
        bus.published_count()
    );

    token.cancel();
    supervisor.join().expect("supervisor thread");

    for message in bus.published() {
        assert_eq!(message.format, "jpg");
        assert!(!message.data.is_empty());
    }
}

#[test]
fn unsupported_feature_type_fails_the_attempt_and_retries() {
    let spec = SyntheticSourceSpec {
        id: "stub://camera-0".to_string(),
        rows: 8,
        cols: 8,
        frame_interval: Duration::from_millis(10),
        feature_types: HashMap::from([("TriggerSoftware".to_string(), FeatureType::Unknown)]),
        ..SyntheticSourceSpec::default()
    };
    let driver = Arc::new(SyntheticDriver::new(vec![spec]));
    let bus = Arc::new(InMemoryBus::new());
    let dir = tempfile::tempdir().expect("temp dir");
    let config = write_config(
        &dir,
        &format!("{}\n[SourceParameters]\nTriggerSoftware = 1\n", BASE_CONFIG),
    );
    let token = ShutdownToken::new();

    let supervisor = spawn_supervisor(driver.clone(), bus.clone(), &config, &token);

    // Every attempt opens the source, fails to apply the parameter, backs
    // off, and retries. Nothing is ever published.
    assert!(
        wait_until(Duration::from_secs(15), || driver.open_count() >= 2),
        "failed attempt was not retried"
    );
    assert_eq!(bus.published_count(), 0);

    token.cancel();
    supervisor.join().expect("supervisor thread");
}
