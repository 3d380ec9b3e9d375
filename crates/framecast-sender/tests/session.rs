//! End-to-end session behaviour over the synthetic capture sources.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use framecast_capture::synthetic::{self, SyntheticControl};
use framecast_capture::MAX_RECREATE_ATTEMPTS;
use framecast_core::{nal, BackendKind, CaptureConfig, CaptureError};
use framecast_sender::{CaptureService, DeliveredFrame, FailoverStrategy};
use parking_lot::Mutex;
use serde_json::json;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Event-driven and poll-driven sources with independent failure controls.
struct Rig {
    event: Arc<SyntheticControl>,
    poll: Arc<SyntheticControl>,
    frames: Arc<Mutex<Vec<DeliveredFrame>>>,
    errors: Arc<Mutex<Vec<String>>>,
    service: CaptureService,
}

impl Rig {
    fn new() -> Self {
        init_test_tracing();
        let event = Arc::new(SyntheticControl::default());
        let poll = Arc::new(SyntheticControl::default());
        let (e, p) = (Arc::clone(&event), Arc::clone(&poll));
        let strategy = FailoverStrategy::new(
            Arc::new(move |config: &CaptureConfig| synthetic::event_driven_backend(config, Arc::clone(&e))),
            Arc::new(move |config: &CaptureConfig| synthetic::poll_driven_backend(config, Arc::clone(&p))),
        );

        let frames = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut service = CaptureService::with_strategy(strategy);
        let sink = Arc::clone(&frames);
        service.on_frame(move |frame| sink.lock().push(frame));
        let sink = Arc::clone(&errors);
        service.on_error(move |message| sink.lock().push(message));

        Self { event, poll, frames, errors, service }
    }

    fn start(&mut self, fps: u32) -> Result<(), CaptureError> {
        let request = json!({
            "width": 64,
            "height": 48,
            "fps": fps,
            "bitrateKbps": 2000,
            "useHardwareEncoder": false,
        });
        self.service.start_json(&request.to_string())
    }

    fn open_handles(&self) -> usize {
        self.event.open_handles() + self.poll.open_handles()
    }
}

#[test]
fn event_driven_init_failure_fails_over_once() {
    let mut rig = Rig::new();
    rig.event.fail_open(true);

    rig.start(30).unwrap();
    assert_eq!(rig.service.active_backend(), Some(BackendKind::PollDriven));
    assert!(rig.service.is_capturing());
    assert_eq!((rig.event.opens(), rig.poll.opens()), (1, 1));
    assert_eq!(rig.event.open_handles(), 0);

    rig.service.stop();
    assert_eq!(rig.open_handles(), 0);
}

#[test]
fn event_driven_start_failure_fails_over_once() {
    let mut rig = Rig::new();
    rig.event.fail_start(true);

    rig.start(30).unwrap();
    assert_eq!(rig.service.active_backend(), Some(BackendKind::PollDriven));
    assert_eq!(rig.event.open_handles(), 0, "failed backend released before failover");
    thread::sleep(Duration::from_millis(200));
    rig.service.stop();
    assert!(!rig.frames.lock().is_empty());
}

#[test]
fn both_backends_failing_is_fatal_and_leaves_nothing_open() {
    let mut rig = Rig::new();
    rig.event.fail_open(true);
    rig.poll.fail_open(true);

    let err = rig.start(30).unwrap_err();
    assert!(matches!(err, CaptureError::FatalSession { .. }), "{err}");
    assert_eq!((rig.event.opens(), rig.poll.opens()), (1, 1), "no retry loop");
    assert_eq!(rig.open_handles(), 0);
    assert!(!rig.service.is_capturing());

    let errors = rig.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("no capture backend could start"));

    rig.service.stop();
    rig.service.stop();
    assert!(!rig.service.is_capturing());
}

#[test]
fn stop_before_start_and_twice_is_a_no_op() {
    let mut rig = Rig::new();
    rig.service.stop();
    assert!(!rig.service.is_capturing());

    rig.start(30).unwrap();
    rig.service.stop();
    rig.service.stop();
    assert!(!rig.service.is_capturing());
    assert_eq!(rig.open_handles(), 0);
}

#[test]
fn poll_driven_delivery_paces_to_fps() {
    let mut rig = Rig::new();
    rig.event.fail_open(true);

    rig.start(20).unwrap();
    thread::sleep(Duration::from_secs(2));
    rig.service.stop();

    let delivered = rig.frames.lock().len();
    assert!((28..=48).contains(&delivered), "expected ~40 frames in 2s at 20fps, got {delivered}");
}

#[test]
fn keyframe_once_per_fps_frames_with_parameter_sets() {
    let mut rig = Rig::new();
    rig.event.fail_open(true);

    rig.start(10).unwrap();
    thread::sleep(Duration::from_millis(2600));
    rig.service.stop();

    let frames = rig.frames.lock();
    assert!(frames.len() >= 21, "got {} frames", frames.len());
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.is_keyframe, i % 10 == 0, "frame {i}");
        let types: Vec<u8> = nal::split_annexb(&frame.data)
            .into_iter()
            .filter_map(nal::unit_type)
            .collect();
        if frame.is_keyframe {
            assert!(types.contains(&nal::NAL_SPS) && types.contains(&nal::NAL_PPS), "frame {i}: {types:?}");
            assert!(types.contains(&nal::NAL_IDR));
        } else {
            assert!(!types.contains(&nal::NAL_IDR), "frame {i}: {types:?}");
        }
    }
}

#[test]
fn delivered_frames_have_host_shape() {
    let mut rig = Rig::new();
    rig.start(30).unwrap();
    assert_eq!(rig.service.active_backend(), Some(BackendKind::EventDriven));
    thread::sleep(Duration::from_millis(300));
    rig.service.stop();

    let frames = rig.frames.lock();
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|f| f.format == "h264" && f.width == 64 && f.height == 48));
    assert!(frames.iter().all(|f| !f.data.is_empty()));
    assert!(frames[0].is_keyframe);
    assert!(rig.event.frames_rendered() >= frames.len() as u64);
    assert!(frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn device_loss_recovers_without_ending_the_session() {
    let mut rig = Rig::new();
    rig.event.fail_open(true);
    rig.start(30).unwrap();
    thread::sleep(Duration::from_millis(200));

    rig.poll.recreate_failures(1);
    rig.poll.lose_device();
    thread::sleep(Duration::from_millis(150));
    let after_loss = rig.frames.lock().len();
    thread::sleep(Duration::from_millis(300));

    assert!(rig.service.is_capturing());
    assert_eq!(rig.poll.recreations(), 2);
    assert!(rig.frames.lock().len() > after_loss, "capture resumed after recreation");
    assert!(rig.errors.lock().is_empty());

    rig.service.stop();
    assert_eq!(rig.open_handles(), 0);
}

#[test]
fn unrecoverable_device_loss_reports_one_error() {
    let mut rig = Rig::new();
    rig.event.fail_open(true);
    rig.start(30).unwrap();
    thread::sleep(Duration::from_millis(150));

    rig.poll.recreate_failures(MAX_RECREATE_ATTEMPTS * 4);
    rig.poll.lose_device();
    thread::sleep(Duration::from_millis(500));

    assert!(!rig.service.is_capturing());
    assert_eq!(rig.poll.opens(), 1, "no failover after start");
    let errors = rig.errors.lock().clone();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("Capture session failed"));

    rig.service.stop();
    assert_eq!(rig.open_handles(), 0);
    assert_eq!(rig.event.opens(), 1);
}
