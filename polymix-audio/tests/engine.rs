//! Orchestrator end to end on the null device

mod common;

use common::{wait_for_event, wait_until, Script};
use polymix_audio::capture::read_raw;
use polymix_audio::state::distance;
use polymix_audio::{
    DeviceOptions, EngineConfig, EngineError, EngineEvent, NullDevice, Orchestrator, OutputDevice,
    PlaybackState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn stereo(sample_rate: u32, buffer_size: usize) -> DeviceOptions {
    DeviceOptions {
        sample_rate,
        channels: 2,
        buffer_size,
    }
}

fn engine_on(device: Arc<NullDevice>) -> Orchestrator {
    let config = EngineConfig {
        yield_interval: Duration::from_micros(200),
        recovery_retry_interval: Duration::from_millis(5),
        ..Default::default()
    };
    Orchestrator::new(config, device).unwrap()
}

fn is_engine_idle(event: &EngineEvent) -> bool {
    matches!(
        event,
        EngineEvent::StateChanged {
            source: None,
            state: PlaybackState::Idle
        }
    )
}

#[test]
fn test_one_second_of_silence_plays_then_rewinds() {
    let device = Arc::new(NullDevice::paced(DeviceOptions::default()));
    let engine = engine_on(device.clone());
    let events = engine.subscribe();
    engine.add_silent(Duration::from_secs(1), 1).unwrap();

    let started = Instant::now();
    engine.play().unwrap();
    assert_eq!(engine.state(), PlaybackState::Playing);

    let seen = wait_for_event(&events, Duration::from_secs(5), is_engine_idle);
    assert!(seen.iter().any(is_engine_idle), "engine never went idle");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "finished after {:?}", elapsed);

    assert_eq!(engine.state(), PlaybackState::Idle);
    assert_eq!(engine.position(), Duration::ZERO);
    assert!(device.is_stopped());
    assert!(device.blocks_sent() >= 43);

    // Engine position notifications are at least 20ms apart
    let positions: Vec<Duration> = seen
        .iter()
        .filter_map(|event| match event {
            EngineEvent::PositionChanged {
                source: None,
                position,
            } if *position > Duration::ZERO => Some(*position),
            _ => None,
        })
        .collect();
    assert!(!positions.is_empty());
    for pair in positions.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(20));
    }
}

#[test]
fn test_file_source_is_mixed_at_unity() {
    let device = Arc::new(NullDevice::new(stereo(1000, 50)).with_recording());
    let engine = engine_on(device.clone());
    let events = engine.subscribe();
    engine
        .load_file(Script::new(1000, 2, 500).constant(0.25).factory())
        .unwrap();
    engine.play().unwrap();

    let seen = wait_for_event(&events, Duration::from_secs(5), is_engine_idle);
    assert!(seen.iter().any(is_engine_idle));

    let recorded = device.recorded();
    assert_eq!(recorded.len(), 1000);
    assert!(recorded.iter().all(|&s| (s - 0.25).abs() < 1e-6));
}

#[test]
fn test_mono_source_is_duplicated_and_sum_is_clamped() {
    let device = Arc::new(NullDevice::paced(stereo(1000, 50)).with_recording());
    let engine = engine_on(device.clone());
    let events = engine.subscribe();
    engine
        .load_file(Script::new(1000, 1, 200).constant(0.75).factory())
        .unwrap();
    engine
        .load_file(Script::new(1000, 2, 200).constant(0.5).factory())
        .unwrap();
    engine.play().unwrap();

    let seen = wait_for_event(&events, Duration::from_secs(5), is_engine_idle);
    assert!(seen.iter().any(is_engine_idle));

    let recorded = device.recorded();
    assert!(!recorded.is_empty());
    assert!(device.max_abs() <= 1.0);
    // A tick may catch only one track; once both flow the sum is clamped
    assert!(recorded.iter().all(|&s| s == 1.0 || s == 0.75 || s == 0.5));
    assert!(recorded.iter().any(|&s| s == 1.0));
}

#[test]
fn test_live_input_is_gain_scaled_and_duplicated() {
    let device = Arc::new(
        NullDevice::paced(stereo(1000, 50))
            .with_input(DeviceOptions {
                sample_rate: 1000,
                channels: 1,
                buffer_size: 50,
            })
            .with_recording(),
    );
    let engine = engine_on(device.clone());
    assert!(engine.config().input.is_some());

    let input: Vec<f32> = (1..=100).map(|i| i as f32 / 200.0).collect();
    device.feed_input(&input);
    engine.record().unwrap();
    assert_eq!(engine.state(), PlaybackState::Recording);

    assert!(wait_until(Duration::from_secs(5), || {
        device.recorded().iter().filter(|&&s| s != 0.0).count() >= 200
    }));
    assert!(wait_until(Duration::from_secs(1), || engine.levels().1.is_some()));
    engine.stop().unwrap();
    assert_eq!(engine.state(), PlaybackState::Idle);

    let recorded = device.recorded();
    let pairs: Vec<(f32, f32)> = recorded
        .chunks_exact(2)
        .map(|p| (p[0], p[1]))
        .filter(|&(l, r)| l != 0.0 || r != 0.0)
        .collect();
    assert_eq!(pairs.len(), input.len());
    for (&(left, right), &x) in pairs.iter().zip(&input) {
        assert_eq!(left, right);
        assert!((left - x * 0.8).abs() < 1e-6);
    }
}

fn with_mono_input(output: DeviceOptions) -> NullDevice {
    NullDevice::paced(output)
        .with_input(DeviceOptions {
            sample_rate: 1000,
            channels: 1,
            buffer_size: 50,
        })
        .with_recording()
}

#[test]
fn test_input_track_is_the_recording_input() {
    let device = Arc::new(with_mono_input(stereo(1000, 50)));
    let engine = engine_on(device.clone());

    let input: Vec<f32> = (1..=400).map(|i| i as f32 / 1000.0).collect();
    device.feed_input(&input);
    let id = engine.add_input().unwrap();
    engine.record().unwrap();
    assert_eq!(engine.sources().len(), 1);

    assert!(wait_until(Duration::from_secs(5), || {
        device.recorded().iter().filter(|&&s| s != 0.0).count() >= 2 * input.len()
    }));
    engine.stop().unwrap();
    assert_eq!(engine.source(id).unwrap().state(), PlaybackState::Idle);

    // Every input sample arrives once, in order, at the recording gain
    let left: Vec<f32> = device
        .recorded()
        .chunks_exact(2)
        .filter(|p| p[0] != 0.0 || p[1] != 0.0)
        .map(|p| {
            assert_eq!(p[0], p[1]);
            p[0]
        })
        .collect();
    assert_eq!(left.len(), input.len());
    for (i, (&got, &x)) in left.iter().zip(&input).enumerate() {
        assert!((got - x * 0.8).abs() < 1e-6, "frame {}: {} for input {}", i, got, x);
    }
}

#[test]
fn test_loud_input_over_loud_file_stays_in_range() {
    let device = Arc::new(with_mono_input(stereo(1000, 50)));
    let engine = engine_on(device.clone());
    engine
        .load_file(Script::new(1000, 2, 1000).constant(0.9).factory())
        .unwrap();

    device.feed_input(&[1.0; 500]);
    engine.record().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        device.recorded().iter().filter(|&&s| s == 1.0).count() >= 200
    }));
    engine.stop().unwrap();

    assert!(device.max_abs() <= 1.0);
    // File alone, input alone, or both saturated
    for s in device.recorded() {
        assert!(
            [0.0, 0.8, 0.9, 1.0].iter().any(|v| (s - v).abs() < 1e-6),
            "unexpected sample {}",
            s
        );
    }
}

#[test]
fn test_drifted_source_is_pulled_back() {
    let device = Arc::new(NullDevice::paced(stereo(44100, 256)));
    let engine = engine_on(device);
    let a = engine.add_silent(Duration::from_secs(2), 2).unwrap();
    let b = engine.add_silent(Duration::from_secs(2), 2).unwrap();
    let a = engine.source(a).unwrap();
    let b = engine.source(b).unwrap();

    assert!(b.seek(Duration::from_millis(250)).unwrap());
    engine.play().unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        engine.position() > Duration::ZERO
            && distance(a.position(), b.position()) < Duration::from_millis(100)
    }));
    engine.stop().unwrap();
}

#[test]
fn test_decoder_failure_during_playback_recovers() {
    let device = Arc::new(NullDevice::new(stereo(1000, 10)).with_recording());
    let engine = engine_on(device.clone());
    let events = engine.subscribe();
    let factory = Script::new(1000, 1, 1000).ramp().chunk(25).fail_at(300).factory();
    let id = engine.load_file(factory.clone()).unwrap();
    // Keep the ramp inside the clamp range
    engine.source(id).unwrap().set_volume(0.001);
    engine.play().unwrap();

    let seen = wait_for_event(&events, Duration::from_secs(10), is_engine_idle);
    assert!(seen.iter().any(is_engine_idle));
    assert!(seen
        .iter()
        .any(|e| matches!(e, EngineEvent::DecoderRecovered { source, .. } if *source == id)));
    assert_eq!(factory.opens(), 2);

    let left: Vec<f32> = device.recorded().chunks_exact(2).map(|p| p[0]).collect();
    assert_eq!(left.len(), 1000);
    for (i, s) in left.iter().enumerate() {
        assert!((s - i as f32 * 0.001).abs() < 1e-4, "sample {} is {}", i, s);
    }
}

#[test]
fn test_seek_reports_refusing_sources() {
    let device = Arc::new(NullDevice::new(stereo(1000, 50)));
    let engine = engine_on(device);
    engine
        .load_file(Script::new(1000, 2, 2000).refuse_seek().factory())
        .unwrap();
    engine.add_silent(Duration::from_secs(2), 2).unwrap();

    assert!(!engine.seek(Duration::from_millis(500)).unwrap());
    assert_eq!(engine.position(), Duration::from_millis(500));
    assert!(engine.seek(Duration::ZERO).unwrap());
}

#[test]
fn test_surround_file_is_rejected() {
    let device = Arc::new(NullDevice::new(stereo(1000, 50)));
    let engine = engine_on(device);
    let result = engine.load_file(Script::new(1000, 6, 100).factory());
    assert!(matches!(
        result,
        Err(EngineError::UnsupportedChannelLayout { input: 6, output: 2 })
    ));
    assert!(engine.sources().is_empty());
}

#[test]
fn test_pause_holds_position() {
    let device = Arc::new(NullDevice::paced(stereo(1000, 20)));
    let engine = engine_on(device);
    engine.add_silent(Duration::from_secs(5), 2).unwrap();
    engine.play().unwrap();
    assert!(wait_until(Duration::from_secs(2), || engine.position()
        >= Duration::from_millis(100)));

    engine.pause().unwrap();
    assert_eq!(engine.state(), PlaybackState::Paused);
    std::thread::sleep(Duration::from_millis(50));
    let held = engine.position();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(engine.position(), held);

    engine.play().unwrap();
    assert_eq!(engine.state(), PlaybackState::Playing);
    assert!(wait_until(Duration::from_secs(2), || engine.position() > held));
    engine.stop().unwrap();
    assert_eq!(engine.position(), Duration::ZERO);
}

#[test]
fn test_capture_writes_the_live_mix() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mix.raw");

    let device = Arc::new(NullDevice::new(stereo(1000, 50)));
    let engine = engine_on(device);
    let events = engine.subscribe();
    engine
        .load_file(Script::new(1000, 2, 500).constant(0.25).factory())
        .unwrap();
    engine.set_volume(0.5);

    engine.start_capture(&path).unwrap();
    assert!(engine.is_capturing());
    engine.play().unwrap();
    let seen = wait_for_event(&events, Duration::from_secs(5), is_engine_idle);
    assert!(seen.iter().any(is_engine_idle));

    let summary = engine.stop_capture().unwrap().unwrap();
    assert!(!engine.is_capturing());
    assert_eq!(summary.samples, 1000);
    assert_eq!(summary.channels, 2);

    let samples = read_raw(&path).unwrap();
    assert_eq!(samples.len(), 1000);
    assert!(samples.iter().all(|&s| (s - 0.125).abs() < 1e-6));

    assert!(engine.stop_capture().unwrap().is_none());
}

#[test]
fn test_engines_are_independent() {
    let first = engine_on(Arc::new(NullDevice::new(stereo(1000, 50))));
    let second = engine_on(Arc::new(NullDevice::new(stereo(1000, 50))));
    first.add_silent(Duration::from_secs(1), 2).unwrap();
    assert_eq!(first.sources().len(), 1);
    assert!(second.sources().is_empty());
    second.set_volume(0.3);
    assert_eq!(first.volume(), 1.0);
}
