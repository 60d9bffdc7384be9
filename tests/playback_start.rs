use crossbeam_channel::Receiver;
use dvdcore::core::{PlaybackClock, PlayerSettings, StageKind};
use dvdcore::player::{
    PlaybackManager, PlayerContext, PlayerEvent, SyntheticConfig, SyntheticCue, SyntheticDecoderFactory,
    SyntheticDemuxer, VirtualOutputs,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn collect_until_end(events: &Receiver<PlayerEvent>, timeout: Duration) -> Vec<PlayerEvent> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => {
                let done = matches!(event, PlayerEvent::Ended | PlayerEvent::Stopped { .. });
                seen.push(event);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    seen
}

#[test]
fn audio_starts_with_three_quarters_of_sink_cache_and_plays_to_end() {
    init_logger();

    let settings = PlayerSettings::default();
    let clock = PlaybackClock::with_monotonic();
    let outputs = Arc::new(VirtualOutputs::new(clock.clone(), &settings));
    let ctx = PlayerContext::new(
        clock,
        settings,
        Arc::new(SyntheticDecoderFactory::default()),
        outputs.clone(),
    );
    let mut manager = PlaybackManager::with_context(ctx);

    let config = SyntheticConfig {
        duration_ms: 3_000,
        cues: vec![SyntheticCue {
            start_ms: 200,
            duration_ms: 800,
            text: "字幕".to_string(),
        }],
        ..SyntheticConfig::default()
    };
    let events = manager.open(Box::new(SyntheticDemuxer::new(config))).unwrap();
    let seen = collect_until_end(&events, Duration::from_secs(20));

    assert!(matches!(seen.first(), Some(PlayerEvent::Opened(_))), "{:?}", seen.first());

    let audio_start = seen
        .iter()
        .find_map(|event| match event {
            PlayerEvent::StageStarted(info) if info.stage == StageKind::Audio => Some(*info),
            _ => None,
        })
        .expect("audio stage never reported started");
    assert!(audio_start.cache_total > 0.0);
    assert!(
        audio_start.cache_time >= 0.75 * audio_start.cache_total,
        "cache_time={} cache_total={}",
        audio_start.cache_time,
        audio_start.cache_total
    );

    assert!(seen
        .iter()
        .any(|event| matches!(event, PlayerEvent::StageStarted(info) if info.stage == StageKind::Video)));
    assert!(matches!(seen.last(), Some(PlayerEvent::Ended)), "{:?}", seen.last());

    let stats = outputs.audio_stats().expect("no audio sink created");
    assert!(stats.frames_written() > 0);
    assert!(outputs.render_monitor().is_some());

    manager.stop();
    assert!(!manager.is_open());
}
