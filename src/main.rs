use anyhow::Result;
use dvdcore::core::{PlaybackClock, PlayerSettings};
use dvdcore::player::{
    DemuxerSource, OutputFactory, PlaybackManager, PlayerContext, PlayerEvent, SyntheticConfig, SyntheticCue,
    SyntheticDecoderFactory, SyntheticDemuxer, VirtualOutputs,
};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// 命令行：`dvdcore [settings.json] [媒体文件]`
struct Args {
    settings: Option<PathBuf>,
    media: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args = Args { settings: None, media: None };
    for arg in std::env::args().skip(1) {
        let path = PathBuf::from(arg);
        if path.extension().map_or(false, |ext| ext == "json") {
            args.settings = Some(path);
        } else {
            args.media = Some(path);
        }
    }
    args
}

fn build_outputs(clock: &PlaybackClock, settings: &PlayerSettings) -> Arc<dyn OutputFactory> {
    let outputs = VirtualOutputs::new(clock.clone(), settings);
    #[cfg(feature = "cpal")]
    let outputs: Arc<dyn OutputFactory> = {
        info!("🔊 使用声卡音频输出");
        Arc::new(dvdcore::player::CpalOutputs::new(outputs, settings))
    };
    #[cfg(not(feature = "cpal"))]
    let outputs: Arc<dyn OutputFactory> = Arc::new(outputs);
    outputs
}

#[cfg(feature = "ffmpeg")]
fn open_media(path: &Path) -> Result<Box<dyn DemuxerSource>> {
    let demuxer = dvdcore::player::FfmpegDemuxer::open(&path.to_string_lossy())?;
    Ok(Box::new(demuxer))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_media(path: &Path) -> Result<Box<dyn DemuxerSource>> {
    warn!("⚠ 未启用 ffmpeg 特性，忽略 {}，改为播放合成输入", path.display());
    Ok(synthetic_source())
}

fn synthetic_source() -> Box<dyn DemuxerSource> {
    let config = SyntheticConfig {
        duration_ms: 5_000,
        cues: vec![
            SyntheticCue { start_ms: 500, duration_ms: 1_500, text: "你好".to_string() },
            SyntheticCue { start_ms: 2_500, duration_ms: 1_500, text: "再见".to_string() },
        ],
        ..SyntheticConfig::default()
    };
    Box::new(SyntheticDemuxer::new(config))
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 dvdcore 启动");
    let args = parse_args();

    let settings = match &args.settings {
        Some(path) => {
            info!("⚙ 读取配置: {}", path.display());
            PlayerSettings::from_json_file(path)?
        }
        None => PlayerSettings::default(),
    };
    let report_interval = Duration::from_millis(settings.report_interval_ms.max(100));

    let clock = PlaybackClock::with_monotonic();
    let outputs = build_outputs(&clock, &settings);
    let ctx = PlayerContext::new(clock, settings, Arc::new(SyntheticDecoderFactory::default()), outputs);
    let mut manager = PlaybackManager::with_context(ctx);

    if let Some(media) = &args.media {
        manager.load_subtitles_for_media(media);
    }
    let source = match &args.media {
        Some(media) => open_media(media)?,
        None => synthetic_source(),
    };
    let events = manager.open(source)?;

    loop {
        match events.recv_timeout(report_interval) {
            Ok(PlayerEvent::Ended) => {
                info!("🏁 播放结束");
                break;
            }
            Ok(PlayerEvent::Stopped { reason }) => {
                warn!("⏹ 播放停止: {}", reason);
                break;
            }
            Ok(PlayerEvent::StateReport(state)) => info!(
                "📊 {}ms / {}ms，缓冲 {}%，速度 {}",
                state.position, state.duration, state.cache_level, state.speed
            ),
            Ok(event) => info!("📨 {:?}", event),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                let overlays = manager.context().overlays.overlays_at(manager.context().clock.get_clock(false));
                if !overlays.is_empty() {
                    info!("💬 当前字幕: {:?}", overlays.iter().map(|o| &o.content).collect::<Vec<_>>());
                }
                manager.request_state()?;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    manager.stop();
    Ok(())
}
