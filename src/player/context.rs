use crate::core::{PlaybackClock, PlayerSettings, StreamKind};
use crate::player::audio_sink::AudioSink;
use crate::player::decoder::DecoderFactory;
use crate::player::demuxer_source::AncillarySink;
use crate::player::external_subtitle::SubtitleCue;
use crate::player::overlay::OverlayContainer;
use crate::player::video_renderer::VideoRenderer;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 输出端工厂
///
/// 每个输出阶段启动时向工厂要一个独占的输出端。
pub trait OutputFactory: Send + Sync {
    fn create_audio_sink(&self) -> Box<dyn AudioSink>;

    fn create_video_renderer(&self) -> Box<dyn VideoRenderer>;

    /// 图文电视 / RDS / ID3 接收端；返回 None 表示不处理该类数据
    fn create_ancillary_sink(&self, _kind: StreamKind) -> Option<Box<dyn AncillarySink>> {
        None
    }
}

/// 一次播放会话共享的依赖
///
/// 所有线程拿到的是同一份克隆，不存在全局查找。
#[derive(Clone)]
pub struct PlayerContext {
    pub clock: PlaybackClock,
    pub settings: Arc<PlayerSettings>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub outputs: Arc<dyn OutputFactory>,
    pub overlays: Arc<OverlayContainer>,
    subtitles_visible: Arc<AtomicBool>,
    /// 外部字幕事件，叠加层被清空后重新放回容器
    external_cues: Arc<Mutex<Vec<SubtitleCue>>>,
}

impl PlayerContext {
    pub fn new(
        clock: PlaybackClock,
        settings: PlayerSettings,
        decoders: Arc<dyn DecoderFactory>,
        outputs: Arc<dyn OutputFactory>,
    ) -> Self {
        Self {
            clock,
            settings: Arc::new(settings),
            decoders,
            outputs,
            overlays: Arc::new(OverlayContainer::new()),
            subtitles_visible: Arc::new(AtomicBool::new(true)),
            external_cues: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subtitles_visible(&self) -> bool {
        self.subtitles_visible.load(Ordering::SeqCst)
    }

    pub fn set_subtitles_visible(&self, visible: bool) {
        self.subtitles_visible.store(visible, Ordering::SeqCst);
    }

    /// 加入外部字幕事件并立即放进叠加层容器
    pub fn add_external_subtitles(&self, cues: Vec<SubtitleCue>) {
        let mut external = self.external_cues.lock();
        for cue in &cues {
            self.overlays.add(Arc::new(cue.to_overlay()));
        }
        external.extend(cues);
    }

    pub fn external_subtitle_count(&self) -> usize {
        self.external_cues.lock().len()
    }

    /// 清空叠加层，然后放回外部字幕
    ///
    /// 持有外部字幕锁完成整个过程，并发重置不会产生重复叠加层。
    pub fn reset_overlays(&self) {
        let external = self.external_cues.lock();
        self.overlays.clear();
        for cue in external.iter() {
            self.overlays.add(Arc::new(cue.to_overlay()));
        }
        if !external.is_empty() {
            debug!("💬 重新载入 {} 条外部字幕", external.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::overlay::{Overlay, OverlayContent};
    use crate::player::synthetic::{SyntheticDecoderFactory, VirtualOutputs};

    #[test]
    fn test_reset_overlays_restores_external_subtitles() {
        let clock = PlaybackClock::with_monotonic();
        let settings = PlayerSettings::default();
        let outputs = Arc::new(VirtualOutputs::new(clock.clone(), &settings));
        let ctx = PlayerContext::new(clock, settings, Arc::new(SyntheticDecoderFactory::default()), outputs);

        ctx.add_external_subtitles(vec![SubtitleCue {
            start: 1_000_000.0,
            stop: 2_000_000.0,
            content: OverlayContent::Text("外挂".to_string()),
        }]);
        ctx.overlays.add(Arc::new(Overlay::new(0.0, Some(5_000_000.0), OverlayContent::Spu(vec![1]))));
        assert_eq!(ctx.overlays.len(), 2);

        ctx.reset_overlays();
        ctx.reset_overlays();
        let remaining = ctx.overlays.get_overlays();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, OverlayContent::Text("外挂".to_string()));
        assert_eq!(ctx.external_subtitle_count(), 1);
    }
}
