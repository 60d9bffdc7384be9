use crate::core::{time_to_msec, PlaybackClock, PlayerError, PlayerSettings, Result, PLAYSPEED_NORMAL, PLAYSPEED_PAUSE};
use crate::player::context::PlayerContext;
use crate::player::demuxer_source::{DemuxerSource, InputNavigator};
use crate::player::demuxer_thread::DemuxerThread;
use crate::player::event::PlayerEvent;
use crate::player::external_subtitle::ExternalSubtitleParser;
use crate::player::message::Message;
use crate::player::stage::log_ctx;
use crate::player::synthetic::{SyntheticDecoderFactory, VirtualOutputs};
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;

/// 播放管理器 - 整体控制播放流程
///
/// 把控制调用转换成发给解复用线程的 `PLAYER_*` 消息；
/// 速度变化与 Seek 会等到解复用线程处理完消息才返回。
pub struct PlaybackManager {
    ctx: PlayerContext,
    demuxer_thread: Option<DemuxerThread>,
    speed: i32,
}

impl PlaybackManager {
    /// 使用合成解码器与虚拟输出端创建管理器
    pub fn new(settings: PlayerSettings) -> Self {
        let clock = PlaybackClock::with_monotonic();
        let outputs = Arc::new(VirtualOutputs::new(clock.clone(), &settings));
        let ctx = PlayerContext::new(clock, settings, Arc::new(SyntheticDecoderFactory::default()), outputs);
        Self::with_context(ctx)
    }

    pub fn with_context(ctx: PlayerContext) -> Self {
        info!("{} 🎮 创建播放管理器", log_ctx());
        Self {
            ctx,
            demuxer_thread: None,
            speed: PLAYSPEED_NORMAL,
        }
    }

    pub fn context(&self) -> &PlayerContext {
        &self.ctx
    }

    /// 打开输入并启动解复用线程，返回事件接收端
    pub fn open(&mut self, source: Box<dyn DemuxerSource>) -> Result<Receiver<PlayerEvent>> {
        self.open_with_navigator(source, None)
    }

    pub fn open_with_navigator(
        &mut self,
        source: Box<dyn DemuxerSource>,
        navigator: Option<Box<dyn InputNavigator>>,
    ) -> Result<Receiver<PlayerEvent>> {
        if self.demuxer_thread.is_some() {
            info!("{} 🔄 已有播放会话，先停止", log_ctx());
            self.stop();
        }

        info!("{} 📂 打开输入: {}", log_ctx(), source.description());
        self.ctx.clock.reset();
        self.speed = PLAYSPEED_NORMAL;

        let thread = DemuxerThread::start(source, self.ctx.clone(), navigator)?;
        let events = thread.events();
        self.demuxer_thread = Some(thread);
        info!("{} 🚀 DemuxerThread 已启动", log_ctx());
        Ok(events)
    }

    pub fn is_open(&self) -> bool {
        self.demuxer_thread.as_ref().map_or(false, |thread| !thread.is_finished())
    }

    fn thread(&self) -> Result<&DemuxerThread> {
        self.demuxer_thread
            .as_ref()
            .ok_or_else(|| PlayerError::StreamError("没有打开的播放会话".to_string()))
    }

    /// 设置播放速度（1000 = 1.0x，0 = 暂停，负数为快退）
    pub fn set_speed(&mut self, speed: i32) -> Result<()> {
        let thread = self.thread()?;
        info!("{} ⏯ 设置播放速度: {}", log_ctx(), speed);
        thread.send(Message::PlayerSetSpeed(speed), 1)?;
        thread.synchronize();
        self.speed = speed;
        Ok(())
    }

    pub fn speed(&self) -> i32 {
        self.speed
    }

    pub fn pause(&mut self) -> Result<()> {
        info!("{} ⏸ 暂停", log_ctx());
        self.set_speed(PLAYSPEED_PAUSE)
    }

    pub fn resume(&mut self) -> Result<()> {
        info!("{} ▶ 继续播放", log_ctx());
        self.set_speed(PLAYSPEED_NORMAL)
    }

    /// Seek 到指定位置（毫秒），目标早于当前时间时向后查找关键帧
    pub fn seek(&self, position_ms: i64) -> Result<()> {
        let thread = self.thread()?;
        let backward = position_ms < self.current_time_ms();
        info!("{} 🎯 Seek 到: {} ms（backward={}）", log_ctx(), position_ms, backward);
        thread.send(
            Message::PlayerSeek {
                time_ms: position_ms.max(0),
                backward,
                flush: true,
            },
            0,
        )?;
        thread.synchronize();
        Ok(())
    }

    /// 切换音频流；负数关闭音频
    pub fn set_audio_stream(&self, id: i32) -> Result<()> {
        self.thread()?.send(Message::PlayerSetAudioStream(id), 0)
    }

    pub fn set_video_stream(&self, id: i32) -> Result<()> {
        self.thread()?.send(Message::PlayerSetVideoStream(id), 0)
    }

    pub fn set_subtitle_stream(&self, id: i32) -> Result<()> {
        self.thread()?.send(Message::PlayerSetSubtitleStream(id), 0)
    }

    /// 字幕开关；未打开会话时直接作用于上下文
    pub fn set_subtitle_visible(&self, visible: bool) -> Result<()> {
        match &self.demuxer_thread {
            Some(thread) => thread.send(Message::PlayerSetSubtitleVisible(visible), 0),
            None => {
                self.ctx.set_subtitles_visible(visible);
                Ok(())
            }
        }
    }

    /// 加载外部字幕文件，返回加入的字幕条数
    pub fn load_external_subtitle(&self, path: &Path) -> Result<usize> {
        info!("{} 📝 加载外部字幕文件: {}", log_ctx(), path.display());
        let cues = ExternalSubtitleParser::parse_subtitle_file(path)?;
        let count = cues.len();
        self.ctx.add_external_subtitles(cues);
        info!("{} ✅ 外部字幕加载完成，共 {} 条", log_ctx(), count);
        Ok(count)
    }

    /// 查找并加载媒体文件旁边的字幕（只加载第一个能解析的文件）
    pub fn load_subtitles_for_media(&self, media_path: &Path) -> usize {
        info!("{} 🔍 查找外部字幕文件: {}", log_ctx(), media_path.display());
        let subtitle_files = ExternalSubtitleParser::find_subtitle_files(media_path);
        if subtitle_files.is_empty() {
            info!("{} 未找到外部字幕文件", log_ctx());
            return 0;
        }

        for subtitle_file in &subtitle_files {
            match self.load_external_subtitle(subtitle_file) {
                Ok(count) => return count,
                Err(e) => error!("{} ❌ 解析外部字幕文件失败: {} - {}", log_ctx(), subtitle_file.display(), e),
            }
        }
        0
    }

    /// 请求一次状态上报（以 `PlayerEvent::StateReport` 返回）
    pub fn request_state(&self) -> Result<()> {
        self.thread()?.send(Message::PlayerReportState, 0)
    }

    /// 当前播放时间（毫秒）
    pub fn current_time_ms(&self) -> i64 {
        time_to_msec(self.ctx.clock.get_clock(true)) as i64
    }

    pub fn stop(&mut self) {
        info!("{} ⏹️  停止播放", log_ctx());
        if let Some(mut thread) = self.demuxer_thread.take() {
            info!("{} ⏹️  停止 DemuxerThread", log_ctx());
            thread.stop();
            info!("{} ✅ DemuxerThread 已停止", log_ctx());
        }
        self.ctx.reset_overlays();
        self.speed = PLAYSPEED_NORMAL;
        info!("{} ✅ 停止播放完成，所有线程已清理", log_ctx());
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        if self.demuxer_thread.is_some() {
            warn!("{} ⚠ PlaybackManager 被 drop，但可能未调用 stop()，正在尝试优雅停止", log_ctx());
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::synthetic::{SyntheticConfig, SyntheticDemuxer};
    use std::time::Duration;

    fn wait_for<F>(events: &Receiver<PlayerEvent>, timeout: Duration, mut pred: F) -> Option<PlayerEvent>
    where
        F: FnMut(&PlayerEvent) -> bool,
    {
        let deadline = std::time::Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_controls_without_session_fail() {
        let mut manager = PlaybackManager::new(PlayerSettings::default());
        assert!(!manager.is_open());
        assert!(manager.pause().is_err());
        assert!(manager.seek(1000).is_err());
        assert!(manager.request_state().is_err());

        manager.set_subtitle_visible(false).unwrap();
        assert!(!manager.context().subtitles_visible());
    }

    #[test]
    fn test_pause_resume_and_seek() {
        let mut manager = PlaybackManager::new(PlayerSettings::default());
        let config = SyntheticConfig {
            duration_ms: 20_000,
            ..SyntheticConfig::default()
        };
        let events = manager.open(Box::new(SyntheticDemuxer::new(config))).unwrap();
        assert!(wait_for(&events, Duration::from_secs(5), |e| matches!(e, PlayerEvent::StageStarted(_))).is_some());

        manager.pause().unwrap();
        assert_eq!(manager.speed(), PLAYSPEED_PAUSE);
        manager.resume().unwrap();
        assert_eq!(manager.speed(), PLAYSPEED_NORMAL);

        manager.seek(10_000).unwrap();
        let seeked = wait_for(&events, Duration::from_secs(5), |e| matches!(e, PlayerEvent::Seeked { .. }));
        assert!(matches!(seeked, Some(PlayerEvent::Seeked { time_ms: 10_000 })));

        manager.request_state().unwrap();
        assert!(wait_for(&events, Duration::from_secs(5), |e| matches!(e, PlayerEvent::StateReport(_))).is_some());

        manager.stop();
        assert!(!manager.is_open());
    }

    #[test]
    fn test_external_subtitle_survives_seek_flush() {
        let path = std::env::temp_dir().join(format!("dvdcore-manager-{}.srt", std::process::id()));
        std::fs::write(&path, "1\n00:00:01,000 --> 00:00:02,000\n外挂字幕\n").unwrap();

        let mut manager = PlaybackManager::new(PlayerSettings::default());
        assert_eq!(manager.load_external_subtitle(&path).unwrap(), 1);
        assert!(manager.load_external_subtitle(&path.with_extension("txt")).is_err());

        let events = manager
            .open(Box::new(SyntheticDemuxer::new(SyntheticConfig {
                duration_ms: 10_000,
                ..SyntheticConfig::default()
            })))
            .unwrap();
        manager.seek(0).unwrap();
        assert!(wait_for(&events, Duration::from_secs(5), |e| matches!(e, PlayerEvent::Seeked { .. })).is_some());
        assert!(!manager.context().overlays.overlays_at(1_500_000.0).is_empty());

        manager.stop();
        let _ = std::fs::remove_file(&path);
    }
}
