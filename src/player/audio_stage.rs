//! 音频输出阶段
//!
//! 解码 → 写入输出端 → 计算同步误差并修正（断点模式或重采样模式）。

use crate::core::{
    msec_to_time, time_to_msec, AudioFormat, AudioFrame, DemuxPacket, StageKind, StreamHints, SyncState,
    PLAYSPEED_NORMAL, PLAYSPEED_PAUSE, TIME_BASE,
};
use crate::player::audio_sink::AudioSink;
use crate::player::context::PlayerContext;
use crate::player::decoder::AudioDecoder;
use crate::player::message::{CodecHandle, Message, StartInfo, SyncSources};
use crate::player::message_queue::QueueError;
use crate::player::stage::{log_ctx, should_log, StageLink};
use crate::player::sync_error::{ResampleController, SyncErrorLearner};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// 缓存达到总量的这个比例后进入 WAITSYNC
const START_CACHE_RATIO: f64 = 0.75;

/// 超过该误差立即修正时钟
const IMMEDIATE_ERROR: f64 = 100_000.0;

/// 同步误差的平均窗口（绝对时间）
const ERROR_WINDOW: f64 = TIME_BASE;

/// 音频阶段线程入口
pub fn audio_stage_task(ctx: PlayerContext, hints: StreamHints, decoder: Box<dyn AudioDecoder>, link: StageLink) {
    let sink = ctx.outputs.create_audio_sink();
    let mut stage = AudioStage::new(ctx, hints, decoder, sink, link);
    stage.run();
    stage.shutdown();
}

struct AudioStage {
    ctx: PlayerContext,
    link: StageLink,
    hints: StreamHints,
    decoder: Box<dyn AudioDecoder>,
    sink: Box<dyn AudioSink>,

    sync: SyncState,
    speed: i32,
    paused: bool,
    only_prio: bool,

    /// 已写入输出端数据末尾的时间戳
    audio_clock: Option<f64>,
    frame_duration: f64,
    pending: Option<(AudioFrame, usize)>,

    resample: bool,
    learner: SyncErrorLearner,
    controller: ResampleController,
    error_sum: f64,
    error_count: u32,
    error_window_start: Option<f64>,

    packets: u64,
    frames: u64,
}

impl AudioStage {
    fn new(
        ctx: PlayerContext,
        hints: StreamHints,
        decoder: Box<dyn AudioDecoder>,
        sink: Box<dyn AudioSink>,
        link: StageLink,
    ) -> Self {
        let learner = SyncErrorLearner::from_settings(&ctx.settings);
        Self {
            ctx,
            link,
            hints,
            decoder,
            sink,
            sync: SyncState::Starting,
            speed: PLAYSPEED_NORMAL,
            paused: false,
            only_prio: false,
            audio_clock: None,
            frame_duration: msec_to_time(20.0),
            pending: None,
            resample: false,
            learner,
            controller: ResampleController::new(),
            error_sum: 0.0,
            error_count: 0,
            error_window_start: None,
            packets: 0,
            frames: 0,
        }
    }

    fn run(&mut self) {
        info!(
            "{} 🔊 音频阶段启动: codec={} {}Hz {}ch 解码器={}",
            log_ctx(),
            self.hints.codec,
            self.hints.sample_rate,
            self.hints.channels,
            self.decoder.name()
        );

        loop {
            let (priority, timeout) = if self.pending.is_some() {
                (1, Duration::from_millis(10))
            } else if self.only_prio {
                (1, Duration::ZERO)
            } else if self.sync == SyncState::WaitSync || self.paused {
                (1, Duration::from_millis(100))
            } else {
                (0, Duration::from_millis(100))
            };
            self.only_prio = false;

            match self.link.inbox.get(timeout, priority) {
                Ok((msg, _)) => {
                    if !self.handle_message(msg) {
                        break;
                    }
                }
                Err(QueueError::Timeout) => self.on_timeout(),
                Err(QueueError::Abort) | Err(QueueError::NotInitialized) => {
                    debug!("{} 🔊 音频阶段收到中止", log_ctx());
                    break;
                }
                Err(e) => warn!("{} ⚠ 音频阶段取消息失败: {}", log_ctx(), e),
            }
        }

        info!("{} 🔊 音频阶段退出（{} 个包，{} 帧）", log_ctx(), self.packets, self.frames);
    }

    fn shutdown(&mut self) {
        self.pending = None;
        self.sink.destroy();
        self.decoder.dispose();
    }

    fn on_timeout(&mut self) {
        if self.pending.is_some() {
            self.output_pending();
            return;
        }
        if self.link.inbox.is_empty() && !self.link.status.is_stalled() {
            debug!("{} 🔊 音频输入为空，标记为 stalled", log_ctx());
            self.link.status.set_stalled(true);
        }
    }

    /// 返回 false 表示退出线程
    fn handle_message(&mut self, msg: Arc<Message>) -> bool {
        match &*msg {
            Message::DemuxerPacket { packet, drop } => self.handle_packet(&msg, packet, *drop),
            Message::GeneralSynchronize(barrier) => {
                if barrier.wait(Duration::from_millis(100), SyncSources::AUDIO) {
                    debug!("{} 🔊 GENERAL_SYNCHRONIZE 已放行", log_ctx());
                } else {
                    // 放回高优先级，先处理其它控制消息
                    self.link.requeue(msg.clone(), 1, false);
                }
            }
            Message::GeneralResync { pts, set_clock } => self.handle_resync(*pts, *set_clock),
            Message::GeneralReset => {
                self.decoder.reset();
                self.pending = None;
            }
            Message::GeneralFlush { sync } => self.handle_flush(*sync),
            Message::GeneralEof => {
                debug!("{} 🔊 GENERAL_EOF", log_ctx());
                self.output_pending();
                if self.sync == SyncState::Starting {
                    self.send_started();
                } else if self.sync == SyncState::InSync && !self.paused && self.speed == PLAYSPEED_NORMAL {
                    self.sink.drain();
                }
            }
            Message::GeneralDelay(delay) => self.link.sleep(*delay),
            Message::GeneralPause(pause) => {
                self.paused = *pause;
                if self.paused {
                    self.sink.pause();
                } else if self.sync == SyncState::InSync && self.speed != PLAYSPEED_PAUSE {
                    self.sink.resume();
                }
            }
            Message::PlayerSetSpeed(speed) => self.handle_speed(*speed),
            Message::GeneralStreamChange(change) => match change.take_codec() {
                Some(CodecHandle::Audio(decoder)) => {
                    info!("{} 🔊 音频流变更: codec={} {}Hz", log_ctx(), change.hints.codec, change.hints.sample_rate);
                    self.decoder.dispose();
                    self.decoder = decoder;
                    self.hints = change.hints.clone();
                    self.pending = None;
                    self.audio_clock = None;
                    self.set_sync(SyncState::Starting);
                    self.sink.pause();
                }
                Some(CodecHandle::Video(_)) => warn!("{} ⚠ 音频阶段收到视频解码器，忽略", log_ctx()),
                None => warn!("{} ⚠ 流变更消息中的解码器已被取走", log_ctx()),
            },
            Message::PlayerReportState => {}
            other => debug!("{} 🔊 音频阶段忽略消息 {:?}", log_ctx(), other.kind()),
        }
        true
    }

    fn handle_packet(&mut self, msg: &Arc<Message>, packet: &DemuxPacket, drop: bool) {
        self.link.status.set_stalled(false);
        self.packets += 1;
        if should_log(self.packets) {
            debug!(
                "{} 🔊 音频包 #{} pts={:?} size={} drop={}",
                log_ctx(),
                self.packets,
                packet.pts,
                packet.size(),
                drop
            );
        }

        let accepted = self.decoder.add_data(packet);
        self.decode_output(drop);
        if !accepted {
            self.link.requeue(msg.clone(), 0, true);
            self.only_prio = true;
        }
    }

    /// 倍速但不允许变调时，解码结果直接丢弃
    fn discard_output(&self) -> bool {
        self.speed != PLAYSPEED_PAUSE && self.speed != PLAYSPEED_NORMAL && !self.ctx.settings.is_tempo_allowed(self.speed)
    }

    fn decode_output(&mut self, drop: bool) {
        loop {
            if self.pending.is_some() && !self.output_pending() {
                return;
            }
            let Some(frame) = self.decoder.get_data() else { break };

            if drop || self.discard_output() {
                if let Some(pts) = frame.pts {
                    self.audio_clock = Some(pts + frame.duration);
                }
                continue;
            }
            self.pending = Some((frame, 0));
        }
    }

    /// 把挂起的帧写入输出端；全部写完返回 true
    fn output_pending(&mut self) -> bool {
        let Some((frame, offset)) = self.pending.take() else { return true };

        if let Err(e) = self.ensure_sink(frame.format) {
            error!("{} ❌ 打开音频输出失败，丢弃帧: {}", log_ctx(), e);
            return true;
        }

        if offset == 0 {
            if let Some(pts) = frame.pts {
                self.audio_clock = Some(pts);
            } else if self.audio_clock.is_none() {
                self.audio_clock = Some(0.0);
            }
            if frame.duration > 0.0 {
                self.frame_duration = frame.duration;
            }
        }

        let written = self.sink.add_packets(&frame, offset);
        if frame.nb_frames > 0 {
            let advance = frame.duration * written as f64 / frame.nb_frames as f64;
            self.audio_clock = self.audio_clock.map(|clock| clock + advance);
        }

        let done = offset + written >= frame.nb_frames;
        if done {
            self.frames += 1;
            self.link.status.set_current_pts(self.audio_clock);
        } else {
            self.pending = Some((frame, offset + written));
        }

        if self.sync == SyncState::Starting && self.sink.cache_time() >= START_CACHE_RATIO * self.sink.cache_total() {
            self.send_started();
        }

        if self.sync == SyncState::InSync && self.speed == PLAYSPEED_NORMAL && !self.paused {
            self.handle_sync_error();
        }
        done
    }

    /// 格式变化时重建输出端（不离开线程）
    fn ensure_sink(&mut self, format: AudioFormat) -> crate::core::Result<()> {
        if self.sink.format() == Some(format) {
            return Ok(());
        }

        if self.sink.format().is_some() {
            info!("{} 🔊 音频格式变化，重建输出: {} Hz {} 声道", log_ctx(), format.sample_rate, format.channels);
            self.sink.drain();
            self.sink.destroy();
        }

        self.sink.create(format)?;

        self.resample = self.ctx.settings.use_display_as_clock && !format.passthrough;
        self.sink.set_resample_mode(self.resample);
        self.ctx
            .clock
            .set_max_speed_adjust(if self.resample { self.ctx.settings.max_speed_adjust } else { 0.0 });
        self.controller.reset();

        if self.sync == SyncState::InSync && !self.paused && self.speed != PLAYSPEED_PAUSE {
            self.sink.resume();
        } else {
            self.sink.pause();
        }

        self.link.notify_parent(Message::PlayerAvChange(StageKind::Audio), 1);
        Ok(())
    }

    fn set_sync(&mut self, state: SyncState) {
        self.sync = state;
        self.link.status.set_sync_state(state);
    }

    fn send_started(&mut self) {
        self.set_sync(SyncState::WaitSync);
        let info = StartInfo {
            stage: StageKind::Audio,
            cache_time: self.sink.cache_time(),
            cache_total: self.sink.cache_total(),
            timestamp: self.audio_clock,
        };
        info!(
            "{} 🔊 音频缓冲就绪 → WAITSYNC: cache={:.0}ms / {:.0}ms, ts={:?}",
            log_ctx(),
            time_to_msec(info.cache_time),
            time_to_msec(info.cache_total),
            info.timestamp
        );
        self.link.notify_parent(Message::PlayerStarted(info), 1);
        self.link.notify_parent(Message::PlayerAvChange(StageKind::Audio), 1);
    }

    /// WAITSYNC/STARTING：`pts` 为此刻应播放的时间；INSYNC：`pts` 为下一个数据的时间戳
    fn handle_resync(&mut self, pts: f64, set_clock: bool) {
        let delay = self.sink.delay();

        if self.sync == SyncState::InSync {
            self.audio_clock = Some(pts);
            if set_clock {
                self.ctx.clock.discontinuity(pts - delay);
            }
        } else {
            if let Some(clock) = self.audio_clock {
                let estimate = clock - delay;
                if (estimate - pts).abs() > self.frame_duration / 2.0 {
                    debug!(
                        "{} 🔊 RESYNC 偏差 {:.1}ms，清空输出缓存",
                        log_ctx(),
                        time_to_msec(estimate - pts)
                    );
                    self.sink.flush();
                }
            }
            self.audio_clock = Some(pts + self.sink.delay());
            if set_clock {
                self.ctx.clock.discontinuity(pts);
            }
        }

        self.reset_sync_error();
        if !self.paused && self.speed != PLAYSPEED_PAUSE {
            self.sink.resume();
        }
        self.set_sync(SyncState::InSync);
        info!("{} 🔊 GENERAL_RESYNC({:.0}, set_clock={}) → INSYNC", log_ctx(), pts, set_clock);
    }

    fn handle_flush(&mut self, sync: bool) {
        debug!("{} 🔊 GENERAL_FLUSH sync={}", log_ctx(), sync);
        self.sink.flush();
        self.pending = None;
        self.audio_clock = None;
        self.decoder.reset();
        self.reset_sync_error();
        self.link.status.set_stalled(true);
        if sync {
            self.set_sync(SyncState::Starting);
            self.sink.pause();
        }
    }

    fn handle_speed(&mut self, speed: i32) {
        self.speed = speed;
        if speed == PLAYSPEED_PAUSE {
            self.sink.pause();
        } else if !self.ctx.settings.is_tempo_allowed(speed) {
            debug!("{} 🔊 速度 {} 超出变调范围，静音输出", log_ctx(), speed);
            self.sink.pause();
            self.sink.flush();
        } else {
            self.sink.set_tempo(speed as f64 / PLAYSPEED_NORMAL as f64);
            if self.sync == SyncState::InSync && !self.paused {
                self.sink.resume();
            }
        }
    }

    fn reset_sync_error(&mut self) {
        self.error_sum = 0.0;
        self.error_count = 0;
        self.error_window_start = None;
        self.controller.reset();
    }

    fn handle_sync_error(&mut self) {
        let Some(audio_clock) = self.audio_clock else { return };
        let (clock, absolute) = self.ctx.clock.get_clock_with_absolute(false);
        let error = audio_clock - self.sink.delay() - clock;

        if error.abs() > IMMEDIATE_ERROR {
            let applied = self.ctx.clock.error_adjust(error, "audio");
            debug!(
                "{} 🔊 同步误差 {:.1}ms 过大，立即修正 {:.1}ms",
                log_ctx(),
                time_to_msec(error),
                time_to_msec(applied)
            );
            self.reset_sync_error();
            return;
        }

        self.error_sum += error;
        self.error_count += 1;
        let window_start = *self.error_window_start.get_or_insert(absolute);
        if absolute - window_start < ERROR_WINDOW {
            return;
        }

        let average = self.error_sum / self.error_count as f64;
        self.error_sum = 0.0;
        self.error_count = 0;
        self.error_window_start = Some(absolute);

        if self.resample {
            let ratio = self.controller.update(
                average,
                self.ctx.clock.clock_speed(),
                self.ctx.settings.max_speed_adjust,
            );
            self.sink.set_resample_ratio(ratio);
            return;
        }

        let threshold = self.learner.threshold();
        if average.abs() > threshold {
            let applied = self.ctx.clock.error_adjust(average, "audio");
            let residual = average - applied;
            if applied != 0.0 {
                debug!(
                    "{} 🔊 断点修正: 误差 {:.1}ms 阈值 {:.1}ms 剩余 {:.1}ms",
                    log_ctx(),
                    time_to_msec(average),
                    time_to_msec(threshold),
                    time_to_msec(residual)
                );
            }
            // 未被时钟吸收的部分计入下一个窗口
            self.error_sum = residual;
            self.error_count = 1;
        }
        self.learner.observe(average.abs(), absolute);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualReferenceClock, PlaybackClock, PlayerSettings};
    use crate::player::audio_sink::{SinkStats, VirtualAudioSink};
    use crate::player::message::StreamChange;
    use crate::player::context::PlayerContext;
    use crate::player::message_queue::MessageQueue;
    use crate::player::stage::StageStatus;
    use crate::player::sync_error::LearnerPhase;
    use crate::player::synthetic::{SyntheticAudioDecoder, SyntheticDecoderFactory, VirtualOutputs};

    fn setup(settings: PlayerSettings) -> (Arc<ManualReferenceClock>, AudioStage, Arc<MessageQueue>) {
        let (reference, stage, parent, _stats) = setup_with_stats(settings);
        (reference, stage, parent)
    }

    fn setup_with_stats(
        settings: PlayerSettings,
    ) -> (Arc<ManualReferenceClock>, AudioStage, Arc<MessageQueue>, Arc<SinkStats>) {
        let reference = Arc::new(ManualReferenceClock::new());
        let clock = PlaybackClock::new(reference.clone());
        let outputs = Arc::new(VirtualOutputs::new(clock.clone(), &settings));
        let ctx = PlayerContext::new(clock, settings, Arc::new(SyntheticDecoderFactory::default()), outputs);

        let parent = Arc::new(MessageQueue::new("parent"));
        parent.init();
        let inbox = Arc::new(MessageQueue::new("audio"));
        inbox.init();
        let link = StageLink { inbox, parent: parent.clone(), status: Arc::new(StageStatus::default()) };

        let hints = StreamHints::audio("pcm", 48000, 2);
        let sink = VirtualAudioSink::new(reference.clone(), ctx.settings.sink_cache_secs);
        let stats = sink.stats();
        let decoder = Box::new(SyntheticAudioDecoder::new(&hints));
        (reference, AudioStage::new(ctx, hints, decoder, Box::new(sink), link), parent, stats)
    }

    fn packet(pts: f64) -> Arc<Message> {
        Message::packet(
            DemuxPacket {
                data: vec![0; 64],
                pts: Some(pts),
                dts: Some(pts),
                duration: Some(20_000.0),
                ..Default::default()
            },
            false,
        )
    }

    fn feed(stage: &mut AudioStage, from: usize, count: usize) {
        for i in from..from + count {
            let msg = packet(i as f64 * 20_000.0);
            assert!(stage.handle_message(msg));
        }
    }

    #[test]
    fn test_starting_reports_wait_sync_at_cache_threshold() {
        let (_reference, mut stage, parent) = setup(PlayerSettings::default());
        // 500ms 缓存，75% 需要 19 个 20ms 的包
        feed(&mut stage, 0, 18);
        assert_eq!(stage.sync, SyncState::Starting);
        feed(&mut stage, 18, 1);
        assert_eq!(stage.sync, SyncState::WaitSync);

        let (msg, priority) = parent.get(Duration::ZERO, 0).unwrap();
        assert_eq!(priority, 1);
        match &*msg {
            Message::PlayerStarted(info) => {
                assert_eq!(info.stage, StageKind::Audio);
                assert!(info.cache_time >= 0.75 * info.cache_total);
                assert_eq!(info.timestamp, Some(19.0 * 20_000.0));
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn test_resync_in_wait_sync_adopts_reference() {
        let (_reference, mut stage, _parent) = setup(PlayerSettings::default());
        feed(&mut stage, 0, 19);
        assert_eq!(stage.sync, SyncState::WaitSync);

        stage.handle_message(Arc::new(Message::GeneralResync { pts: 0.0, set_clock: false }));
        assert_eq!(stage.sync, SyncState::InSync);
        assert_eq!(stage.link.status.sync_state(), SyncState::InSync);
        // 缓存从 0 开始，与参考一致，不清空
        assert_eq!(stage.audio_clock, Some(19.0 * 20_000.0));
    }

    #[test]
    fn test_flush_returns_to_starting_and_marks_stalled() {
        let (_reference, mut stage, _parent) = setup(PlayerSettings::default());
        feed(&mut stage, 0, 5);
        stage.handle_message(Arc::new(Message::GeneralFlush { sync: true }));
        assert_eq!(stage.sync, SyncState::Starting);
        assert!(stage.link.status.is_stalled());
        assert_eq!(stage.sink.cache_time(), 0.0);
        assert!(stage.audio_clock.is_none());
    }

    #[test]
    fn test_eof_while_starting_sends_started() {
        let (_reference, mut stage, parent) = setup(PlayerSettings::default());
        feed(&mut stage, 0, 2);
        stage.handle_message(Arc::new(Message::GeneralEof));
        assert_eq!(stage.sync, SyncState::WaitSync);
        assert!(!parent.is_empty());
    }

    #[test]
    fn test_disallowed_tempo_discards_output() {
        let (_reference, mut stage, _parent) = setup(PlayerSettings::default());
        stage.handle_message(Arc::new(Message::PlayerSetSpeed(4000)));
        feed(&mut stage, 0, 3);
        assert_eq!(stage.sink.cache_time(), 0.0);
        assert_eq!(stage.audio_clock, Some(3.0 * 20_000.0));
    }

    #[test]
    fn test_large_sync_error_moves_clock() {
        let (reference, mut stage, _parent) = setup(PlayerSettings::default());
        stage.ctx.clock.discontinuity(0.0);
        feed(&mut stage, 0, 19);
        stage.handle_message(Arc::new(Message::GeneralResync { pts: 0.0, set_clock: false }));

        // 时钟落后音频 1 秒
        stage.ctx.clock.discontinuity(-1_000_000.0);
        reference.advance_ms(20.0);
        feed(&mut stage, 19, 1);
        let clock = stage.ctx.clock.get_clock(false);
        assert!(clock > -100_000.0, "clock = {}", clock);
    }

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 48000,
        channels: 2,
        passthrough: false,
    };

    /// 进入 INSYNC 且时钟从 0 开始，输出端为空
    fn in_sync(stage: &mut AudioStage) {
        stage.ensure_sink(FORMAT).unwrap();
        stage.ctx.clock.discontinuity(0.0);
        stage.set_sync(SyncState::InSync);
    }

    /// 一个完整的误差平均窗口：窗口起点和 1 秒后各采样一次，音频都领先时钟 `error`
    fn sync_window(stage: &mut AudioStage, reference: &ManualReferenceClock, error: f64) {
        stage.audio_clock = Some(stage.ctx.clock.get_clock(false) + error);
        stage.handle_sync_error();
        reference.advance_ms(1_000.0);
        stage.audio_clock = Some(stage.ctx.clock.get_clock(false) + error);
        stage.handle_sync_error();
    }

    #[test]
    fn test_resample_mode_feeds_ratio_to_sink() {
        let settings = PlayerSettings {
            use_display_as_clock: true,
            ..Default::default()
        };
        let (reference, mut stage, _parent, stats) = setup_with_stats(settings);
        in_sync(&mut stage);
        assert!(stage.resample);
        assert_eq!(stats.resample_ratio(), None);

        let before = stage.ctx.clock.get_clock(false);
        sync_window(&mut stage, &reference, msec_to_time(20.0));

        // 音频领先：放慢消耗，比值 > 1 且在最大修正范围内
        let ratio = stats.resample_ratio().expect("重采样比没有送到输出端");
        assert!(ratio > 1.0 && ratio <= 1.05, "ratio = {}", ratio);
        // 重采样模式不移动时钟
        let after = stage.ctx.clock.get_clock(false);
        assert!((after - before - TIME_BASE).abs() < 10.0, "clock moved by {}", after - before);
    }

    #[test]
    fn test_discontinuity_mode_respects_learned_threshold() {
        let (reference, mut stage, _parent) = setup(PlayerSettings::default());
        in_sync(&mut stage);
        assert!(!stage.resample);

        // 学到 20ms 抖动，余量 2 倍 -> 阈值 40ms
        stage.learner = SyncErrorLearner::new(msec_to_time(10.0), msec_to_time(100.0), TIME_BASE, 2.0);
        stage.learner.observe(msec_to_time(20.0), 0.0);
        stage.learner.observe(0.0, TIME_BASE);
        assert_eq!(stage.learner.phase(), LearnerPhase::Fixed { threshold: msec_to_time(40.0) });

        // 阈值以内：时钟只随参考推进
        let before = stage.ctx.clock.get_clock(false);
        sync_window(&mut stage, &reference, msec_to_time(30.0));
        let after = stage.ctx.clock.get_clock(false);
        assert!((after - before - TIME_BASE).abs() < 10.0, "clock moved by {}", after - before);

        // 超过阈值：时钟追上音频
        let before = stage.ctx.clock.get_clock(false);
        sync_window(&mut stage, &reference, msec_to_time(60.0));
        let after = stage.ctx.clock.get_clock(false);
        let expected = TIME_BASE + msec_to_time(60.0);
        assert!((after - before - expected).abs() < 10.0, "clock moved by {}", after - before);
    }

    #[test]
    fn test_stream_change_rebuilds_sink_for_new_format() {
        let (_reference, mut stage, parent, stats) = setup_with_stats(PlayerSettings::default());
        feed(&mut stage, 0, 2);
        assert_eq!(stats.creates(), 1);
        while parent.get(Duration::ZERO, 0).is_ok() {}

        let hints = StreamHints::audio("pcm", 24000, 2);
        let decoder = Box::new(SyntheticAudioDecoder::new(&hints));
        let change = StreamChange::new(hints, CodecHandle::Audio(decoder));
        stage.handle_message(Arc::new(Message::GeneralStreamChange(change)));
        assert_eq!(stage.sync, SyncState::Starting);
        assert_eq!(stage.hints.sample_rate, 24000);

        feed(&mut stage, 2, 1);
        assert_eq!(stats.creates(), 2);
        assert_eq!(stage.sink.format().map(|f| f.sample_rate), Some(24000));

        let (msg, priority) = parent.get(Duration::ZERO, 0).unwrap();
        assert_eq!(priority, 1);
        assert!(matches!(&*msg, Message::PlayerAvChange(StageKind::Audio)));
    }
}
