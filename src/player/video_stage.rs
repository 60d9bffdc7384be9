//! 视频输出阶段
//!
//! 解码 → 帧间隔追踪 → 丢帧 / 重复帧决策 → 提交渲染端。

use crate::core::{
    msec_to_time, time_to_msec, DemuxPacket, StageKind, StreamHints, SyncState, VideoFormat, VideoPicture,
    PLAYSPEED_NORMAL, PLAYSPEED_PAUSE, TIME_BASE,
};
use crate::player::context::PlayerContext;
use crate::player::decoder::VideoDecoder;
use crate::player::message::{CodecHandle, Message, StartInfo, SyncSources};
use crate::player::message_queue::QueueError;
use crate::player::overlay::Overlay;
use crate::player::pts_tracker::PtsTracker;
use crate::player::stage::{log_ctx, should_log, StageLink};
use crate::player::video_renderer::VideoRenderer;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const START_CACHE_RATIO: f64 = 0.75;
const DEFAULT_FPS: f64 = 25.0;

/// 对一帧的处理决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    Display,
    /// 落后时钟超过一帧
    DropLate,
    /// 渲染队列快空且已迟到
    DropBufferLevel,
    /// 与上一帧间隔过大，额外显示 n 次
    Duplicate(u32),
}

/// 丢帧统计
///
/// 每次因迟到丢帧记一笔"收益"，对应时间点渲染过去后收益作废。
#[derive(Debug, Clone, Default)]
pub struct DropStatistics {
    gains: VecDeque<f64>,
    pub late_drops: u64,
    pub level_drops: u64,
    pub duplicates: u64,
}

impl DropStatistics {
    pub fn total_gain(&self) -> usize {
        self.gains.len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 丢帧决策输入
#[derive(Debug, Clone, Copy)]
pub struct DropInput {
    pub pts: f64,
    pub prev_pts: Option<f64>,
    pub clock: f64,
    pub frame_duration: f64,
    /// 渲染端最近显示的时间戳
    pub render_pts: Option<f64>,
    /// 渲染队列中的画面数
    pub buffer_level: usize,
    pub allow_drop: bool,
    /// 可变帧率：不做重复帧补偿
    pub vfr: bool,
}

/// 根据时钟与渲染队列决定丢帧、重复或正常显示
pub fn calc_drop_requirement(input: &DropInput, stats: &mut DropStatistics) -> FrameDecision {
    if let Some(render_pts) = input.render_pts {
        while stats.gains.front().is_some_and(|&pts| pts <= render_pts) {
            stats.gains.pop_front();
        }
    }

    let frame = input.frame_duration.max(1.0);
    let lateness = input.clock - input.pts;

    if input.allow_drop {
        if lateness > frame && (stats.gains.len() as f64) < lateness / frame {
            stats.gains.push_back(input.pts);
            stats.late_drops += 1;
            return FrameDecision::DropLate;
        }
        if input.buffer_level < 2 && lateness > frame / 2.0 {
            stats.level_drops += 1;
            return FrameDecision::DropBufferLevel;
        }
    }

    if !input.vfr {
        if let Some(prev) = input.prev_pts {
            let gap = input.pts - prev;
            if gap > 1.5 * frame {
                let extra = (gap / frame).round() as i64 - 1;
                if extra > 0 {
                    stats.duplicates += extra as u64;
                    return FrameDecision::Duplicate(extra as u32);
                }
            }
        }
    }

    FrameDecision::Display
}

/// 视频阶段线程入口
pub fn video_stage_task(ctx: PlayerContext, hints: StreamHints, decoder: Box<dyn VideoDecoder>, link: StageLink) {
    let renderer = ctx.outputs.create_video_renderer();
    let mut stage = VideoStage::new(ctx, hints, decoder, renderer, link);
    stage.run();
    stage.shutdown();
}

struct VideoStage {
    ctx: PlayerContext,
    link: StageLink,
    hints: StreamHints,
    decoder: Box<dyn VideoDecoder>,
    renderer: Box<dyn VideoRenderer>,

    sync: SyncState,
    speed: i32,
    paused: bool,
    no_skip: bool,
    configured: bool,
    configure_failed: bool,

    tracker: PtsTracker,
    drops: DropStatistics,
    last_pts: Option<f64>,
    pending: Option<(VideoPicture, Vec<Arc<Overlay>>)>,

    packets: u64,
    pictures: u64,
}

impl VideoStage {
    fn new(
        ctx: PlayerContext,
        hints: StreamHints,
        decoder: Box<dyn VideoDecoder>,
        renderer: Box<dyn VideoRenderer>,
        link: StageLink,
    ) -> Self {
        Self {
            ctx,
            link,
            hints,
            decoder,
            renderer,
            sync: SyncState::Starting,
            speed: PLAYSPEED_NORMAL,
            paused: false,
            no_skip: false,
            configured: false,
            configure_failed: false,
            tracker: PtsTracker::new(),
            drops: DropStatistics::default(),
            last_pts: None,
            pending: None,
            packets: 0,
            pictures: 0,
        }
    }

    fn run(&mut self) {
        info!(
            "{} 🎬 视频阶段启动: codec={} {}x{} 解码器={}",
            log_ctx(),
            self.hints.codec,
            self.hints.width,
            self.hints.height,
            self.decoder.name()
        );

        loop {
            let priority = if self.pending.is_some() || self.sync == SyncState::WaitSync || self.paused {
                1
            } else {
                0
            };
            let timeout = if self.pending.is_some() {
                Duration::from_millis(10)
            } else {
                Duration::from_secs_f64((self.frame_duration() / 2.0 / TIME_BASE).clamp(0.005, 0.1))
            };

            match self.link.inbox.get(timeout, priority) {
                Ok((msg, _)) => self.handle_message(msg),
                Err(QueueError::Timeout) => self.on_timeout(),
                Err(QueueError::Abort) | Err(QueueError::NotInitialized) => {
                    debug!("{} 🎬 视频阶段收到中止", log_ctx());
                    break;
                }
                Err(e) => warn!("{} ⚠ 视频阶段取消息失败: {}", log_ctx(), e),
            }
            self.refresh_status();
        }

        info!(
            "{} 🎬 视频阶段退出（{} 个包，{} 帧，迟到丢帧 {}，水位丢帧 {}，重复 {}）",
            log_ctx(),
            self.packets,
            self.pictures,
            self.drops.late_drops,
            self.drops.level_drops,
            self.drops.duplicates
        );
    }

    fn shutdown(&mut self) {
        self.pending = None;
        self.renderer.release();
        self.decoder.dispose();
    }

    fn frame_duration(&self) -> f64 {
        self.tracker
            .frame_duration()
            .or_else(|| self.hints.fps.filter(|fps| *fps > 0.0).map(|fps| TIME_BASE / fps))
            .unwrap_or_else(|| msec_to_time(40.0))
    }

    fn refresh_status(&mut self) {
        let stats = self.renderer.stats();
        if stats.render_pts.is_some() {
            self.link.status.set_current_pts(stats.render_pts);
        }
    }

    fn on_timeout(&mut self) {
        if self.pending.is_some() {
            self.submit_pending();
            return;
        }
        if self.link.inbox.is_empty() && !self.link.status.is_stalled() {
            debug!("{} 🎬 视频输入为空，标记为 stalled", log_ctx());
            self.link.status.set_stalled(true);
        }
    }

    fn handle_message(&mut self, msg: Arc<Message>) {
        match &*msg {
            Message::DemuxerPacket { packet, drop } => self.handle_packet(&msg, packet, *drop),
            Message::GeneralSynchronize(barrier) => {
                if !barrier.wait(Duration::from_millis(100), SyncSources::VIDEO) {
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
                if !self.drain_decoder() {
                    // 渲染队列满，等画面送出后再处理 EOF
                    self.link.requeue(msg.clone(), 0, true);
                    return;
                }
                debug!("{} 🎬 GENERAL_EOF", log_ctx());
                if self.sync == SyncState::Starting {
                    self.send_started();
                } else if self.sync == SyncState::InSync {
                    self.renderer.drain();
                }
            }
            Message::GeneralDelay(delay) => self.link.sleep(*delay),
            Message::GeneralPause(pause) => {
                self.paused = *pause;
                self.apply_play_state();
            }
            Message::PlayerSetSpeed(speed) => {
                self.speed = *speed;
                self.apply_play_state();
            }
            Message::VideoNoSkip => {
                debug!("{} 🎬 VIDEO_NOSKIP", log_ctx());
                self.no_skip = true;
            }
            Message::GeneralStreamChange(change) => match change.take_codec() {
                Some(CodecHandle::Video(decoder)) => {
                    info!(
                        "{} 🎬 视频流变更: codec={} {}x{}",
                        log_ctx(),
                        change.hints.codec,
                        change.hints.width,
                        change.hints.height
                    );
                    self.decoder.dispose();
                    self.decoder = decoder;
                    self.hints = change.hints.clone();
                    self.configured = false;
                    self.configure_failed = false;
                    self.pending = None;
                    self.tracker.reset_vfr_detection();
                    self.set_sync(SyncState::Starting);
                    self.renderer.pause();
                }
                Some(CodecHandle::Audio(_)) => warn!("{} ⚠ 视频阶段收到音频解码器，忽略", log_ctx()),
                None => warn!("{} ⚠ 流变更消息中的解码器已被取走", log_ctx()),
            },
            Message::PlayerReportState => {}
            other => debug!("{} 🎬 视频阶段忽略消息 {:?}", log_ctx(), other.kind()),
        }
    }

    fn apply_play_state(&mut self) {
        if self.paused || self.speed == PLAYSPEED_PAUSE {
            self.renderer.pause();
        } else if self.sync == SyncState::InSync {
            self.renderer.resume();
        }
    }

    fn handle_packet(&mut self, msg: &Arc<Message>, packet: &DemuxPacket, drop: bool) {
        self.link.status.set_stalled(false);
        self.packets += 1;
        if should_log(self.packets) {
            debug!(
                "{} 🎬 视频包 #{} pts={:?} dts={:?} size={} drop={}",
                log_ctx(),
                self.packets,
                packet.pts,
                packet.dts,
                packet.size(),
                drop
            );
        }

        if self.pending.is_some() && !self.submit_pending() {
            self.link.requeue(msg.clone(), 0, true);
            return;
        }

        let accepted = self.decoder.add_data(packet);
        while let Some(picture) = self.decoder.get_data() {
            if drop {
                continue;
            }
            self.process_picture(picture);
            if self.pending.is_some() {
                break;
            }
        }
        if !accepted {
            self.link.requeue(msg.clone(), 0, true);
        }
    }

    /// 送出挂起画面并取空解码器；渲染队列满时返回 false
    fn drain_decoder(&mut self) -> bool {
        if !self.submit_pending() {
            return false;
        }
        while let Some(picture) = self.decoder.get_data() {
            self.process_picture(picture);
            if self.pending.is_some() {
                return false;
            }
        }
        true
    }

    fn process_picture(&mut self, mut picture: VideoPicture) {
        if !self.configured && !self.configure(&picture) {
            return;
        }

        let frame = self.frame_duration();
        let pts = picture.pts.or(self.last_pts.map(|last| last + frame));
        picture.pts = pts;
        let Some(pts) = pts else {
            self.pending = Some((picture, Vec::new()));
            self.submit_pending();
            return;
        };

        self.tracker.add(pts);
        let prev_pts = self.last_pts;
        self.last_pts = Some(pts);

        let mut duration = picture.duration.unwrap_or(frame);
        if self.sync == SyncState::InSync && !self.no_skip && self.speed == PLAYSPEED_NORMAL {
            let stats = self.renderer.stats();
            let input = DropInput {
                pts,
                prev_pts,
                clock: self.ctx.clock.get_clock(false),
                frame_duration: frame,
                render_pts: stats.render_pts,
                buffer_level: stats.queued,
                allow_drop: self.ctx.settings.allow_frame_drop,
                vfr: self.tracker.vfr_detection(),
            };
            match calc_drop_requirement(&input, &mut self.drops) {
                FrameDecision::Display => {}
                FrameDecision::DropLate | FrameDecision::DropBufferLevel => {
                    if should_log(self.drops.late_drops + self.drops.level_drops) {
                        debug!(
                            "{} 🎬 丢帧 pts={:.0} 落后 {:.1}ms",
                            log_ctx(),
                            pts,
                            time_to_msec(input.clock - pts)
                        );
                    }
                    return;
                }
                FrameDecision::Duplicate(extra) => {
                    duration *= (extra + 1) as f64;
                }
            }
        }
        picture.duration = Some(duration);

        let overlays = if self.ctx.subtitles_visible() {
            self.ctx.overlays.overlays_at(pts)
        } else {
            self.ctx.overlays.overlays_at(pts).into_iter().filter(|o| o.forced).collect()
        };
        self.pending = Some((picture, overlays));
        self.submit_pending();
    }

    /// 提交挂起画面；渲染队列满时保留并返回 false
    fn submit_pending(&mut self) -> bool {
        let Some((picture, overlays)) = self.pending.take() else { return true };
        if !self.renderer.add_picture(&picture, overlays.clone()) {
            self.pending = Some((picture, overlays));
            return false;
        }

        self.pictures += 1;
        if self.sync == SyncState::Starting {
            let stats = self.renderer.stats();
            let needed = (START_CACHE_RATIO * stats.capacity as f64).ceil() as usize;
            if stats.queued >= needed.max(1) {
                self.send_started();
            }
        }
        true
    }

    fn configure(&mut self, picture: &VideoPicture) -> bool {
        if self.configure_failed {
            return false;
        }
        let fps = self.hints.fps.filter(|fps| *fps > 0.0).unwrap_or(DEFAULT_FPS);
        let format = VideoFormat {
            width: if picture.width > 0 { picture.width } else { self.hints.width },
            height: if picture.height > 0 { picture.height } else { self.hints.height },
            fps,
        };

        if let Err(e) = self.renderer.configure(format) {
            error!("{} ❌ 渲染端配置失败，丢弃画面: {}", log_ctx(), e);
            self.configure_failed = true;
            return false;
        }

        match self.ctx.clock.update_framerate(fps) {
            Some((rate, _)) if self.ctx.settings.use_display_as_clock => {
                info!("{} 🎬 以显示刷新率 {:.3}Hz 为主时钟", log_ctx(), rate);
                self.ctx.clock.set_vsync_adjust(1.0);
            }
            Some(_) => {}
            None => debug!("{} 🎬 没有刷新率参考，使用软件节奏", log_ctx()),
        }

        self.configured = true;
        if self.sync == SyncState::InSync && !self.paused && self.speed != PLAYSPEED_PAUSE {
            self.renderer.resume();
        }
        self.link.notify_parent(Message::PlayerAvChange(StageKind::Video), 1);
        true
    }

    fn set_sync(&mut self, state: SyncState) {
        self.sync = state;
        self.link.status.set_sync_state(state);
    }

    fn send_started(&mut self) {
        self.set_sync(SyncState::WaitSync);
        let frame = self.frame_duration();
        let info = StartInfo {
            stage: StageKind::Video,
            cache_time: self.renderer.cache_time(),
            cache_total: self.renderer.cache_total(),
            timestamp: self.last_pts.map(|pts| pts + frame),
        };
        info!(
            "{} 🎬 视频缓冲就绪 → WAITSYNC: cache={:.0}ms / {:.0}ms, ts={:?}",
            log_ctx(),
            time_to_msec(info.cache_time),
            time_to_msec(info.cache_total),
            info.timestamp
        );
        self.link.notify_parent(Message::PlayerStarted(info), 1);
        self.link.notify_parent(Message::PlayerAvChange(StageKind::Video), 1);
    }

    /// WAITSYNC/STARTING：`pts` 为此刻应显示的时间；INSYNC：`pts` 为下一帧的时间戳
    fn handle_resync(&mut self, pts: f64, set_clock: bool) {
        if self.sync == SyncState::InSync {
            if set_clock {
                self.ctx.clock.discontinuity(pts - self.renderer.cache_time());
            }
            // 新时间线上的第一帧不能和跳变前的画面比较间隔
            self.last_pts = None;
            self.tracker.flush();
        } else {
            let stats = self.renderer.stats();
            if let Some(next) = stats.next_pts {
                // 队列中的画面已整体过期
                if next < pts - self.frame_duration() / 2.0 && self.last_pts.is_some_and(|last| last < pts) {
                    debug!(
                        "{} 🎬 RESYNC 时渲染队列已过期 {:.1}ms，清空",
                        log_ctx(),
                        time_to_msec(pts - next)
                    );
                    self.renderer.flush();
                }
            }
            if set_clock {
                self.ctx.clock.discontinuity(pts);
            }
        }

        self.drops.reset();
        self.no_skip = false;
        self.set_sync(SyncState::InSync);
        if !self.paused && self.speed != PLAYSPEED_PAUSE {
            self.renderer.resume();
        }
        info!("{} 🎬 GENERAL_RESYNC({:.0}, set_clock={}) → INSYNC", log_ctx(), pts, set_clock);
    }

    fn handle_flush(&mut self, sync: bool) {
        debug!("{} 🎬 GENERAL_FLUSH sync={}", log_ctx(), sync);
        self.renderer.flush();
        self.decoder.reset();
        self.pending = None;
        self.last_pts = None;
        self.tracker.flush();
        self.drops.reset();
        self.no_skip = false;
        self.link.status.set_stalled(true);
        self.link.status.set_current_pts(None);
        if sync {
            self.set_sync(SyncState::Starting);
            self.renderer.pause();
        }
    }
}
