//! 解复用调度线程
//!
//! 单线程拉取输入源的数据包，按当前选中的流分发到各输出阶段；
//! 同时负责缓冲状态机、音视频起播同步、seek / 变速、流切换与 EOF 收尾。

use crate::core::{
    msec_to_time, time_to_msec, DemuxPacket, DemuxStream, MediaInfo, PlaybackState, PlayerError, PlayerState,
    Result, StageKind, StreamKind, SyncState, PLAYSPEED_NORMAL, PLAYSPEED_PAUSE, TIME_BASE,
};
use crate::player::ancillary_stage::ancillary_stage_task;
use crate::player::audio_stage::audio_stage_task;
use crate::player::context::PlayerContext;
use crate::player::demuxer_source::{DemuxerSource, InputNavigator, ReadOutcome};
use crate::player::event::PlayerEvent;
use crate::player::message::{
    CodecHandle, Message, MessageKind, StartInfo, StreamChange, SyncSources, SynchronizeBarrier,
};
use crate::player::message_queue::{MessageQueue, QueueError};
use crate::player::stage::{log_ctx, should_log, StageHandle, StageLink, StageStatus};
use crate::player::subtitle_stage::subtitle_stage_task;
use crate::player::video_stage::video_stage_task;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 每种流类型一个槽位
const SLOT_KINDS: [StreamKind; 6] = [
    StreamKind::Audio,
    StreamKind::Video,
    StreamKind::Subtitle,
    StreamKind::Teletext,
    StreamKind::Rds,
    StreamKind::Id3,
];

const AV_KINDS: [StreamKind; 2] = [StreamKind::Audio, StreamKind::Video];

/// INIT 状态下队列已满仍无法起播时的兜底超时
const CACHING_TIMEOUT: Duration = Duration::from_secs(5);
/// 同步起播后多久才开始检查欠载
const SYNC_GRACE: Duration = Duration::from_secs(3);
/// EOF 后各阶段迟迟不同步时的兜底超时
const EOF_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const CATCHUP_INTERVAL: Duration = Duration::from_secs(1);
const SYNCHRONIZE_DEMUXER_TIMEOUT: Duration = Duration::from_millis(500);
const FLUSH_BARRIER_TIMEOUT: Duration = Duration::from_secs(1);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// 精确 seek 时最多向前丢弃的距离
const MAX_START_SKIP: f64 = 20.0 * TIME_BASE;
/// 流之间起始时间差超过该值不再补偿延迟
const MAX_START_DELAY: f64 = 2.0 * TIME_BASE;
const FORWARD_JUMP: f64 = TIME_BASE;
/// 单帧时长超过该值视为长时间静止画面
const LONG_FRAME: f64 = 0.5 * TIME_BASE;
const CATCHUP_LEAD: f64 = TIME_BASE;
/// 一路流完全没有数据、另一路已累计这么多包时不再等它
const STARVED_PACKETS: u64 = 20;
/// 队列水位低于该值视为饿死
const STARVED_LEVEL: u32 = 10;
const STALL_CACHE_LEVEL: u32 = 50;
/// 直播流音频水位低于该值时放慢时钟
const LIVE_LOW_LEVEL: u32 = 5;
const LIVE_RECOVER_LEVEL: u32 = 10;
const LIVE_SLOWDOWN: f64 = -0.01;

/// 调度循环的退出原因
#[derive(Debug, Clone, PartialEq)]
enum LoopExit {
    /// 所有数据已播放完毕
    Ended,
    /// 外部请求停止
    Stopped,
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachingState {
    Done,
    Full,
    Init,
    Play,
    Flush,
}

/// 流变更后如何重新并入同步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AvSyncMode {
    None,
    /// 等待下一个包确认时间戳是否连续
    Check,
    /// 连续：阶段就绪后直接接上当前时钟
    Cont,
}

/// 一个已打开的流及其输出阶段
struct CurrentStream {
    id: i32,
    demuxer_id: i32,
    hints: crate::core::StreamHints,
    stage: StageHandle,

    dts: Option<f64>,
    duration: Option<f64>,
    /// 调度线程视角的同步状态
    sync: SyncState,
    avsync: AvSyncMode,
    packets: u64,
    inited: bool,
    start_pts: Option<f64>,

    start_time: Option<f64>,
    cache_time: f64,
    cache_total: f64,
}

impl CurrentStream {
    fn new(stream: &DemuxStream, stage: StageHandle) -> Self {
        Self {
            id: stream.id,
            demuxer_id: stream.demuxer_id,
            hints: stream.hints.clone(),
            stage,
            dts: None,
            duration: None,
            sync: SyncState::Starting,
            avsync: AvSyncMode::None,
            packets: 0,
            inited: false,
            start_pts: None,
            start_time: None,
            cache_time: 0.0,
            cache_total: 0.0,
        }
    }

    fn dts_end(&self) -> Option<f64> {
        self.dts.map(|dts| dts + self.duration.unwrap_or(0.0))
    }
}

fn slot_index(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Audio => 0,
        StreamKind::Video => 1,
        StreamKind::Subtitle => 2,
        StreamKind::Teletext => 3,
        StreamKind::Rds => 4,
        StreamKind::Id3 => 5,
    }
}

fn other_av(kind: StreamKind) -> StreamKind {
    if kind == StreamKind::Audio {
        StreamKind::Video
    } else {
        StreamKind::Audio
    }
}

fn stream_kind(stage: StageKind) -> StreamKind {
    match stage {
        StageKind::Audio => StreamKind::Audio,
        StageKind::Video => StreamKind::Video,
    }
}

fn is_trick_speed(speed: i32) -> bool {
    speed != PLAYSPEED_PAUSE && speed != PLAYSPEED_NORMAL
}

/// 向输出阶段投递控制消息；失败时记日志并返回 false
fn send_control(stage: &StageHandle, msg: Message, priority: i32) -> bool {
    let kind = msg.kind();
    match stage.send(msg, priority) {
        Ok(()) => true,
        Err(e) => {
            warn!("{} ⚠ [{}] 发送 {:?} 失败: {}", log_ctx(), stage.name(), kind, e);
            false
        }
    }
}

/// 解复用线程句柄
///
/// 控制方通过 `send()` 投递消息，通过 `events()` 接收事件。
pub struct DemuxerThread {
    thread_handle: Option<JoinHandle<()>>,
    messenger: Arc<MessageQueue>,
    stop: Arc<AtomicBool>,
    events: Receiver<PlayerEvent>,
}

impl DemuxerThread {
    /// 启动解复用线程，打开默认流后开始读包
    pub fn start(
        source: Box<dyn DemuxerSource>,
        ctx: PlayerContext,
        navigator: Option<Box<dyn InputNavigator>>,
    ) -> Result<Self> {
        let messenger = Arc::new(MessageQueue::new("player"));
        messenger.init();
        let stop = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = unbounded();

        let mut dispatcher = Dispatcher::new(ctx, source, navigator, messenger.clone(), stop.clone(), event_tx);
        let thread_handle = thread::Builder::new()
            .name("demuxer".to_string())
            .spawn(move || {
                info!("{} 🎬 解复用线程启动: {}", log_ctx(), dispatcher.source.description());
                let exit = dispatcher.run();
                dispatcher.finish(exit);
            })
            .map_err(|e| PlayerError::StreamError(format!("启动解复用线程失败: {}", e)))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            messenger,
            stop,
            events: event_rx,
        })
    }

    pub fn messenger(&self) -> &Arc<MessageQueue> {
        &self.messenger
    }

    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events.clone()
    }

    pub fn send(&self, msg: Message, priority: i32) -> Result<()> {
        self.messenger.put(Arc::new(msg), priority)?;
        Ok(())
    }

    /// 等待解复用线程处理完此前投递的消息
    pub fn synchronize(&self) {
        let barrier = Arc::new(SynchronizeBarrier::new(
            SYNCHRONIZE_DEMUXER_TIMEOUT,
            SyncSources::OWNER.union(SyncSources::ANY),
        ));
        if self.messenger.put(Arc::new(Message::GeneralSynchronize(barrier.clone())), 0).is_ok() {
            barrier.wait_until(&self.stop, SyncSources::NONE);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// 停止线程：置停止标志 → 中止消息队列 → join
    pub fn stop(&mut self) {
        info!("{} 🛑 DemuxerThread::stop() called", log_ctx());
        self.stop.store(true, Ordering::SeqCst);
        self.messenger.abort();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ 解复用线程异常退出", log_ctx());
            }
        }
        self.messenger.end();
    }
}

impl Drop for DemuxerThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ DemuxerThread 被 drop，但可能未调用 stop()，正在尝试优雅停止", log_ctx());
            self.stop();
        }
    }
}

/// 调度线程内部状态（只在解复用线程上访问）
struct Dispatcher {
    ctx: PlayerContext,
    source: Box<dyn DemuxerSource>,
    navigator: Option<Box<dyn InputNavigator>>,
    messenger: Arc<MessageQueue>,
    stop: Arc<AtomicBool>,
    events: Sender<PlayerEvent>,

    streams: Vec<Option<CurrentStream>>,
    /// 打开失败或无人处理的流
    disabled: HashSet<i32>,

    play_speed: i32,
    caching: CachingState,
    caching_timer: Instant,
    sync_timer: Instant,
    catchup_timer: Instant,
    next_report: Instant,
    still_started: Option<Instant>,

    eof_sent: bool,
    eof_deadline: Instant,
    read_errors: u32,
    packets: u64,
}

impl Dispatcher {
    fn new(
        ctx: PlayerContext,
        source: Box<dyn DemuxerSource>,
        navigator: Option<Box<dyn InputNavigator>>,
        messenger: Arc<MessageQueue>,
        stop: Arc<AtomicBool>,
        events: Sender<PlayerEvent>,
    ) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            source,
            navigator,
            messenger,
            stop,
            events,
            streams: SLOT_KINDS.iter().map(|_| None).collect(),
            disabled: HashSet::new(),
            play_speed: PLAYSPEED_NORMAL,
            caching: CachingState::Done,
            caching_timer: now,
            sync_timer: now,
            catchup_timer: now,
            next_report: now,
            still_started: None,
            eof_sent: false,
            eof_deadline: now,
            read_errors: 0,
            packets: 0,
        }
    }

    fn run(&mut self) -> LoopExit {
        if let Err(e) = self.open_default_streams() {
            error!("{} ❌ 打开默认流失败: {}", log_ctx(), e);
            return LoopExit::Fatal(e.to_string());
        }
        self.emit(PlayerEvent::Opened(self.media_info()));
        self.set_caching(CachingState::Flush);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return LoopExit::Stopped;
            }
            if let Some(exit) = self.handle_messages() {
                return exit;
            }
            self.handle_play_speed();
            self.report_state_periodically();

            // 队列已满时不再读包
            if self.av_queue_full() {
                thread::sleep(QUEUE_FULL_BACKOFF);
                continue;
            }

            match self.source.read_packet() {
                Ok(ReadOutcome::Packet(packet)) => {
                    self.read_errors = 0;
                    self.process_packet(packet);
                }
                Ok(ReadOutcome::Eof) => {
                    if let Some(exit) = self.handle_eof() {
                        return exit;
                    }
                }
                Ok(ReadOutcome::NoData) => {
                    if let Some(exit) = self.handle_no_data() {
                        return exit;
                    }
                }
                Ok(ReadOutcome::Stop) => {
                    warn!("{} ⚠ 输入源要求停止播放", log_ctx());
                    return LoopExit::Fatal("输入源要求停止".to_string());
                }
                Err(e) => {
                    self.read_errors += 1;
                    if self.read_errors > self.ctx.settings.read_retry_budget {
                        error!("{} ❌ 连续读包失败 {} 次，放弃: {}", log_ctx(), self.read_errors, e);
                        return LoopExit::Fatal(format!("读包失败: {}", e));
                    }
                    warn!(
                        "{} ⚠ 读包失败（第 {}/{} 次），稍后重试: {}",
                        log_ctx(),
                        self.read_errors,
                        self.ctx.settings.read_retry_budget,
                        e
                    );
                    thread::sleep(Duration::from_millis(self.ctx.settings.read_retry_backoff_ms));
                }
            }
        }
    }

    fn finish(&mut self, exit: LoopExit) {
        info!("{} 🛑 解复用线程退出: {:?}（共 {} 个包）", log_ctx(), exit, self.packets);
        match exit {
            LoopExit::Ended => {
                for kind in SLOT_KINDS {
                    let wait = self.current(kind).is_some_and(|s| s.sync == SyncState::InSync);
                    self.close_stream(kind, wait);
                }
                self.emit(PlayerEvent::Ended);
            }
            LoopExit::Stopped => {
                self.close_all();
                self.emit(PlayerEvent::Stopped {
                    reason: "停止请求".to_string(),
                });
            }
            LoopExit::Fatal(reason) => {
                self.send_to_all(Message::GeneralEof, 0);
                self.close_all();
                self.emit(PlayerEvent::Stopped { reason });
            }
        }
    }

    fn emit(&self, event: PlayerEvent) {
        if self.events.send(event).is_err() {
            debug!("{} 事件接收端已关闭", log_ctx());
        }
    }

    // ---------------------------------------------------------------------
    // 流管理
    // ---------------------------------------------------------------------

    fn current(&self, kind: StreamKind) -> Option<&CurrentStream> {
        self.streams[slot_index(kind)].as_ref()
    }

    fn current_mut(&mut self, kind: StreamKind) -> Option<&mut CurrentStream> {
        self.streams[slot_index(kind)].as_mut()
    }

    fn is_open(&self, kind: StreamKind) -> bool {
        self.current(kind).is_some()
    }

    fn sync_of(&self, kind: StreamKind) -> Option<SyncState> {
        self.current(kind).map(|s| s.sync)
    }

    fn open_default_streams(&mut self) -> Result<()> {
        let streams = self.source.streams();
        for kind in SLOT_KINDS {
            for stream in streams.iter().filter(|s| s.hints.kind == kind && !s.disabled) {
                if self.open_stream(kind, stream.id) {
                    break;
                }
            }
        }

        if !self.is_open(StreamKind::Audio) && !self.is_open(StreamKind::Video) {
            return Err(PlayerError::StreamError("没有可播放的音视频流".to_string()));
        }
        Ok(())
    }

    /// 打开指定流（替换该类型当前的流）；失败的流会被禁用
    fn open_stream(&mut self, kind: StreamKind, id: i32) -> bool {
        if self.disabled.contains(&id) {
            return false;
        }
        let Some(stream) = self.source.stream(id) else {
            warn!("{} ⚠ 流 #{} 不存在", log_ctx(), id);
            return false;
        };
        if stream.disabled || stream.hints.kind != kind {
            return false;
        }

        self.close_stream(kind, false);
        match self.spawn_stage(&stream) {
            Ok(Some(stage)) => {
                info!(
                    "{} ✅ 打开{}流 #{}: codec={}",
                    log_ctx(),
                    kind.as_str(),
                    stream.id,
                    stream.hints.codec
                );
                if AV_KINDS.contains(&kind) {
                    let speed = match self.caching {
                        CachingState::Full | CachingState::Init => PLAYSPEED_PAUSE,
                        _ => self.play_speed,
                    };
                    if speed != PLAYSPEED_NORMAL {
                        send_control(&stage, Message::PlayerSetSpeed(speed), 1);
                    }
                }
                self.streams[slot_index(kind)] = Some(CurrentStream::new(&stream, stage));
                true
            }
            Ok(None) => {
                debug!("{} 没有 {} 数据接收端，忽略流 #{}", log_ctx(), kind.as_str(), id);
                self.disabled.insert(id);
                false
            }
            Err(e) => {
                warn!("{} ⚠ 打开{}流 #{} 失败，禁用该流: {}", log_ctx(), kind.as_str(), id, e);
                self.disabled.insert(id);
                self.emit(PlayerEvent::StreamOpenFailed {
                    kind,
                    id,
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// 按流类型设好容量上限的阶段链路
    fn stage_link(&self, kind: StreamKind) -> StageLink {
        let settings = &self.ctx.settings;
        let queue = Arc::new(MessageQueue::new(kind.as_str()));
        match kind {
            StreamKind::Audio => {
                queue.set_max_data_size(settings.audio_queue_max_bytes);
                queue.set_max_time_size(settings.audio_queue_max_secs);
            }
            StreamKind::Video => {
                queue.set_max_data_size(settings.video_queue_max_bytes);
                queue.set_max_time_size(settings.video_queue_max_secs);
            }
            _ => queue.set_max_data_size(settings.subtitle_queue_max_bytes),
        }

        StageLink {
            inbox: queue,
            parent: self.messenger.clone(),
            status: Arc::new(StageStatus::default()),
        }
    }

    fn spawn_stage(&self, stream: &DemuxStream) -> Result<Option<StageHandle>> {
        let kind = stream.hints.kind;
        let link = self.stage_link(kind);
        let ctx = self.ctx.clone();
        let hints = stream.hints.clone();

        let stage = match kind {
            StreamKind::Audio => {
                let decoder = self.ctx.decoders.create_audio(&hints)?;
                StageHandle::spawn(link, move |link| audio_stage_task(ctx, hints, decoder, link))?
            }
            StreamKind::Video => {
                let decoder = self.ctx.decoders.create_video(&hints)?;
                StageHandle::spawn(link, move |link| video_stage_task(ctx, hints, decoder, link))?
            }
            StreamKind::Subtitle => {
                let decoder = self.ctx.decoders.create_subtitle(&hints)?;
                StageHandle::spawn(link, move |link| subtitle_stage_task(ctx, hints, decoder, link))?
            }
            StreamKind::Teletext | StreamKind::Rds | StreamKind::Id3 => {
                let Some(sink) = self.ctx.outputs.create_ancillary_sink(kind) else {
                    return Ok(None);
                };
                StageHandle::spawn(link, move |link| ancillary_stage_task(kind, sink, link))?
            }
        };
        Ok(Some(stage))
    }

    fn close_stream(&mut self, kind: StreamKind, wait: bool) {
        if let Some(mut current) = self.streams[slot_index(kind)].take() {
            info!("{} ⏹ 关闭{}流 #{}（wait={}）", log_ctx(), kind.as_str(), current.id, wait);
            current.stage.close(wait);
            if kind == StreamKind::Subtitle {
                self.ctx.reset_overlays();
            }
        }
    }

    fn close_all(&mut self) {
        for kind in SLOT_KINDS {
            self.close_stream(kind, false);
        }
    }

    /// PLAYER_SET_*STREAM：按请求切换流，id < 0 表示关闭
    fn switch_stream(&mut self, kind: StreamKind, id: i32) {
        if self.current(kind).is_some_and(|s| s.id == id) {
            debug!("{} {}流 #{} 已是当前流", log_ctx(), kind.as_str(), id);
            return;
        }
        if id < 0 {
            self.close_stream(kind, false);
            return;
        }

        // 显式请求允许重试之前失败的流
        self.disabled.remove(&id);
        let playing = AV_KINDS.contains(&kind) && self.sync_of(other_av(kind)) == Some(SyncState::InSync);
        if self.open_stream(kind, id) && playing {
            // 从当前位置重新读取，新流从此刻开始输出
            let time_ms = time_to_msec(self.ctx.clock.get_clock(false)).max(0.0) as i64;
            self.put_self(
                Message::PlayerSeek {
                    time_ms,
                    backward: true,
                    flush: true,
                },
                1,
            );
        }
    }

    fn send_to_kinds(&self, kinds: &[StreamKind], msg: Message, priority: i32) {
        let msg = Arc::new(msg);
        for kind in kinds {
            if let Some(current) = self.current(*kind) {
                if let Err(e) = current.stage.send_arc(msg.clone(), priority) {
                    debug!("{} [{}] 发送 {:?} 失败: {}", log_ctx(), current.stage.name(), msg.kind(), e);
                }
            }
        }
    }

    fn send_to_av(&self, msg: Message, priority: i32) {
        self.send_to_kinds(&AV_KINDS, msg, priority);
    }

    fn send_to_all(&self, msg: Message, priority: i32) {
        self.send_to_kinds(&SLOT_KINDS, msg, priority);
    }

    fn put_self(&self, msg: Message, priority: i32) {
        if let Err(e) = self.messenger.put(Arc::new(msg), priority) {
            debug!("{} 投递消息到自身队列失败: {}", log_ctx(), e);
        }
    }

    // ---------------------------------------------------------------------
    // 控制消息
    // ---------------------------------------------------------------------

    fn handle_messages(&mut self) -> Option<LoopExit> {
        loop {
            match self.messenger.get(Duration::ZERO, 0) {
                Ok((msg, _)) => self.handle_message(msg),
                Err(QueueError::Timeout) => return None,
                Err(QueueError::Abort) | Err(QueueError::NotInitialized) => return Some(LoopExit::Stopped),
                Err(e) => {
                    warn!("{} ⚠ 取控制消息失败: {}", log_ctx(), e);
                    return None;
                }
            }
        }
    }

    fn handle_message(&mut self, msg: Arc<Message>) {
        match &*msg {
            Message::PlayerSeek {
                time_ms,
                backward,
                flush,
            } => self.handle_seek(*time_ms, *backward, *flush),
            Message::PlayerSetSpeed(speed) => self.handle_set_speed(*speed),
            Message::PlayerSetAudioStream(id) => self.switch_stream(StreamKind::Audio, *id),
            Message::PlayerSetVideoStream(id) => self.switch_stream(StreamKind::Video, *id),
            Message::PlayerSetSubtitleStream(id) => self.switch_stream(StreamKind::Subtitle, *id),
            Message::PlayerSetSubtitleVisible(visible) => {
                info!("{} 💬 字幕显示: {}", log_ctx(), visible);
                self.ctx.set_subtitles_visible(*visible);
            }
            Message::GeneralSynchronize(barrier) => {
                if !barrier.wait(Duration::from_millis(100), SyncSources::OWNER) {
                    self.put_self_arc(msg.clone(), 1);
                }
            }
            Message::PlayerStarted(info) => self.handle_started(info),
            Message::PlayerAvChange(kind) => self.emit(PlayerEvent::AvChange(*kind)),
            Message::PlayerReportState => self.emit(PlayerEvent::StateReport(self.state_snapshot())),
            Message::GeneralFlush { .. } => self.flush_buffers(false, None, true, true),
            Message::DemuxerReset => {
                info!("{} 🔄 DEMUXER_RESET", log_ctx());
                self.flush_buffers(false, None, true, true);
            }
            other => debug!("{} 解复用线程忽略消息 {:?}", log_ctx(), other.kind()),
        }
    }

    fn put_self_arc(&self, msg: Arc<Message>, priority: i32) {
        if let Err(e) = self.messenger.put(msg, priority) {
            debug!("{} 投递消息到自身队列失败: {}", log_ctx(), e);
        }
    }

    fn handle_started(&mut self, info: &StartInfo) {
        let kind = stream_kind(info.stage);
        if let Some(current) = self.current_mut(kind) {
            current.sync = SyncState::WaitSync;
            current.start_time = info.timestamp;
            current.cache_time = info.cache_time;
            current.cache_total = info.cache_total;
        }
        debug!(
            "{} ▶ {} 阶段就绪: start={:?} cache={:.0}ms / {:.0}ms",
            log_ctx(),
            kind.as_str(),
            info.timestamp,
            time_to_msec(info.cache_time),
            time_to_msec(info.cache_total)
        );
        self.emit(PlayerEvent::StageStarted(*info));
    }

    fn handle_seek(&mut self, time_ms: i64, backward: bool, flush: bool) {
        info!("{} ⏩ Seek: {}ms backward={} flush={}", log_ctx(), time_ms, backward, flush);
        match self.source.seek(time_ms, backward) {
            Ok(()) => {
                let pts = msec_to_time(time_ms as f64);
                self.flush_buffers(!flush, Some(pts), true, true);
                self.emit(PlayerEvent::Seeked { time_ms });
            }
            Err(e) => {
                error!("{} ❌ Seek 失败: {}", log_ctx(), e);
                self.flush_buffers(false, None, true, true);
            }
        }
        self.eof_sent = false;
    }

    fn handle_set_speed(&mut self, speed: i32) {
        info!("{} ⏯ 播放速度: {} → {}", log_ctx(), self.play_speed, speed);

        // 进出快进 / 快退时解码器缺参考帧，从当前时间重新读取
        if is_trick_speed(speed) || is_trick_speed(self.play_speed) {
            let time_ms = time_to_msec(self.ctx.clock.get_clock(false)).max(0.0) as i64;
            self.put_self(
                Message::PlayerSeek {
                    time_ms,
                    backward: speed < 0,
                    flush: true,
                },
                1,
            );
        }

        self.play_speed = speed;
        if self.caching != CachingState::Done {
            self.caching = CachingState::Done;
            self.emit(PlayerEvent::Caching {
                caching: false,
                percent: self.cache_level(),
            });
        }
        self.ctx.clock.set_speed(speed);
        self.send_to_av(Message::PlayerSetSpeed(speed), 1);
        self.source.set_speed(speed);
    }

    // ---------------------------------------------------------------------
    // 读包与分发
    // ---------------------------------------------------------------------

    fn process_packet(&mut self, packet: DemuxPacket) {
        self.packets += 1;
        let Some(stream) = self.source.stream(packet.stream_id) else {
            debug!("{} 丢弃未知流 #{} 的包", log_ctx(), packet.stream_id);
            return;
        };
        if self.disabled.contains(&stream.id) {
            return;
        }

        let kind = stream.hints.kind;
        // 该类型尚未打开流：自动打开第一个出现的可用流
        if !self.is_open(kind) && !self.open_stream(kind, stream.id) {
            return;
        }
        if !self
            .current(kind)
            .is_some_and(|s| s.id == stream.id && s.demuxer_id == stream.demuxer_id)
        {
            return;
        }

        self.check_stream_changes(kind, &stream);

        if AV_KINDS.contains(&kind) {
            let jumped = self.check_continuity(kind, &packet);
            if let Some(current) = self.current_mut(kind) {
                if current.avsync == AvSyncMode::Check {
                    current.avsync = if jumped { AvSyncMode::None } else { AvSyncMode::Cont };
                }
            }
        }
        self.update_timestamps(kind, &packet);
        let drop = !self.check_player_init(kind);

        if should_log(self.packets) {
            debug!(
                "{} 📦 分发{}包 #{}: dts={:?} pts={:?} size={} drop={}",
                log_ctx(),
                kind.as_str(),
                self.packets,
                packet.dts,
                packet.pts,
                packet.size(),
                drop
            );
        }

        let Some(current) = self.current_mut(kind) else { return };
        if let Err(e) = current.stage.send_arc(Message::packet(packet, drop), 0) {
            warn!("{} ⚠ [{}] 投递数据包失败: {}", log_ctx(), current.stage.name(), e);
            return;
        }
        current.packets += 1;
    }

    /// 当前流 id 上的参数变化：音视频发送 STREAMCHANGE，其它流重新打开
    fn check_stream_changes(&mut self, kind: StreamKind, stream: &DemuxStream) {
        if self.current(kind).map_or(true, |s| s.hints == stream.hints) {
            return;
        }
        info!("{} 🔀 {}流 #{} 参数变化: codec={}", log_ctx(), kind.as_str(), stream.id, stream.hints.codec);

        let codec = match kind {
            StreamKind::Audio => self.ctx.decoders.create_audio(&stream.hints).map(CodecHandle::Audio),
            StreamKind::Video => self.ctx.decoders.create_video(&stream.hints).map(CodecHandle::Video),
            _ => {
                self.close_stream(kind, false);
                self.open_stream(kind, stream.id);
                return;
            }
        };

        match codec {
            Ok(codec) => {
                if let Some(current) = self.current_mut(kind) {
                    current.hints = stream.hints.clone();
                    current.sync = SyncState::Starting;
                    current.avsync = AvSyncMode::Check;
                    let change = StreamChange::new(stream.hints.clone(), codec);
                    if let Err(e) = current.stage.send(Message::GeneralStreamChange(change), 0) {
                        warn!("{} ⚠ 发送流变更失败: {}", log_ctx(), e);
                    }
                }
            }
            Err(e) => {
                warn!("{} ⚠ 流变更后无法创建解码器，禁用流 #{}: {}", log_ctx(), stream.id, e);
                self.close_stream(kind, false);
                self.disabled.insert(stream.id);
                self.emit(PlayerEvent::StreamOpenFailed {
                    kind,
                    id: stream.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// 检测时间戳回绕与跳变；返回 true 表示发生了不连续
    fn check_continuity(&mut self, kind: StreamKind, packet: &DemuxPacket) -> bool {
        if self.play_speed < PLAYSPEED_PAUSE {
            return false;
        }
        let Some(dts) = packet.timestamp() else { return false };
        if self.current(kind).and_then(|s| s.dts).is_none() {
            return false;
        }

        let limits: Vec<f64> = AV_KINDS
            .iter()
            .filter_map(|k| self.current(*k))
            .flat_map(|s| [s.dts, s.dts_end()])
            .flatten()
            .collect();
        let (Some(min), Some(max)) = (
            limits.iter().copied().reduce(f64::min),
            limits.iter().copied().reduce(f64::max),
        ) else {
            return false;
        };

        let mut jumped = false;
        if dts < min {
            let video = self.current(StreamKind::Video);
            let video_waits = video.is_some_and(|v| {
                v.dts.is_some()
                    && (v.stage.is_stalled()
                        || v.hints.still_images
                        || v.duration.is_some_and(|d| d > LONG_FRAME))
            });
            if video_waits {
                // 静止画面还在显示，等视频处理完再继续
                debug!("{} 回绕时视频仍在显示静止画面，同步视频阶段", log_ctx());
                self.synchronize_players(SyncSources::VIDEO);
            } else {
                debug!(
                    "{} 🔁 时间戳回绕: {} dts={:.3}s min={:.3}s",
                    log_ctx(),
                    kind.as_str(),
                    dts / TIME_BASE,
                    min / TIME_BASE
                );
            }
            jumped = true;
        }
        if dts > max + FORWARD_JUMP {
            debug!(
                "{} ⏭ 时间戳前跳: {} dts={:.3}s max={:.3}s",
                log_ctx(),
                kind.as_str(),
                dts / TIME_BASE,
                max / TIME_BASE
            );
            jumped = true;
        }

        if jumped {
            for current in self.streams.iter_mut().flatten() {
                current.inited = false;
            }
        }
        jumped
    }

    fn update_timestamps(&mut self, kind: StreamKind, packet: &DemuxPacket) {
        let Some(current) = self.current_mut(kind) else { return };
        let dts = packet.timestamp().or(current.dts);

        if packet.duration.is_some() {
            current.duration = packet.duration;
        } else if let (Some(new), Some(old)) = (dts, current.dts) {
            // 没有时长时用相邻包间隔做滑动平均
            current.duration = Some(0.1 * (current.duration.unwrap_or(0.0) * 9.0 + (new - old)));
        }
        current.dts = dts;
    }

    /// 流未初始化时决定包是否丢弃；返回 false 表示带 drop 标记投递
    fn check_player_init(&mut self, kind: StreamKind) -> bool {
        let Some(current) = self.current(kind) else { return true };
        if current.inited {
            return true;
        }
        let dts = current.dts;

        if let Some(start) = current.start_pts {
            let Some(dts) = dts else {
                debug!("{} 丢弃无时间戳的{}包，等待到达起始点 {:.3}s", log_ctx(), kind.as_str(), start / TIME_BASE);
                return false;
            };
            if start - dts > MAX_START_SKIP {
                debug!("{} 距离起始点过远，放弃精确定位", log_ctx());
                for stream in self.streams.iter_mut().flatten() {
                    if stream.start_pts.is_some() {
                        stream.start_pts = Some(dts);
                    }
                }
            } else if dts < start {
                return false;
            }
        }

        let Some(dts) = dts else { return true };
        let audio_open = self.is_open(StreamKind::Audio);
        let video_open = self.is_open(StreamKind::Video);
        let play_speed = self.play_speed;
        let earliest = AV_KINDS
            .iter()
            .filter_map(|k| self.current(*k))
            .filter(|s| s.inited)
            .filter_map(|s| s.start_pts)
            .fold(dts, f64::min);

        let Some(current) = self.current_mut(kind) else { return true };
        current.inited = true;
        current.start_pts = Some(dts);

        if current.sync == SyncState::InSync && AV_KINDS.contains(&kind) {
            let set_clock = match kind {
                StreamKind::Audio => !video_open || play_speed == PLAYSPEED_NORMAL,
                _ => !audio_open || play_speed != PLAYSPEED_NORMAL,
            };
            let offset = dts - earliest;
            if offset > 0.0 && offset <= MAX_START_DELAY {
                send_control(&current.stage, Message::GeneralDelay(offset), 0);
            } else if offset > MAX_START_DELAY {
                warn!("{} ⚠ {}流起始时间相差 {:.0}ms，不做延迟补偿", log_ctx(), kind.as_str(), time_to_msec(offset));
            }
            debug!("{} 🔄 {}流重新初始化: dts={:.3}s set_clock={}", log_ctx(), kind.as_str(), dts / TIME_BASE, set_clock);
            if !send_control(&current.stage, Message::GeneralResync { pts: dts, set_clock }, 0) {
                // 阶段没有收到新起点，下一个包重新初始化
                current.inited = false;
                return false;
            }
        }
        true
    }

    fn handle_eof(&mut self) -> Option<LoopExit> {
        if !self.eof_sent {
            info!("{} 📄 输入结束，通知各阶段排空", log_ctx());
            self.send_to_all(Message::GeneralEof, 0);
            // 不会再有数据，FULL 目标不可能达到
            if self.caching == CachingState::Full {
                self.set_caching(CachingState::Init);
            }
            self.eof_sent = true;
            self.eof_deadline = Instant::now() + EOF_SETTLE_TIMEOUT;
        }

        // 暂停或仍在播放时保持线程存活，允许往回 seek
        if self.play_speed == PLAYSPEED_PAUSE {
            thread::sleep(IDLE_SLEEP);
            return None;
        }
        if AV_KINDS.iter().any(|k| self.current(*k).is_some_and(|s| s.stage.has_data())) {
            self.eof_deadline = Instant::now() + EOF_SETTLE_TIMEOUT;
            thread::sleep(IDLE_SLEEP);
            return None;
        }
        let unsynced = AV_KINDS
            .iter()
            .any(|k| self.current(*k).is_some_and(|s| s.sync != SyncState::InSync));
        if unsynced && Instant::now() < self.eof_deadline {
            thread::sleep(IDLE_SLEEP);
            return None;
        }
        if unsynced {
            warn!("{} ⚠ EOF 后输出阶段未能同步，直接结束", log_ctx());
        }
        Some(LoopExit::Ended)
    }

    /// 暂无数据：按导航器的 hold / 静止帧状态推进
    fn handle_no_data(&mut self) -> Option<LoopExit> {
        let Some(nav) = self.navigator.as_ref() else {
            thread::sleep(QUEUE_FULL_BACKOFF);
            return None;
        };
        let (held, still, nav_eof) = (nav.is_held(), nav.still_state(), nav.is_eof());

        if nav_eof {
            return self.handle_eof();
        }

        let av_busy = AV_KINDS.iter().any(|k| self.current(*k).is_some_and(|s| s.stage.has_data()));
        if held && !av_busy {
            info!("{} 💿 输入处于 hold，队列已排空，继续", log_ctx());
            self.synchronize_players(SyncSources::ALL);
            if let Some(nav) = self.navigator.as_mut() {
                nav.skip_hold();
            }
        }

        match still {
            Some(duration_ms) if duration_ms != i64::MAX => {
                let since = *self.still_started.get_or_insert_with(Instant::now);
                if since.elapsed() >= Duration::from_millis(duration_ms.max(0) as u64) {
                    info!("{} 💿 静止帧 {}ms 已结束", log_ctx(), duration_ms);
                    self.still_started = None;
                    if let Some(nav) = self.navigator.as_mut() {
                        nav.skip_still();
                    }
                }
            }
            Some(_) => {}
            None => self.still_started = None,
        }

        thread::sleep(QUEUE_FULL_BACKOFF);
        None
    }

    // ---------------------------------------------------------------------
    // 缓冲与同步
    // ---------------------------------------------------------------------

    /// 打开的音视频队列中水位最高者
    fn cache_level(&self) -> u32 {
        AV_KINDS
            .iter()
            .filter_map(|k| self.current(*k))
            .map(|s| s.stage.level())
            .max()
            .unwrap_or(0)
    }

    fn av_queue_full(&self) -> bool {
        AV_KINDS
            .iter()
            .filter_map(|k| self.current(*k))
            .any(|s| !s.stage.accepts_data())
    }

    /// 静止画面或导航等待时允许长时间无数据
    fn tolerate_stall(&self) -> bool {
        self.navigator.as_ref().is_some_and(|nav| nav.still_state().is_some())
            || self.current(StreamKind::Video).is_some_and(|v| v.hints.still_images)
    }

    fn set_caching(&mut self, state: CachingState) {
        let state = match state {
            CachingState::Flush if self.source.has_read_cache() => CachingState::Full,
            CachingState::Flush => CachingState::Init,
            other => other,
        };
        if state == self.caching {
            return;
        }
        info!("{} 📶 缓冲状态: {:?} → {:?}", log_ctx(), self.caching, state);

        match state {
            CachingState::Full | CachingState::Init => {
                self.ctx.clock.set_speed(PLAYSPEED_PAUSE);
                self.send_to_av(Message::PlayerSetSpeed(PLAYSPEED_PAUSE), 1);
                self.caching_timer = Instant::now() + CACHING_TIMEOUT;
            }
            CachingState::Play => self.restore_speed(),
            CachingState::Done if self.caching != CachingState::Play => self.restore_speed(),
            _ => {}
        }

        self.caching = state;
        self.ctx.clock.set_speed_adjust(0.0);
        self.emit(PlayerEvent::Caching {
            caching: matches!(state, CachingState::Full | CachingState::Init),
            percent: self.cache_level(),
        });
    }

    fn restore_speed(&self) {
        self.ctx.clock.set_speed(self.play_speed);
        self.send_to_av(Message::PlayerSetSpeed(self.play_speed), 1);
    }

    fn handle_play_speed(&mut self) {
        let now = Instant::now();

        if self.caching != CachingState::Done && self.tolerate_stall() {
            self.set_caching(CachingState::Done);
        }

        if self.caching == CachingState::Full
            && (self.cache_level() >= self.ctx.settings.cache_fill_target || self.av_queue_full())
        {
            self.set_caching(CachingState::Init);
        }

        if self.caching == CachingState::Init {
            let starting = AV_KINDS.iter().any(|k| self.sync_of(*k) == Some(SyncState::Starting));
            if !starting {
                self.set_caching(CachingState::Play);
            } else if self.is_open(StreamKind::Audio)
                && self.is_open(StreamKind::Video)
                && self.av_queue_full()
                && now >= self.caching_timer
            {
                warn!("{} ⚠ 队列已满仍无法起播，强制结束缓冲", log_ctx());
                self.set_caching(CachingState::Done);
            }
        }

        if self.caching == CachingState::Play {
            let stalled = AV_KINDS
                .iter()
                .filter_map(|k| self.current(*k))
                .any(|s| s.stage.is_stalled());
            if !stalled {
                self.set_caching(CachingState::Done);
            }
        }

        if self.caching == CachingState::Done
            && self.play_speed == PLAYSPEED_NORMAL
            && !self.eof_sent
            && now >= self.sync_timer
        {
            let starved = AV_KINDS
                .iter()
                .filter_map(|k| self.current(*k))
                .any(|s| s.inited && s.stage.is_stalled());
            if starved && self.cache_level() <= STALL_CACHE_LEVEL && !self.tolerate_stall() {
                warn!("{} ⚠ 输出阶段欠载，重新缓冲", log_ctx());
                self.set_caching(CachingState::Full);
            } else if !starved && self.source.is_realtime() {
                self.adjust_live_speed();
            }
        }

        if AV_KINDS.iter().any(|k| self.sync_of(*k) == Some(SyncState::WaitSync)) {
            self.sync_streams();
        }

        self.check_catch_up(now);
    }

    /// 直播流：音频队列快空时略微放慢时钟，水位回升后恢复
    fn adjust_live_speed(&self) {
        let Some(audio) = self.current(StreamKind::Audio) else { return };
        let level = audio.stage.level();
        let current = self.ctx.clock.speed_adjust();

        let adjust = if current >= 0.0 && level < LIVE_LOW_LEVEL {
            LIVE_SLOWDOWN
        } else if current < 0.0 && level > LIVE_RECOVER_LEVEL {
            0.0
        } else {
            return;
        };
        debug!("{} 📡 直播音频水位 {}%，时钟速度修正 {}", log_ctx(), level, adjust);
        self.ctx.clock.set_speed_adjust(adjust);
    }

    /// 一路处于 WAITSYNC 时决定起播时钟
    fn sync_streams(&mut self) {
        for kind in AV_KINDS {
            let other_in_sync = self.sync_of(other_av(kind)) == Some(SyncState::InSync);
            let rejoin = self
                .current(kind)
                .is_some_and(|s| s.sync == SyncState::WaitSync && (s.avsync == AvSyncMode::Cont || other_in_sync));
            if rejoin {
                let clock = self.ctx.clock.get_clock(false);
                info!("{} ⏱ {} 并入当前时钟 {:.3}s", log_ctx(), kind.as_str(), clock / TIME_BASE);
                if let Some(current) = self.current_mut(kind) {
                    if send_control(&current.stage, Message::GeneralResync { pts: clock, set_clock: false }, 1) {
                        current.sync = SyncState::InSync;
                        current.avsync = AvSyncMode::None;
                    }
                }
                return;
            }
        }

        if self.ready_to_start(StreamKind::Audio) && self.ready_to_start(StreamKind::Video) {
            self.start_playback();
            return;
        }

        // 视频在整个队列长度内都没有出画面
        let audio_blocked = self.current(StreamKind::Audio).is_some_and(|a| !a.stage.accepts_data());
        let video_stuck = self
            .current(StreamKind::Video)
            .is_some_and(|v| v.sync == SyncState::Starting && v.stage.is_stalled());
        if audio_blocked && video_stuck {
            warn!("{} ⚠ 视频阶段无法起播，清空缓冲", log_ctx());
            self.flush_buffers(false, None, true, true);
        }
    }

    fn ready_to_start(&self, kind: StreamKind) -> bool {
        let Some(current) = self.current(kind) else { return true };
        let other = self.current(other_av(kind));
        current.sync == SyncState::WaitSync
            || (current.packets == 0 && other.is_some_and(|o| o.packets > STARVED_PACKETS))
            || (other.is_some_and(|o| !o.stage.accepts_data()) && current.stage.level() < STARVED_LEVEL)
    }

    fn start_playback(&mut self) {
        let video_paused_start = self
            .current(StreamKind::Video)
            .filter(|v| v.packets > 0 && self.play_speed == PLAYSPEED_PAUSE)
            .and_then(|v| v.start_time);
        let earliest = AV_KINDS
            .iter()
            .filter_map(|k| self.current(*k))
            .filter(|s| s.packets > 0)
            .filter_map(|s| s.start_time.map(|start| start - s.cache_time))
            .reduce(f64::min);
        let clock = video_paused_start
            .or(earliest)
            .unwrap_or_else(|| self.ctx.clock.get_clock(false));

        for kind in AV_KINDS {
            if let Some(current) = self.current(kind) {
                debug!(
                    "{} ⏱ {}: start={:?} cache={:.0}ms / {:.0}ms",
                    log_ctx(),
                    kind.as_str(),
                    current.start_time,
                    time_to_msec(current.cache_time),
                    time_to_msec(current.cache_total)
                );
            }
        }
        info!("{} ⏱ 音视频同步起播: clock={:.3}s", log_ctx(), clock / TIME_BASE);

        self.ctx.clock.discontinuity(clock);
        for kind in AV_KINDS {
            if let Some(current) = self.current_mut(kind) {
                current.sync = SyncState::InSync;
                current.avsync = AvSyncMode::None;
            }
        }
        self.send_to_av(Message::GeneralResync { pts: clock, set_clock: false }, 1);
        self.set_caching(CachingState::Done);
        self.sync_timer = Instant::now() + SYNC_GRACE;
    }

    /// 快进 / 快退时画面跟不上时钟，跳到时钟附近重新读取
    fn check_catch_up(&mut self, now: Instant) {
        if now < self.catchup_timer {
            return;
        }
        self.catchup_timer = now + CATCHUP_INTERVAL;

        let Some(video) = self.current(StreamKind::Video) else { return };
        if video.sync != SyncState::InSync {
            return;
        }
        let Some(video_pts) = video.stage.status().current_pts() else { return };

        let clock = self.ctx.clock.get_clock(false);
        let ahead = clock - video_pts;
        let forward = self.play_speed > PLAYSPEED_NORMAL && ahead > CATCHUP_LEAD;
        let backward = self.play_speed < 0 && ahead < -CATCHUP_LEAD;
        if !forward && !backward {
            return;
        }

        let target = if forward { clock + CATCHUP_LEAD } else { clock - CATCHUP_LEAD };
        let time_ms = time_to_msec(target).max(0.0) as i64;
        info!(
            "{} ⏩ 画面落后时钟 {:.0}ms，跳到 {}ms",
            log_ctx(),
            time_to_msec(ahead),
            time_ms
        );
        self.put_self(
            Message::PlayerSeek {
                time_ms,
                backward,
                flush: true,
            },
            1,
        );
    }

    /// 向打开的音频 / 视频 / 字幕阶段发送同步屏障（不等待）
    fn synchronize_players(&self, sources: SyncSources) {
        let mut mask = SyncSources::NONE;
        let mut targets = Vec::new();
        for (kind, source) in [
            (StreamKind::Audio, SyncSources::AUDIO),
            (StreamKind::Video, SyncSources::VIDEO),
            (StreamKind::Subtitle, SyncSources::SUBTITLE),
        ] {
            if sources.contains(source) && self.is_open(kind) {
                mask = mask.union(source);
                targets.push(kind);
            }
        }
        if targets.is_empty() {
            return;
        }

        debug!("{} 🔒 同步输出阶段: sources={:?}", log_ctx(), mask);
        let barrier = Arc::new(SynchronizeBarrier::new(
            Duration::from_millis(self.ctx.settings.sync_timeout_ms),
            mask,
        ));
        self.send_to_kinds(&targets, Message::GeneralSynchronize(barrier), 0);
    }

    /// 清空缓冲
    ///
    /// `queued` 为 true 时 FLUSH 随数据排队送达；否则直接清空队列并等待各阶段处理完 FLUSH。
    fn flush_buffers(&mut self, queued: bool, pts: Option<f64>, accurate: bool, sync: bool) {
        info!(
            "{} 🧹 清空缓冲: queued={} pts={:?} accurate={} sync={}",
            log_ctx(),
            queued,
            pts,
            accurate,
            sync
        );
        let start_pts = if accurate { pts } else { None };
        for current in self.streams.iter_mut().flatten() {
            current.dts = None;
            current.duration = None;
            current.packets = 0;
            current.start_pts = start_pts;
            if sync {
                current.inited = false;
            }
        }

        if queued {
            self.send_to_all(Message::GeneralFlush { sync: false }, 0);
            self.send_to_kinds(&[StreamKind::Video], Message::VideoNoSkip, 0);
            self.synchronize_players(SyncSources::ALL);
        } else {
            self.source.flush();
            for current in self.streams.iter().flatten() {
                current.stage.flush(sync);
            }
            self.ctx.reset_overlays();

            if self.play_speed == PLAYSPEED_NORMAL || self.play_speed == PLAYSPEED_PAUSE {
                // 等音视频阶段处理完 FLUSH，之前发出的 STARTED 全部作废
                let mut sources = SyncSources::OWNER;
                if self.is_open(StreamKind::Audio) {
                    sources = sources.union(SyncSources::AUDIO);
                }
                if self.is_open(StreamKind::Video) {
                    sources = sources.union(SyncSources::VIDEO);
                }
                let barrier = Arc::new(SynchronizeBarrier::new(FLUSH_BARRIER_TIMEOUT, sources));
                self.send_to_av(Message::GeneralSynchronize(barrier.clone()), 1);
                barrier.wait_until(&self.stop, SyncSources::OWNER);
                self.messenger.flush(Some(MessageKind::PlayerStarted));

                self.set_caching(CachingState::Flush);
                if sync {
                    for kind in AV_KINDS {
                        if let Some(current) = self.current_mut(kind) {
                            current.sync = SyncState::Starting;
                            current.avsync = AvSyncMode::None;
                        }
                    }
                }
            }
        }

        if sync {
            if let Some(pts) = pts {
                self.ctx.clock.discontinuity(pts);
            }
        }
    }

    // ---------------------------------------------------------------------
    // 状态上报
    // ---------------------------------------------------------------------

    fn media_info(&self) -> MediaInfo {
        let mut info = MediaInfo {
            duration: self.source.duration_ms(),
            ..Default::default()
        };
        if let Some(video) = self.current(StreamKind::Video) {
            info.width = video.hints.width;
            info.height = video.hints.height;
            info.fps = video.hints.fps.unwrap_or(0.0);
            info.video_codec = video.hints.codec.clone();
        }
        if let Some(audio) = self.current(StreamKind::Audio) {
            info.audio_codec = audio.hints.codec.clone();
            info.sample_rate = audio.hints.sample_rate;
            info.channels = audio.hints.channels;
        }
        info
    }

    fn state_snapshot(&self) -> PlayerState {
        let caching = matches!(self.caching, CachingState::Full | CachingState::Init);
        let state = if caching {
            PlaybackState::Caching
        } else if self.play_speed == PLAYSPEED_PAUSE {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };
        PlayerState {
            state,
            position: time_to_msec(self.ctx.clock.get_clock(false)).max(0.0) as i64,
            duration: self.source.duration_ms(),
            speed: self.play_speed,
            caching,
            cache_level: self.cache_level(),
            audio_sync: self.current(StreamKind::Audio).map(|s| s.stage.status().sync_state()),
            video_sync: self.current(StreamKind::Video).map(|s| s.stage.status().sync_state()),
        }
    }

    fn report_state_periodically(&mut self) {
        let now = Instant::now();
        if now < self.next_report {
            return;
        }
        self.next_report = now + Duration::from_millis(self.ctx.settings.report_interval_ms.max(1));
        self.emit(PlayerEvent::StateReport(self.state_snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlaybackClock, PlayerSettings};
    use crate::player::synthetic::{
        SyntheticConfig, SyntheticDecoderFactory, SyntheticDemuxer, VirtualOutputs, AUDIO_STREAM_ID, VIDEO_STREAM_ID,
    };

    fn context(factory: SyntheticDecoderFactory) -> PlayerContext {
        context_with(PlayerSettings::default(), factory)
    }

    fn context_with(settings: PlayerSettings, factory: SyntheticDecoderFactory) -> PlayerContext {
        let clock = PlaybackClock::with_monotonic();
        let outputs = Arc::new(VirtualOutputs::new(clock.clone(), &settings));
        PlayerContext::new(clock, settings, Arc::new(factory), outputs)
    }

    /// 等待满足条件的事件，超时返回 None
    fn wait_for<F>(events: &Receiver<PlayerEvent>, timeout: Duration, mut pred: F) -> Option<PlayerEvent>
    where
        F: FnMut(&PlayerEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_source_without_streams_stops() {
        let config = SyntheticConfig {
            audio: None,
            video: None,
            ..Default::default()
        };
        let mut thread =
            DemuxerThread::start(Box::new(SyntheticDemuxer::new(config)), context(Default::default()), None).unwrap();
        let event = wait_for(&thread.events(), Duration::from_secs(5), |e| matches!(e, PlayerEvent::Stopped { .. }));
        assert!(event.is_some());
        thread.stop();
    }

    #[test]
    fn test_failing_decoder_disables_stream() {
        let factory = SyntheticDecoderFactory::failing(&[StreamKind::Video]);
        let mut thread = DemuxerThread::start(
            Box::new(SyntheticDemuxer::new(SyntheticConfig::default())),
            context(factory),
            None,
        )
        .unwrap();
        let events = thread.events();
        let failed = wait_for(&events, Duration::from_secs(5), |e| {
            matches!(e, PlayerEvent::StreamOpenFailed { kind: StreamKind::Video, .. })
        });
        assert!(failed.is_some());

        // 只剩音频也能正常打开
        let opened = wait_for(&events, Duration::from_secs(5), |e| matches!(e, PlayerEvent::Opened(_)));
        match opened {
            Some(PlayerEvent::Opened(info)) => {
                assert_eq!(info.width, 0);
                assert_eq!(info.sample_rate, 48_000);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        thread.stop();
    }

    #[test]
    fn test_read_errors_within_budget_are_retried() {
        let config = SyntheticConfig {
            duration_ms: 1_000,
            failing_reads: 3,
            ..Default::default()
        };
        let mut thread =
            DemuxerThread::start(Box::new(SyntheticDemuxer::new(config)), context(Default::default()), None).unwrap();
        let started = wait_for(&thread.events(), Duration::from_secs(5), |e| {
            matches!(e, PlayerEvent::StageStarted(_) | PlayerEvent::Stopped { .. })
        });
        assert!(matches!(started, Some(PlayerEvent::StageStarted(_))));
        thread.stop();
    }

    #[test]
    fn test_read_errors_beyond_budget_stop_playback() {
        let config = SyntheticConfig {
            failing_reads: 100,
            ..Default::default()
        };
        let mut thread =
            DemuxerThread::start(Box::new(SyntheticDemuxer::new(config)), context(Default::default()), None).unwrap();
        let stopped = wait_for(&thread.events(), Duration::from_secs(5), |e| matches!(e, PlayerEvent::Stopped { .. }));
        match stopped {
            Some(PlayerEvent::Stopped { reason }) => assert!(reason.contains("读包失败")),
            other => panic!("unexpected event: {:?}", other),
        }
        thread.stop();
    }

    #[test]
    fn test_short_clip_plays_to_end() {
        let config = SyntheticConfig {
            duration_ms: 800,
            ..Default::default()
        };
        let mut thread =
            DemuxerThread::start(Box::new(SyntheticDemuxer::new(config)), context(Default::default()), None).unwrap();
        let ended = wait_for(&thread.events(), Duration::from_secs(10), |e| {
            matches!(e, PlayerEvent::Ended | PlayerEvent::Stopped { .. })
        });
        assert!(matches!(ended, Some(PlayerEvent::Ended)));
        thread.stop();
        assert!(thread.is_finished());
    }

    #[test]
    fn test_synchronize_returns_after_messages_handled() {
        let ctx = context(Default::default());
        let observer = ctx.clone();
        let mut thread =
            DemuxerThread::start(Box::new(SyntheticDemuxer::new(SyntheticConfig::default())), ctx, None).unwrap();
        let events = thread.events();
        let opened = wait_for(&events, Duration::from_secs(5), |e| matches!(e, PlayerEvent::Opened(_)));
        assert!(opened.is_some());

        assert!(observer.subtitles_visible());
        thread.send(Message::PlayerSetSubtitleVisible(false), 0).unwrap();
        thread.synchronize();
        assert!(!observer.subtitles_visible());
        thread.stop();
    }

    /// 小队列：几十个合成包就能把水位推高
    fn small_queue_settings() -> PlayerSettings {
        PlayerSettings {
            audio_queue_max_bytes: Some(4096),
            video_queue_max_bytes: Some(32 * 1024),
            ..Default::default()
        }
    }

    fn dispatcher(config: SyntheticConfig) -> (Dispatcher, Receiver<PlayerEvent>) {
        let messenger = Arc::new(MessageQueue::new("player"));
        messenger.init();
        let (tx, rx) = unbounded();
        let dispatcher = Dispatcher::new(
            context_with(small_queue_settings(), Default::default()),
            Box::new(SyntheticDemuxer::new(config)),
            None,
            messenger,
            Arc::new(AtomicBool::new(false)),
            tx,
        );
        (dispatcher, rx)
    }

    /// 装上不消费消息的阶段，发给它的消息留在队列里
    fn attach_idle_stage(dispatcher: &mut Dispatcher, kind: StreamKind) {
        let stream = dispatcher
            .source
            .streams()
            .into_iter()
            .find(|s| s.hints.kind == kind)
            .expect("source has no such stream");
        let stage = StageHandle::spawn(dispatcher.stage_link(kind), |_link| {}).unwrap();
        dispatcher.streams[slot_index(kind)] = Some(CurrentStream::new(&stream, stage));
    }

    /// 取出阶段队列里的全部消息（高优先级在前）
    fn received(dispatcher: &Dispatcher, kind: StreamKind) -> Vec<Arc<Message>> {
        let queue = dispatcher.current(kind).expect("stage not attached").stage.queue().clone();
        let mut messages = Vec::new();
        while let Ok((msg, _)) = queue.get(Duration::ZERO, 0) {
            messages.push(msg);
        }
        messages
    }

    fn dispatch_next(dispatcher: &mut Dispatcher) {
        match dispatcher.source.read_packet() {
            Ok(ReadOutcome::Packet(packet)) => dispatcher.process_packet(packet),
            other => panic!("unexpected read: {:?}", other),
        }
    }

    fn packet(stream_id: i32, time_ms: f64, duration_ms: f64) -> DemuxPacket {
        DemuxPacket {
            data: vec![0; 64],
            pts: Some(msec_to_time(time_ms)),
            dts: Some(msec_to_time(time_ms)),
            duration: Some(msec_to_time(duration_ms)),
            stream_id,
            ..Default::default()
        }
    }

    fn resyncs(messages: &[Arc<Message>]) -> Vec<(f64, bool)> {
        messages
            .iter()
            .filter_map(|m| match &**m {
                Message::GeneralResync { pts, set_clock } => Some((*pts, *set_clock)),
                _ => None,
            })
            .collect()
    }

    fn mark_in_sync(dispatcher: &mut Dispatcher) {
        for current in dispatcher.streams.iter_mut().flatten() {
            current.sync = SyncState::InSync;
        }
    }

    #[test]
    fn test_audio_format_change_sends_stream_change_with_new_decoder() {
        let (mut dispatcher, events) = dispatcher(SyntheticConfig {
            video: None,
            audio_change_at_ms: Some(100),
            ..Default::default()
        });
        attach_idle_stage(&mut dispatcher, StreamKind::Audio);

        // 0 - 80ms 五个包参数不变，第六个包 (100ms) 起采样率减半
        for _ in 0..5 {
            dispatch_next(&mut dispatcher);
        }
        assert!(received(&dispatcher, StreamKind::Audio)
            .iter()
            .all(|m| m.kind() == MessageKind::DemuxerPacket));
        dispatch_next(&mut dispatcher);

        let messages = received(&dispatcher, StreamKind::Audio);
        let kinds: Vec<MessageKind> = messages.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec![MessageKind::GeneralStreamChange, MessageKind::DemuxerPacket]);
        match &*messages[0] {
            Message::GeneralStreamChange(change) => {
                assert_eq!(change.hints.sample_rate, 24_000);
                assert!(matches!(change.take_codec(), Some(CodecHandle::Audio(_))));
                assert!(change.take_codec().is_none());
            }
            other => panic!("unexpected message: {:?}", other.kind()),
        }

        let audio = dispatcher.current(StreamKind::Audio).unwrap();
        assert_eq!(audio.hints.sample_rate, 24_000);
        assert_eq!(audio.sync, SyncState::Starting);
        // 变化后的第一个包时间戳连续，阶段就绪后可直接并入时钟
        assert_eq!(audio.avsync, AvSyncMode::Cont);

        // 阶段重建输出后上报，控制方收到 AvChange
        dispatcher
            .messenger
            .put(Arc::new(Message::PlayerAvChange(StageKind::Audio)), 1)
            .unwrap();
        assert!(dispatcher.handle_messages().is_none());
        assert!(events.try_iter().any(|e| matches!(e, PlayerEvent::AvChange(StageKind::Audio))));
        dispatcher.close_all();
    }

    #[test]
    fn test_forward_jump_resyncs_with_start_delay() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig::default());
        attach_idle_stage(&mut dispatcher, StreamKind::Audio);
        attach_idle_stage(&mut dispatcher, StreamKind::Video);
        for p in [
            packet(AUDIO_STREAM_ID, 0.0, 20.0),
            packet(VIDEO_STREAM_ID, 0.0, 40.0),
            packet(AUDIO_STREAM_ID, 20.0, 20.0),
            packet(AUDIO_STREAM_ID, 40.0, 20.0),
            packet(VIDEO_STREAM_ID, 40.0, 40.0),
        ] {
            dispatcher.process_packet(p);
        }
        mark_in_sync(&mut dispatcher);
        assert!(resyncs(&received(&dispatcher, StreamKind::Audio)).is_empty());
        assert!(resyncs(&received(&dispatcher, StreamKind::Video)).is_empty());

        // 音频先跳到 5s：以它为新起点并重设时钟
        dispatcher.process_packet(packet(AUDIO_STREAM_ID, 5_000.0, 20.0));
        let audio = received(&dispatcher, StreamKind::Audio);
        assert_eq!(resyncs(&audio), vec![(msec_to_time(5_000.0), true)]);
        assert!(matches!(&*audio[1], Message::DemuxerPacket { drop: false, .. }));

        // 视频晚 500ms 到达：先延迟再同步，不动时钟
        dispatcher.process_packet(packet(VIDEO_STREAM_ID, 5_500.0, 40.0));
        let video = received(&dispatcher, StreamKind::Video);
        let kinds: Vec<MessageKind> = video.iter().map(|m| m.kind()).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::GeneralDelay, MessageKind::GeneralResync, MessageKind::DemuxerPacket]
        );
        assert!(matches!(&*video[0], Message::GeneralDelay(delay) if *delay == msec_to_time(500.0)));
        assert_eq!(resyncs(&video), vec![(msec_to_time(5_500.0), false)]);
        dispatcher.close_all();
    }

    #[test]
    fn test_timestamp_wrap_resyncs_audio_only_stream() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig {
            video: None,
            ..Default::default()
        });
        attach_idle_stage(&mut dispatcher, StreamKind::Audio);
        dispatcher.process_packet(packet(AUDIO_STREAM_ID, 30_000.0, 20.0));
        dispatcher.process_packet(packet(AUDIO_STREAM_ID, 30_020.0, 20.0));
        mark_in_sync(&mut dispatcher);
        received(&dispatcher, StreamKind::Audio);

        dispatcher.process_packet(packet(AUDIO_STREAM_ID, 0.0, 20.0));
        let audio = received(&dispatcher, StreamKind::Audio);
        assert_eq!(resyncs(&audio), vec![(0.0, true)]);
        assert!(matches!(audio.last().map(|m| &**m), Some(Message::DemuxerPacket { drop: false, .. })));
        let current = dispatcher.current(StreamKind::Audio).unwrap();
        assert!(current.inited);
        assert_eq!(current.start_pts, Some(0.0));
        dispatcher.close_all();
    }

    #[test]
    fn test_caching_fills_then_starts_both_stages() {
        let (mut dispatcher, events) = dispatcher(SyntheticConfig {
            read_cache: true,
            ..Default::default()
        });
        attach_idle_stage(&mut dispatcher, StreamKind::Audio);
        attach_idle_stage(&mut dispatcher, StreamKind::Video);

        // 带预读缓存的输入先进入 FULL
        dispatcher.set_caching(CachingState::Flush);
        assert_eq!(dispatcher.caching, CachingState::Full);

        for _ in 0..200 {
            if dispatcher.cache_level() >= dispatcher.ctx.settings.cache_fill_target || dispatcher.av_queue_full() {
                break;
            }
            dispatch_next(&mut dispatcher);
        }
        dispatcher.handle_play_speed();
        assert_eq!(dispatcher.caching, CachingState::Init);

        for stage in [StageKind::Audio, StageKind::Video] {
            let info = StartInfo {
                stage,
                cache_time: 0.0,
                cache_total: 0.0,
                timestamp: Some(0.0),
            };
            dispatcher.messenger.put(Arc::new(Message::PlayerStarted(info)), 1).unwrap();
        }
        assert!(dispatcher.handle_messages().is_none());
        assert_eq!(dispatcher.sync_of(StreamKind::Audio), Some(SyncState::WaitSync));
        dispatcher.handle_play_speed();

        assert_eq!(dispatcher.caching, CachingState::Done);
        assert_eq!(dispatcher.sync_of(StreamKind::Audio), Some(SyncState::InSync));
        assert_eq!(dispatcher.sync_of(StreamKind::Video), Some(SyncState::InSync));

        for kind in AV_KINDS {
            let messages = received(&dispatcher, kind);
            let speeds: Vec<i32> = messages
                .iter()
                .filter_map(|m| match &**m {
                    Message::PlayerSetSpeed(speed) => Some(*speed),
                    _ => None,
                })
                .collect();
            // FULL、INIT 暂停，PLAY 恢复
            assert_eq!(speeds, vec![PLAYSPEED_PAUSE, PLAYSPEED_PAUSE, PLAYSPEED_NORMAL]);
            assert_eq!(resyncs(&messages), vec![(0.0, false)]);
            let resync_at = messages.iter().position(|m| m.kind() == MessageKind::GeneralResync);
            let last_speed_at = messages.iter().rposition(|m| m.kind() == MessageKind::PlayerSetSpeed);
            assert!(resync_at > last_speed_at);
        }

        let events: Vec<PlayerEvent> = events.try_iter().collect();
        let caching: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::Caching { caching, .. } => Some(*caching),
                _ => None,
            })
            .collect();
        assert_eq!(caching, vec![true, true, false, false]);
        assert_eq!(events.iter().filter(|e| matches!(e, PlayerEvent::StageStarted(_))).count(), 2);
        dispatcher.close_all();
    }

    #[test]
    fn test_caching_without_read_cache_starts_in_init() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig::default());
        attach_idle_stage(&mut dispatcher, StreamKind::Audio);
        dispatcher.set_caching(CachingState::Flush);
        assert_eq!(dispatcher.caching, CachingState::Init);
        dispatcher.close_all();
    }

    fn queued_seek(dispatcher: &Dispatcher) -> Option<(i64, bool)> {
        match dispatcher.messenger.get(Duration::ZERO, 0) {
            Ok((msg, _)) => match &*msg {
                Message::PlayerSeek { time_ms, backward, .. } => Some((*time_ms, *backward)),
                _ => None,
            },
            Err(_) => None,
        }
    }

    #[test]
    fn test_fast_forward_catches_up_with_clock() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig::default());
        attach_idle_stage(&mut dispatcher, StreamKind::Video);
        mark_in_sync(&mut dispatcher);
        dispatcher.play_speed = 2 * PLAYSPEED_NORMAL;

        let video = dispatcher.current(StreamKind::Video).unwrap();
        video.stage.status().set_current_pts(Some(0.0));
        dispatcher.ctx.clock.discontinuity(msec_to_time(5_000.0));

        let now = Instant::now();
        dispatcher.check_catch_up(now);
        let (time_ms, backward) = queued_seek(&dispatcher).expect("no catch-up seek queued");
        assert!(!backward);
        // 时钟前方 1s
        assert!((6_000..6_200).contains(&time_ms), "time_ms={}", time_ms);

        // 同一检查周期内不重复发起
        dispatcher.check_catch_up(now);
        assert!(queued_seek(&dispatcher).is_none());
        dispatcher.close_all();
    }

    #[test]
    fn test_rewind_catches_up_backwards() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig::default());
        attach_idle_stage(&mut dispatcher, StreamKind::Video);
        mark_in_sync(&mut dispatcher);
        dispatcher.play_speed = -2 * PLAYSPEED_NORMAL;

        let video = dispatcher.current(StreamKind::Video).unwrap();
        video.stage.status().set_current_pts(Some(msec_to_time(8_000.0)));
        dispatcher.ctx.clock.discontinuity(msec_to_time(3_000.0));

        dispatcher.check_catch_up(Instant::now());
        let (time_ms, backward) = queued_seek(&dispatcher).expect("no catch-up seek queued");
        assert!(backward);
        assert!((1_900..2_100).contains(&time_ms), "time_ms={}", time_ms);
        dispatcher.close_all();
    }

    #[test]
    fn test_catch_up_ignores_normal_speed() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig::default());
        attach_idle_stage(&mut dispatcher, StreamKind::Video);
        mark_in_sync(&mut dispatcher);
        let video = dispatcher.current(StreamKind::Video).unwrap();
        video.stage.status().set_current_pts(Some(0.0));
        dispatcher.ctx.clock.discontinuity(msec_to_time(5_000.0));

        dispatcher.check_catch_up(Instant::now());
        assert!(queued_seek(&dispatcher).is_none());
        dispatcher.close_all();
    }

    #[test]
    fn test_live_stream_slows_clock_while_audio_queue_is_low() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig {
            video: None,
            realtime: true,
            ..Default::default()
        });
        attach_idle_stage(&mut dispatcher, StreamKind::Audio);
        assert_eq!(dispatcher.caching, CachingState::Done);

        dispatcher.handle_play_speed();
        assert_eq!(dispatcher.ctx.clock.speed_adjust(), LIVE_SLOWDOWN);

        // 256 字节一包，两包即超过恢复水位
        dispatch_next(&mut dispatcher);
        dispatch_next(&mut dispatcher);
        assert!(dispatcher.cache_level() > LIVE_RECOVER_LEVEL);
        dispatcher.handle_play_speed();
        assert_eq!(dispatcher.ctx.clock.speed_adjust(), 0.0);
        dispatcher.close_all();
    }

    #[test]
    fn test_file_playback_never_adjusts_clock_speed() {
        let (mut dispatcher, _events) = dispatcher(SyntheticConfig {
            video: None,
            ..Default::default()
        });
        attach_idle_stage(&mut dispatcher, StreamKind::Audio);
        dispatcher.handle_play_speed();
        assert_eq!(dispatcher.ctx.clock.speed_adjust(), 0.0);
        dispatcher.close_all();
    }
}
