//! 线程间消息
//!
//! 解复用线程、各输出阶段与控制器之间只通过 `Arc<Message>` 通信。
//! 消息构造后不可变；`DemuxerPacket` 独占一个数据包，最后一个 `Arc` 释放时随之释放。

use crate::core::{DemuxPacket, StageKind, StreamHints};
use crate::player::decoder::{AudioDecoder, VideoDecoder};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 同步屏障的参与方（位集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSources(pub u32);

impl SyncSources {
    /// 只等待，不算作到达
    pub const NONE: SyncSources = SyncSources(0);
    pub const AUDIO: SyncSources = SyncSources(0x01);
    pub const VIDEO: SyncSources = SyncSources(0x02);
    pub const SUBTITLE: SyncSources = SyncSources(0x04);
    pub const OWNER: SyncSources = SyncSources(0x08);
    pub const ANY: SyncSources = SyncSources(0x10);
    /// 0 表示全部参与方
    pub const ALL: SyncSources = SyncSources(0x01 | 0x02 | 0x04 | 0x08);

    pub fn contains(&self, other: SyncSources) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: SyncSources) -> SyncSources {
        SyncSources(self.0 | other.0)
    }
}

impl From<StageKind> for SyncSources {
    fn from(kind: StageKind) -> Self {
        match kind {
            StageKind::Audio => SyncSources::AUDIO,
            StageKind::Video => SyncSources::VIDEO,
        }
    }
}

/// 同步屏障
///
/// 所有指定参与方都到达，或全局超时到期后放行。
pub struct SynchronizeBarrier {
    sources: u32,
    reached: Mutex<u32>,
    cond: Condvar,
    deadline: Instant,
}

impl SynchronizeBarrier {
    pub fn new(timeout: Duration, sources: SyncSources) -> Self {
        let sources = if sources.0 == 0 { SyncSources::ALL.0 } else { sources.0 };
        Self {
            sources,
            reached: Mutex::new(0),
            cond: Condvar::new(),
            deadline: Instant::now() + timeout,
        }
    }

    /// 以 `source` 身份到达屏障并等待
    ///
    /// 返回 true：屏障已放行（全部到达或全局超时）；false：本次等待超时，调用方可稍后再试。
    pub fn wait(&self, timeout: Duration, source: SyncSources) -> bool {
        let mut reached = self.reached.lock();
        if self.sources & SyncSources::ANY.0 != 0 && source.0 != 0 {
            *reached |= SyncSources::ANY.0;
        }
        *reached |= source.0 & self.sources;

        let call_deadline = Instant::now() + timeout;
        loop {
            if *reached & self.sources == self.sources {
                self.cond.notify_all();
                return true;
            }
            let now = Instant::now();
            if now >= self.deadline {
                return true;
            }
            if now >= call_deadline {
                return false;
            }
            let until = call_deadline.min(self.deadline);
            self.cond.wait_until(&mut reached, until);
        }
    }

    /// 循环等待直到放行或 `stop` 被置位
    pub fn wait_until(&self, stop: &AtomicBool, source: SyncSources) {
        while !self.wait(Duration::from_millis(100), source) {
            if stop.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    pub fn sources(&self) -> SyncSources {
        SyncSources(self.sources)
    }
}

impl fmt::Debug for SynchronizeBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizeBarrier")
            .field("sources", &self.sources)
            .field("reached", &*self.reached.lock())
            .finish()
    }
}

/// 流变更时随消息携带的新解码器
pub enum CodecHandle {
    Audio(Box<dyn AudioDecoder>),
    Video(Box<dyn VideoDecoder>),
}

/// 流变更：新的流参数 + 已构造好的解码器（只能被取走一次）
pub struct StreamChange {
    pub hints: StreamHints,
    codec: Mutex<Option<CodecHandle>>,
}

impl StreamChange {
    pub fn new(hints: StreamHints, codec: CodecHandle) -> Self {
        Self {
            hints,
            codec: Mutex::new(Some(codec)),
        }
    }

    pub fn take_codec(&self) -> Option<CodecHandle> {
        self.codec.lock().take()
    }
}

impl fmt::Debug for StreamChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChange")
            .field("hints", &self.hints)
            .field("has_codec", &self.codec.lock().is_some())
            .finish()
    }
}

/// 阶段进入 WAITSYNC 时上报给解复用线程的启动信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartInfo {
    pub stage: StageKind,
    pub cache_time: f64,
    pub cache_total: f64,
    /// 当前缓冲的首个时间戳
    pub timestamp: Option<f64>,
}

/// 消息类型（无负载），用于按类型清空队列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    GeneralFlush,
    GeneralReset,
    GeneralResync,
    GeneralSynchronize,
    GeneralStreamChange,
    GeneralEof,
    GeneralPause,
    GeneralDelay,
    PlayerSetSpeed,
    PlayerSeek,
    PlayerSetAudioStream,
    PlayerSetVideoStream,
    PlayerSetSubtitleStream,
    PlayerSetSubtitleVisible,
    PlayerStarted,
    PlayerReportState,
    PlayerAvChange,
    DemuxerPacket,
    DemuxerReset,
    VideoNoSkip,
}

/// 线程间消息
#[derive(Debug)]
pub enum Message {
    /// 清空解码器与输出；`sync` 为 true 时阶段回到 STARTING
    GeneralFlush { sync: bool },
    GeneralReset,
    /// 以参考时间戳重新同步；`set_clock` 为 true 时同时重设播放时钟
    ///
    /// 阶段处于 WAITSYNC / STARTING 时 `pts` 是此刻正在播放的时间，
    /// 已同步的阶段把它当作下一包数据的时间戳。
    GeneralResync { pts: f64, set_clock: bool },
    GeneralSynchronize(Arc<SynchronizeBarrier>),
    GeneralStreamChange(StreamChange),
    GeneralEof,
    GeneralPause(bool),
    /// 阶段延迟处理（时间基单位）
    GeneralDelay(f64),

    PlayerSetSpeed(i32),
    PlayerSeek { time_ms: i64, backward: bool, flush: bool },
    PlayerSetAudioStream(i32),
    PlayerSetVideoStream(i32),
    PlayerSetSubtitleStream(i32),
    PlayerSetSubtitleVisible(bool),
    PlayerStarted(StartInfo),
    PlayerReportState,
    PlayerAvChange(StageKind),

    DemuxerPacket { packet: DemuxPacket, drop: bool },
    DemuxerReset,

    VideoNoSkip,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::GeneralFlush { .. } => MessageKind::GeneralFlush,
            Message::GeneralReset => MessageKind::GeneralReset,
            Message::GeneralResync { .. } => MessageKind::GeneralResync,
            Message::GeneralSynchronize(_) => MessageKind::GeneralSynchronize,
            Message::GeneralStreamChange(_) => MessageKind::GeneralStreamChange,
            Message::GeneralEof => MessageKind::GeneralEof,
            Message::GeneralPause(_) => MessageKind::GeneralPause,
            Message::GeneralDelay(_) => MessageKind::GeneralDelay,
            Message::PlayerSetSpeed(_) => MessageKind::PlayerSetSpeed,
            Message::PlayerSeek { .. } => MessageKind::PlayerSeek,
            Message::PlayerSetAudioStream(_) => MessageKind::PlayerSetAudioStream,
            Message::PlayerSetVideoStream(_) => MessageKind::PlayerSetVideoStream,
            Message::PlayerSetSubtitleStream(_) => MessageKind::PlayerSetSubtitleStream,
            Message::PlayerSetSubtitleVisible(_) => MessageKind::PlayerSetSubtitleVisible,
            Message::PlayerStarted(_) => MessageKind::PlayerStarted,
            Message::PlayerReportState => MessageKind::PlayerReportState,
            Message::PlayerAvChange(_) => MessageKind::PlayerAvChange,
            Message::DemuxerPacket { .. } => MessageKind::DemuxerPacket,
            Message::DemuxerReset => MessageKind::DemuxerReset,
            Message::VideoNoSkip => MessageKind::VideoNoSkip,
        }
    }

    pub fn packet(packet: DemuxPacket, drop: bool) -> Arc<Message> {
        Arc::new(Message::DemuxerPacket { packet, drop })
    }

    /// 数据包负载（非数据消息返回 None）
    pub fn demux_packet(&self) -> Option<&DemuxPacket> {
        match self {
            Message::DemuxerPacket { packet, .. } => Some(packet),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_barrier_releases_when_all_sources_arrive() {
        let barrier = Arc::new(SynchronizeBarrier::new(
            Duration::from_secs(10),
            SyncSources::AUDIO.union(SyncSources::VIDEO),
        ));

        let audio = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait(Duration::from_secs(5), SyncSources::AUDIO))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(barrier.wait(Duration::from_secs(5), SyncSources::VIDEO));
        assert!(audio.join().unwrap());
    }

    #[test]
    fn test_barrier_call_timeout_vs_global_timeout() {
        let barrier = SynchronizeBarrier::new(
            Duration::from_millis(150),
            SyncSources::AUDIO.union(SyncSources::VIDEO),
        );
        // 单次等待超时：返回 false
        assert!(!barrier.wait(Duration::from_millis(10), SyncSources::AUDIO));
        // 全局超时后放行
        thread::sleep(Duration::from_millis(160));
        assert!(barrier.wait(Duration::from_millis(10), SyncSources::AUDIO));
    }

    #[test]
    fn test_zero_sources_means_all() {
        let barrier = SynchronizeBarrier::new(Duration::from_secs(1), SyncSources(0));
        assert_eq!(barrier.sources(), SyncSources::ALL);
    }

    #[test]
    fn test_message_kind() {
        let msg = Message::packet(DemuxPacket::default(), false);
        assert_eq!(msg.kind(), MessageKind::DemuxerPacket);
        assert!(msg.demux_packet().is_some());
        assert!(Message::GeneralEof.demux_packet().is_none());
    }
}
