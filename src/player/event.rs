use crate::core::{MediaInfo, PlayerState, StageKind, StreamKind};
use crate::player::message::StartInfo;

/// 解复用线程向控制方发布的事件
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// 默认流已打开
    Opened(MediaInfo),
    /// 缓冲状态变化
    Caching { caching: bool, percent: u32 },
    /// 输出阶段缓冲就绪
    StageStarted(StartInfo),
    /// 输出阶段格式 / 配置变化
    AvChange(StageKind),
    StateReport(PlayerState),
    Seeked { time_ms: i64 },
    /// 流打开失败，已禁用
    StreamOpenFailed { kind: StreamKind, id: i32, reason: String },
    /// 所有输出阶段已排空
    Ended,
    Stopped { reason: String },
}
