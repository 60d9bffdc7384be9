//! 播放同步核心：呈现时钟、消息队列、叠加层容器、解复用分发循环、
//! 音视频输出阶段与 PTS 规律检测。

pub mod core;
pub mod player;
