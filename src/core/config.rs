//! 播放核心配置快照
//!
//! 所有阶段在构造时拿到同一份 `PlayerSettings`（依赖注入），运行期间不再读取全局设置。

use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 播放核心配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    /// 音频包队列容量（字节），None 则按时间计算水位
    pub audio_queue_max_bytes: Option<usize>,
    /// 音频包队列容量（秒）
    pub audio_queue_max_secs: f64,
    pub video_queue_max_bytes: Option<usize>,
    pub video_queue_max_secs: f64,
    pub subtitle_queue_max_bytes: Option<usize>,

    /// 以显示刷新为主时钟（音频走重采样同步）
    pub use_display_as_clock: bool,
    /// 参考时钟允许的最大速度修正（百分比）
    pub max_speed_adjust: f64,
    /// 允许变调播放的速度区间（1000 = 1.0x）
    pub tempo_min: i32,
    pub tempo_max: i32,

    /// FULL 缓冲阶段的目标水位（百分比）
    pub cache_fill_target: u32,
    /// 读包失败的最大重试次数
    pub read_retry_budget: u32,
    /// 读包失败后的退避间隔（毫秒）
    pub read_retry_backoff_ms: u64,
    /// 同步屏障全局超时（毫秒）
    pub sync_timeout_ms: u64,

    /// 断点同步阈值下限（毫秒）
    pub discon_min_threshold_ms: f64,
    /// 断点同步阈值上限（毫秒）
    pub discon_max_threshold_ms: f64,
    /// 自学习窗口（秒）
    pub discon_learning_secs: f64,
    /// 学习结束时附加的余量系数
    pub discon_margin: f64,

    /// 音频输出缓存总量（秒）
    pub sink_cache_secs: f64,
    /// 渲染队列容量（帧）
    pub render_queue_capacity: usize,
    /// 是否允许丢帧
    pub allow_frame_drop: bool,
    /// 状态上报间隔（毫秒）
    pub report_interval_ms: u64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            audio_queue_max_bytes: Some(6 * 1024 * 1024),
            audio_queue_max_secs: 8.0,
            video_queue_max_bytes: Some(16 * 1024 * 1024),
            video_queue_max_secs: 8.0,
            subtitle_queue_max_bytes: Some(256 * 1024),
            use_display_as_clock: false,
            max_speed_adjust: 5.0,
            tempo_min: 800,
            tempo_max: 1500,
            cache_fill_target: 60,
            read_retry_budget: 10,
            read_retry_backoff_ms: 50,
            sync_timeout_ms: 10_000,
            discon_min_threshold_ms: 10.0,
            discon_max_threshold_ms: 100.0,
            discon_learning_secs: 30.0,
            discon_margin: 1.5,
            sink_cache_secs: 0.5,
            render_queue_capacity: 8,
            allow_frame_drop: true,
            report_interval_ms: 500,
        }
    }
}

impl PlayerSettings {
    /// 从 JSON 字符串解析（缺失字段使用默认值）
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: PlayerSettings = serde_json::from_str(json)?;
        settings.validated()
    }

    /// 从 JSON 文件加载
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 判断速度是否允许以变调方式播放音频
    pub fn is_tempo_allowed(&self, speed: i32) -> bool {
        speed >= self.tempo_min && speed <= self.tempo_max
    }

    fn validated(self) -> Result<Self> {
        if self.tempo_min > self.tempo_max {
            return Err(crate::core::PlayerError::Other(format!(
                "tempo 区间无效: {} > {}",
                self.tempo_min, self.tempo_max
            )));
        }
        if self.discon_min_threshold_ms > self.discon_max_threshold_ms {
            return Err(crate::core::PlayerError::Other(format!(
                "断点阈值区间无效: {}ms > {}ms",
                self.discon_min_threshold_ms, self.discon_max_threshold_ms
            )));
        }
        if self.render_queue_capacity == 0 {
            return Err(crate::core::PlayerError::Other("渲染队列容量不能为 0".to_string()));
        }
        Ok(self)
    }
}
