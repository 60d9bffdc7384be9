use serde::{Deserialize, Serialize};

/// 时间基：1 秒 = 1_000_000 个单位（微秒）
pub const TIME_BASE: f64 = 1_000_000.0;

/// 播放速度：暂停
pub const PLAYSPEED_PAUSE: i32 = 0;
/// 播放速度：正常（1000 = 1.0x）
pub const PLAYSPEED_NORMAL: i32 = 1000;

/// 毫秒 -> 时间基单位
pub fn msec_to_time(ms: f64) -> f64 {
    ms * TIME_BASE / 1000.0
}

/// 秒 -> 时间基单位
pub fn sec_to_time(sec: f64) -> f64 {
    sec * TIME_BASE
}

/// 时间基单位 -> 毫秒
pub fn time_to_msec(time: f64) -> f64 {
    time * 1000.0 / TIME_BASE
}

/// 时间基单位 -> 秒
pub fn time_to_sec(time: f64) -> f64 {
    time / TIME_BASE
}

/// 基本流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
    Teletext,
    Rds,
    Id3,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
            StreamKind::Subtitle => "subtitle",
            StreamKind::Teletext => "teletext",
            StreamKind::Rds => "rds",
            StreamKind::Id3 => "id3",
        }
    }
}

/// 流参数（解码器构造依据）
///
/// 同一个流 id 上参数发生变化即视为"流变更"，需要重建解码器。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHints {
    pub kind: StreamKind,
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
    /// 压缩音频直通（不做软件解码）
    pub passthrough: bool,
    /// 静态图片流（菜单/幻灯片），允许长时间停顿
    pub still_images: bool,
    #[serde(default)]
    pub extradata: Vec<u8>,
}

impl StreamHints {
    pub fn audio(codec: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: StreamKind::Audio,
            codec: codec.to_string(),
            sample_rate,
            channels,
            width: 0,
            height: 0,
            fps: None,
            passthrough: false,
            still_images: false,
            extradata: Vec::new(),
        }
    }

    pub fn video(codec: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            kind: StreamKind::Video,
            codec: codec.to_string(),
            sample_rate: 0,
            channels: 0,
            width,
            height,
            fps: Some(fps),
            passthrough: false,
            still_images: false,
            extradata: Vec::new(),
        }
    }

    pub fn subtitle(codec: &str) -> Self {
        Self {
            kind: StreamKind::Subtitle,
            codec: codec.to_string(),
            sample_rate: 0,
            channels: 0,
            width: 0,
            height: 0,
            fps: None,
            passthrough: false,
            still_images: false,
            extradata: Vec::new(),
        }
    }

    pub fn data(kind: StreamKind, codec: &str) -> Self {
        Self {
            kind,
            ..Self::subtitle(codec)
        }
    }
}

/// 容器中的一个基本流
#[derive(Debug, Clone)]
pub struct DemuxStream {
    pub id: i32,
    pub demuxer_id: i32,
    pub hints: StreamHints,
    pub language: Option<String>,
    /// 打开失败后被禁用，不再尝试
    pub disabled: bool,
}

/// 解复用数据包
///
/// 时间戳均为时间基单位；`None` 表示无时间戳。
#[derive(Debug, Clone, Default)]
pub struct DemuxPacket {
    pub data: Vec<u8>,
    pub pts: Option<f64>,
    pub dts: Option<f64>,
    pub duration: Option<f64>,
    pub stream_id: i32,
    pub demuxer_id: i32,
    pub group_id: i32,
}

impl DemuxPacket {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 用于队列时间跨度计算的时间戳（优先 dts）
    pub fn timestamp(&self) -> Option<f64> {
        self.dts.or(self.pts)
    }

    /// 对时间戳做整体偏移校正
    pub fn apply_correction(&mut self, correction: f64) {
        if let Some(dts) = self.dts.as_mut() {
            *dts -= correction;
        }
        if let Some(pts) = self.pts.as_mut() {
            *pts -= correction;
        }
    }
}

/// 音频输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub passthrough: bool,
}

/// 解码后的音频帧
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<f32>,     // 交错 f32 采样
    pub format: AudioFormat,
    pub nb_frames: usize,
    pub pts: Option<f64>,
    /// 整帧时长（时间基单位）
    pub duration: f64,
}

/// 视频输出格式
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// 解码后的视频画面
#[derive(Debug, Clone)]
pub struct VideoPicture {
    pub pts: Option<f64>,
    pub dts: Option<f64>,
    pub duration: Option<f64>,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// 输出阶段的同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Starting,
    WaitSync,
    InSync,
}

/// 输出阶段标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Audio,
    Video,
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Opening,
    Caching,
    Playing,
    Paused,
    Seeking,
    Stopped,
    Error,
}

/// 媒体信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: i64,          // 总时长（毫秒）
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// 播放器状态快照（周期性上报）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub state: PlaybackState,
    pub position: i64,          // 当前位置（毫秒）
    pub duration: i64,          // 总时长（毫秒）
    pub speed: i32,
    pub caching: bool,
    pub cache_level: u32,       // 0 - 100
    pub audio_sync: Option<SyncState>,
    pub video_sync: Option<SyncState>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            position: 0,
            duration: 0,
            speed: PLAYSPEED_NORMAL,
            caching: false,
            cache_level: 0,
            audio_sync: None,
            video_sync: None,
        }
    }
}
