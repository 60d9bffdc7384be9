use thiserror::Error;

/// 播放核心错误类型
#[derive(Error, Debug)]
pub enum PlayerError {
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("解复用错误: {0}")]
    DemuxError(String),

    #[error("解码器错误: {0}")]
    DecodeError(String),

    #[error("渲染错误: {0}")]
    RenderError(String),

    #[error("音频错误: {0}")]
    AudioError(String),

    #[error("流错误: {0}")]
    StreamError(String),

    #[error("消息队列错误: {0}")]
    QueueError(#[from] crate::player::message_queue::QueueError),

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
