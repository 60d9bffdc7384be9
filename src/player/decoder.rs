use crate::core::{AudioFrame, DemuxPacket, Result, StreamHints, VideoPicture};
use crate::player::overlay::Overlay;

/// 音频解码器
///
/// 调用约定：先 `add_data` 送入一个包，再循环 `get_data` 取出全部可用帧。
pub trait AudioDecoder: Send {
    /// 送入数据包；解码器暂时无法接收时返回 false（调用方把包放回队列稍后再试）
    fn add_data(&mut self, packet: &DemuxPacket) -> bool;

    /// 取出一帧解码结果
    fn get_data(&mut self) -> Option<AudioFrame>;

    /// 丢弃内部缓冲（seek / flush 后调用）
    fn reset(&mut self);

    /// 释放解码资源
    fn dispose(&mut self);

    fn name(&self) -> &str;
}

/// 视频解码器
pub trait VideoDecoder: Send {
    fn add_data(&mut self, packet: &DemuxPacket) -> bool;

    fn get_data(&mut self) -> Option<VideoPicture>;

    fn reset(&mut self);

    fn dispose(&mut self);

    fn name(&self) -> &str;
}

/// 字幕解码器：数据包 -> 叠加层
pub trait SubtitleDecoder: Send {
    fn decode(&mut self, packet: &DemuxPacket) -> Vec<Overlay>;

    fn reset(&mut self);

    fn name(&self) -> &str;
}

/// 解码器工厂
///
/// 构造失败即视为该流无法打开（上层会禁用该流并上报）。
pub trait DecoderFactory: Send + Sync {
    fn create_audio(&self, hints: &StreamHints) -> Result<Box<dyn AudioDecoder>>;

    fn create_video(&self, hints: &StreamHints) -> Result<Box<dyn VideoDecoder>>;

    fn create_subtitle(&self, hints: &StreamHints) -> Result<Box<dyn SubtitleDecoder>>;
}
