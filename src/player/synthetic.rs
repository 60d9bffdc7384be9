//! 合成输入、解码器与虚拟输出
//!
//! 无需任何媒体文件或音视频设备即可驱动完整的播放管线：
//! 演示程序、集成测试和无头环境都使用这里的实现。

use crate::core::{
    msec_to_time, AudioFormat, AudioFrame, DemuxPacket, DemuxStream, PlaybackClock, PlayerError, PlayerSettings,
    Result, StreamHints, StreamKind, VideoPicture, TIME_BASE,
};
use crate::player::audio_sink::{AudioSink, SinkStats, VirtualAudioSink};
use crate::player::context::OutputFactory;
use crate::player::decoder::{AudioDecoder, DecoderFactory, SubtitleDecoder, VideoDecoder};
use crate::player::demuxer_source::{AncillarySink, DemuxerSource, ReadOutcome};
use crate::player::overlay::{Overlay, OverlayContent};
use crate::player::video_renderer::{RenderMonitor, VideoRenderer, VirtualVideoRenderer};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const VIDEO_STREAM_ID: i32 = 0;
pub const AUDIO_STREAM_ID: i32 = 1;
pub const SUBTITLE_STREAM_ID: i32 = 2;

/// 合成字幕事件（毫秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticCue {
    pub start_ms: i64,
    pub duration_ms: i64,
    pub text: String,
}

/// 合成输入的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub duration_ms: i64,
    /// (采样率, 声道数)
    pub audio: Option<(u32, u16)>,
    /// (宽, 高, 帧率)
    pub video: Option<(u32, u32, f64)>,
    pub audio_packet_ms: f64,
    pub cues: Vec<SyntheticCue>,
    /// 所有时间戳整体偏移（毫秒）
    pub start_offset_ms: i64,
    /// 前 N 次读包返回错误
    pub failing_reads: u32,
    /// 到该位置时音频采样率变化（触发流变更）
    pub audio_change_at_ms: Option<i64>,
    /// 模拟带预读缓存的网络输入
    pub read_cache: bool,
    /// 模拟直播输入
    pub realtime: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            audio: Some((48_000, 2)),
            video: Some((640, 360, 25.0)),
            audio_packet_ms: 20.0,
            cues: Vec::new(),
            start_offset_ms: 0,
            failing_reads: 0,
            audio_change_at_ms: None,
            read_cache: false,
            realtime: false,
        }
    }
}

/// 按时间戳交错输出音视频与字幕包的合成输入源
pub struct SyntheticDemuxer {
    config: SyntheticConfig,
    next_audio: f64,
    next_video: f64,
    next_cue: usize,
    failures_left: u32,
    audio_changed: bool,
    packets: u64,
}

impl SyntheticDemuxer {
    pub fn new(config: SyntheticConfig) -> Self {
        let failures_left = config.failing_reads;
        let mut demuxer = Self {
            config,
            next_audio: 0.0,
            next_video: 0.0,
            next_cue: 0,
            failures_left,
            audio_changed: false,
            packets: 0,
        };
        demuxer.reposition(0);
        demuxer
    }

    fn offset(&self) -> f64 {
        msec_to_time(self.config.start_offset_ms as f64)
    }

    fn end(&self) -> f64 {
        msec_to_time(self.config.duration_ms as f64)
    }

    fn frame_duration(&self) -> Option<f64> {
        self.config.video.map(|(_, _, fps)| TIME_BASE / fps.max(1.0))
    }

    fn audio_hints(&self) -> Option<StreamHints> {
        let (rate, channels) = self.config.audio?;
        let rate = if self.audio_changed { rate / 2 } else { rate };
        Some(StreamHints::audio("pcm_f32le", rate, channels))
    }

    fn reposition(&mut self, time_ms: i64) {
        let target = msec_to_time(time_ms.clamp(0, self.config.duration_ms) as f64);
        let audio_step = msec_to_time(self.config.audio_packet_ms);
        self.next_audio = (target / audio_step).floor() * audio_step;
        self.next_video = match self.frame_duration() {
            Some(frame) => (target / frame).floor() * frame,
            None => target,
        };
        self.next_cue = self
            .config
            .cues
            .iter()
            .position(|cue| msec_to_time((cue.start_ms + cue.duration_ms) as f64) > target)
            .unwrap_or(self.config.cues.len());
        self.audio_changed = self
            .config
            .audio_change_at_ms
            .is_some_and(|at| msec_to_time(at as f64) <= self.next_audio);
    }

    fn audio_packet(&mut self) -> DemuxPacket {
        let duration = msec_to_time(self.config.audio_packet_ms);
        if let Some(at) = self.config.audio_change_at_ms {
            if !self.audio_changed && self.next_audio >= msec_to_time(at as f64) {
                info!("🧪 合成输入: {:.0}ms 处音频参数变化", self.next_audio / 1000.0);
                self.audio_changed = true;
            }
        }
        let pts = self.next_audio + self.offset();
        self.next_audio += duration;
        DemuxPacket {
            data: vec![0; 256],
            pts: Some(pts),
            dts: Some(pts),
            duration: Some(duration),
            stream_id: AUDIO_STREAM_ID,
            ..Default::default()
        }
    }

    fn video_packet(&mut self, frame: f64) -> DemuxPacket {
        let pts = self.next_video + self.offset();
        self.next_video += frame;
        DemuxPacket {
            data: vec![0; 2048],
            pts: Some(pts),
            dts: Some(pts),
            duration: Some(frame),
            stream_id: VIDEO_STREAM_ID,
            ..Default::default()
        }
    }
}

impl DemuxerSource for SyntheticDemuxer {
    fn read_packet(&mut self) -> Result<ReadOutcome> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(PlayerError::DemuxError("合成读错误".to_string()));
        }

        let end = self.end();
        let audio_due = self.config.audio.is_some() && self.next_audio < end;
        let video_frame = self.frame_duration().filter(|_| self.next_video < end);
        let head = match (audio_due, video_frame) {
            (true, Some(_)) => self.next_audio.min(self.next_video),
            (true, None) => self.next_audio,
            (false, Some(_)) => self.next_video,
            (false, None) => return Ok(ReadOutcome::Eof),
        };

        if let Some(cue) = self.config.cues.get(self.next_cue) {
            let start = msec_to_time(cue.start_ms as f64);
            if start <= head {
                self.next_cue += 1;
                return Ok(ReadOutcome::Packet(DemuxPacket {
                    data: cue.text.as_bytes().to_vec(),
                    pts: Some(start + self.offset()),
                    dts: Some(start + self.offset()),
                    duration: Some(msec_to_time(cue.duration_ms as f64)),
                    stream_id: SUBTITLE_STREAM_ID,
                    ..Default::default()
                }));
            }
        }

        self.packets += 1;
        let packet = match video_frame {
            Some(frame) if !audio_due || self.next_video < self.next_audio => self.video_packet(frame),
            _ => self.audio_packet(),
        };
        Ok(ReadOutcome::Packet(packet))
    }

    fn streams(&self) -> Vec<DemuxStream> {
        let mut streams = Vec::new();
        if let Some((width, height, fps)) = self.config.video {
            streams.push(DemuxStream {
                id: VIDEO_STREAM_ID,
                demuxer_id: 0,
                hints: StreamHints::video("rawvideo", width, height, fps),
                language: None,
                disabled: false,
            });
        }
        if let Some(hints) = self.audio_hints() {
            streams.push(DemuxStream {
                id: AUDIO_STREAM_ID,
                demuxer_id: 0,
                hints,
                language: Some("und".to_string()),
                disabled: false,
            });
        }
        if !self.config.cues.is_empty() {
            streams.push(DemuxStream {
                id: SUBTITLE_STREAM_ID,
                demuxer_id: 0,
                hints: StreamHints::subtitle("text"),
                language: Some("und".to_string()),
                disabled: false,
            });
        }
        streams
    }

    fn seek(&mut self, time_ms: i64, backward: bool) -> Result<()> {
        debug!("🧪 合成输入 seek: {}ms backward={}", time_ms, backward);
        self.reposition(time_ms);
        Ok(())
    }

    fn flush(&mut self) {}

    fn duration_ms(&self) -> i64 {
        self.config.duration_ms
    }

    fn has_read_cache(&self) -> bool {
        self.config.read_cache
    }

    fn is_realtime(&self) -> bool {
        self.config.realtime
    }

    fn description(&self) -> String {
        format!(
            "synthetic({}ms, audio={:?}, video={:?}, cues={})",
            self.config.duration_ms,
            self.config.audio,
            self.config.video,
            self.config.cues.len()
        )
    }
}

/// 合成音频解码器：每个包产生一帧静音，最多缓存 4 帧
pub struct SyntheticAudioDecoder {
    format: AudioFormat,
    frames: VecDeque<AudioFrame>,
}

const AUDIO_DECODER_CAPACITY: usize = 4;

impl SyntheticAudioDecoder {
    pub fn new(hints: &StreamHints) -> Self {
        Self {
            format: AudioFormat {
                sample_rate: hints.sample_rate,
                channels: hints.channels,
                passthrough: hints.passthrough,
            },
            frames: VecDeque::new(),
        }
    }
}

impl AudioDecoder for SyntheticAudioDecoder {
    fn add_data(&mut self, packet: &DemuxPacket) -> bool {
        if self.frames.len() >= AUDIO_DECODER_CAPACITY {
            return false;
        }
        let duration = packet.duration.unwrap_or_else(|| msec_to_time(20.0));
        let nb_frames = (self.format.sample_rate as f64 * duration / TIME_BASE).round() as usize;
        self.frames.push_back(AudioFrame {
            data: vec![0.0; nb_frames * self.format.channels as usize],
            format: self.format,
            nb_frames,
            pts: packet.pts,
            duration,
        });
        true
    }

    fn get_data(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    fn reset(&mut self) {
        self.frames.clear();
    }

    fn dispose(&mut self) {
        self.frames.clear();
    }

    fn name(&self) -> &str {
        "synthetic-audio"
    }
}

/// 合成视频解码器：每个包一帧
pub struct SyntheticVideoDecoder {
    width: u32,
    height: u32,
    picture: Option<VideoPicture>,
}

impl SyntheticVideoDecoder {
    pub fn new(hints: &StreamHints) -> Self {
        Self {
            width: hints.width,
            height: hints.height,
            picture: None,
        }
    }
}

impl VideoDecoder for SyntheticVideoDecoder {
    fn add_data(&mut self, packet: &DemuxPacket) -> bool {
        if self.picture.is_some() {
            return false;
        }
        self.picture = Some(VideoPicture {
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            width: self.width,
            height: self.height,
            data: Vec::new(),
        });
        true
    }

    fn get_data(&mut self) -> Option<VideoPicture> {
        self.picture.take()
    }

    fn reset(&mut self) {
        self.picture = None;
    }

    fn dispose(&mut self) {
        self.picture = None;
    }

    fn name(&self) -> &str {
        "synthetic-video"
    }
}

/// 文本字幕解码器：包内容即 UTF-8 文本
pub struct TextSubtitleDecoder {
    ssa: bool,
}

impl TextSubtitleDecoder {
    pub fn new(hints: &StreamHints) -> Self {
        Self {
            ssa: matches!(hints.codec.as_str(), "ass" | "ssa"),
        }
    }
}

impl SubtitleDecoder for TextSubtitleDecoder {
    fn decode(&mut self, packet: &DemuxPacket) -> Vec<Overlay> {
        let Some(start) = packet.pts else { return Vec::new() };
        let text = String::from_utf8_lossy(&packet.data).trim().to_string();
        if text.is_empty() {
            return Vec::new();
        }
        let stop = packet.duration.map(|duration| start + duration);
        let content = if self.ssa { OverlayContent::Ssa(text) } else { OverlayContent::Text(text) };
        vec![Overlay::new(start, stop, content).with_replace(true)]
    }

    fn reset(&mut self) {}

    fn name(&self) -> &str {
        "text-subtitle"
    }
}

/// 合成解码器工厂；`failing` 中的流类型构造失败
#[derive(Debug, Default)]
pub struct SyntheticDecoderFactory {
    failing: Vec<StreamKind>,
}

impl SyntheticDecoderFactory {
    pub fn failing(kinds: &[StreamKind]) -> Self {
        Self { failing: kinds.to_vec() }
    }

    fn check(&self, hints: &StreamHints) -> Result<()> {
        if self.failing.contains(&hints.kind) {
            return Err(PlayerError::DecodeError(format!("无法为 {} 创建解码器", hints.codec)));
        }
        Ok(())
    }
}

impl DecoderFactory for SyntheticDecoderFactory {
    fn create_audio(&self, hints: &StreamHints) -> Result<Box<dyn AudioDecoder>> {
        self.check(hints)?;
        Ok(Box::new(SyntheticAudioDecoder::new(hints)))
    }

    fn create_video(&self, hints: &StreamHints) -> Result<Box<dyn VideoDecoder>> {
        self.check(hints)?;
        Ok(Box::new(SyntheticVideoDecoder::new(hints)))
    }

    fn create_subtitle(&self, hints: &StreamHints) -> Result<Box<dyn SubtitleDecoder>> {
        self.check(hints)?;
        Ok(Box::new(TextSubtitleDecoder::new(hints)))
    }
}

/// 计数型附属数据接收端
struct CountingSink {
    counter: Arc<AtomicU64>,
}

impl AncillarySink for CountingSink {
    fn on_data(&mut self, _packet: &DemuxPacket) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// 虚拟输出工厂：创建的输出端都保留观察句柄
pub struct VirtualOutputs {
    clock: PlaybackClock,
    sink_cache_secs: f64,
    render_capacity: usize,
    sinks: Mutex<Vec<Arc<SinkStats>>>,
    monitors: Mutex<Vec<Arc<RenderMonitor>>>,
    ancillary_packets: Arc<AtomicU64>,
}

impl VirtualOutputs {
    pub fn new(clock: PlaybackClock, settings: &PlayerSettings) -> Self {
        Self {
            clock,
            sink_cache_secs: settings.sink_cache_secs,
            render_capacity: settings.render_queue_capacity,
            sinks: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            ancillary_packets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 最近创建的音频输出端统计
    pub fn audio_stats(&self) -> Option<Arc<SinkStats>> {
        self.sinks.lock().last().cloned()
    }

    /// 最近创建的渲染端观察窗口
    pub fn render_monitor(&self) -> Option<Arc<RenderMonitor>> {
        self.monitors.lock().last().cloned()
    }

    pub fn ancillary_packets(&self) -> u64 {
        self.ancillary_packets.load(Ordering::SeqCst)
    }
}

impl OutputFactory for VirtualOutputs {
    fn create_audio_sink(&self) -> Box<dyn AudioSink> {
        let sink = VirtualAudioSink::new(self.clock.reference().clone(), self.sink_cache_secs);
        self.sinks.lock().push(sink.stats());
        Box::new(sink)
    }

    fn create_video_renderer(&self) -> Box<dyn VideoRenderer> {
        let renderer = VirtualVideoRenderer::new(self.clock.clone(), self.render_capacity);
        self.monitors.lock().push(renderer.monitor());
        Box::new(renderer)
    }

    fn create_ancillary_sink(&self, _kind: StreamKind) -> Option<Box<dyn AncillarySink>> {
        Some(Box::new(CountingSink {
            counter: self.ancillary_packets.clone(),
        }))
    }
}
