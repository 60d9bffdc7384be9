use crate::core::{AudioFormat, AudioFrame, PlayerError, PlayerSettings, Result, StreamKind, TIME_BASE};
use crate::player::audio_sink::AudioSink;
use crate::player::context::OutputFactory;
use crate::player::demuxer_source::AncillarySink;
use crate::player::synthetic::VirtualOutputs;
use crate::player::video_renderer::VideoRenderer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// 声卡输出端 - 使用 cpal 播放，采样经无锁队列交给回调
pub struct CpalAudioSink {
    device: Option<Device>,
    stream: Option<Stream>,
    format: Option<AudioFormat>,
    buffer: Arc<SegQueue<f32>>,
    cache_secs: f64,
    resample: bool,
    ratio: f64,
}

// cpal::Stream 不是 Send；输出端在音频阶段线程上 create / destroy，只在该线程上使用
unsafe impl Send for CpalAudioSink {}

impl CpalAudioSink {
    pub fn new(cache_secs: f64) -> Self {
        Self {
            device: None,
            stream: None,
            format: None,
            buffer: Arc::new(SegQueue::new()),
            cache_secs,
            resample: false,
            ratio: 1.0,
        }
    }

    /// 检查配置是否兼容
    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range && config.channels == supported.channels()
    }

    fn buffered_frames(&self) -> usize {
        match self.format {
            Some(format) if format.channels > 0 => self.buffer.len() / format.channels as usize,
            _ => 0,
        }
    }

    fn frames_to_time(&self, frames: usize) -> f64 {
        match self.format {
            Some(format) if format.sample_rate > 0 => frames as f64 * TIME_BASE / format.sample_rate as f64,
            _ => 0.0,
        }
    }

    fn capacity_frames(&self) -> usize {
        self.format
            .map_or(0, |format| (format.sample_rate as f64 * self.cache_secs) as usize)
    }

    fn clear_buffer(&self) {
        while self.buffer.pop().is_some() {}
    }
}

impl AudioSink for CpalAudioSink {
    fn create(&mut self, format: AudioFormat) -> Result<()> {
        info!("初始化音频输出: {} Hz, {} 声道", format.sample_rate, format.channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?
            .any(|supported| Self::is_config_compatible(&config, &supported));
        if !supported {
            return Err(PlayerError::AudioError(format!(
                "音频设备不支持 {} Hz, {} 声道",
                format.sample_rate, format.channels
            )));
        }

        let buffer = self.buffer.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = buffer.pop().unwrap_or(0.0);
                    }
                },
                move |err| warn!("⚠ 音频流错误: {}", err),
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        // 建好后保持暂停，由音频阶段在缓冲就绪后 resume
        stream
            .pause()
            .map_err(|e| PlayerError::AudioError(format!("暂停音频流失败: {}", e)))?;

        self.device = Some(device);
        self.stream = Some(stream);
        self.format = Some(format);
        info!("音频输出已创建");
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
        self.device = None;
        self.clear_buffer();
        self.format = None;
    }

    fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn add_packets(&mut self, frame: &AudioFrame, offset: usize) -> usize {
        let Some(format) = self.format else { return 0 };
        let channels = format.channels as usize;
        let free = self.capacity_frames().saturating_sub(self.buffered_frames());
        let count = frame.nb_frames.saturating_sub(offset).min(free);

        let start = offset * channels;
        let end = (start + count * channels).min(frame.data.len());
        for sample in &frame.data[start.min(end)..end] {
            self.buffer.push(*sample);
        }
        count
    }

    fn delay(&self) -> f64 {
        self.cache_time()
    }

    fn cache_time(&self) -> f64 {
        self.frames_to_time(self.buffered_frames())
    }

    fn cache_total(&self) -> f64 {
        self.cache_secs * TIME_BASE
    }

    fn flush(&mut self) {
        self.clear_buffer();
    }

    fn drain(&mut self) {
        let deadline = Instant::now() + Duration::from_secs_f64(self.cache_secs + 1.0);
        while !self.buffer.is_empty() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }
    }

    fn pause(&mut self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                warn!("⚠ 暂停音频流失败: {}", e);
            }
        }
    }

    fn resume(&mut self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.play() {
                warn!("⚠ 启动音频流失败: {}", e);
            }
        }
    }

    fn set_resample_mode(&mut self, enabled: bool) {
        // 设备按固定采样率输出，重采样同步只记录状态
        self.resample = enabled;
    }

    fn set_resample_ratio(&mut self, ratio: f64) {
        if self.resample && (ratio - self.ratio).abs() > f64::EPSILON {
            debug!("重采样比 {:.5}（设备不支持，忽略）", ratio);
        }
        self.ratio = ratio;
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// 声卡音频 + 虚拟视频输出
pub struct CpalOutputs {
    inner: VirtualOutputs,
    sink_cache_secs: f64,
}

impl CpalOutputs {
    pub fn new(inner: VirtualOutputs, settings: &PlayerSettings) -> Self {
        Self {
            inner,
            sink_cache_secs: settings.sink_cache_secs,
        }
    }
}

impl OutputFactory for CpalOutputs {
    fn create_audio_sink(&self) -> Box<dyn AudioSink> {
        Box::new(CpalAudioSink::new(self.sink_cache_secs))
    }

    fn create_video_renderer(&self) -> Box<dyn VideoRenderer> {
        self.inner.create_video_renderer()
    }

    fn create_ancillary_sink(&self, kind: StreamKind) -> Option<Box<dyn AncillarySink>> {
        self.inner.create_ancillary_sink(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unopened_sink_accepts_nothing() {
        let mut sink = CpalAudioSink::new(0.5);
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            passthrough: false,
        };
        let frame = AudioFrame {
            data: vec![0.0; 960 * 2],
            format,
            nb_frames: 960,
            pts: None,
            duration: 20_000.0,
        };
        assert_eq!(sink.add_packets(&frame, 0), 0);
        assert_eq!(sink.cache_time(), 0.0);
        assert_eq!(sink.cache_total(), 500_000.0);
    }
}
