use crate::core::{AudioFormat, AudioFrame, PlayerError, ReferenceClock, Result, TIME_BASE};
use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 音频输出端
///
/// 由音频阶段线程独占。时间量均为时间基单位。
pub trait AudioSink: Send {
    /// 按格式打开输出（已打开时由调用方先 `destroy`）
    fn create(&mut self, format: AudioFormat) -> Result<()>;

    fn destroy(&mut self);

    /// 当前打开的格式
    fn format(&self) -> Option<AudioFormat>;

    /// 从第 `offset` 帧开始写入，返回实际接收的帧数（缓存满时可能小于剩余帧数）
    fn add_packets(&mut self, frame: &AudioFrame, offset: usize) -> usize;

    /// 下一个写入的采样还要多久才会被听到
    fn delay(&self) -> f64;

    /// 已缓存的可播放时长
    fn cache_time(&self) -> f64;

    /// 缓存总容量
    fn cache_total(&self) -> f64;

    fn flush(&mut self);

    /// 阻塞直到已缓存数据播放完
    fn drain(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    /// 开关重采样同步
    fn set_resample_mode(&mut self, enabled: bool);

    /// 重采样比（输出 / 输入）
    fn set_resample_ratio(&mut self, ratio: f64);

    /// 变速不变调播放
    fn set_tempo(&mut self, _tempo: f64) {}
}

/// 虚拟输出端统计（测试与无声卡环境观察用）
#[derive(Debug, Default)]
pub struct SinkStats {
    pub frames_written: AtomicU64,
    pub flushes: AtomicU64,
    pub creates: AtomicU64,
    pub drains: AtomicU64,
    /// 最近一次生效的重采样比
    pub resample_ratio: AtomicCell<Option<f64>>,
}

impl SinkStats {
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn resample_ratio(&self) -> Option<f64> {
        self.resample_ratio.load()
    }
}

/// 虚拟音频输出：按参考时钟的主机时间消耗缓存，不产生声音
///
/// 消耗速率 = tempo / 重采样比。
pub struct VirtualAudioSink {
    reference: Arc<dyn ReferenceClock>,
    format: Option<AudioFormat>,
    cache_total: f64,
    buffered: f64,              // last_tick 时刻的缓存时长
    last_tick: i64,
    paused: bool,
    tempo: f64,
    ratio: f64,
    resample: bool,
    stats: Arc<SinkStats>,
}

impl VirtualAudioSink {
    pub fn new(reference: Arc<dyn ReferenceClock>, cache_secs: f64) -> Self {
        let last_tick = reference.host_time();
        Self {
            reference,
            format: None,
            cache_total: cache_secs * TIME_BASE,
            buffered: 0.0,
            last_tick,
            paused: true,
            tempo: 1.0,
            ratio: 1.0,
            resample: false,
            stats: Arc::new(SinkStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        self.stats.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_resampling(&self) -> bool {
        self.resample
    }

    pub fn resample_ratio(&self) -> f64 {
        self.ratio
    }

    fn consume_rate(&self) -> f64 {
        if self.paused {
            0.0
        } else {
            self.tempo / self.ratio.max(f64::EPSILON)
        }
    }

    fn buffered_at(&self, tick: i64) -> f64 {
        let elapsed = (tick - self.last_tick) as f64 * TIME_BASE / self.reference.frequency() as f64;
        (self.buffered - elapsed.max(0.0) * self.consume_rate()).max(0.0)
    }

    fn buffered_now(&self) -> f64 {
        self.buffered_at(self.reference.host_time())
    }

    /// 把流逝的时间结算进缓存，速率变化前调用
    fn settle(&mut self) {
        let now = self.reference.host_time();
        self.buffered = self.buffered_at(now);
        self.last_tick = now;
    }
}

impl AudioSink for VirtualAudioSink {
    fn create(&mut self, format: AudioFormat) -> Result<()> {
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(PlayerError::AudioError(format!(
                "无效的音频格式: {} Hz, {} 声道",
                format.sample_rate, format.channels
            )));
        }
        info!("🔈 虚拟音频输出打开: {} Hz, {} 声道, 直通={}", format.sample_rate, format.channels, format.passthrough);
        self.format = Some(format);
        self.buffered = 0.0;
        self.last_tick = self.reference.host_time();
        self.paused = true;
        self.stats.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.format.take().is_some() {
            debug!("🔈 虚拟音频输出关闭");
        }
        self.buffered = 0.0;
    }

    fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn add_packets(&mut self, frame: &AudioFrame, offset: usize) -> usize {
        if self.format.is_none() || offset >= frame.nb_frames {
            return 0;
        }
        let remaining = frame.nb_frames - offset;
        if frame.duration <= 0.0 {
            return remaining;
        }

        self.settle();
        let per_frame = frame.duration / frame.nb_frames as f64;
        let space = (self.cache_total - self.buffered).max(0.0);
        let accepted = ((space / per_frame).floor() as usize).min(remaining);

        self.buffered += accepted as f64 * per_frame;
        self.stats.frames_written.fetch_add(accepted as u64, Ordering::SeqCst);
        accepted
    }

    fn delay(&self) -> f64 {
        self.buffered_now()
    }

    fn cache_time(&self) -> f64 {
        self.buffered_now()
    }

    fn cache_total(&self) -> f64 {
        self.cache_total
    }

    fn flush(&mut self) {
        self.buffered = 0.0;
        self.last_tick = self.reference.host_time();
        self.stats.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn drain(&mut self) {
        self.stats.drains.fetch_add(1, Ordering::SeqCst);
        if self.paused {
            self.flush();
            return;
        }
        let pending = self.buffered_now();
        let deadline = Instant::now() + Duration::from_secs_f64(pending / TIME_BASE + 1.0);
        while self.buffered_now() > 0.0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.settle();
        self.buffered = 0.0;
    }

    fn pause(&mut self) {
        if !self.paused {
            self.settle();
            self.paused = true;
        }
    }

    fn resume(&mut self) {
        if self.paused {
            self.settle();
            self.paused = false;
        }
    }

    fn set_resample_mode(&mut self, enabled: bool) {
        self.settle();
        self.resample = enabled;
        if !enabled {
            self.ratio = 1.0;
            self.stats.resample_ratio.store(None);
        }
    }

    fn set_resample_ratio(&mut self, ratio: f64) {
        if self.resample && ratio > 0.0 {
            self.settle();
            self.ratio = ratio;
            self.stats.resample_ratio.store(Some(ratio));
        }
    }

    fn set_tempo(&mut self, tempo: f64) {
        if tempo > 0.0 {
            self.settle();
            self.tempo = tempo;
        }
    }
}
