use crate::core::{msec_to_time, PlaybackClock, PlayerError, Result, VideoFormat, VideoPicture, TIME_BASE};
use crate::player::overlay::Overlay;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 渲染队列统计
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderStats {
    /// 排队等待显示的画面数
    pub queued: usize,
    pub capacity: usize,
    /// 最近显示的画面时间戳
    pub render_pts: Option<f64>,
    /// 队头（下一个将显示）画面时间戳
    pub next_pts: Option<f64>,
    pub displayed: u64,
    /// 显示时已迟到超过一帧的画面数
    pub late: u64,
}

/// 视频渲染端
///
/// 由视频阶段线程独占。画面按时间戳排队，到时刻后呈现。
pub trait VideoRenderer: Send {
    fn configure(&mut self, format: VideoFormat) -> Result<()>;

    fn is_configured(&self) -> bool;

    fn release(&mut self);

    /// 提交画面；队列满时返回 false，调用方稍后重试
    fn add_picture(&mut self, picture: &VideoPicture, overlays: Vec<Arc<Overlay>>) -> bool;

    fn stats(&mut self) -> RenderStats;

    /// 已排队画面的总时长
    fn cache_time(&self) -> f64;

    /// 队列满时的总时长
    fn cache_total(&self) -> f64;

    fn flush(&mut self);

    /// 阻塞直到队列中的画面全部呈现
    fn drain(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    /// 显示 / 隐藏视频层
    fn show(&mut self, visible: bool);
}

/// 已呈现画面的记录
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedFrame {
    pub pts: Option<f64>,
    pub duration: f64,
    pub overlays: usize,
}

/// 虚拟渲染端的观察窗口
#[derive(Debug, Default)]
pub struct RenderMonitor {
    presented: Mutex<Vec<PresentedFrame>>,
    flushes: AtomicU64,
}

impl RenderMonitor {
    pub fn presented(&self) -> Vec<PresentedFrame> {
        self.presented.lock().clone()
    }

    pub fn presented_count(&self) -> usize {
        self.presented.lock().len()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

struct QueuedPicture {
    pts: Option<f64>,
    duration: f64,
    overlays: usize,
}

/// 虚拟渲染端：没有窗口，按播放时钟把到期画面移出队列
pub struct VirtualVideoRenderer {
    clock: PlaybackClock,
    format: Option<VideoFormat>,
    capacity: usize,
    queue: VecDeque<QueuedPicture>,
    frame_duration: f64,
    paused: bool,
    visible: bool,
    render_pts: Option<f64>,
    displayed: u64,
    late: u64,
    monitor: Arc<RenderMonitor>,
}

impl VirtualVideoRenderer {
    pub fn new(clock: PlaybackClock, capacity: usize) -> Self {
        Self {
            clock,
            format: None,
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            frame_duration: msec_to_time(40.0),
            paused: true,
            visible: true,
            render_pts: None,
            displayed: 0,
            late: 0,
            monitor: Arc::new(RenderMonitor::default()),
        }
    }

    pub fn monitor(&self) -> Arc<RenderMonitor> {
        self.monitor.clone()
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// 呈现所有到期画面；`force` 时无视时钟全部呈现
    fn present_due(&mut self, force: bool) {
        if self.paused && !force {
            return;
        }
        let clock = self.clock.get_clock(false);
        while let Some(front) = self.queue.front() {
            let due = force || front.pts.map_or(true, |pts| pts <= clock);
            if !due {
                break;
            }
            let Some(picture) = self.queue.pop_front() else { break };
            if let Some(pts) = picture.pts {
                if clock - pts > picture.duration.max(self.frame_duration) {
                    self.late += 1;
                }
                self.render_pts = Some(pts);
            }
            self.displayed += 1;
            self.monitor.presented.lock().push(PresentedFrame {
                pts: picture.pts,
                duration: picture.duration,
                overlays: picture.overlays,
            });
        }
    }
}

impl VideoRenderer for VirtualVideoRenderer {
    fn configure(&mut self, format: VideoFormat) -> Result<()> {
        if format.width == 0 || format.height == 0 {
            return Err(PlayerError::RenderError(format!(
                "无效的视频尺寸: {}x{}",
                format.width, format.height
            )));
        }
        if format.fps > 0.0 {
            self.frame_duration = TIME_BASE / format.fps;
        }
        info!("🖼 虚拟渲染端配置: {}x{} @ {:.3}fps", format.width, format.height, format.fps);
        self.format = Some(format);
        Ok(())
    }

    fn is_configured(&self) -> bool {
        self.format.is_some()
    }

    fn release(&mut self) {
        self.queue.clear();
        self.format = None;
    }

    fn add_picture(&mut self, picture: &VideoPicture, overlays: Vec<Arc<Overlay>>) -> bool {
        self.present_due(false);
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(QueuedPicture {
            pts: picture.pts,
            duration: picture.duration.unwrap_or(self.frame_duration),
            overlays: overlays.len(),
        });
        true
    }

    fn stats(&mut self) -> RenderStats {
        self.present_due(false);
        RenderStats {
            queued: self.queue.len(),
            capacity: self.capacity,
            render_pts: self.render_pts,
            next_pts: self.queue.front().and_then(|p| p.pts),
            displayed: self.displayed,
            late: self.late,
        }
    }

    fn cache_time(&self) -> f64 {
        self.queue.len() as f64 * self.frame_duration
    }

    fn cache_total(&self) -> f64 {
        self.capacity as f64 * self.frame_duration
    }

    fn flush(&mut self) {
        if !self.queue.is_empty() {
            debug!("🖼 丢弃 {} 个排队画面", self.queue.len());
        }
        self.queue.clear();
        self.render_pts = None;
        self.monitor.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn drain(&mut self) {
        let deadline = Instant::now() + Duration::from_secs_f64(self.cache_time() / TIME_BASE + 1.0);
        while !self.queue.is_empty() && Instant::now() < deadline {
            self.present_due(false);
            thread::sleep(Duration::from_millis(5));
        }
        self.present_due(true);
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
        self.present_due(false);
    }

    fn show(&mut self, visible: bool) {
        self.visible = visible;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualReferenceClock;
    use crate::player::overlay::OverlayContent;

    fn picture(pts: f64) -> VideoPicture {
        VideoPicture {
            pts: Some(pts),
            dts: Some(pts),
            duration: Some(40_000.0),
            width: 64,
            height: 48,
            data: Vec::new(),
        }
    }

    fn setup(capacity: usize) -> (Arc<ManualReferenceClock>, PlaybackClock, VirtualVideoRenderer) {
        let reference = Arc::new(ManualReferenceClock::new());
        let clock = PlaybackClock::new(reference.clone());
        clock.discontinuity(0.0);
        let mut renderer = VirtualVideoRenderer::new(clock.clone(), capacity);
        renderer
            .configure(VideoFormat { width: 64, height: 48, fps: 25.0 })
            .unwrap();
        (reference, clock, renderer)
    }

    #[test]
    fn test_queue_capacity_and_cache_time() {
        let (_reference, _clock, mut renderer) = setup(3);
        for i in 0..3 {
            assert!(renderer.add_picture(&picture(i as f64 * 40_000.0), Vec::new()));
        }
        // 暂停状态下不会呈现，队列满
        assert!(!renderer.add_picture(&picture(120_000.0), Vec::new()));
        assert_eq!(renderer.cache_time(), 120_000.0);
        assert_eq!(renderer.cache_total(), 120_000.0);

        let stats = renderer.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.next_pts, Some(0.0));
        assert_eq!(stats.render_pts, None);
    }

    #[test]
    fn test_presents_by_clock_after_resume() {
        let (reference, _clock, mut renderer) = setup(8);
        let monitor = renderer.monitor();
        let overlay = Arc::new(Overlay::new(0.0, Some(1e6), OverlayContent::Text("hi".to_string())));
        for i in 0..4 {
            renderer.add_picture(&picture(i as f64 * 40_000.0), vec![overlay.clone()]);
        }

        renderer.resume();
        assert_eq!(monitor.presented_count(), 1);

        reference.advance_ms(85.0);
        let stats = renderer.stats();
        assert_eq!(stats.displayed, 3);
        assert_eq!(stats.render_pts, Some(80_000.0));
        assert_eq!(stats.queued, 1);
        assert_eq!(monitor.presented()[0].overlays, 1);
    }

    #[test]
    fn test_flush_and_invalid_configure() {
        let (_reference, _clock, mut renderer) = setup(4);
        let monitor = renderer.monitor();
        renderer.add_picture(&picture(0.0), Vec::new());
        renderer.flush();
        assert_eq!(renderer.stats().queued, 0);
        assert_eq!(monitor.flushes(), 1);

        assert!(renderer
            .configure(VideoFormat { width: 0, height: 0, fps: 25.0 })
            .is_err());
        renderer.release();
        assert!(!renderer.is_configured());
    }

    #[test]
    fn test_drain_forces_presentation() {
        let (_reference, clock, mut renderer) = setup(4);
        let monitor = renderer.monitor();
        clock.set_speed(crate::core::PLAYSPEED_PAUSE);
        renderer.add_picture(&picture(0.0), Vec::new());
        renderer.add_picture(&picture(10_000_000.0), Vec::new());
        renderer.resume();
        renderer.drain();
        assert_eq!(monitor.presented_count(), 2);
    }
}
