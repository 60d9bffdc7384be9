use crate::core::{msec_to_time, PLAYSPEED_NORMAL, PLAYSPEED_PAUSE, TIME_BASE};
use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 参考时钟：播放时钟的底层时间源
///
/// 可以是主机单调时钟，也可以是跟随显示刷新的时钟（带速度修正）。
pub trait ReferenceClock: Send + Sync {
    /// 每秒 tick 数
    fn frequency(&self) -> i64;

    /// 当前 tick（受参考时钟速度影响）
    fn time(&self, interpolated: bool) -> i64;

    /// 主机单调 tick（不受任何速度修正影响）
    fn host_time(&self) -> i64;

    /// 显示刷新率（Hz）与刷新周期（秒）；没有硬件刷新参考时返回 None
    fn refresh_rate(&self) -> Option<(f64, f64)> {
        None
    }

    fn set_speed(&self, speed: f64);

    fn speed(&self) -> f64;
}

/// 基于 `Instant` 的单调参考时钟（纳秒精度）
pub struct MonotonicClock {
    origin: Instant,
    base: Mutex<SpeedBase>,
}

struct SpeedBase {
    speed: f64,
    base_host: i64,
    base_ticks: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            base: Mutex::new(SpeedBase {
                speed: 1.0,
                base_host: 0,
                base_ticks: 0,
            }),
        }
    }

    fn ticks_at(base: &SpeedBase, host: i64) -> i64 {
        base.base_ticks + ((host - base.base_host) as f64 * base.speed) as i64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for MonotonicClock {
    fn frequency(&self) -> i64 {
        1_000_000_000
    }

    fn time(&self, _interpolated: bool) -> i64 {
        let host = self.host_time();
        Self::ticks_at(&self.base.lock(), host)
    }

    fn host_time(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn set_speed(&self, speed: f64) {
        let host = self.host_time();
        let mut base = self.base.lock();
        base.base_ticks = Self::ticks_at(&base, host);
        base.base_host = host;
        base.speed = speed;
    }

    fn speed(&self) -> f64 {
        self.base.lock().speed
    }
}

/// 手动推进的参考时钟（微秒 tick），用于确定性测试
pub struct ManualReferenceClock {
    ticks: AtomicI64,
    host: AtomicI64,
    speed: AtomicCell<f64>,
    refresh: Mutex<Option<(f64, f64)>>,
}

impl ManualReferenceClock {
    pub fn new() -> Self {
        Self {
            ticks: AtomicI64::new(0),
            host: AtomicI64::new(0),
            speed: AtomicCell::new(1.0),
            refresh: Mutex::new(None),
        }
    }

    /// 推进指定毫秒（参考 tick 按当前速度推进）
    pub fn advance_ms(&self, ms: f64) {
        let host_delta = (ms * 1000.0) as i64;
        let tick_delta = (ms * 1000.0 * self.speed.load()) as i64;
        self.host.fetch_add(host_delta, Ordering::SeqCst);
        self.ticks.fetch_add(tick_delta, Ordering::SeqCst);
    }

    /// 模拟显示刷新参考
    pub fn set_refresh_rate(&self, rate: Option<f64>) {
        *self.refresh.lock() = rate.map(|r| (r, 1.0 / r));
    }
}

impl Default for ManualReferenceClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceClock for ManualReferenceClock {
    fn frequency(&self) -> i64 {
        1_000_000
    }

    fn time(&self, _interpolated: bool) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn host_time(&self) -> i64 {
        self.host.load(Ordering::SeqCst)
    }

    fn refresh_rate(&self) -> Option<(f64, f64)> {
        *self.refresh.lock()
    }

    fn set_speed(&self, speed: f64) {
        self.speed.store(speed);
    }

    fn speed(&self) -> f64 {
        self.speed.load()
    }
}

/// 播放时钟 - 所有输出阶段共同参照的呈现时钟
///
/// 两把互不嵌套的锁：
/// - `play`：播放相关字段，解码线程频繁读写
/// - `system`：参考时钟修正相关字段，刷新率路径使用
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    reference: Arc<dyn ReferenceClock>,
    play: Mutex<PlayState>,
    system: Mutex<SystemState>,
    frame_time: AtomicCell<f64>,    // 一帧时长（时间基单位）
    host_origin: i64,
}

struct PlayState {
    start_clock: i64,               // 播放时间原点（参考 tick）
    pause_clock: Option<i64>,       // 暂停时刻（参考 tick）
    system_used: f64,               // 当前速度下每播放秒对应的 tick 数
    disc: f64,                      // 原点对应的播放时间
    reset: bool,
    speed_adjust: f64,
    system_adjust: f64,             // speed_adjust 累积出的 tick 偏移
    last_system_time: i64,
    vsync_adjust: f64,
    paused: bool,
    speed_after_pause: i32,
}

struct SystemState {
    max_speed_adjust: f64,          // 百分比
}

impl PlaybackClock {
    pub fn new(reference: Arc<dyn ReferenceClock>) -> Self {
        let host_origin = reference.host_time();
        let frequency = reference.frequency() as f64;
        Self {
            inner: Arc::new(ClockInner {
                reference,
                play: Mutex::new(PlayState {
                    start_clock: 0,
                    pause_clock: None,
                    system_used: frequency,
                    disc: 0.0,
                    reset: true,
                    speed_adjust: 0.0,
                    system_adjust: 0.0,
                    last_system_time: 0,
                    vsync_adjust: 0.0,
                    paused: false,
                    speed_after_pause: PLAYSPEED_NORMAL,
                }),
                system: Mutex::new(SystemState { max_speed_adjust: 0.0 }),
                frame_time: AtomicCell::new(0.0),
                host_origin,
            }),
        }
    }

    /// 使用主机单调时钟创建
    pub fn with_monotonic() -> Self {
        Self::new(Arc::new(MonotonicClock::new()))
    }

    pub fn reference(&self) -> &Arc<dyn ReferenceClock> {
        &self.inner.reference
    }

    /// 获取当前播放时间（时间基单位）
    pub fn get_clock(&self, interpolated: bool) -> f64 {
        self.get_clock_with_absolute(interpolated).0
    }

    /// 获取当前播放时间，并返回同一时刻的绝对时间
    pub fn get_clock_with_absolute(&self, interpolated: bool) -> (f64, f64) {
        let inner = &self.inner;
        let mut st = inner.play.lock();
        let current = inner.reference.time(interpolated);
        let absolute = self.host_to_absolute(inner.reference.host_time());

        if st.pause_clock.is_none() {
            st.system_adjust += st.speed_adjust * (current - st.last_system_time) as f64;
        }
        st.last_system_time = current;

        (Self::system_to_playing(&mut st, current, inner.reference.frequency()), absolute)
    }

    /// 绝对时钟：与播放速度、断点无关的墙钟时间（时间基单位）
    pub fn get_absolute_clock(&self, _interpolated: bool) -> f64 {
        self.host_to_absolute(self.inner.reference.host_time())
    }

    /// 当前播放时间（毫秒）
    pub fn now_ms(&self) -> i64 {
        (self.get_clock(false) * 1000.0 / TIME_BASE) as i64
    }

    /// 以当前绝对时间为锚点重设播放时间
    pub fn discontinuity(&self, clock: f64) {
        let absolute = self.get_absolute_clock(false);
        self.discontinuity_at(clock, absolute);
    }

    /// 重设播放时间原点：`absolute` 时刻的播放时间为 `clock`
    pub fn discontinuity_at(&self, clock: f64, absolute: f64) {
        let start = self.absolute_to_system(absolute);
        let mut st = self.inner.play.lock();
        st.start_clock = start;
        if st.pause_clock.is_some() {
            st.pause_clock = Some(start);
        }
        st.disc = clock;
        st.reset = false;
        st.system_adjust = 0.0;
        st.speed_adjust = 0.0;
        st.last_system_time = self.inner.reference.time(false);
    }

    /// 下次读取时从 0 重新开始计时
    pub fn reset(&self) {
        self.inner.play.lock().reset = true;
    }

    /// 根据同步误差决定本次的时钟修正量，返回实际施加的修正
    pub fn error_adjust(&self, error: f64, tag: &str) -> f64 {
        let (clock, absolute) = self.get_clock_with_absolute(false);

        let (speed_adjust, vsync_adjust) = {
            let st = self.inner.play.lock();
            (st.speed_adjust, st.vsync_adjust)
        };

        // 速度修正进行中时忽略 100ms 以内的误差
        if speed_adjust != 0.0 && error.abs() < msec_to_time(100.0) {
            return 0.0;
        }

        let mut adjustment = error;
        let frame_time = self.inner.frame_time.load();
        if vsync_adjust != 0.0 && frame_time > 0.0 {
            adjustment = if error.abs() < frame_time / 2.0 {
                0.0
            } else {
                frame_time.copysign(error)
            };
        }

        if adjustment == 0.0 {
            return 0.0;
        }

        debug!(
            "⏱ [{}] 时钟修正: error={:.0}us adjustment={:.0}us clock={:.0}",
            tag, error, adjustment, clock
        );
        self.discontinuity_at(clock + adjustment, absolute);
        adjustment
    }

    /// 设置播放速度（PLAYSPEED_NORMAL = 1000），原点重算，播放时间不跳变
    pub fn set_speed(&self, speed: i32) {
        let mut st = self.inner.play.lock();
        self.set_speed_locked(&mut st, speed);
    }

    fn set_speed_locked(&self, st: &mut PlayState, speed: i32) {
        let reference = &self.inner.reference;
        if speed == PLAYSPEED_PAUSE {
            if st.pause_clock.is_none() {
                st.pause_clock = Some(reference.time(false));
            }
            return;
        }

        let current = reference.time(false);
        let new_used = reference.frequency() as f64 * PLAYSPEED_NORMAL as f64 / speed as f64;

        if let Some(pause_clock) = st.pause_clock.take() {
            st.start_clock += current - pause_clock;
        }

        st.start_clock = current - ((current - st.start_clock) as f64 * new_used / st.system_used) as i64;
        st.system_adjust *= new_used / st.system_used;
        st.last_system_time = current;
        st.system_used = new_used;
    }

    /// 暂停 / 恢复，恢复时回到暂停前的速度
    pub fn pause(&self, pause: bool) {
        let mut st = self.inner.play.lock();
        if pause && !st.paused {
            st.speed_after_pause = if st.pause_clock.is_none() {
                (self.inner.reference.frequency() as f64 * PLAYSPEED_NORMAL as f64 / st.system_used).round() as i32
            } else {
                PLAYSPEED_PAUSE
            };
            self.set_speed_locked(&mut st, PLAYSPEED_PAUSE);
            st.paused = true;
        } else if !pause && st.paused {
            st.paused = false;
            let speed = st.speed_after_pause;
            self.set_speed_locked(&mut st, speed);
        }
    }

    pub fn is_paused(&self) -> bool {
        let st = self.inner.play.lock();
        st.paused || st.pause_clock.is_some()
    }

    /// 连续速度修正（重采样同步使用），以积分方式计入播放时间
    pub fn set_speed_adjust(&self, adjust: f64) {
        debug!("⏱ 时钟速度修正: {:.6}", adjust);
        let mut st = self.inner.play.lock();
        st.speed_adjust = adjust;
    }

    pub fn speed_adjust(&self) -> f64 {
        self.inner.play.lock().speed_adjust
    }

    /// 实际时钟速度（1.0 = 正常）
    pub fn clock_speed(&self) -> f64 {
        let (used, speed_adjust) = {
            let st = self.inner.play.lock();
            (st.system_used, st.speed_adjust)
        };
        let speed = self.inner.reference.frequency() as f64 / used;
        self.inner.reference.speed() * speed + speed_adjust
    }

    /// 垂直同步修正模式：非零时修正量按整帧计
    pub fn set_vsync_adjust(&self, adjust: f64) {
        self.inner.play.lock().vsync_adjust = adjust;
    }

    pub fn frame_time(&self) -> f64 {
        self.inner.frame_time.load()
    }

    /// 设置参考时钟允许的最大速度修正（百分比）
    pub fn set_max_speed_adjust(&self, percent: f64) {
        self.inner.system.lock().max_speed_adjust = percent;
    }

    /// 更新视频帧率，驱动参考时钟向显示刷新率靠拢
    ///
    /// 返回 (刷新率, 刷新周期)；没有硬件刷新参考时返回 None，调用方退回软件节奏。
    pub fn update_framerate(&self, fps: f64) -> Option<(f64, f64)> {
        if fps <= 0.0 {
            return None;
        }
        self.inner.frame_time.store(TIME_BASE / fps);

        let (rate, interval) = self.inner.reference.refresh_rate()?;
        if rate <= 0.0 {
            return None;
        }

        let speed = {
            let system = self.inner.system.lock();
            let mut weight = rate / fps.round().max(1.0);
            if system.max_speed_adjust > 0.05 {
                let rounded = weight.round();
                if rounded > 0.0 {
                    let ratio = weight / rounded;
                    if ratio < 1.0 + system.max_speed_adjust / 100.0
                        && ratio > 1.0 - system.max_speed_adjust / 100.0
                    {
                        weight = rounded;
                    }
                }
            }
            rate / (fps * weight)
        };

        info!("🖥 刷新率 {:.3}Hz，帧率 {:.3}fps，参考时钟速度 {:.5}", rate, fps, speed);
        self.inner.reference.set_speed(speed);
        Some((rate, interval))
    }

    fn system_to_playing(st: &mut PlayState, system: i64, frequency: i64) -> f64 {
        if st.reset {
            st.start_clock = system;
            st.system_used = frequency as f64;
            if st.pause_clock.is_some() {
                st.pause_clock = Some(st.start_clock);
            }
            st.disc = 0.0;
            st.system_adjust = 0.0;
            st.speed_adjust = 0.0;
            st.vsync_adjust = 0.0;
            st.reset = false;
        }

        let current = st.pause_clock.unwrap_or(system);
        TIME_BASE * ((current - st.start_clock) as f64 + st.system_adjust) / st.system_used + st.disc
    }

    fn host_to_absolute(&self, host: i64) -> f64 {
        (host - self.inner.host_origin) as f64 * TIME_BASE / self.inner.reference.frequency() as f64
    }

    /// 绝对时间 -> 参考 tick（按已流逝的绝对时长倒推）
    fn absolute_to_system(&self, absolute: f64) -> i64 {
        let reference = &self.inner.reference;
        let now_absolute = self.host_to_absolute(reference.host_time());
        let elapsed = now_absolute - absolute;
        reference.time(false) - (elapsed * reference.frequency() as f64 / TIME_BASE) as i64
    }
}
