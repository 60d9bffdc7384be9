//! 帧间隔模式追踪
//!
//! 从带噪声的 pts 序列估计真实帧时长：在最近 120 个差值中寻找重复模式，
//! 模式反复丢失又重新建立时判定为可变帧率。

use crate::core::{msec_to_time, TIME_BASE};
use log::debug;

const DIFFRINGSIZE: usize = 120;
const VFR_DETECTION_THRESHOLD: u32 = 3;
const VFR_PATTERN_THRESHOLD: u32 = 2;

fn max_error() -> f64 {
    msec_to_time(2.5)
}

fn min_frame_duration() -> f64 {
    msec_to_time(8.3)
}

fn max_frame_duration() -> f64 {
    msec_to_time(500.0)
}

/// 常见帧时长（24000/1001、24、25、30000/1001、30、50、60000/1001、60）
const STANDARD_DURATIONS: [f64; 8] = [
    TIME_BASE * 1.001 / 24.0,
    TIME_BASE / 24.0,
    TIME_BASE / 25.0,
    TIME_BASE * 1.001 / 30.0,
    TIME_BASE / 30.0,
    TIME_BASE / 50.0,
    TIME_BASE * 1.001 / 60.0,
    TIME_BASE / 60.0,
];

/// 与常见帧时长相差 20us 以内时取常见值，第二个返回值表示是否命中
pub fn normalize_frameduration(duration: f64) -> (f64, bool) {
    let tolerance = msec_to_time(0.02);
    STANDARD_DURATIONS
        .iter()
        .map(|&standard| (standard, (duration - standard).abs()))
        .filter(|&(_, diff)| diff < tolerance)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(standard, _)| (standard, true))
        .unwrap_or((duration, false))
}

pub struct PtsTracker {
    diff_ring: [f64; DIFFRINGSIZE],
    ring_pos: usize,
    ring_fill: usize,
    prev_pts: Option<f64>,
    pattern: Vec<f64>,
    has_pattern: bool,
    frame_duration: Option<f64>,

    // 以下在 flush 后保留
    last_pattern: Vec<f64>,
    vfr_counter: u32,
    pattern_counter: u32,
    min_frame_duration: Option<f64>,
    max_frame_duration: Option<f64>,
}

impl Default for PtsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PtsTracker {
    pub fn new() -> Self {
        let mut tracker = Self {
            diff_ring: [0.0; DIFFRINGSIZE],
            ring_pos: 0,
            ring_fill: 0,
            prev_pts: None,
            pattern: Vec::new(),
            has_pattern: false,
            frame_duration: None,
            last_pattern: Vec::new(),
            vfr_counter: 0,
            pattern_counter: 0,
            min_frame_duration: None,
            max_frame_duration: None,
        };
        tracker.reset_vfr_detection();
        tracker.flush();
        tracker
    }

    pub fn add(&mut self, pts: f64) {
        let Some(prev) = self.prev_pts else {
            self.prev_pts = Some(pts);
            return;
        };

        self.ring_pos = (self.ring_pos + 1) % DIFFRINGSIZE;
        self.diff_ring[self.ring_pos] = pts - prev;
        self.prev_pts = Some(pts);

        if self.ring_fill < DIFFRINGSIZE {
            self.ring_fill += 1;
        }
        if self.ring_fill < DIFFRINGSIZE {
            return;
        }

        let pattern = self.current_pattern();

        if !self.check_pattern(&pattern) {
            if self.has_pattern {
                self.vfr_counter += 1;
                self.last_pattern = std::mem::take(&mut self.pattern);
                debug!(
                    "🎞 帧间隔模式丢失，差值 {:.0}，累计丢失 {} 次",
                    self.diff(0),
                    self.vfr_counter
                );
                self.flush();
            }
            self.pattern = pattern;
            return;
        }

        if !self.has_pattern {
            self.has_pattern = true;
            let last = self.last_pattern.clone();
            if !self.check_pattern(&last) {
                self.pattern_counter += 1;
            }
            debug!(
                "🎞 检测到长度为 {} 的帧间隔模式: {:?}",
                self.pattern.len(),
                self.pattern
            );
        }

        self.frame_duration = Some(self.calc_frame_duration());
    }

    /// 清空差值环（保留 VFR 统计）
    pub fn flush(&mut self) {
        self.pattern.clear();
        self.ring_pos = 0;
        self.prev_pts = None;
        self.ring_fill = 0;
        self.has_pattern = false;
        self.frame_duration = None;
        self.diff_ring = [0.0; DIFFRINGSIZE];
    }

    /// 清空 VFR 统计（保留差值环）
    pub fn reset_vfr_detection(&mut self) {
        self.min_frame_duration = None;
        self.max_frame_duration = None;
        self.vfr_counter = 0;
        self.pattern_counter = 0;
        self.last_pattern.clear();
    }

    /// 估计的帧时长；尚未建立模式时为 None
    pub fn frame_duration(&self) -> Option<f64> {
        self.frame_duration
    }

    pub fn min_frame_duration(&self) -> Option<f64> {
        self.min_frame_duration
    }

    pub fn max_frame_duration(&self) -> Option<f64> {
        self.max_frame_duration
    }

    pub fn vfr_detection(&self) -> bool {
        self.vfr_counter >= VFR_DETECTION_THRESHOLD && self.pattern_counter >= VFR_PATTERN_THRESHOLD
    }

    pub fn has_pattern(&self) -> bool {
        self.has_pattern
    }

    /// 往前第 `n` 个差值（0 为最新）
    fn diff(&self, n: usize) -> f64 {
        let pos = (self.ring_pos + DIFFRINGSIZE - n % DIFFRINGSIZE) % DIFFRINGSIZE;
        self.diff_ring[pos]
    }

    fn match_diff(a: f64, b: f64) -> bool {
        (a - b).abs() < max_error()
    }

    fn match_difftype(a: &[usize], b: &[usize]) -> bool {
        a == b
    }

    /// 在差值环中寻找重复模式，返回模式内各位置的平均差值（升序）
    fn current_pattern(&self) -> Vec<f64> {
        let fill = self.ring_fill;

        let mut difftypes: Vec<f64> = Vec::new();
        for i in 0..fill {
            let d = self.diff(i);
            if !difftypes.iter().any(|&t| Self::match_diff(d, t)) {
                difftypes.push(d);
            }
        }

        let types: Vec<usize> = (0..fill)
            .map(|i| {
                let d = self.diff(i);
                difftypes
                    .iter()
                    .position(|&t| Self::match_diff(d, t))
                    .unwrap_or(0)
            })
            .collect();

        let mut pattern = Vec::new();
        // 优先验证已知模式长度
        let mut check_existing = !self.pattern.is_empty();
        let mut i = 1;
        while i <= fill / 2 {
            let length = if check_existing { self.pattern.len() } else { i };
            let mut has_match = length > 0;

            if has_match {
                for j in 1..=(fill / length) {
                    let start = j * length;
                    if start >= fill {
                        break;
                    }
                    let nr_diffs = length.min(fill - start);
                    if !Self::match_difftype(&types[..nr_diffs], &types[start..start + nr_diffs]) {
                        has_match = false;
                        break;
                    }
                }
            }

            if check_existing {
                check_existing = false;
            } else {
                i += 1;
            }

            if has_match {
                let repeats = fill / length;
                for pos in 0..length {
                    let sum: f64 = (0..repeats).map(|j| self.diff(j * length + pos)).sum();
                    pattern.push(sum / repeats as f64);
                }
                break;
            }
        }

        pattern.sort_by(|a, b| a.total_cmp(b));
        pattern
    }

    /// 与已保存模式比较
    fn check_pattern(&self, pattern: &[f64]) -> bool {
        if pattern.is_empty() || pattern.len() != self.pattern.len() {
            return false;
        }
        if pattern.len() == 1 && (pattern[0] < min_frame_duration() || pattern[0] > max_frame_duration()) {
            return false;
        }
        pattern
            .iter()
            .zip(self.pattern.iter())
            .all(|(&a, &b)| Self::match_diff(a, b))
    }

    /// 由模式计算帧时长，同时更新最小 / 最大帧时长
    fn calc_frame_duration(&mut self) -> f64 {
        if self.pattern.is_empty() {
            return 0.0;
        }

        let min = self.pattern.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.pattern.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let average = self.pattern.iter().sum::<f64>() / self.pattern.len() as f64;

        let (normalized_min, standard) = normalize_frameduration(min);
        if standard && self.min_frame_duration.map_or(true, |cur| normalized_min < cur) {
            self.min_frame_duration = Some(normalized_min);
        }
        let (normalized_max, standard) = normalize_frameduration(max);
        if standard && self.max_frame_duration.map_or(true, |cur| normalized_max > cur) {
            self.max_frame_duration = Some(normalized_max);
        }

        normalize_frameduration(average).0
    }
}
