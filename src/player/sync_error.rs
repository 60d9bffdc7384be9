//! 音频同步误差处理：断点阈值自学习与重采样 PI 控制器

use crate::core::{msec_to_time, sec_to_time, PlayerSettings, TIME_BASE};
use log::info;

/// 学习阶段
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearnerPhase {
    /// 统计观察到的抖动，阈值随之放宽
    Learning { started: Option<f64>, observed: f64 },
    /// 阈值已固定
    Fixed { threshold: f64 },
}

/// 断点同步阈值学习器
///
/// 学习窗口内阈值跟随观察到的最大抖动；窗口结束后固定为 抖动 × 余量，
/// 始终限制在 [min, max] 内。超过 max 的误差被视为真实漂移，不参与学习。
#[derive(Debug, Clone)]
pub struct SyncErrorLearner {
    phase: LearnerPhase,
    min: f64,
    max: f64,
    window: f64,
    margin: f64,
}

impl SyncErrorLearner {
    pub fn new(min: f64, max: f64, window: f64, margin: f64) -> Self {
        Self {
            phase: LearnerPhase::Learning { started: None, observed: 0.0 },
            min,
            max: max.max(min),
            window,
            margin,
        }
    }

    pub fn from_settings(settings: &PlayerSettings) -> Self {
        Self::new(
            msec_to_time(settings.discon_min_threshold_ms),
            msec_to_time(settings.discon_max_threshold_ms.min(100.0)),
            sec_to_time(settings.discon_learning_secs),
            settings.discon_margin,
        )
    }

    pub fn phase(&self) -> LearnerPhase {
        self.phase
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.phase, LearnerPhase::Fixed { .. })
    }

    pub fn threshold(&self) -> f64 {
        match self.phase {
            LearnerPhase::Learning { observed, .. } => observed.clamp(self.min, self.max),
            LearnerPhase::Fixed { threshold } => threshold,
        }
    }

    /// 记录一次误差绝对值；`now` 为绝对时间
    pub fn observe(&mut self, error_abs: f64, now: f64) {
        let LearnerPhase::Learning { started, observed } = self.phase else { return };
        let started = started.unwrap_or(now);
        let observed = if error_abs <= self.max { observed.max(error_abs) } else { observed };

        if now - started >= self.window {
            let threshold = (observed * self.margin).clamp(self.min, self.max);
            info!(
                "🎚 断点同步阈值学习完成: 抖动 {:.1}ms -> 阈值 {:.1}ms",
                observed * 1000.0 / TIME_BASE,
                threshold * 1000.0 / TIME_BASE
            );
            self.phase = LearnerPhase::Fixed { threshold };
        } else {
            self.phase = LearnerPhase::Learning { started: Some(started), observed };
        }
    }

    pub fn reset(&mut self) {
        self.phase = LearnerPhase::Learning { started: None, observed: 0.0 };
    }
}

const INTEGRAL: f64 = 200.0;
const PROPORTIONAL: f64 = 20.0;
const PROPREF: f64 = 0.01;
const PROPDIVMIN: f64 = 2.0;
const PROPDIVMAX: f64 = 40.0;

/// 重采样 PI 控制器
#[derive(Debug, Clone, Default)]
pub struct ResampleController {
    integral: f64,
}

impl ResampleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由平均同步误差（音频领先为正）计算重采样比
    ///
    /// 比值围绕 1 / 时钟速度，偏离量被限制在 `max_adjust_percent` 以内。
    pub fn update(&mut self, error: f64, clock_speed: f64, max_adjust_percent: f64) -> f64 {
        let error_secs = error / TIME_BASE;

        if error.abs() > TIME_BASE {
            self.integral = 0.0;
        } else if error.abs() > msec_to_time(5.0) {
            self.integral += error_secs / INTEGRAL;
        }

        let mut proportional = 0.0;
        if error_secs.abs() > 0.0 {
            let div = (PROPORTIONAL * (PROPREF / error_secs.abs())).clamp(PROPDIVMIN, PROPDIVMAX);
            proportional = error_secs / div;
        }

        let base = if clock_speed > 0.0 { 1.0 / clock_speed } else { 1.0 };
        let limit = max_adjust_percent.max(0.0) / 100.0;
        (base + proportional + self.integral).clamp(base - limit, base + limit)
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
    }
}
