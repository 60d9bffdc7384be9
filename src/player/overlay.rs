use crossbeam::atomic::AtomicCell;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

/// 叠加层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayKind {
    Spu,
    Text,
    Image,
    Ssa,
    Group,
}

/// 叠加层内容
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayContent {
    /// DVD 子图像原始数据
    Spu(Vec<u8>),
    Text(String),
    Image { width: u32, height: u32, rgba: Vec<u8> },
    /// ASS/SSA 事件（带样式的原始行）
    Ssa(String),
    Group(Vec<OverlayContent>),
}

impl OverlayContent {
    pub fn kind(&self) -> OverlayKind {
        match self {
            OverlayContent::Spu(_) => OverlayKind::Spu,
            OverlayContent::Text(_) => OverlayKind::Text,
            OverlayContent::Image { .. } => OverlayKind::Image,
            OverlayContent::Ssa(_) => OverlayKind::Ssa,
            OverlayContent::Group(_) => OverlayKind::Group,
        }
    }
}

/// 字幕 / 菜单叠加层
///
/// 结束时间可被容器在渲染线程持有句柄时裁剪，因此放在原子单元里。
#[derive(Debug)]
pub struct Overlay {
    pub start: f64,
    stop: AtomicCell<Option<f64>>,
    /// 强制显示（不受字幕开关影响，也不会被清理）
    pub forced: bool,
    /// 允许被后加入的同类型叠加层截断
    pub replace: bool,
    pub content: OverlayContent,
}

impl Overlay {
    pub fn new(start: f64, stop: Option<f64>, content: OverlayContent) -> Self {
        Self {
            start,
            stop: AtomicCell::new(stop),
            forced: false,
            replace: false,
            content,
        }
    }

    pub fn with_forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn with_replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn kind(&self) -> OverlayKind {
        self.content.kind()
    }

    pub fn stop(&self) -> Option<f64> {
        self.stop.load()
    }

    pub fn set_stop(&self, stop: Option<f64>) {
        self.stop.store(stop);
    }

    /// `pts` 时刻是否可见（无结束时间视为持续到下一个叠加层）
    pub fn is_active_at(&self, pts: f64) -> bool {
        self.start <= pts && self.stop().map_or(true, |stop| pts < stop)
    }
}

/// 叠加层容器
///
/// 字幕阶段写入，渲染路径读取。单把锁覆盖增删与遍历，读者只拷出 `Arc` 句柄。
#[derive(Default)]
pub struct OverlayContainer {
    overlays: Mutex<Vec<Arc<Overlay>>>,
}

impl OverlayContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入叠加层，同时裁剪与之重叠的同类型旧叠加层
    ///
    /// 完全嵌套在已有 ASS 事件内的新 ASS 事件被丢弃。
    pub fn add(&self, overlay: Arc<Overlay>) {
        let mut overlays = self.overlays.lock();

        for existing in overlays.iter().rev() {
            if existing.kind() != overlay.kind() {
                continue;
            }

            // 同一起点可能排队多个无结束时间的叠加层，遇到新起点才结束它们
            if let Some(stop) = existing.stop() {
                if !existing.replace || stop <= overlay.start {
                    break;
                }
            }

            if overlay.kind() == OverlayKind::Ssa && Self::is_nested(&overlay, existing) {
                debug!("💬 丢弃被完全覆盖的 ASS 事件 start={}", overlay.start);
                return;
            }

            if existing.start != overlay.start {
                existing.set_stop(Some(overlay.start));
            }
        }

        overlays.push(overlay);
    }

    fn is_nested(inner: &Overlay, outer: &Overlay) -> bool {
        let stop_within = match (inner.stop(), outer.stop()) {
            (_, None) => true,
            (Some(inner_stop), Some(outer_stop)) => inner_stop <= outer_stop,
            (None, Some(_)) => false,
        };
        inner.start >= outer.start && stop_within
    }

    /// 拷出当前所有叠加层句柄
    pub fn get_overlays(&self) -> Vec<Arc<Overlay>> {
        self.overlays.lock().clone()
    }

    /// `pts` 时刻可见的叠加层
    pub fn overlays_at(&self, pts: f64) -> Vec<Arc<Overlay>> {
        self.overlays
            .lock()
            .iter()
            .filter(|o| o.is_active_at(pts))
            .cloned()
            .collect()
    }

    /// 移除已经结束的非强制叠加层
    pub fn clean_up(&self, pts: f64) {
        let mut overlays = self.overlays.lock();
        let before = overlays.len();
        overlays.retain(|o| o.forced || o.stop().map_or(true, |stop| stop >= pts));
        let removed = before - overlays.len();
        if removed > 0 {
            debug!("💬 清理 {} 个过期叠加层 (pts={:.0})", removed, pts);
        }
    }

    pub fn remove(&self, overlay: &Arc<Overlay>) {
        self.overlays.lock().retain(|o| !Arc::ptr_eq(o, overlay));
    }

    pub fn clear(&self) {
        self.overlays.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.overlays.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.lock().is_empty()
    }

    pub fn contains_kind(&self, kind: OverlayKind) -> bool {
        self.overlays.lock().iter().any(|o| o.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(start: f64, stop: f64, s: &str) -> Arc<Overlay> {
        Arc::new(Overlay::new(start, Some(stop), OverlayContent::Text(s.to_string())).with_replace(true))
    }

    #[test]
    fn test_overlapping_overlay_is_clipped() {
        let container = OverlayContainer::new();
        let a = text(0.0, 5.0, "a");
        let b = text(3.0, 8.0, "b");
        container.add(a.clone());
        container.add(b.clone());

        assert_eq!(a.stop(), Some(3.0));
        assert_eq!(b.stop(), Some(8.0));
        let all = container.get_overlays();
        assert_eq!(all.len(), 2);
        assert!(Arc::ptr_eq(&all[0], &a));
        assert!(Arc::ptr_eq(&all[1], &b));
    }

    #[test]
    fn test_non_overlapping_and_other_kinds_untouched() {
        let container = OverlayContainer::new();
        let a = text(0.0, 2.0, "a");
        let image = Arc::new(Overlay::new(
            1.0,
            Some(9.0),
            OverlayContent::Image { width: 1, height: 1, rgba: vec![0; 4] },
        ));
        container.add(a.clone());
        container.add(image.clone());
        container.add(text(3.0, 4.0, "b"));

        assert_eq!(a.stop(), Some(2.0));
        assert_eq!(image.stop(), Some(9.0));
        assert_eq!(container.len(), 3);
    }

    #[test]
    fn test_open_ended_overlay_stops_at_next() {
        let container = OverlayContainer::new();
        let menu = Arc::new(Overlay::new(0.0, None, OverlayContent::Spu(vec![1, 2, 3])));
        container.add(menu.clone());
        container.add(Arc::new(Overlay::new(4.0, None, OverlayContent::Spu(vec![4]))));
        assert_eq!(menu.stop(), Some(4.0));
    }

    #[test]
    fn test_nested_ssa_is_suppressed() {
        let container = OverlayContainer::new();
        let ssa = |start: f64, stop: f64| {
            Arc::new(Overlay::new(start, Some(stop), OverlayContent::Ssa("Dialogue".to_string())).with_replace(true))
        };
        let outer = ssa(1.0, 5.0);
        container.add(outer.clone());
        container.add(ssa(2.0, 3.0));
        assert_eq!(container.len(), 1);
        assert_eq!(outer.stop(), Some(5.0));
        assert!(container.contains_kind(OverlayKind::Ssa));

        // 部分重叠的仍然加入，并截断前一个
        container.add(ssa(4.0, 7.0));
        assert_eq!(container.len(), 2);
        assert_eq!(outer.stop(), Some(4.0));
    }

    #[test]
    fn test_clean_up_keeps_forced() {
        let container = OverlayContainer::new();
        container.add(text(0.0, 1.0, "old"));
        let forced = Arc::new(Overlay::new(0.0, Some(1.0), OverlayContent::Spu(vec![])).with_forced(true));
        container.add(forced.clone());
        container.add(text(5.0, 6.0, "new"));

        container.clean_up(3.0);
        assert_eq!(container.len(), 2);
        assert_eq!(container.overlays_at(5.5).len(), 1);

        container.remove(&forced);
        assert_eq!(container.len(), 1);
        container.clear();
        assert!(container.is_empty());
    }

    #[test]
    fn test_handle_outlives_container_entry() {
        let container = OverlayContainer::new();
        let a = text(0.0, 5.0, "a");
        container.add(a.clone());
        let held = container.overlays_at(1.0);
        container.clear();
        // 渲染路径持有的句柄仍然有效，并且能看到后续裁剪
        assert_eq!(held[0].stop(), Some(5.0));
        held[0].set_stop(Some(2.0));
        assert_eq!(a.stop(), Some(2.0));
    }
}
