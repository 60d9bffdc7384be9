//! 输出阶段的公共部分：状态快照、线程句柄与消息通道

use crate::core::{PlayerError, Result, SyncState, TIME_BASE};
use crate::player::message::Message;
use crate::player::message_queue::{MessageQueue, QueueError};
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub(crate) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 前 N 个包逐个打日志，之后每 100 个打一次
pub(crate) const LOG_FIRST_N: u64 = 5;

pub(crate) fn should_log(count: u64) -> bool {
    count <= LOG_FIRST_N || count % 100 == 0
}

/// 阶段线程对外发布的状态（解复用线程只读）
#[derive(Debug)]
pub struct StageStatus {
    sync_state: AtomicCell<SyncState>,
    stalled: AtomicBool,
    current_pts: AtomicCell<Option<f64>>,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self {
            sync_state: AtomicCell::new(SyncState::Starting),
            stalled: AtomicBool::new(false),
            current_pts: AtomicCell::new(None),
        }
    }
}

impl StageStatus {
    pub fn sync_state(&self) -> SyncState {
        self.sync_state.load()
    }

    pub fn set_sync_state(&self, state: SyncState) {
        self.sync_state.store(state);
    }

    /// 输入队列已空且超时未收到数据
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// 最近送出的画面 / 音频时间戳
    pub fn current_pts(&self) -> Option<f64> {
        self.current_pts.load()
    }

    pub fn set_current_pts(&self, pts: Option<f64>) {
        self.current_pts.store(pts);
    }
}

/// 阶段线程持有的通道：自己的输入队列、上级队列和状态
#[derive(Clone)]
pub struct StageLink {
    pub inbox: Arc<MessageQueue>,
    pub parent: Arc<MessageQueue>,
    pub status: Arc<StageStatus>,
}

impl StageLink {
    /// 向上级发送消息；上级已关闭时只记日志
    pub fn notify_parent(&self, msg: Message, priority: i32) {
        if let Err(e) = self.parent.put(Arc::new(msg), priority) {
            debug!("{} [{}] 上级队列不可用: {}", log_ctx(), self.inbox.name(), e);
        }
    }

    /// 把消息放回自己的队列稍后再处理；`front` 时插到同优先级最前
    ///
    /// 返回 false 表示队列已不可用，消息被丢弃。
    pub fn requeue(&self, msg: Arc<Message>, priority: i32, front: bool) -> bool {
        let kind = msg.kind();
        let result = if front {
            self.inbox.put_back(msg, priority)
        } else {
            self.inbox.put(msg, priority)
        };
        match result {
            Ok(()) => true,
            Err(QueueError::Abort) => {
                debug!("{} [{}] 队列已中止，丢弃 {:?}", log_ctx(), self.inbox.name(), kind);
                false
            }
            Err(e) => {
                warn!("{} ⚠ [{}] 放回 {:?} 失败: {}", log_ctx(), self.inbox.name(), kind, e);
                false
            }
        }
    }

    /// GENERAL_DELAY：等待 `delay`（时间基单位），收到中止请求立即返回
    pub fn sleep(&self, delay: f64) {
        let deadline = Instant::now() + Duration::from_secs_f64((delay / TIME_BASE).max(0.0));
        while Instant::now() < deadline && !self.inbox.received_abort_request() {
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// 阶段线程句柄
///
/// 关闭顺序固定为 Abort → join → End。
pub struct StageHandle {
    link: StageLink,
    thread_handle: Option<JoinHandle<()>>,
}

impl StageHandle {
    /// 初始化输入队列并启动阶段线程
    pub fn spawn<F>(link: StageLink, task: F) -> Result<Self>
    where
        F: FnOnce(StageLink) + Send + 'static,
    {
        link.inbox.init();
        let name = link.inbox.name().to_string();
        let thread_link = link.clone();
        let thread_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || task(thread_link))
            .map_err(|e| PlayerError::StreamError(format!("启动 {} 线程失败: {}", name, e)))?;

        info!("{} ▶ 阶段线程已启动: {}", log_ctx(), name);
        Ok(Self {
            link,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn name(&self) -> &str {
        self.link.inbox.name()
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.link.inbox
    }

    pub fn status(&self) -> &Arc<StageStatus> {
        &self.link.status
    }

    pub fn send(&self, msg: Message, priority: i32) -> std::result::Result<(), QueueError> {
        self.send_arc(Arc::new(msg), priority)
    }

    pub fn send_arc(&self, msg: Arc<Message>, priority: i32) -> std::result::Result<(), QueueError> {
        self.link.inbox.put(msg, priority)
    }

    /// 丢弃排队消息并插入高优先级 FLUSH
    pub fn flush(&self, sync: bool) {
        self.link.inbox.flush(None);
        if let Err(e) = self.send(Message::GeneralFlush { sync }, 1) {
            warn!("{} ⚠ [{}] 发送 FLUSH 失败: {}", log_ctx(), self.name(), e);
        }
    }

    pub fn level(&self) -> u32 {
        self.link.inbox.level()
    }

    pub fn accepts_data(&self) -> bool {
        !self.link.inbox.is_full()
    }

    pub fn has_data(&self) -> bool {
        !self.link.inbox.is_empty()
    }

    pub fn is_stalled(&self) -> bool {
        self.link.status.is_stalled()
    }

    /// 关闭阶段；`wait` 为 true 时先等队列中的数据处理完
    pub fn close(&mut self, wait: bool) {
        let Some(handle) = self.thread_handle.take() else { return };
        if wait {
            self.link.inbox.wait_until_empty();
        }
        self.link.inbox.abort();
        if handle.join().is_err() {
            warn!("{} ⚠ [{}] 阶段线程异常退出", log_ctx(), self.name());
        }
        self.link.inbox.end();
        info!("{} ⏹ 阶段线程已关闭: {}", log_ctx(), self.name());
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ StageHandle[{}] 被 drop，但可能未调用 close()，正在尝试优雅停止", log_ctx(), self.name());
            self.close(false);
        }
    }
}
