use crate::core::TIME_BASE;
use crate::player::message::{Message, MessageKind, SyncSources, SynchronizeBarrier};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// 消息队列返回码
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("等待超时")]
    Timeout,
    #[error("队列已中止")]
    Abort,
    #[error("队列未初始化")]
    NotInitialized,
    #[error("无效消息")]
    InvalidMessage,
    #[error("队列已满")]
    Full,
}

/// WaitUntilEmpty 的屏障超时
const DRAIN_TIMEOUT: Duration = Duration::from_secs(40);

struct QueueItem {
    msg: Arc<Message>,
    priority: i32,
}

struct QueueState {
    initialized: bool,
    drain: bool,
    /// 优先级消息：按优先级降序，同优先级先进先出
    prio: VecDeque<QueueItem>,
    /// 数据消息：队头最旧
    data: VecDeque<QueueItem>,
    data_size: usize,
    time_front: Option<f64>,        // 最新数据包时间戳
    time_back: Option<f64>,         // 最旧数据包时间戳
    max_data_size: Option<usize>,
    max_time_size: f64,             // 秒
}

impl QueueState {
    fn reset_accounting(&mut self) {
        self.data_size = 0;
        self.time_front = None;
        self.time_back = None;
    }

    fn oldest_data_timestamp(&self) -> Option<f64> {
        self.data
            .iter()
            .find_map(|item| item.msg.demux_packet().and_then(|p| p.timestamp()))
    }

    fn time_span(&self) -> Option<f64> {
        match (self.time_front, self.time_back) {
            (Some(front), Some(back)) if front > back => Some(front - back),
            _ => None,
        }
    }

    fn level(&self) -> u32 {
        if self.data_size == 0 {
            return 0;
        }
        if let Some(max) = self.max_data_size {
            if self.data_size > max {
                return 100;
            }
            return if max == 0 { 100 } else { (100 * self.data_size / max).min(100) as u32 };
        }

        let level = match self.time_span() {
            Some(span) if self.max_time_size > 0.0 => {
                (100.0 * span / TIME_BASE / self.max_time_size).ceil().min(100.0) as u32
            }
            _ => 0,
        };
        // 有数据但没有可用时间戳时不能报告为空
        if level == 0 {
            1
        } else {
            level
        }
    }
}

/// 优先级消息队列
///
/// - 优先级 > 0 的控制消息总是先于数据消息被取出
/// - 优先级 0 的数据包累计字节数与时间跨度，用于水位计算
/// - Abort 是粘滞的，直到再次 Init
pub struct MessageQueue {
    name: String,
    state: Mutex<QueueState>,
    cond: Condvar,
    abort: AtomicBool,
}

impl MessageQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                initialized: false,
                drain: false,
                prio: VecDeque::new(),
                data: VecDeque::new(),
                data_size: 0,
                time_front: None,
                time_back: None,
                max_data_size: None,
                max_time_size: 8.0,
            }),
            cond: Condvar::new(),
            abort: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init(&self) {
        let mut st = self.state.lock();
        st.prio.clear();
        st.data.clear();
        st.reset_accounting();
        st.drain = false;
        st.initialized = true;
        self.abort.store(false, Ordering::SeqCst);
    }

    /// 中止：唤醒所有阻塞的 get
    pub fn abort(&self) {
        let _st = self.state.lock();
        self.abort.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn end(&self) {
        self.flush(None);
        let mut st = self.state.lock();
        st.initialized = false;
        st.reset_accounting();
        self.abort.store(false, Ordering::SeqCst);
    }

    pub fn put(&self, msg: Arc<Message>, priority: i32) -> Result<(), QueueError> {
        self.put_internal(msg, priority, false)
    }

    /// 放回队头（解码器暂时不能接收时使用）
    pub fn put_back(&self, msg: Arc<Message>, priority: i32) -> Result<(), QueueError> {
        self.put_internal(msg, priority, true)
    }

    /// 非阻塞写入：数据包遇到满队列时返回 Full
    pub fn try_put(&self, msg: Arc<Message>, priority: i32) -> Result<(), QueueError> {
        if priority == 0 && msg.kind() == MessageKind::DemuxerPacket && self.is_full() {
            return Err(QueueError::Full);
        }
        self.put(msg, priority)
    }

    fn put_internal(&self, msg: Arc<Message>, priority: i32, front: bool) -> Result<(), QueueError> {
        let mut st = self.state.lock();
        if !st.initialized {
            warn!("⚠ [{}] 队列未初始化，丢弃消息 {:?}", self.name, msg.kind());
            return Err(QueueError::NotInitialized);
        }

        let packet_info = if priority == 0 {
            msg.demux_packet().map(|p| (p.size(), p.timestamp()))
        } else {
            None
        };

        if priority > 0 {
            let pos = if front {
                st.prio.iter().position(|item| item.priority <= priority)
            } else {
                st.prio.iter().position(|item| item.priority < priority)
            };
            let item = QueueItem { msg, priority };
            match pos {
                Some(pos) => st.prio.insert(pos, item),
                None => st.prio.push_back(item),
            }
        } else {
            if st.data.is_empty() {
                st.reset_accounting();
            }
            let item = QueueItem { msg, priority };
            if front {
                st.data.push_front(item);
            } else {
                st.data.push_back(item);
            }
        }

        if let Some((size, timestamp)) = packet_info {
            st.data_size += size;
            if let Some(ts) = timestamp {
                if front {
                    st.time_back = Some(ts);
                    if st.time_front.is_none() {
                        st.time_front = Some(ts);
                    }
                } else {
                    st.time_front = Some(ts);
                    if st.time_back.is_none() {
                        st.time_back = Some(ts);
                    }
                }
            }
        }

        self.cond.notify_all();
        Ok(())
    }

    /// 取消息
    ///
    /// 有优先级消息（或 `min_priority > 0`）时只看优先级列表。
    pub fn get(&self, timeout: Duration, min_priority: i32) -> Result<(Arc<Message>, i32), QueueError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();

        if !st.initialized {
            return Err(QueueError::NotInitialized);
        }

        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(QueueError::Abort);
            }

            let use_prio = min_priority > 0 || !st.prio.is_empty();
            let drain = st.drain;
            let list = if use_prio { &mut st.prio } else { &mut st.data };
            let ready = list
                .front()
                .map(|item| item.priority >= min_priority || drain)
                .unwrap_or(false);

            if ready {
                if let Some(item) = list.pop_front() {
                    if item.priority == 0 {
                        if let Some(packet) = item.msg.demux_packet() {
                            st.data_size = st.data_size.saturating_sub(packet.size());
                        }
                        st.time_back = st.oldest_data_timestamp().or(st.time_front);
                        if st.data.is_empty() {
                            st.reset_accounting();
                        }
                    }
                    return Ok((item.msg, item.priority));
                }
            }

            if timeout.is_zero() || Instant::now() >= deadline {
                return Err(QueueError::Timeout);
            }
            self.cond.wait_until(&mut st, deadline);
        }
    }

    /// 清空指定类型（None 为全部）的消息
    pub fn flush(&self, kind: Option<MessageKind>) {
        let mut st = self.state.lock();
        let matches = |item: &QueueItem| kind.map_or(true, |k| item.msg.kind() == k);
        st.prio.retain(|item| !matches(item));
        st.data.retain(|item| !matches(item));

        if kind.is_none() || kind == Some(MessageKind::DemuxerPacket) {
            st.reset_accounting();
        }
        debug!("🧹 [{}] 队列清空: {:?}", self.name, kind);
    }

    /// 等待消费者处理完当前所有数据
    pub fn wait_until_empty(&self) {
        {
            let mut st = self.state.lock();
            st.drain = true;
        }

        // 消费者取到屏障即放行
        let barrier = Arc::new(SynchronizeBarrier::new(DRAIN_TIMEOUT, SyncSources::ANY));
        if self.put(Arc::new(Message::GeneralSynchronize(barrier.clone())), 0).is_ok() {
            debug!("⏳ [{}] 等待队列排空", self.name);
            barrier.wait_until(&self.abort, SyncSources::NONE);
        }

        let mut st = self.state.lock();
        st.drain = false;
    }

    /// 水位（0 - 100）
    pub fn level(&self) -> u32 {
        self.state.lock().level()
    }

    pub fn is_full(&self) -> bool {
        self.level() >= 100
    }

    pub fn is_inited(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_empty(&self) -> bool {
        let st = self.state.lock();
        st.prio.is_empty() && st.data.is_empty()
    }

    pub fn received_abort_request(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn data_size(&self) -> usize {
        self.state.lock().data_size
    }

    /// 缓冲的时间跨度（秒）
    pub fn time_size(&self) -> f64 {
        self.state.lock().time_span().map(|span| span / TIME_BASE).unwrap_or(0.0)
    }

    pub fn max_data_size(&self) -> Option<usize> {
        self.state.lock().max_data_size
    }

    pub fn set_max_data_size(&self, size: Option<usize>) {
        self.state.lock().max_data_size = size;
    }

    pub fn set_max_time_size(&self, secs: f64) {
        self.state.lock().max_time_size = secs;
    }

    pub fn max_time_size(&self) -> f64 {
        self.state.lock().max_time_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DemuxPacket;
    use std::thread;

    fn packet(size: usize, dts: Option<f64>) -> Arc<Message> {
        Message::packet(
            DemuxPacket {
                data: vec![0u8; size],
                dts,
                pts: dts,
                ..Default::default()
            },
            false,
        )
    }

    fn queue() -> MessageQueue {
        let q = MessageQueue::new("test");
        q.init();
        q
    }

    #[test]
    fn test_byte_accounting_matches_buffered_packets() {
        let q = queue();
        q.put(packet(100, Some(0.0)), 0).unwrap();
        q.put(packet(200, Some(40_000.0)), 0).unwrap();
        q.put(Arc::new(Message::GeneralEof), 0).unwrap();
        q.put(packet(300, Some(80_000.0)), 0).unwrap();
        assert_eq!(q.data_size(), 600);

        q.get(Duration::ZERO, 0).unwrap();
        assert_eq!(q.data_size(), 500);
        q.get(Duration::ZERO, 0).unwrap();
        assert_eq!(q.data_size(), 300);
        let (msg, _) = q.get(Duration::ZERO, 0).unwrap();
        assert_eq!(msg.kind(), MessageKind::GeneralEof);
        assert_eq!(q.data_size(), 300);
        q.get(Duration::ZERO, 0).unwrap();
        assert_eq!(q.data_size(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_priority_messages_overtake_data() {
        let q = queue();
        q.put(packet(10, Some(0.0)), 0).unwrap();
        q.put(packet(10, Some(1.0)), 0).unwrap();
        q.put(Arc::new(Message::GeneralReset), 1).unwrap();

        let (msg, priority) = q.get(Duration::ZERO, 1).unwrap();
        assert_eq!(msg.kind(), MessageKind::GeneralReset);
        assert_eq!(priority, 1);

        // 只要优先级消息的请求在优先级列表为空时超时
        assert_eq!(q.get(Duration::ZERO, 1).unwrap_err(), QueueError::Timeout);
        assert_eq!(q.get(Duration::ZERO, 0).unwrap().0.kind(), MessageKind::DemuxerPacket);
    }

    #[test]
    fn test_priority_order_and_put_back() {
        let q = queue();
        q.put(Arc::new(Message::GeneralPause(true)), 1).unwrap();
        q.put(Arc::new(Message::GeneralReset), 2).unwrap();
        q.put(Arc::new(Message::GeneralEof), 1).unwrap();
        q.put_back(Arc::new(Message::VideoNoSkip), 1).unwrap();

        let order: Vec<MessageKind> = (0..4).map(|_| q.get(Duration::ZERO, 0).unwrap().0.kind()).collect();
        assert_eq!(
            order,
            vec![
                MessageKind::GeneralReset,
                MessageKind::VideoNoSkip,
                MessageKind::GeneralPause,
                MessageKind::GeneralEof
            ]
        );
    }

    #[test]
    fn test_put_back_data_goes_to_head() {
        let q = queue();
        q.put(packet(10, Some(40_000.0)), 0).unwrap();
        q.put_back(packet(20, Some(0.0)), 0).unwrap();
        let (msg, _) = q.get(Duration::ZERO, 0).unwrap();
        assert_eq!(msg.demux_packet().unwrap().size(), 20);
        assert_eq!(q.data_size(), 10);
    }

    #[test]
    fn test_flush_by_kind_keeps_accounting_for_other_kinds() {
        let q = queue();
        q.put(packet(64, Some(0.0)), 0).unwrap();
        q.put(Arc::new(Message::GeneralEof), 0).unwrap();
        q.flush(Some(MessageKind::GeneralEof));
        assert_eq!(q.data_size(), 64);
        q.flush(Some(MessageKind::DemuxerPacket));
        assert_eq!(q.data_size(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_flush_atomic_with_concurrent_put() {
        let q = Arc::new(queue());
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for i in 0..2000 {
                    q.put(packet(16, Some(i as f64 * 1000.0)), 0).unwrap();
                }
            })
        };
        for _ in 0..200 {
            q.flush(None);
            assert_eq!(q.data_size() % 16, 0);
        }
        producer.join().unwrap();

        let size = q.data_size();
        let mut drained = 0;
        while q.get(Duration::ZERO, 0).is_ok() {
            drained += 1;
        }
        assert_eq!(size, drained * 16);
        assert_eq!(q.data_size(), 0);

        q.put(packet(16, Some(0.0)), 0).unwrap();
        q.flush(None);
        assert_eq!(q.data_size(), 0);
    }

    #[test]
    fn test_time_based_level() {
        let q = queue();
        q.set_max_data_size(None);
        q.set_max_time_size(4.0);
        assert_eq!(q.level(), 0);
        q.put(packet(10, Some(0.0)), 0).unwrap();
        q.put(packet(10, Some(2_000_000.0)), 0).unwrap();
        assert_eq!(q.level(), 50);
        assert!((q.time_size() - 2.0).abs() < 1e-9);
        q.put(packet(10, Some(5_000_000.0)), 0).unwrap();
        assert_eq!(q.level(), 100);
        assert!(q.is_full());
    }

    #[test]
    fn test_level_without_timestamps_is_not_empty() {
        let q = queue();
        q.set_max_data_size(None);
        q.put(packet(10, None), 0).unwrap();
        q.put(packet(10, None), 0).unwrap();
        assert_eq!(q.level(), 1);
    }

    #[test]
    fn test_byte_based_level_and_try_put() {
        let q = queue();
        q.set_max_data_size(Some(1000));
        q.put(packet(500, None), 0).unwrap();
        assert_eq!(q.level(), 50);
        q.put(packet(600, None), 0).unwrap();
        assert_eq!(q.level(), 100);
        assert_eq!(q.try_put(packet(1, None), 0).unwrap_err(), QueueError::Full);
        assert!(q.try_put(Arc::new(Message::GeneralEof), 1).is_ok());
    }

    #[test]
    fn test_abort_is_sticky_and_wakes_getter() {
        let q = Arc::new(queue());
        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.get(Duration::from_secs(10), 0))
        };
        thread::sleep(Duration::from_millis(20));
        q.abort();
        assert_eq!(waiter.join().unwrap().unwrap_err(), QueueError::Abort);

        q.put(Arc::new(Message::GeneralEof), 0).unwrap();
        assert_eq!(q.get(Duration::ZERO, 0).unwrap_err(), QueueError::Abort);
        assert!(q.received_abort_request());

        q.init();
        assert!(!q.received_abort_request());
    }

    #[test]
    fn test_not_initialized() {
        let q = MessageQueue::new("idle");
        assert_eq!(q.put(Arc::new(Message::GeneralEof), 0).unwrap_err(), QueueError::NotInitialized);
        assert_eq!(q.get(Duration::ZERO, 0).unwrap_err(), QueueError::NotInitialized);

        q.init();
        q.end();
        assert!(!q.is_inited());
        assert_eq!(q.get(Duration::ZERO, 0).unwrap_err(), QueueError::NotInitialized);
    }

    #[test]
    fn test_wait_until_empty_with_consumer() {
        let q = Arc::new(queue());
        q.put(packet(10, Some(0.0)), 0).unwrap();
        q.put(packet(10, Some(1.0)), 0).unwrap();

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut packets = 0;
                loop {
                    match q.get(Duration::from_secs(5), 0) {
                        Ok((msg, _)) => match &*msg {
                            Message::GeneralSynchronize(barrier) => {
                                barrier.wait(Duration::from_secs(5), SyncSources::AUDIO);
                                return packets;
                            }
                            Message::DemuxerPacket { .. } => packets += 1,
                            _ => {}
                        },
                        Err(_) => return packets,
                    }
                }
            })
        };

        q.wait_until_empty();
        assert_eq!(consumer.join().unwrap(), 2);
        assert!(q.is_empty());
    }
}
