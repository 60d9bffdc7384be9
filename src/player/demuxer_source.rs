use crate::core::{DemuxPacket, DemuxStream, Result};

/// 一次读包的结果
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(DemuxPacket),
    /// 到达文件末尾
    Eof,
    /// 暂无数据（菜单 / 静止帧等待），不是 EOF
    NoData,
    /// 输入源要求停止播放
    Stop,
}

/// Demuxer 数据源抽象接口
///
/// 不同的媒体源（本地文件、网络流、合成流等）实现这个接口，
/// 解复用线程把它当作不透明的拉取源使用。
pub trait DemuxerSource: Send {
    /// 读取下一个媒体包
    fn read_packet(&mut self) -> Result<ReadOutcome>;

    /// 所有基本流
    fn streams(&self) -> Vec<DemuxStream>;

    fn stream(&self, id: i32) -> Option<DemuxStream> {
        self.streams().into_iter().find(|s| s.id == id)
    }

    /// Seek 到指定位置（毫秒）
    fn seek(&mut self, time_ms: i64, backward: bool) -> Result<()>;

    /// 丢弃内部缓冲
    fn flush(&mut self);

    /// 通知播放速度（部分输入源需要，例如按速度调整读取策略）
    fn set_speed(&mut self, _speed: i32) {}

    /// 总时长（毫秒），未知时返回 0
    fn duration_ms(&self) -> i64;

    /// 输入是否带预读缓存（决定 seek 后先做 FULL 缓冲还是 INIT）
    fn has_read_cache(&self) -> bool {
        false
    }

    /// 直播输入：数据按实时速率到达，播放时钟需要随缓冲水位微调
    fn is_realtime(&self) -> bool {
        false
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}

/// 光盘 / 菜单类输入的导航状态机
pub trait InputNavigator: Send {
    /// 是否处于 hold 状态（等待解复用器排空后才继续送数据）
    fn is_held(&self) -> bool;

    fn skip_hold(&mut self);

    /// 当前静止帧的时长（毫秒）；None 表示不在静止帧，`Some(i64::MAX)` 表示无限静止
    fn still_state(&self) -> Option<i64>;

    fn skip_still(&mut self);

    fn is_eof(&self) -> bool;
}

/// 图文电视 / RDS / ID3 等附属数据的接收端
pub trait AncillarySink: Send {
    fn on_data(&mut self, packet: &DemuxPacket);

    fn flush(&mut self) {}
}
