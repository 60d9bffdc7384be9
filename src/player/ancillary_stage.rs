use crate::core::StreamKind;
use crate::player::demuxer_source::AncillarySink;
use crate::player::message::{Message, SyncSources};
use crate::player::message_queue::QueueError;
use crate::player::stage::{log_ctx, StageLink};
use log::{debug, info, warn};
use std::time::Duration;

/// 图文电视 / RDS / ID3 阶段：数据包原样转交接收端，不参与音视频同步
pub fn ancillary_stage_task(kind: StreamKind, mut sink: Box<dyn AncillarySink>, link: StageLink) {
    info!("{} 📟 {} 阶段启动", log_ctx(), kind.as_str());
    let mut packets = 0u64;

    loop {
        match link.inbox.get(Duration::from_millis(100), 0) {
            Ok((msg, _)) => match &*msg {
                Message::DemuxerPacket { packet, drop } => {
                    packets += 1;
                    link.status.set_stalled(false);
                    if !*drop {
                        sink.on_data(packet);
                    }
                }
                Message::GeneralFlush { .. } | Message::GeneralReset => sink.flush(),
                Message::GeneralSynchronize(barrier) => {
                    // 不在同步参与方之列，只按 ANY 到达
                    if !barrier.wait(Duration::from_millis(100), SyncSources::ANY) {
                        link.requeue(msg.clone(), 1, false);
                    }
                }
                other => debug!("{} 📟 {} 阶段忽略消息 {:?}", log_ctx(), kind.as_str(), other.kind()),
            },
            Err(QueueError::Timeout) => link.status.set_stalled(true),
            Err(QueueError::Abort) | Err(QueueError::NotInitialized) => break,
            Err(e) => warn!("{} ⚠ {} 阶段取消息失败: {}", log_ctx(), kind.as_str(), e),
        }
    }

    info!("{} 📟 {} 阶段退出（{} 个包）", log_ctx(), kind.as_str(), packets);
}
