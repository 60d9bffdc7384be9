use crate::core::{DemuxPacket, StreamHints, TIME_BASE};
use crate::player::context::PlayerContext;
use crate::player::decoder::SubtitleDecoder;
use crate::player::message::{Message, SyncSources};
use crate::player::message_queue::QueueError;
use crate::player::stage::{log_ctx, should_log, StageLink};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// 过期叠加层的清理间隔（绝对时间）
const CLEANUP_INTERVAL: f64 = TIME_BASE;

/// 字幕阶段线程入口：数据包解码为叠加层后放入共享容器，由视频阶段按时间取用
pub fn subtitle_stage_task(ctx: PlayerContext, hints: StreamHints, mut decoder: Box<dyn SubtitleDecoder>, link: StageLink) {
    info!("{} 💬 字幕阶段启动: codec={} 解码器={}", log_ctx(), hints.codec, decoder.name());

    let mut packets = 0u64;
    let mut last_cleanup = ctx.clock.get_absolute_clock(false);

    loop {
        match link.inbox.get(Duration::from_millis(100), 0) {
            Ok((msg, _)) => match &*msg {
                Message::DemuxerPacket { packet, drop } => {
                    packets += 1;
                    link.status.set_stalled(false);
                    if !*drop {
                        decode_packet(&ctx, decoder.as_mut(), packet, packets);
                    }
                }
                Message::GeneralSynchronize(barrier) => {
                    if !barrier.wait(Duration::from_millis(100), SyncSources::SUBTITLE) {
                        link.requeue(msg.clone(), 1, false);
                    }
                }
                Message::GeneralFlush { .. } | Message::GeneralReset => {
                    debug!("{} 💬 清空字幕解码器与叠加层", log_ctx());
                    decoder.reset();
                    ctx.reset_overlays();
                }
                Message::GeneralDelay(delay) => link.sleep(*delay),
                Message::GeneralEof => debug!("{} 💬 GENERAL_EOF", log_ctx()),
                other => debug!("{} 💬 字幕阶段忽略消息 {:?}", log_ctx(), other.kind()),
            },
            Err(QueueError::Timeout) => {
                if link.inbox.is_empty() {
                    link.status.set_stalled(true);
                }
            }
            Err(QueueError::Abort) | Err(QueueError::NotInitialized) => break,
            Err(e) => warn!("{} ⚠ 字幕阶段取消息失败: {}", log_ctx(), e),
        }

        let now = ctx.clock.get_absolute_clock(false);
        if now - last_cleanup >= CLEANUP_INTERVAL {
            ctx.overlays.clean_up(ctx.clock.get_clock(false));
            last_cleanup = now;
        }
    }

    info!("{} 💬 字幕阶段退出（{} 个包）", log_ctx(), packets);
}

fn decode_packet(ctx: &PlayerContext, decoder: &mut dyn SubtitleDecoder, packet: &DemuxPacket, count: u64) {
    let overlays = decoder.decode(packet);
    if should_log(count) {
        debug!("{} 💬 字幕包 #{} pts={:?} → {} 个叠加层", log_ctx(), count, packet.pts, overlays.len());
    }
    for overlay in overlays {
        ctx.overlays.add(Arc::new(overlay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlaybackClock, PlayerSettings};
    use crate::player::message_queue::MessageQueue;
    use crate::player::stage::{StageHandle, StageStatus};
    use crate::player::synthetic::{SyntheticDecoderFactory, VirtualOutputs};
    use crate::player::decoder::DecoderFactory;
    use std::thread;

    #[test]
    fn test_packets_become_overlays_and_flush_clears() {
        let settings = PlayerSettings::default();
        let clock = PlaybackClock::with_monotonic();
        let outputs = Arc::new(VirtualOutputs::new(clock.clone(), &settings));
        let factory = Arc::new(SyntheticDecoderFactory::default());
        let ctx = PlayerContext::new(clock, settings, factory.clone(), outputs);

        let parent = Arc::new(MessageQueue::new("parent"));
        parent.init();
        let link = StageLink {
            inbox: Arc::new(MessageQueue::new("subtitle")),
            parent,
            status: Arc::new(StageStatus::default()),
        };

        let hints = StreamHints::subtitle("text");
        let decoder = factory.create_subtitle(&hints).unwrap();
        let task_ctx = ctx.clone();
        let mut handle =
            StageHandle::spawn(link, move |link| subtitle_stage_task(task_ctx, hints, decoder, link)).unwrap();

        let packet = DemuxPacket {
            data: "你好".as_bytes().to_vec(),
            pts: Some(0.0),
            duration: Some(2_000_000.0),
            ..Default::default()
        };
        handle.send_arc(Message::packet(packet, false), 0).unwrap();
        handle.queue().wait_until_empty();
        assert_eq!(ctx.overlays.len(), 1);

        handle.flush(true);
        for _ in 0..50 {
            if ctx.overlays.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(ctx.overlays.is_empty());
        handle.close(false);
    }
}
