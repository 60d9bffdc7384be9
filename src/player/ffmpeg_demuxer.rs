use crate::core::{DemuxPacket, DemuxStream, PlayerError, Result, StreamHints, StreamKind, TIME_BASE};
use crate::player::demuxer_source::{DemuxerSource, ReadOutcome};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media, Rational};
use log::{debug, info};
use std::collections::HashMap;

/// 基于 FFmpeg 的容器解复用器
pub struct FfmpegDemuxer {
    input_ctx: format::context::Input,
    streams: Vec<DemuxStream>,
    time_bases: HashMap<usize, Rational>,
    source_path: String,
    is_network: bool,
    packets: u64,
}

impl FfmpegDemuxer {
    /// 打开媒体文件或网络流
    pub fn open(path: &str) -> Result<Self> {
        info!("正在打开文件: {}", path);
        ffmpeg::init()?;

        let is_network = path.starts_with("http://")
            || path.starts_with("https://")
            || path.starts_with("rtsp://")
            || path.starts_with("rtmp://")
            || path.contains(".m3u8");

        let input_ctx = if is_network {
            info!("🌐 检测到网络流，应用网络选项");
            let mut options = ffmpeg::Dictionary::new();
            options.set("fflags", "+discardcorrupt+genpts");
            options.set("analyzeduration", "5000000");
            options.set("probesize", "10000000");
            options.set("timeout", "15000000");
            options.set("rw_timeout", "8000000");
            options.set("reconnect", "1");
            options.set("reconnect_streamed", "1");
            options.set("reconnect_delay_max", "4");
            format::input_with_dictionary(&path, options)
                .map_err(|e| PlayerError::DemuxError(format!("无法打开网络流: {}", e)))?
        } else {
            format::input(&path).map_err(|e| PlayerError::DemuxError(format!("无法打开文件: {}", e)))?
        };

        let mut streams = Vec::new();
        let mut time_bases = HashMap::new();
        for stream in input_ctx.streams() {
            let Some(hints) = Self::stream_hints(&stream)? else {
                debug!("跳过流 #{}（{:?}）", stream.index(), stream.parameters().medium());
                continue;
            };
            debug!("流 #{}: {:?}", stream.index(), hints);
            time_bases.insert(stream.index(), stream.time_base());
            streams.push(DemuxStream {
                id: stream.index() as i32,
                demuxer_id: stream.id(),
                hints,
                language: stream.metadata().get("language").map(|l| l.to_string()),
                disabled: false,
            });
        }

        if streams.is_empty() {
            return Err(PlayerError::DemuxError(format!("{} 中没有可播放的流", path)));
        }

        Ok(Self {
            input_ctx,
            streams,
            time_bases,
            source_path: path.to_string(),
            is_network,
            packets: 0,
        })
    }

    /// 从编解码参数提取流参数
    fn stream_hints(stream: &format::stream::Stream) -> Result<Option<StreamHints>> {
        let parameters = stream.parameters();
        let codec_name = parameters.id().name().to_string();

        let hints = match parameters.medium() {
            media::Type::Video => {
                let context = ffmpeg::codec::context::Context::from_parameters(parameters)?;
                let video = context.decoder().video()?;
                let fps = stream.avg_frame_rate();
                let fps = if fps.denominator() != 0 {
                    fps.numerator() as f64 / fps.denominator() as f64
                } else {
                    0.0
                };
                StreamHints::video(&codec_name, video.width(), video.height(), fps)
            }
            media::Type::Audio => {
                let context = ffmpeg::codec::context::Context::from_parameters(parameters)?;
                let audio = context.decoder().audio()?;
                StreamHints::audio(&codec_name, audio.rate(), audio.channels())
            }
            media::Type::Subtitle => StreamHints::subtitle(&codec_name),
            media::Type::Data if codec_name.contains("id3") => StreamHints::data(StreamKind::Id3, &codec_name),
            _ => return Ok(None),
        };
        Ok(Some(hints))
    }

    fn to_time(&self, stream_index: usize, ts: Option<i64>) -> Option<f64> {
        let tb = self.time_bases.get(&stream_index)?;
        ts.map(|ts| ts as f64 * tb.numerator() as f64 / tb.denominator() as f64 * TIME_BASE)
    }
}

impl DemuxerSource for FfmpegDemuxer {
    fn read_packet(&mut self) -> Result<ReadOutcome> {
        loop {
            let Some((index, demuxer_id, packet)) = self
                .input_ctx
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), stream.id(), packet))
            else {
                return Ok(ReadOutcome::Eof);
            };
            if !self.time_bases.contains_key(&index) {
                continue;
            }

            self.packets += 1;
            let duration = (packet.duration() > 0).then(|| packet.duration());
            return Ok(ReadOutcome::Packet(DemuxPacket {
                data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
                pts: self.to_time(index, packet.pts()),
                dts: self.to_time(index, packet.dts()),
                duration: self.to_time(index, duration),
                stream_id: index as i32,
                demuxer_id,
                group_id: 0,
            }));
        }
    }

    fn streams(&self) -> Vec<DemuxStream> {
        self.streams.clone()
    }

    fn seek(&mut self, time_ms: i64, backward: bool) -> Result<()> {
        let timestamp = time_ms * 1000; // 毫秒转微秒
        if backward {
            self.input_ctx.seek(timestamp, ..timestamp)?;
        } else {
            self.input_ctx.seek(timestamp, timestamp..)?;
        }
        Ok(())
    }

    fn flush(&mut self) {
        debug!("FFmpeg 解复用器 flush（已读 {} 个包）", self.packets);
    }

    fn duration_ms(&self) -> i64 {
        (self.input_ctx.duration() / 1000).max(0)
    }

    fn has_read_cache(&self) -> bool {
        self.is_network
    }

    fn is_realtime(&self) -> bool {
        self.source_path.starts_with("rtsp://")
            || self.source_path.starts_with("rtmp://")
            || (self.is_network && self.input_ctx.duration() <= 0)
    }

    fn description(&self) -> String {
        format!("FFmpeg Demuxer: {}", self.source_path)
    }
}
