// 播放器核心模块

pub mod message;
pub mod message_queue;
pub mod overlay;
pub mod pts_tracker;
pub mod sync_error;
pub mod event;
pub mod context;
pub mod stage;

pub mod decoder;
pub mod demuxer_source;
pub mod audio_sink;
pub mod video_renderer;
pub mod synthetic;

pub mod audio_stage;
pub mod video_stage;
pub mod subtitle_stage;
pub mod ancillary_stage;
pub mod demuxer_thread;
pub mod external_subtitle;
pub mod manager;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_demuxer;
#[cfg(feature = "cpal")]
pub mod cpal_sink;

pub use message::{Message, MessageKind, SyncSources, SynchronizeBarrier};
pub use message_queue::{MessageQueue, QueueError};
pub use overlay::{Overlay, OverlayContainer, OverlayContent, OverlayKind};
pub use pts_tracker::PtsTracker;
pub use event::PlayerEvent;
pub use context::{OutputFactory, PlayerContext};
pub use decoder::{AudioDecoder, DecoderFactory, SubtitleDecoder, VideoDecoder};
pub use demuxer_source::{AncillarySink, DemuxerSource, InputNavigator, ReadOutcome};
pub use audio_sink::{AudioSink, VirtualAudioSink};
pub use video_renderer::{VideoRenderer, VirtualVideoRenderer};
pub use synthetic::{SyntheticConfig, SyntheticCue, SyntheticDecoderFactory, SyntheticDemuxer, VirtualOutputs};
pub use demuxer_thread::DemuxerThread;
pub use external_subtitle::{ExternalSubtitleParser, SubtitleCue};
pub use manager::PlaybackManager;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg_demuxer::FfmpegDemuxer;
#[cfg(feature = "cpal")]
pub use cpal_sink::{CpalAudioSink, CpalOutputs};
