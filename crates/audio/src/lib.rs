//! sonance-audio – Echtzeit-Duplex-Audio-Engine
//!
//! Bewegt PCM-Frames fester Groesse von einer Quelle (Aufnahmegeraet, Datei,
//! Socket) ueber optionale Transformationen in eine Senke:
//! - Begrenzter Frame-Puffer mit Gegendruck
//! - Pause/Resume an der Lese-Grenze
//! - Geordnetes Beenden (Puffer leeren, Senke schliessen, Quelle freigeben)
//! - Lautstaerke-Messung und periodische Statistik ohne Einfluss auf den Datenpfad
//! - Geraete-Anbindung ueber cpal (Feature `cpal-backend`), Opus (Feature `opus`)

pub mod buffer;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod format;
pub mod frame;
pub mod metering;
pub mod observer;
pub mod pipeline;
pub mod stats;
pub mod transform;

// Bequeme Re-Exporte der wichtigsten Typen
pub use buffer::{FrameBuffer, FrameConsumer, FrameProducer, PopError, PushError};
pub use device::{
    DeviceBackend, DeviceCatalog, DeviceDriver, DeviceInfo, Direction, StreamParams,
};
pub use endpoint::{
    DeviceSink, DeviceSource, EndpointCounters, FileSink, FileSource, FrameSink, FrameSource,
    ReadOutcome, SocketSink, SocketSource,
};
pub use error::{AudioError, AudioResult};
pub use format::{AudioFormat, SampleFormat, StreamFormat};
pub use frame::Frame;
pub use metering::{LoudnessSample, MeteringStage, MAX_LEVEL};
pub use observer::{LogDisplay, ObserverHub, PipelineDisplay};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineConfig, PipelineEvent, PipelineOutcome, PipelineState,
    RetryPolicy,
};
pub use stats::{StatsCounters, StatsSnapshot};
pub use transform::{ChannelRemix, FormatConversion, Passthrough, TransformChain, TransformStage};
