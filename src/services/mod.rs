//! Services that keep I/O and reporting out of the pipeline logic

pub mod config_store;
pub mod format;
pub mod io;
pub mod progress;

pub use config_store::{ConfigStore, JsonConfigStore, MemoryConfigStore};
pub use format::JpgExporter;
pub use io::{collect_inputs, ArtifactKind, ArtifactNaming, ImageIOService};
pub use progress::{
    BatchSummary, ChannelProgressReporter, ConsoleProgressReporter, NoOpProgressReporter,
    PipelineStage, ProgressEvent, ProgressReporter, ProgressTracker, ProgressUpdate,
};
