pub mod health;
pub mod image;
pub mod lockfile;
pub mod manifest;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod quality;
pub mod runner;
pub mod security;
pub mod stages;
pub mod validation;

pub use image::ImageDefinition;
pub use manifest::PipelineManifest;
pub use pipeline::{PipelineExecutor, RunOptions, RunReport, StageRegistry, build_pipeline};
pub use runner::{CommandRunner, RecordingRunner, SystemRunner};
