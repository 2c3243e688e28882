//! Capture/render/encode pipeline
//!
//! Configuration intake, the recording driver and the pieces it is built
//! from: frame pacing, the stop/shutdown controller, the command listener
//! and the status protocol.

mod command;
mod config;
pub mod exit;
mod lifecycle;
mod pacer;
mod recorder;
mod status;

pub use command::{CommandChannel, CommandError};
pub use config::{AudioSource, ColorFormat, EncoderKind, PipelineConfig, RenderStrategy, Rotation};
pub use lifecycle::{LifecycleController, StopOrigin};
pub use pacer::FramePacer;
pub use recorder::{DeviceFactory, Recorder};
pub use status::{StatusError, StatusWriter};
