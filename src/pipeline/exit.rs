//! Reserved process exit codes
//!
//! The controlling process interprets these values, so they are a fixed
//! contract and must not be renumbered.

pub const SUCCESS: i32 = 0;
/// stdin closed before the output path arrived
pub const CANCELLED: i32 = 200;
pub const DISPLAY_CONNECTION_FAILED: i32 = 201;
pub const CAPTURE_SURFACE_FAILED: i32 = 202;
pub const ENCODER_SESSION_FAILED: i32 = 203;
pub const RENDER_FAILED: i32 = 204;
pub const COMMAND_LISTENER_FAILED: i32 = 216;
/// No in-process encoder requested and no external encoder available
pub const UNSUPPORTED_ENCODER: i32 = 217;
pub const MISSING_ROTATION: i32 = 219;
pub const MISSING_AUDIO_SOURCE: i32 = 221;
/// stdout or the encoder pipe was closed under us
pub const BROKEN_PIPE: i32 = 222;
/// SIGINT / SIGTERM / SIGHUP
pub const TERMINATED: i32 = 223;
