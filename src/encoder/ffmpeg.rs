//! ffmpeg-backed encoder session
//!
//! Frames are written as rawvideo to the child's stdin. Closing stdin lets
//! ffmpeg flush and finalize the container.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{EncoderError, EncoderParams, EncoderSink};

/// Builds the ffmpeg argument list for a rawvideo-over-stdin session
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    params: EncoderParams,
    preset: Option<String>,
}

impl FfmpegCommandBuilder {
    pub fn new(params: EncoderParams) -> Self {
        Self {
            params,
            preset: None,
        }
    }

    /// x264/x265 speed preset
    pub fn with_preset(mut self, preset: Option<String>) -> Self {
        self.preset = preset;
        self
    }

    pub fn params(&self) -> &EncoderParams {
        &self.params
    }

    pub fn build(&self) -> Vec<String> {
        let p = &self.params;
        let mut args = strings(&["-hide_banner", "-loglevel", "error", "-y"]);
        args.extend(strings(&["-f", "rawvideo", "-pix_fmt", p.pixel_format.ffmpeg_name()]));
        args.push("-s".to_string());
        args.push(format!("{}x{}", p.width, p.height));
        if let Some(rate) = p.frame_rate {
            args.push("-framerate".to_string());
            args.push(rate.to_string());
        }
        // Frames are stamped when they arrive, so late or uncapped frames keep real time
        args.extend(strings(&["-use_wallclock_as_timestamps", "1", "-i", "pipe:0"]));

        if let Some(audio) = &p.audio {
            args.extend(strings(&["-f", &audio.input_format]));
            args.push("-ar".to_string());
            args.push(audio.sample_rate.to_string());
            args.extend(strings(&["-i", &audio.device]));
        }

        if !p.filters.is_empty() {
            args.push("-vf".to_string());
            args.push(p.filters.join(","));
        }

        args.extend(strings(&["-c:v", &p.codec]));
        args.push("-b:v".to_string());
        args.push(p.video_bitrate.to_string());
        if let Some(preset) = &self.preset {
            args.extend(strings(&["-preset", preset]));
        }
        match p.frame_rate {
            Some(rate) => {
                args.extend(strings(&["-fps_mode", "cfr", "-r"]));
                args.push(rate.to_string());
            }
            None => args.extend(strings(&["-fps_mode", "vfr"])),
        }
        args.extend(strings(&["-pix_fmt", "yuv420p"]));

        if let Some(audio) = &p.audio {
            // The microphone never ends on its own; stop with the video stream
            args.extend(strings(&["-c:a", "aac", "-ar"]));
            args.push(audio.sample_rate.to_string());
            args.push("-shortest".to_string());
        }

        args.push(p.output_path.to_string_lossy().into_owned());
        args
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Check whether the encoder binary can be executed
pub fn is_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// An ffmpeg child process fed through its stdin
pub struct FfmpegSession {
    program: PathBuf,
    args: Vec<String>,
    frame_size: usize,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl FfmpegSession {
    pub fn new(program: impl Into<PathBuf>, builder: &FfmpegCommandBuilder) -> Self {
        Self::with_args(program, builder.build(), builder.params().frame_size())
    }

    pub(crate) fn with_args(program: impl Into<PathBuf>, args: Vec<String>, frame_size: usize) -> Self {
        Self {
            program: program.into(),
            args,
            frame_size,
            child: None,
            stdin: None,
        }
    }
}

impl EncoderSink for FfmpegSession {
    fn start(&mut self) -> Result<(), EncoderError> {
        if self.child.is_some() {
            debug!("Encoder already started");
            return Ok(());
        }

        info!("Starting encoder: {:?} {}", self.program, self.args.join(" "));
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        self.stdin = child.stdin.take();
        self.child = Some(child);
        Ok(())
    }

    fn queue_frame(&mut self, data: &[u8], pts: Duration) -> Result<(), EncoderError> {
        // rawvideo carries no timestamps; ffmpeg stamps each frame on arrival
        if data.len() != self.frame_size {
            return Err(EncoderError::FrameSize {
                expected: self.frame_size,
                actual: data.len(),
            });
        }

        let stdin = self.stdin.as_mut().ok_or(EncoderError::NotStarted)?;
        trace!("Queueing frame at {:?}", pts);
        stdin.write_all(data).map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe => EncoderError::BrokenPipe,
            _ => EncoderError::Io(e),
        })
    }

    fn finish(&mut self) -> Result<(), EncoderError> {
        // EOF on stdin tells ffmpeg to flush and write the trailer
        drop(self.stdin.take());

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let status = child.wait()?;
        if status.success() {
            info!("Encoder finished");
            Ok(())
        } else {
            Err(EncoderError::Failed(status.to_string()))
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            warn!("Encoder session dropped without finish, killing ffmpeg");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
