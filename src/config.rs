//! Daemon settings for screenrec
//!
//! The per-recording parameters arrive on stdin (see [`crate::pipeline::PipelineConfig`]).
//! This file covers the host-level knobs that stay the same across recordings:
//! where the encoder binary lives, which framebuffer device to read and which
//! audio device feeds the microphone track.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the settings file location
const CONFIG_PATH_ENV: &str = "SCREENREC_CONFIG";

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Encoder configuration
    #[serde(default)]
    pub encoder: EncoderSettings,

    /// Capture configuration
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Audio configuration
    #[serde(default)]
    pub audio: AudioSettings,

    /// Path the settings were loaded from (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Path (or bare name looked up in PATH) of the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Codec used when the controller asks for the default encoder
    #[serde(default = "default_video_codec")]
    pub default_codec: String,

    /// x264/x265 preset for the external-process encoder
    #[serde(default = "default_preset")]
    pub preset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Framebuffer device to read frames from
    #[serde(default = "default_framebuffer_device")]
    pub framebuffer_device: PathBuf,

    /// sysfs directory describing the framebuffer geometry
    #[serde(default = "default_framebuffer_sysfs")]
    pub framebuffer_sysfs: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// ffmpeg input format for the microphone (alsa, pulse, ...)
    #[serde(default = "default_audio_input_format")]
    pub input_format: String,

    /// Device name handed to the audio input format
    #[serde(default = "default_audio_device")]
    pub device: String,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_framebuffer_device() -> PathBuf {
    // Android exposes the framebuffer under /dev/graphics, desktop Linux under /dev
    let android = PathBuf::from("/dev/graphics/fb0");
    if android.exists() {
        android
    } else {
        PathBuf::from("/dev/fb0")
    }
}

fn default_framebuffer_sysfs() -> PathBuf {
    PathBuf::from("/sys/class/graphics/fb0")
}

fn default_audio_input_format() -> String {
    "alsa".to_string()
}

fn default_audio_device() -> String {
    "default".to_string()
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            default_codec: default_video_codec(),
            preset: default_preset(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            framebuffer_device: default_framebuffer_device(),
            framebuffer_sysfs: default_framebuffer_sysfs(),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_format: default_audio_input_format(),
            device: default_audio_device(),
        }
    }
}

impl Settings {
    /// Load settings from the default location, falling back to defaults.
    ///
    /// The daemon runs privileged and never writes this file; a missing file
    /// simply means "use the defaults".
    pub fn load() -> Result<Self> {
        let Some(config_path) = Self::default_config_path() else {
            return Ok(Self::default());
        };

        if config_path.exists() {
            Self::load_from(config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read settings file: {:?}", config_path))?;

        let mut settings: Settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file: {:?}", config_path))?;

        settings.config_path = Some(config_path);
        Ok(settings)
    }

    /// Path the settings were loaded from, if any
    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    fn default_config_path() -> Option<PathBuf> {
        if let Ok(override_path) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(override_path));
        }

        directories::ProjectDirs::from("dev", "screenrec", "screenrec")
            .map(|dirs| dirs.config_dir().join("settings.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[encoder]\nffmpeg_path = \"/opt/bin/ffmpeg\"").unwrap();

        let settings = Settings::load_from(file.path().to_path_buf()).unwrap();
        assert_eq!(settings.encoder.ffmpeg_path, PathBuf::from("/opt/bin/ffmpeg"));
        assert_eq!(settings.encoder.default_codec, "libx264");
        assert_eq!(settings.audio.device, "default");
        assert_eq!(settings.config_path(), Some(&file.path().to_path_buf()));
    }

    #[test]
    fn test_malformed_settings_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[encoder\nffmpeg_path = 3").unwrap();

        assert!(Settings::load_from(file.path().to_path_buf()).is_err());
    }
}
