// src/core/media.rs

//! Thin wrapper around the external media tool (ffmpeg by default).
//!
//! The tool is opaque to the rest of the system: three operations (segment,
//! transcode, concat) run as child processes with captured stderr; a non-zero
//! exit surfaces the stderr tail as a `PrismError::MediaTool`.

use crate::core::errors::PrismError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum_macros::{Display, EnumString};
use tokio::process::Command;
use tracing::{debug, info};

/// How much captured stderr to surface in error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// Supported output containers.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl Container {
    /// Parses a container from a format name or file extension, defaulting to
    /// mp4 for anything unrecognized.
    pub fn from_ext(ext: &str) -> Self {
        ext.parse().unwrap_or_default()
    }

    pub fn video_codec(self) -> &'static str {
        match self {
            Container::Mp4 | Container::Mov | Container::Mkv => "libx264",
            Container::Webm => "libvpx-vp9",
        }
    }

    pub fn audio_codec(self) -> &'static str {
        match self {
            Container::Mp4 | Container::Mov | Container::Mkv => "aac",
            Container::Webm => "libvorbis",
        }
    }

    /// The muxer name the media tool expects for this container.
    pub fn muxer(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "matroska",
            Container::Webm => "webm",
            Container::Mov => "mov",
        }
    }
}

/// Handle to the media tool binary.
#[derive(Debug, Clone)]
pub struct MediaTool {
    binary: String,
}

impl MediaTool {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    /// Splits `input` into fixed-duration segments scaled to the upscale
    /// dimensions, writing files matching `output_pattern`. Keyframes are
    /// forced at segment boundaries so each segment stands alone.
    pub async fn segment(
        &self,
        input: &Path,
        output_pattern: &Path,
        upscale_width: u32,
        upscale_height: u32,
        container: Container,
        segment_secs: u32,
    ) -> Result<(), PrismError> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-vf".to_string(),
            format!("scale={upscale_width}:{upscale_height}"),
            "-f".to_string(),
            "segment".to_string(),
            "-segment_time".to_string(),
            segment_secs.to_string(),
            "-segment_format_options".to_string(),
            "fflags=+genpts".to_string(),
            "-reset_timestamps".to_string(),
            "1".to_string(),
            "-force_key_frames".to_string(),
            format!("expr:gte(t,n_forced*{segment_secs})"),
            "-c:v".to_string(),
            container.video_codec().to_string(),
            "-c:a".to_string(),
            container.audio_codec().to_string(),
        ];
        if container.video_codec() == "libx264" {
            args.push("-b:v".to_string());
            args.push("2M".to_string());
        }
        args.push(output_pattern.display().to_string());
        self.run(args).await
    }

    /// Rescales one shard to the target dimensions, keeping the container.
    pub async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target_width: u32,
        target_height: u32,
        container: Container,
    ) -> Result<(), PrismError> {
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-vf".to_string(),
            format!("scale={target_width}:{target_height}"),
            "-c:v".to_string(),
            container.video_codec().to_string(),
            "-c:a".to_string(),
            container.audio_codec().to_string(),
        ];
        if container.video_codec() == "libx264" {
            args.push("-preset".to_string());
            args.push("fast".to_string());
        }
        args.extend([
            "-fps_mode".to_string(),
            "passthrough".to_string(),
            "-f".to_string(),
            container.muxer().to_string(),
            output.display().to_string(),
        ]);
        self.run(args).await
    }

    /// Concatenates pre-encoded segments listed in `file_list` (demuxer-concat
    /// format) into `output` with stream copy.
    pub async fn concat(&self, file_list: &Path, output: &Path) -> Result<(), PrismError> {
        let args = vec![
            "-y".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-copytb".to_string(),
            "1".to_string(),
            "-i".to_string(),
            file_list.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.display().to_string(),
        ];
        self.run(args).await
    }

    async fn run(&self, args: Vec<String>) -> Result<(), PrismError> {
        debug!("Invoking {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PrismError::MediaTool(format!("failed to launch {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
            let tail = stderr.get(tail_start..).unwrap_or(&stderr);
            return Err(PrismError::MediaTool(format!(
                "{} exited with {}: {}",
                self.binary, output.status, tail
            )));
        }
        info!("{} finished: {}", self.binary, args.last().cloned().unwrap_or_default());
        Ok(())
    }
}
