//! Post-processing of stored captures.
//!
//! After a session's file is closed the collector may hand its path to a
//! [`Transcoder`]. The only implementation shipped here runs an external
//! command (ffmpeg by default) and reports a launch failure or a nonzero
//! exit as [`CamError::TranscodeInvocation`].

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::CamError;

/// Placeholder replaced by the stored capture path.
pub const INPUT_PLACEHOLDER: &str = "{input}";
/// Placeholder replaced by the derived artifact path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Converts a stored capture into another artifact.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input`; returns the path of the produced artifact.
    async fn convert(&self, input: &Path) -> Result<PathBuf, CamError>;
}

/// Replace the extension of `input` with `extension`.
///
/// A path without an extension is an error rather than a guess.
pub fn derive_output_path(input: &Path, extension: &str) -> Result<PathBuf, CamError> {
    if input.extension().is_none() {
        return Err(CamError::TranscodeInvocation(format!(
            "{} has no extension to replace",
            input.display()
        )));
    }
    Ok(input.with_extension(extension))
}

// ── CommandTranscoder ────────────────────────────────────────────

/// Runs an external program with `{input}` / `{output}` substituted in
/// its arguments.
#[derive(Debug, Clone)]
pub struct CommandTranscoder {
    program: String,
    args: Vec<String>,
    extension: String,
}

impl CommandTranscoder {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            extension: extension.into(),
        }
    }

    /// `ffmpeg -y -i {input} -c:v libx264 -preset fast -crf 23 {output}`, to `.mp4`.
    pub fn ffmpeg() -> Self {
        Self::new("ffmpeg", Self::ffmpeg_args(), "mp4")
    }

    pub fn ffmpeg_args() -> Vec<String> {
        [
            "-hide_banner", "-loglevel", "error", "-y", "-i", INPUT_PLACEHOLDER, "-c:v",
            "libx264", "-preset", "fast", "-crf", "23", OUTPUT_PLACEHOLDER,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn resolve_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(INPUT_PLACEHOLDER, &input)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }
}

#[async_trait]
impl Transcoder for CommandTranscoder {
    async fn convert(&self, input: &Path) -> Result<PathBuf, CamError> {
        let output = derive_output_path(input, &self.extension)?;
        let args = self.resolve_args(input, &output);
        debug!(program = %self.program, ?args, "starting transcoder");

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                CamError::TranscodeInvocation(format!("cannot launch {}: {e}", self.program))
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr.lines().last().unwrap_or("").trim();
            return Err(CamError::TranscodeInvocation(format!(
                "{} exited with {}: {detail}",
                self.program, result.status
            )));
        }

        info!("transcoded {} -> {}", input.display(), output.display());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_swaps_extension() {
        let out = derive_output_path(Path::new("/tmp/cam_640_480_3.mjpeg"), "mp4").unwrap();
        assert_eq!(out, PathBuf::from("/tmp/cam_640_480_3.mp4"));
    }

    #[test]
    fn missing_extension_is_an_error() {
        let err = derive_output_path(Path::new("/tmp/capture"), "mp4").unwrap_err();
        assert!(matches!(err, CamError::TranscodeInvocation(_)));
    }

    #[test]
    fn placeholders_are_substituted() {
        let t = CommandTranscoder::ffmpeg();
        let args = t.resolve_args(Path::new("a.mjpeg"), Path::new("a.mp4"));
        assert!(args.contains(&"a.mjpeg".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("a.mp4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_and_returns_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cap.mjpeg");
        std::fs::write(&input, b"\xFF\xD8data").unwrap();

        let t = CommandTranscoder::new("cp", [INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER], "bin");
        let out = t.convert(&input).await.unwrap();
        assert_eq!(out, dir.path().join("cap.bin"));
        assert_eq!(std::fs::read(out).unwrap(), b"\xFF\xD8data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let t = CommandTranscoder::new("false", Vec::<String>::new(), "mp4");
        let err = t.convert(Path::new("x.mjpeg")).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let t = CommandTranscoder::new("camstream-no-such-transcoder", Vec::<String>::new(), "mp4");
        let err = t.convert(Path::new("x.mjpeg")).await.unwrap_err();
        assert!(err.to_string().contains("cannot launch"));
    }
}
