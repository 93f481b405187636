//! Image preprocessing before OCR.
//!
//! We don't implement image filters ourselves. A [`Preprocessor`] is handed a
//! named [`PreprocessPreset`] and either passes the document through or calls
//! out to an external program which knows how to deskew, denoise, etc.

use std::{fmt, sync::Arc, time::Duration};

use schemars::JsonSchema;
use tokio::process::Command;

use crate::{
    async_utils::{DEFAULT_ERROR_REGEX, check_for_command_failure},
    config::PreprocessingConfig,
    cpu_limit::with_cpu_semaphore,
    errors::ProcessingError,
    prelude::*,
};

/// Named preprocessing configurations, tried in [`PreprocessPreset::ORDER`]
/// on successive retries.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessPreset {
    /// Deskew, denoise and enhance contrast.
    Standard,
    /// Deskew and sharpen.
    Sharpen,
    /// Denoise and reduce blur.
    BlurReduction,
    /// As little work as possible. Used after timeouts.
    Minimal,
}

impl PreprocessPreset {
    /// The order in which presets are tried.
    pub const ORDER: [PreprocessPreset; 4] = [
        PreprocessPreset::Standard,
        PreprocessPreset::Sharpen,
        PreprocessPreset::BlurReduction,
        PreprocessPreset::Minimal,
    ];

    /// Image operations making up this preset.
    pub fn operations(self) -> &'static [&'static str] {
        match self {
            PreprocessPreset::Standard => &["deskew", "denoise", "enhance_contrast"],
            PreprocessPreset::Sharpen => &["deskew", "sharpen"],
            PreprocessPreset::BlurReduction => &["denoise", "blur_reduction"],
            PreprocessPreset::Minimal => &["minimal"],
        }
    }

    /// The preset to try after `current`, or the first one if we haven't
    /// tried any. `None` once the list is exhausted.
    pub fn next_after(current: Option<PreprocessPreset>) -> Option<PreprocessPreset> {
        match current {
            None => Some(Self::ORDER[0]),
            Some(current) => Self::ORDER
                .iter()
                .position(|p| *p == current)
                .and_then(|idx| Self::ORDER.get(idx + 1))
                .copied(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            PreprocessPreset::Standard => "standard",
            PreprocessPreset::Sharpen => "sharpen",
            PreprocessPreset::BlurReduction => "blur_reduction",
            PreprocessPreset::Minimal => "minimal",
        }
    }
}

impl fmt::Display for PreprocessPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interface to an image preprocessor.
#[async_trait]
pub trait Preprocessor: Send + Sync + 'static {
    /// Apply `preset` to a document, returning the new content.
    async fn preprocess(
        &self,
        content: Arc<[u8]>,
        mime_type: &str,
        preset: PreprocessPreset,
    ) -> Result<Arc<[u8]>, ProcessingError>;
}

/// Returns documents unchanged.
pub struct PassthroughPreprocessor;

#[async_trait]
impl Preprocessor for PassthroughPreprocessor {
    async fn preprocess(
        &self,
        content: Arc<[u8]>,
        _mime_type: &str,
        preset: PreprocessPreset,
    ) -> Result<Arc<[u8]>, ProcessingError> {
        trace!(%preset, "Passing document through unchanged");
        Ok(content)
    }
}

/// Runs an external image tool.
///
/// `{input}` and `{output}` in the arguments become temporary file paths, and
/// `{ops}` becomes the preset's operations joined with commas. With no
/// arguments, the tool is called as `<program> <ops> <input> <output>`.
pub struct CommandPreprocessor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPreprocessor {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        let args = if args.is_empty() {
            vec!["{ops}".to_owned(), "{input}".to_owned(), "{output}".to_owned()]
        } else {
            args
        };
        Self {
            program,
            args,
            timeout,
        }
    }

    fn command_args(&self, input: &Path, output: &Path, preset: PreprocessPreset) -> Vec<String> {
        let ops = preset.operations().join(",");
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
                    .replace("{ops}", &ops)
            })
            .collect()
    }

    async fn run(
        &self,
        content: &[u8],
        mime_type: &str,
        preset: PreprocessPreset,
    ) -> Result<Vec<u8>> {
        let extension = mime_guess::get_mime_extensions_str(mime_type)
            .and_then(|o| o.first())
            .copied()
            .unwrap_or("bin");
        let tmpdir = tempfile::TempDir::with_prefix("invoice-preprocess")?;
        let input_path = tmpdir.path().join(format!("input.{extension}"));
        let output_path = tmpdir.path().join(format!("output.{extension}"));
        tokio::fs::write(&input_path, content)
            .await
            .context("cannot write preprocessor input")?;

        let args = self.command_args(&input_path, &output_path, preset);
        let output = with_cpu_semaphore(|| async {
            tokio::time::timeout(
                self.timeout,
                Command::new(&self.program).args(&args).kill_on_drop(true).output(),
            )
            .await
            .with_context(|| format!("{} timed out after {:?}", self.program, self.timeout))?
            .with_context(|| format!("cannot run {}", self.program))
        })
        .await?;
        check_for_command_failure(&self.program, &output, Some(&DEFAULT_ERROR_REGEX))?;

        tokio::fs::read(&output_path)
            .await
            .with_context(|| format!("{} did not write its output file", self.program))
    }
}

#[async_trait]
impl Preprocessor for CommandPreprocessor {
    #[instrument(level = "debug", skip_all, fields(program = %self.program, %preset))]
    async fn preprocess(
        &self,
        content: Arc<[u8]>,
        mime_type: &str,
        preset: PreprocessPreset,
    ) -> Result<Arc<[u8]>, ProcessingError> {
        match self.run(&content, mime_type, preset).await {
            Ok(bytes) if bytes.is_empty() => Err(ProcessingError::Preprocessing(format!(
                "preprocessing with {preset} produced an empty image"
            ))),
            Ok(bytes) => Ok(Arc::from(bytes)),
            Err(err) => Err(ProcessingError::Preprocessing(format!(
                "preprocessing with {preset} failed: {err:#}"
            ))),
        }
    }
}

/// Build the configured preprocessor.
pub fn preprocessor_for_config(config: &PreprocessingConfig) -> Arc<dyn Preprocessor> {
    match &config.program {
        Some(program) => Arc::new(CommandPreprocessor::new(
            program.clone(),
            config.args.clone(),
            Duration::from_secs_f64(config.timeout_secs.max(0.0)),
        )),
        None => Arc::new(PassthroughPreprocessor),
    }
}
