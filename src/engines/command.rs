//! Engine wrapping an external OCR program.
//!
//! The program is called as `<program> <args...> <input-file>`, where
//! `<input-file>` is the document written to a temporary file. Any argument
//! equal to `{input}` is replaced by the input path instead of appending it.
//! It must print an [`EngineOutput`] as JSON on standard output.

use std::{fs::File, io::Write as _};

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

use super::{EngineError, EngineOutput, OcrEngine};

/// Placeholder for the input path in `args`.
const INPUT_PLACEHOLDER: &str = "{input}";

/// OCR engine wrapping a CLI tool.
pub struct CommandEngine {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    /// Create a new command engine.
    pub fn new(name: String, program: String, args: Vec<String>) -> Result<Self> {
        if program.trim().is_empty() {
            return Err(anyhow!("engine {name:?} has an empty `program`"));
        }
        Ok(Self {
            name,
            program,
            args,
        })
    }

    /// Build the argument list for an input path.
    fn command_args(&self, input_path: &Path) -> Vec<String> {
        let input = input_path.to_string_lossy().into_owned();
        let mut args = self
            .args
            .iter()
            .map(|arg| {
                if arg == INPUT_PLACEHOLDER {
                    input.clone()
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>();
        if !self.args.iter().any(|arg| arg == INPUT_PLACEHOLDER) {
            args.push(input);
        }
        args
    }
}

#[async_trait]
impl OcrEngine for CommandEngine {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.name, mime_type = %mime_type))]
    async fn process(
        &self,
        content: &[u8],
        mime_type: &str,
    ) -> Result<EngineOutput, EngineError> {
        let extension = mime_guess::get_mime_extensions_str(mime_type)
            .and_then(|o| o.first())
            .copied()
            .unwrap_or("bin");

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("invoice-engine")
            .map_err(EngineError::failed)?;
        let input_path = tmpdir.path().join(format!("input.{extension}"));
        let mut input_file = File::create(&input_path)
            .context("cannot create engine input file")
            .map_err(EngineError::failed)?;
        input_file
            .write_all(content)
            .and_then(|()| input_file.flush())
            .context("cannot write engine input file")
            .map_err(EngineError::failed)?;

        // Run the engine, holding a CPU permit since OCR programs tend to
        // saturate a core.
        let args = self.command_args(&input_path);
        let output = with_cpu_semaphore(|| async {
            Command::new(&self.program)
                .args(&args)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("cannot run {}", self.program))
        })
        .await
        .map_err(|err| EngineError::Unavailable(format!("{err:#}")))?;
        check_for_command_failure(&self.program, &output, None)
            .map_err(EngineError::failed)?;

        serde_json::from_slice::<EngineOutput>(&output.stdout)
            .map_err(|err| EngineError::InvalidOutput(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_path_is_appended_or_substituted() {
        let engine = CommandEngine::new(
            "t".into(),
            "ocr-wrapper".into(),
            vec!["--json".into()],
        )
        .unwrap();
        assert_eq!(
            engine.command_args(Path::new("/tmp/in.png")),
            vec!["--json".to_owned(), "/tmp/in.png".to_owned()]
        );

        let engine = CommandEngine::new(
            "t".into(),
            "ocr-wrapper".into(),
            vec!["-i".into(), "{input}".into(), "--json".into()],
        )
        .unwrap();
        assert_eq!(
            engine.command_args(Path::new("/tmp/in.png")),
            vec!["-i".to_owned(), "/tmp/in.png".to_owned(), "--json".to_owned()]
        );
    }

    #[test]
    fn empty_program_is_rejected() {
        assert!(CommandEngine::new("t".into(), " ".into(), vec![]).is_err());
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let engine = CommandEngine::new(
            "t".into(),
            "/nonexistent/invoice-ocr-engine".into(),
            vec![],
        )
        .unwrap();
        let err = engine.process(b"data", "image/png").await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)), "{err:?}");
    }
}
