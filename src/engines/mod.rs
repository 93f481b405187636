//! OCR engine interface.
//!
//! Each concrete engine is a black box which takes document bytes and returns
//! invoice fields plus the raw text blocks it recognized. Engines are shared
//! between concurrent calls, so they must not keep per-call mutable state.

use std::{sync::Arc, time::Duration};

use schemars::JsonSchema;
use thiserror::Error;

use crate::{
    config::{EngineConfig, EngineKind},
    fields::{RawFields, TextBlock},
    prelude::*,
};

use self::{command::CommandEngine, replay::ReplayEngine, throttle::ThrottledEngine};

pub mod command;
pub mod replay;
pub mod throttle;

/// Errors reported by an engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine did not answer before its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The engine cannot be used right now.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The engine ran but failed.
    #[error("engine failed: {0}")]
    Failed(String),

    /// The engine returned something we can't interpret.
    #[error("invalid engine output: {0}")]
    InvalidOutput(String),
}

impl EngineError {
    /// Wrap any error as an engine failure, keeping its full chain.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Failed(format!("{:#}", err.into()))
    }
}

/// What an engine gives us for one document.
///
/// This is also the JSON protocol spoken by external `command` engines.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct EngineOutput {
    /// Extracted invoice fields, keyed by field name.
    #[serde(default)]
    pub fields: RawFields,

    /// Recognized text blocks, in the engine's reading order.
    #[serde(default)]
    pub blocks: Vec<TextBlock>,

    /// The engine's own overall confidence, if it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Engine-specific details. `page_width` and `page_height`, when present,
    /// are used for layout scoring.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl EngineOutput {
    /// Page size from metadata, if the engine reported one.
    pub fn page_size(&self) -> Option<(f64, f64)> {
        let width = self.metadata.get("page_width")?.as_f64()?;
        let height = self.metadata.get("page_height")?.as_f64()?;
        Some((width, height))
    }
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// A stable name, used for weights, logging and engine switching.
    fn name(&self) -> &str;

    /// Can this engine be called at all right now?
    fn is_available(&self) -> bool {
        true
    }

    /// Extract invoice data from a document.
    ///
    /// Callers apply deadlines from the outside, so implementations don't need
    /// their own timeouts, but they must tolerate being dropped mid-call.
    async fn process(&self, content: &[u8], mime_type: &str)
    -> Result<EngineOutput, EngineError>;
}

/// Build an engine from its configuration, wrapping it in a rate limiter if
/// one was requested.
pub fn engine_for_config(config: &EngineConfig) -> Result<Arc<dyn OcrEngine>> {
    let engine: Arc<dyn OcrEngine> = match &config.kind {
        EngineKind::Command { program, args } => Arc::new(CommandEngine::new(
            config.name.clone(),
            program.clone(),
            args.clone(),
        )?),
        EngineKind::Replay => Arc::new(ReplayEngine::new(config.name.clone())),
    };
    Ok(match &config.rate_limit {
        Some(rate_limit) => Arc::new(ThrottledEngine::new(engine, rate_limit)),
        None => engine,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engines for tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// What a [`ScriptedEngine`] should do when called.
    #[derive(Clone, Debug)]
    pub enum Script {
        Succeed(EngineOutput),
        Fail(String),
        Hang,
    }

    /// An engine which follows a script, one step per call, repeating the last.
    pub struct ScriptedEngine {
        name: String,
        steps: Vec<Script>,
        calls: AtomicUsize,
        available: bool,
    }

    impl ScriptedEngine {
        pub fn new(name: &str, steps: Vec<Script>) -> Self {
            Self {
                name: name.to_owned(),
                steps,
                calls: AtomicUsize::new(0),
                available: true,
            }
        }

        pub fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// Output with an engine-reported confidence and nothing else.
    pub fn output_with_confidence(confidence: f64) -> EngineOutput {
        EngineOutput {
            confidence: Some(confidence),
            ..EngineOutput::default()
        }
    }

    #[async_trait]
    impl OcrEngine for ScriptedEngine {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn process(
            &self,
            _content: &[u8],
            _mime_type: &str,
        ) -> Result<EngineOutput, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .steps
                .get(call)
                .or(self.steps.last())
                .cloned()
                .unwrap_or(Script::Fail("empty script".into()));
            match step {
                Script::Succeed(output) => Ok(output),
                Script::Fail(message) => Err(EngineError::Failed(message)),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(EngineError::Failed("woke up".into()))
                }
            }
        }
    }
}
