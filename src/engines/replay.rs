//! Replays recorded engine output.
//!
//! A recording is a JSON document which captured what several engines said
//! about one invoice:
//!
//! ```json
//! {
//!   "engines": {
//!     "tesseract": { "fields": { ... }, "blocks": [ ... ] },
//!     "paddle": { "error": "model crashed" },
//!     "easyocr": { "delay_ms": 60000 }
//!   }
//! }
//! ```
//!
//! Each replay engine picks out the entry matching its own name. This lets us
//! re-score and re-decide old captures offline, and gives the CLI something
//! deterministic to run against in tests.

use std::{collections::BTreeMap, time::Duration};

use schemars::JsonSchema;

use crate::prelude::*;

use super::{EngineError, EngineOutput, OcrEngine};

/// A document containing recorded engine output.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Recording {
    /// Recorded entries, by engine name.
    pub engines: BTreeMap<String, RecordedEntry>,
}

/// One engine's recorded behavior.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RecordedEntry {
    /// Wait this long before answering.
    #[serde(default)]
    pub delay_ms: Option<u64>,

    /// Fail with this message instead of returning output.
    #[serde(default)]
    pub error: Option<String>,

    /// The output to return.
    #[serde(flatten)]
    pub output: EngineOutput,
}

/// Engine which replays its entry from a [`Recording`].
pub struct ReplayEngine {
    name: String,
}

impl ReplayEngine {
    /// Create a replay engine which answers as `name`.
    pub fn new(name: String) -> Self {
        Self { name }
    }
}

#[async_trait]
impl OcrEngine for ReplayEngine {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.name))]
    async fn process(
        &self,
        content: &[u8],
        mime_type: &str,
    ) -> Result<EngineOutput, EngineError> {
        if mime_type != "application/json" {
            return Err(EngineError::InvalidOutput(format!(
                "replay engine needs an application/json recording, not {mime_type}"
            )));
        }
        let mut recording = serde_json::from_slice::<Recording>(content)
            .map_err(|err| EngineError::InvalidOutput(format!("bad recording: {err}")))?;
        let entry = recording.engines.remove(&self.name).ok_or_else(|| {
            EngineError::Unavailable(format!("no recording for {}", self.name))
        })?;

        if let Some(delay_ms) = entry.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        match entry.error {
            Some(message) => Err(EngineError::Failed(message)),
            None => Ok(entry.output),
        }
    }
}
