//! The pipelines' LLM seam.
//!
//! Every pipeline call is schema-constrained: the subprocess is launched
//! with an output schema and its final result must deserialize into the
//! pipeline's output struct. Tests substitute a scripted implementation.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use cortex_agents::sdk::{SdkEvent, SdkLaunch, SdkSession};

use crate::error::{PipelineError, Result};

/// A structured-output LLM call.
#[async_trait]
pub trait PipelineLlm: Send + Sync {
    async fn structured(
        &self,
        model: &str,
        system_prompt: &str,
        prompt: &str,
        schema: Value,
        timeout_secs: u64,
    ) -> Result<Value>;
}

/// Production implementation over the SDK streaming subprocess.
pub struct SdkPipelineLlm {
    command: String,
}

impl SdkPipelineLlm {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl PipelineLlm for SdkPipelineLlm {
    async fn structured(
        &self,
        model: &str,
        system_prompt: &str,
        prompt: &str,
        schema: Value,
        timeout_secs: u64,
    ) -> Result<Value> {
        let launch = SdkLaunch {
            command: self.command.clone(),
            model: model.to_string(),
            system_prompt: Some(system_prompt.to_string()),
            // Pure extraction: no tools.
            allowed_tools: Vec::new(),
            max_turns: 2,
            output_format: Some(schema),
            thinking: None,
            cwd: None,
            prompt: prompt.to_string(),
        };

        let mut session =
            SdkSession::spawn(launch).map_err(|e| PipelineError::Llm(e.to_string()))?;

        let consume = async {
            let mut result: Option<String> = None;
            while let Some(event) = session.next_event().await {
                if let SdkEvent::ResultMeta {
                    result: r,
                    is_error,
                    ..
                } = event
                {
                    if is_error {
                        return Err(PipelineError::Llm(r));
                    }
                    result = Some(r);
                }
            }
            let raw = result.ok_or_else(|| PipelineError::Llm("no result received".into()))?;
            debug!(len = raw.len(), "pipeline LLM returned");
            serde_json::from_str(&raw).map_err(|e| PipelineError::BadOutput(e.to_string()))
        };

        match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), consume).await {
            Ok(result) => result,
            Err(_) => {
                session.interrupt();
                Err(PipelineError::Timeout {
                    seconds: timeout_secs,
                })
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted LLM: pops pre-loaded responses in order.
    pub struct ScriptedLlm {
        responses: Mutex<Vec<Value>>,
    }

    impl ScriptedLlm {
        pub fn new(mut responses: Vec<Value>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl PipelineLlm for ScriptedLlm {
        async fn structured(
            &self,
            _model: &str,
            _system_prompt: &str,
            _prompt: &str,
            _schema: Value,
            _timeout_secs: u64,
        ) -> Result<Value> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PipelineError::Llm("scripted LLM exhausted".into()))
        }
    }
}
