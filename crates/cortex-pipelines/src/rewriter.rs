//! Query rewriting for memory retrieval.
//!
//! A fast structured call turns the raw user message plus the last few
//! exchanges into 1-5 weighted vector-search queries. On any failure the
//! raw message passes through as a single full-weight query — retrieval
//! never blocks on the rewriter.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cortex_memory::{QueryItem, RewrittenQuery};

use crate::llm::PipelineLlm;

/// Messages of context handed to the rewriter (last ~3 exchanges).
const CONTEXT_MESSAGES: usize = 6;
const REWRITER_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct RewriterQueryItem {
    /// Semantic search query text.
    text: String,
    /// Relative importance weight in [0, 1].
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_weight() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct RewriterOutput {
    /// 1-5 search queries, each with a weight.
    queries: Vec<RewriterQueryItem>,
}

const REWRITER_SYSTEM_PROMPT: &str = r#"You are a query rewriter for a semantic memory system.

Given a user message and recent conversation context, output structured search queries optimized for vector similarity search. Each query targets a distinct topic and carries its own weight.

Rules:
1. Identify distinct topics or concepts in the user message
2. Generate a SEPARATE query for each topic (1-5 queries)
3. Expand vague references ("that bug", "the thing", "it") into specific terms from context
4. Use concrete nouns and verbs, not conversational filler
5. Even for greetings or simple messages, generate queries about recent context or general state
6. PRESERVE distinctive phrases verbatim. If the user uses an unusual phrase, a direct quote, or a specific term that looks like it refers to something concrete, use it EXACTLY as-is in a query. Do NOT paraphrase, expand with synonyms, or dilute it. These phrases are the best possible search terms because they will match the original text in memory.

Per-query fields:
- text: the search query (concrete terms for vector search)
- weight: relative importance (0.0-1.0); equal weights when unsure

Always output valid JSON matching the schema."#;

pub struct QueryRewriter {
    llm: Arc<dyn PipelineLlm>,
    model: String,
}

impl QueryRewriter {
    pub fn new(llm: Arc<dyn PipelineLlm>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Rewrite `user_message` into retrieval queries. `context` is the
    /// recent conversation as (role, content) pairs, oldest first.
    pub async fn rewrite(
        &self,
        user_message: &str,
        context: &[(String, String)],
    ) -> RewrittenQuery {
        let context_str = if context.is_empty() {
            "(no prior context)".to_string()
        } else {
            context
                .iter()
                .rev()
                .take(CONTEXT_MESSAGES)
                .rev()
                .map(|(role, content)| {
                    let content: String = content.chars().take(500).collect();
                    format!("{role}: {content}")
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "Recent conversation:\n{context_str}\n\nUser message to rewrite:\n{user_message}\n\n\
             Output optimized search queries for semantic memory retrieval."
        );

        let schema = serde_json::to_value(schemars::schema_for!(RewriterOutput))
            .expect("schema serializes");
        match self
            .llm
            .structured(
                &self.model,
                REWRITER_SYSTEM_PROMPT,
                &prompt,
                schema,
                REWRITER_TIMEOUT_SECS,
            )
            .await
            .and_then(|v| {
                serde_json::from_value::<RewriterOutput>(v)
                    .map_err(|e| crate::error::PipelineError::BadOutput(e.to_string()))
            }) {
            Ok(output) if !output.queries.is_empty() => {
                let queries: Vec<QueryItem> = output
                    .queries
                    .into_iter()
                    .take(5)
                    .map(|q| QueryItem {
                        text: q.text,
                        weight: q.weight.clamp(0.0, 1.0),
                    })
                    .collect();
                debug!(count = queries.len(), "query rewriter produced queries");
                RewrittenQuery { queries }
            }
            Ok(_) => RewrittenQuery::passthrough(user_message),
            Err(e) => {
                warn!("query rewriter failed, passing message through: {e}");
                RewrittenQuery::passthrough(user_message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedLlm;
    use serde_json::json;

    #[tokio::test]
    async fn parses_weighted_queries() {
        let llm = Arc::new(ScriptedLlm::new(vec![json!({
            "queries": [
                {"text": "austin move", "weight": 0.5},
                {"text": "vibe shift", "weight": 0.9}
            ]
        })]));
        let rewriter = QueryRewriter::new(llm, "haiku");
        let result = rewriter
            .rewrite("remember the austin move and the vibe shift", &[])
            .await;
        assert_eq!(result.queries.len(), 2);
        assert_eq!(result.queries[1].text, "vibe shift");
        assert_eq!(result.queries[1].weight, 0.9);
    }

    #[tokio::test]
    async fn failure_falls_back_to_passthrough() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let rewriter = QueryRewriter::new(llm, "haiku");
        let result = rewriter.rewrite("what's my favorite color", &[]).await;
        assert_eq!(result.queries.len(), 1);
        assert_eq!(result.queries[0].text, "what's my favorite color");
        assert_eq!(result.queries[0].weight, 1.0);
    }

    #[tokio::test]
    async fn weights_are_clamped() {
        let llm = Arc::new(ScriptedLlm::new(vec![json!({
            "queries": [{"text": "q", "weight": 7.5}]
        })]));
        let rewriter = QueryRewriter::new(llm, "haiku");
        let result = rewriter.rewrite("q", &[]).await;
        assert_eq!(result.queries[0].weight, 1.0);
    }
}
