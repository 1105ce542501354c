//! `cortex-pipelines` — the memory maintenance pipelines.
//!
//! The Librarian drains the throttled exchange buffer and extracts atoms
//! into threads; the Chronicler keeps conversation-thread descriptions
//! summarized; the Gardener curates the topical side of the graph under
//! the size caps. Each runs as a single cooperative task with a timeout
//! and reports a status object rather than raising.

pub mod buffer;
pub mod chronicler;
pub mod error;
pub mod gardener;
pub mod librarian;
pub mod llm;
pub mod rewriter;

pub use buffer::{Exchange, ExchangeBuffer, ThrottleState};
pub use chronicler::{Chronicler, ChroniclerRun};
pub use error::{PipelineError, Result};
pub use gardener::{Gardener, GardenerRun};
pub use librarian::{Librarian, LibrarianRun};
pub use llm::{PipelineLlm, SdkPipelineLlm};
pub use rewriter::QueryRewriter;
