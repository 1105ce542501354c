//! Exchange buffer and Librarian throttle state.
//!
//! Completed exchanges accumulate here until the Librarian consumes them.
//! The buffer is strictly FIFO until consumed and capped; overflow trims
//! the oldest entries. Consuming is atomic: drain, clear the file, and
//! bump the throttle — or nothing, when the buffer raced empty.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cortex_core::files::{load_json, locked_update};
use cortex_core::time::{now_iso, now_unix};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub user_message: String,
    pub assistant_message: String,
    /// When the exchange happened (RFC 3339).
    pub timestamp: String,
    /// Chat session the exchange belongs to.
    pub session_id: String,
    /// Unix seconds when buffered.
    #[serde(default)]
    pub buffered_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThrottleState {
    #[serde(default)]
    pub last_librarian_run: f64,
    #[serde(default)]
    pub last_gardener_run: f64,
    #[serde(default)]
    pub total_librarian_runs: u64,
    #[serde(default)]
    pub total_gardener_runs: u64,
    #[serde(default)]
    pub total_exchanges_processed: u64,
}

pub struct ExchangeBuffer {
    buffer_file: PathBuf,
    throttle_file: PathBuf,
    cap: usize,
    throttle_secs: f64,
}

impl ExchangeBuffer {
    pub fn new(memory_dir: &std::path::Path, cap: usize, throttle_secs: f64) -> Self {
        Self {
            buffer_file: memory_dir.join("exchange_buffer.json"),
            throttle_file: memory_dir.join("throttle_state.json"),
            cap,
            throttle_secs,
        }
    }

    pub fn throttle_secs(&self) -> f64 {
        self.throttle_secs
    }

    /// Append an exchange, trimming the oldest entries past the cap.
    pub fn add(&self, mut exchange: Exchange) -> Result<usize> {
        exchange.buffered_at = now_unix();
        let cap = self.cap;
        let len = locked_update(&self.buffer_file, Vec::<Exchange>::new(), move |mut buf| {
            buf.push(exchange);
            if buf.len() > cap {
                let excess = buf.len() - cap;
                warn!(excess, cap, "exchange buffer overflow, trimming oldest");
                buf.drain(..excess);
            }
            let len = buf.len();
            (buf, len)
        })?;
        Ok(len)
    }

    pub fn peek(&self) -> Vec<Exchange> {
        load_json(&self.buffer_file, Vec::new())
    }

    pub fn throttle_state(&self) -> ThrottleState {
        load_json(&self.throttle_file, ThrottleState::default())
    }

    /// Seconds left before the Librarian may run again (zero when ready).
    pub fn throttle_remaining(&self) -> f64 {
        let state = self.throttle_state();
        (self.throttle_secs - (now_unix() - state.last_librarian_run)).max(0.0)
    }

    /// Atomically drain the buffer and bump the throttle counters. When the
    /// buffer raced empty between check and consume, nothing is updated and
    /// an empty list comes back.
    pub fn consume(&self) -> Result<Vec<Exchange>> {
        let drained = locked_update(&self.buffer_file, Vec::<Exchange>::new(), |buf| {
            (Vec::new(), buf)
        })?;
        if drained.is_empty() {
            return Ok(drained);
        }
        let count = drained.len() as u64;
        locked_update(
            &self.throttle_file,
            ThrottleState::default(),
            move |mut state| {
                state.last_librarian_run = now_unix();
                state.total_librarian_runs += 1;
                state.total_exchanges_processed += count;
                (state, ())
            },
        )?;
        info!(count, "consumed exchange buffer");
        Ok(drained)
    }

    pub fn mark_gardener_run(&self) -> Result<()> {
        locked_update(
            &self.throttle_file,
            ThrottleState::default(),
            move |mut state| {
                state.last_gardener_run = now_unix();
                state.total_gardener_runs += 1;
                (state, ())
            },
        )?;
        Ok(())
    }

    /// Reset the throttle so a manual trigger runs immediately.
    pub fn force_ready(&self) -> Result<()> {
        locked_update(
            &self.throttle_file,
            ThrottleState::default(),
            |mut state| {
                state.last_librarian_run = 0.0;
                (state, ())
            },
        )?;
        Ok(())
    }

    /// Rewind the last-run clock (tests and manual maintenance).
    pub fn rewind_last_run(&self, seconds: f64) -> Result<()> {
        locked_update(
            &self.throttle_file,
            ThrottleState::default(),
            move |mut state| {
                state.last_librarian_run -= seconds;
                (state, ())
            },
        )?;
        Ok(())
    }

    pub fn stats(&self) -> serde_json::Value {
        let state = self.throttle_state();
        let buffer = self.peek();
        serde_json::json!({
            "buffer_size": buffer.len(),
            "seconds_until_next_run": self.throttle_remaining(),
            "total_librarian_runs": state.total_librarian_runs,
            "total_exchanges_processed": state.total_exchanges_processed,
            "checked_at": now_iso(),
        })
    }
}
