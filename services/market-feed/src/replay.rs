//! Command journal replay.
//!
//! Feeds a JSON Lines file of [`BookCommand`]s into a [`BookEngine`], one
//! command per line. Blank lines and lines starting with `#` are ignored;
//! malformed or rejected commands are logged and skipped so one bad line
//! never stops a replay. An optional pace spaces commands out in time so a
//! connected client sees the feed evolve as it would live.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::error::Result;
use crate::order_book::{BookCommand, BookEngine};

/// Outcome of a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Commands the engine accepted.
    pub applied: u64,
    /// Trades produced by accepted fills.
    pub trades: u64,
    /// Lines that failed to parse or were rejected by the engine.
    pub skipped: u64,
}

/// Parse one journal line. `None` for blank and comment lines.
pub fn parse_line(line: &str) -> Option<serde_json::Result<BookCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Replays commands into one engine, keeping count.
pub struct Replayer<'a> {
    engine: &'a BookEngine,
    report: ReplayReport,
}

impl<'a> Replayer<'a> {
    pub fn new(engine: &'a BookEngine) -> Self {
        Self {
            engine,
            report: ReplayReport::default(),
        }
    }

    /// Apply one journal line. Returns whether a command was applied.
    pub fn apply_line(&mut self, line_no: usize, line: &str) -> bool {
        let command = match parse_line(line) {
            None => return false,
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                self.report.skipped += 1;
                warn!(line = line_no, error = %e, "Skipping malformed journal line");
                return false;
            }
        };

        match self.engine.apply(command) {
            Ok(trade) => {
                self.report.applied += 1;
                if trade.is_some() {
                    self.report.trades += 1;
                }
                true
            }
            Err(e) => {
                self.report.skipped += 1;
                warn!(line = line_no, error = %e, "Engine rejected journal command");
                false
            }
        }
    }

    /// Apply one raw journal line. A line that is not UTF-8 is skipped.
    pub fn apply_bytes(&mut self, line_no: usize, raw: &[u8]) -> bool {
        match std::str::from_utf8(raw) {
            Ok(line) => self.apply_line(line_no, line),
            Err(e) => {
                self.report.skipped += 1;
                warn!(line = line_no, error = %e, "Skipping non-UTF-8 journal line");
                false
            }
        }
    }

    pub fn finish(self) -> ReplayReport {
        self.report
    }
}

/// Replay every line of `text`.
pub fn replay_str(engine: &BookEngine, text: &str) -> ReplayReport {
    let mut replayer = Replayer::new(engine);
    for (idx, line) in text.lines().enumerate() {
        replayer.apply_line(idx + 1, line);
    }
    replayer.finish()
}

/// Stream a journal file into `engine`, sleeping `pace` after each applied
/// command (zero means as fast as possible).
pub async fn replay_file(engine: &BookEngine, path: &Path, pace: Duration) -> Result<ReplayReport> {
    let start = Instant::now();
    info!(path = %path.display(), pace_ms = pace.as_millis() as u64, "Starting journal replay");

    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).split(b'\n');
    let mut replayer = Replayer::new(engine);
    let mut line_no = 0;

    while let Some(raw) = lines.next_segment().await? {
        line_no += 1;
        if replayer.apply_bytes(line_no, &raw) && !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
    }

    let report = replayer.finish();
    info!(
        applied = report.applied,
        trades = report.trades,
        skipped = report.skipped,
        duration_ms = start.elapsed().as_millis() as u64,
        "Journal replay completed"
    );
    Ok(report)
}
