use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use serde::Serialize;

use crate::memunit::MemUnitStats;
use crate::timeq::Cycle;

/// State scoped to one simulation run. Every component of the run shares it through an `Arc`;
/// nothing here outlives the run.
#[derive(Debug, Default)]
pub struct RunContext {
    next_transaction: AtomicU64,
    stats_log: Option<StatsLog>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats_log(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("cannot create stats log {}", path.display()))?;
        Ok(Self {
            next_transaction: AtomicU64::new(0),
            stats_log: Some(StatsLog {
                writer: Mutex::new(BufWriter::new(file)),
            }),
        })
    }

    /// Transaction ids start at 1.
    pub fn next_transaction_id(&self) -> u64 {
        self.next_transaction.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn transactions_issued(&self) -> u64 {
        self.next_transaction.load(Ordering::Relaxed)
    }

    pub fn log_stats(&self, cycle: Cycle, stats: &MemUnitStats) {
        if let Some(log) = &self.stats_log {
            log.write_json(&StatsRecord {
                cycle,
                stats: *stats,
            });
        }
    }

    pub fn log_json<T: Serialize>(&self, record: &T) {
        if let Some(log) = &self.stats_log {
            log.write_json(record);
        }
    }

    pub fn flush(&self) {
        if let Some(log) = &self.stats_log {
            if let Ok(mut guard) = log.writer.lock() {
                let _ = guard.flush();
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsRecord {
    pub cycle: Cycle,
    pub stats: MemUnitStats,
}

#[derive(Debug)]
struct StatsLog {
    writer: Mutex<BufWriter<File>>,
}

impl StatsLog {
    fn write_json<T: Serialize>(&self, record: &T) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Ok(payload) = serde_json::to_string(record) {
                let _ = writeln!(guard, "{payload}");
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub cycles: Cycle,
    pub instructions_retired: u64,
    pub resyncs: u64,
    pub transactions: u64,
    pub average_latency: f64,
    pub memunit: MemUnitStats,
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let payload = serde_json::to_string_pretty(summary).context("cannot serialize summary")?;
    fs::write(path, payload).with_context(|| format!("cannot write {}", path.display()))
}
