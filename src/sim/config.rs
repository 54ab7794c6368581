use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{ensure, Context};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

use crate::timeq::{Cycle, ServerConfig};

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        match section {
            Some(value) => value
                .clone()
                .try_into()
                .context("cannot deserialize config section"),
            None => {
                warn!("config section not found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyModel {
    Sc,
    #[default]
    Tso,
    Rmo,
}

impl FromStr for ConsistencyModel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sc" => Ok(Self::Sc),
            "tso" => Ok(Self::Tso),
            "rmo" => Ok(Self::Rmo),
            _ => Err(format!(
                "unsupported consistency model '{}', expected one of: sc, tso, rmo",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub timeout: Cycle,
    pub seed: u64,
    pub dispatch_width: usize,
    pub retire_width: usize,
    pub rob_size: usize,
    /// JSON trace to replay; when unset a synthetic workload is generated from `[traffic]`.
    pub trace: Option<PathBuf>,
    /// JSON-lines file receiving periodic stats records.
    pub stats_log: Option<PathBuf>,
    pub stats_period: Cycle,
    pub summary: Option<PathBuf>,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            timeout: 1_000_000,
            seed: 0,
            dispatch_width: 4,
            retire_width: 4,
            rob_size: 64,
            trace: None,
            stats_log: None,
            stats_period: 10_000,
            summary: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MemUnitConfig {
    pub num_memory_ports: usize,
    pub num_snoop_ports: usize,
    /// Coherence line size in bytes.
    pub coherence_unit: u64,
    pub consistency_model: ConsistencyModel,
    pub speculative_order: bool,
    pub speculate_on_atomic_value: bool,
    /// 0 = unlimited.
    pub allowed_checkpoints: usize,
    /// Retirements after which a new checkpoint is opened; 0 = off.
    pub checkpoint_threshold: usize,
    /// Send-buffer capacity; 0 = unbounded.
    pub sb_size: usize,
    pub in_order_memory: bool,
    pub max_store_prefetches: usize,
    pub naw_bypass_sb: bool,
    pub naw_wait_at_sync: bool,
    pub prefetch_early: bool,
    pub side_effect_latency: Cycle,
    pub max_live_instructions: usize,
}

impl Config for MemUnitConfig {}

impl Default for MemUnitConfig {
    fn default() -> Self {
        Self {
            num_memory_ports: 2,
            num_snoop_ports: 1,
            coherence_unit: 64,
            consistency_model: ConsistencyModel::Tso,
            speculative_order: true,
            speculate_on_atomic_value: false,
            allowed_checkpoints: 0,
            checkpoint_threshold: 0,
            sb_size: 16,
            in_order_memory: false,
            max_store_prefetches: 8,
            naw_bypass_sb: false,
            naw_wait_at_sync: false,
            prefetch_early: false,
            side_effect_latency: 0,
            max_live_instructions: 1_000_000,
        }
    }
}

impl MemUnitConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.coherence_unit.is_power_of_two() && self.coherence_unit >= 8,
            "coherence_unit must be a power of two of at least 8 bytes, got {}",
            self.coherence_unit
        );
        ensure!(self.num_memory_ports > 0, "num_memory_ports must be > 0");
        ensure!(self.num_snoop_ports > 0, "num_snoop_ports must be > 0");
        ensure!(
            self.max_live_instructions > 0,
            "max_live_instructions must be > 0"
        );
        Ok(())
    }

    pub fn is_sc(&self) -> bool {
        self.consistency_model == ConsistencyModel::Sc
    }

    pub fn is_rmo(&self) -> bool {
        self.consistency_model == ConsistencyModel::Rmo
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct MemSystemConfig {
    pub base_latency: Cycle,
    pub bytes_per_cycle: u32,
    pub queue_capacity: usize,
    pub completions_per_cycle: u32,
    /// Per-cycle probability of an unsolicited invalidate to a recently touched line.
    pub invalidate_rate: f64,
    pub downgrade_rate: f64,
    pub probe_rate: f64,
}

impl Config for MemSystemConfig {}

impl Default for MemSystemConfig {
    fn default() -> Self {
        Self {
            base_latency: 20,
            bytes_per_cycle: 8,
            queue_capacity: 16,
            completions_per_cycle: 2,
            invalidate_rate: 0.0,
            downgrade_rate: 0.0,
            probe_rate: 0.0,
        }
    }
}

impl MemSystemConfig {
    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            base_latency: self.base_latency,
            bytes_per_cycle: self.bytes_per_cycle,
            queue_capacity: self.queue_capacity,
            completions_per_cycle: self.completions_per_cycle,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.bytes_per_cycle > 0, "mem.bytes_per_cycle must be > 0");
        ensure!(self.queue_capacity > 0, "mem.queue_capacity must be > 0");
        for (name, rate) in [
            ("invalidate_rate", self.invalidate_rate),
            ("downgrade_rate", self.downgrade_rate),
            ("probe_rate", self.probe_rate),
        ] {
            ensure!(
                (0.0..=1.0).contains(&rate),
                "mem.{name} must lie in [0, 1], got {rate}"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct TrafficConfig {
    pub num_ops: usize,
    /// Addresses are drawn from `[base, base + footprint)`.
    pub base: u64,
    pub footprint: u64,
    pub load_ratio: f64,
    pub store_ratio: f64,
    pub atomic_ratio: f64,
    pub fence_ratio: f64,
    /// Cycles between dispatch and address resolution, drawn uniformly from `[0, max]`.
    pub max_address_delay: Cycle,
    pub max_value_delay: Cycle,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            num_ops: 1000,
            base: 0x1000,
            footprint: 0x400,
            load_ratio: 0.5,
            store_ratio: 0.3,
            atomic_ratio: 0.05,
            fence_ratio: 0.05,
            max_address_delay: 4,
            max_value_delay: 4,
        }
    }
}

impl TrafficConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.footprint >= 8, "traffic.footprint must be at least 8 bytes");
        let total = self.load_ratio + self.store_ratio + self.atomic_ratio + self.fence_ratio;
        ensure!(
            total > 0.0 && total <= 1.0 + f64::EPSILON,
            "traffic ratios must sum to a value in (0, 1], got {total}"
        );
        Ok(())
    }
}
