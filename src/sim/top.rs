use std::collections::VecDeque;
use std::sync::Arc;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::memunit::{MemMessage, MemUnit};
use crate::sim::config::{MemSystemConfig, MemUnitConfig, SimConfig, TrafficConfig};
use crate::sim::mem_system::CoherentMemory;
use crate::sim::perf_log::{write_summary, RunContext, RunSummary};
use crate::sim::traffic::{generate, load_trace, TraceEngine, TraceRecord};
use crate::timeq::Cycle;

/// One core's memory unit between a trace-driven engine and a timed coherent memory.
pub struct Sim {
    config: SimConfig,
    ctx: Arc<RunContext>,
    engine: TraceEngine,
    unit: MemUnit,
    memory: CoherentMemory,
    /// Requests the memory refused, retried before anything new leaves the unit.
    held: VecDeque<MemMessage>,
    resyncs: u64,
}

impl Sim {
    pub fn new(
        sim_config: SimConfig,
        unit_config: MemUnitConfig,
        mem_config: MemSystemConfig,
        traffic_config: TrafficConfig,
    ) -> anyhow::Result<Self> {
        let program = match &sim_config.trace {
            Some(path) => load_trace(path)?,
            None => generate(&traffic_config, &mut StdRng::seed_from_u64(sim_config.seed)),
        };
        let ctx = match &sim_config.stats_log {
            Some(path) => RunContext::with_stats_log(path)?,
            None => RunContext::new(),
        };
        Ok(Self::with_program(
            program,
            sim_config,
            unit_config,
            mem_config,
            Arc::new(ctx),
        ))
    }

    pub fn with_program(
        program: Vec<TraceRecord>,
        sim_config: SimConfig,
        unit_config: MemUnitConfig,
        mem_config: MemSystemConfig,
        ctx: Arc<RunContext>,
    ) -> Self {
        info!(
            "simulating {} ops under {:?}",
            program.len(),
            unit_config.consistency_model
        );
        let memory = CoherentMemory::new(
            mem_config,
            unit_config.coherence_unit,
            sim_config.seed.wrapping_add(1),
        );
        Self {
            engine: TraceEngine::new(program, &sim_config),
            unit: MemUnit::new(unit_config, Arc::clone(&ctx)),
            memory,
            config: sim_config,
            ctx,
            held: VecDeque::new(),
            resyncs: 0,
        }
    }

    pub fn finished(&self) -> bool {
        self.engine.finished()
            && self.unit.is_empty()
            && self.memory.is_idle()
            && self.held.is_empty()
    }

    pub fn memory(&self) -> &CoherentMemory {
        &self.memory
    }

    pub fn engine(&self) -> &TraceEngine {
        &self.engine
    }

    pub fn tick(&mut self, now: Cycle) -> anyhow::Result<()> {
        self.memory.tick(now, &mut self.unit)?;
        self.engine.execute(now, &mut self.unit)?;

        let resync = match self.engine.retire(&mut self.unit)? {
            Some(reason) => Err(reason),
            None => self.unit.cycle(now, self.engine.core_view()),
        };
        match resync {
            Ok(()) => {
                let effects = self.unit.take_effects();
                self.engine.apply_effects(effects, &mut self.memory)?;
            }
            Err(reason) => {
                self.resyncs += 1;
                self.engine
                    .recover(&reason, &mut self.unit, &mut self.memory)?;
            }
        }

        self.drain_ports(now);
        self.engine.dispatch(now, &mut self.unit)
    }

    fn drain_ports(&mut self, now: Cycle) {
        while let Some(message) = self.unit.pop_snoop_op() {
            // acknowledgements are never refused
            let _ = self.memory.accept(now, message);
        }
        while let Some(message) = self.held.pop_front() {
            if let Err(message) = self.memory.accept(now, message) {
                self.held.push_front(message);
                return;
            }
        }
        while let Some(message) = self.unit.pop_memory_op() {
            if let Err(message) = self.memory.accept(now, message) {
                self.held.push_back(message);
                return;
            }
        }
    }

    pub fn simulate(&mut self) -> anyhow::Result<RunSummary> {
        let mut cycles = self.config.timeout;
        let mut done = false;
        for now in 1..=self.config.timeout {
            self.tick(now)?;
            if self.config.stats_period > 0 && now % self.config.stats_period == 0 {
                self.ctx.log_stats(now, self.unit.stats());
            }
            if self.finished() {
                cycles = now;
                done = true;
                break;
            }
        }
        if !done {
            warn!(
                "timeout after {} cycles with {} instructions retired",
                cycles,
                self.engine.retired()
            );
        }
        self.ctx.log_stats(cycles, self.unit.stats());
        self.ctx.flush();

        let stats = *self.unit.stats();
        let summary = RunSummary {
            cycles,
            instructions_retired: self.engine.retired(),
            resyncs: self.resyncs,
            transactions: self.ctx.transactions_issued(),
            average_latency: stats.average_latency(),
            memunit: stats,
        };
        info!(
            "finished in {} cycles: {} retired, {} committed, {} rollbacks, {} replayed, \
             {} resyncs, checksum {:#x}",
            cycles,
            summary.instructions_retired,
            self.engine.committed(),
            self.engine.rollbacks(),
            self.engine.replayed(),
            self.resyncs,
            self.engine.checksum()
        );
        if let Some(path) = &self.config.summary {
            write_summary(path, &summary)?;
        }
        Ok(summary)
    }
}
