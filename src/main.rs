use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use toml::Table;

use specmem::sim::config::{
    Config, ConsistencyModel, MemSystemConfig, MemUnitConfig, SimConfig, TrafficConfig,
};
use specmem::sim::top::Sim;

#[derive(Parser)]
#[command(version, about)]
struct SpecmemArgs {
    #[arg(help = "Path to config.toml")]
    config_path: PathBuf,
    #[arg(long, help = "Override consistency model (sc, tso, rmo)")]
    model: Option<ConsistencyModel>,
    #[arg(long, help = "Override random seed")]
    seed: Option<u64>,
    #[arg(long, help = "Replay a JSON trace instead of synthetic traffic")]
    trace: Option<PathBuf>,
    #[arg(long, help = "Override cycle limit")]
    timeout: Option<u64>,
    #[arg(long, help = "Write the run summary to this path")]
    summary: Option<PathBuf>,
}

pub fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv = SpecmemArgs::parse();
    let config = fs::read_to_string(&argv.config_path)
        .with_context(|| format!("failed to read {}", argv.config_path.display()))?;
    let config_table: Table = toml::from_str(&config).context("cannot parse config toml")?;
    let mut sim_config = SimConfig::from_section(config_table.get("sim"))?;
    let mut unit_config = MemUnitConfig::from_section(config_table.get("memunit"))?;
    let mem_config = MemSystemConfig::from_section(config_table.get("mem"))?;
    let traffic_config = TrafficConfig::from_section(config_table.get("traffic"))?;

    // override toml configs with argv
    unit_config.consistency_model = argv.model.unwrap_or(unit_config.consistency_model);
    sim_config.seed = argv.seed.unwrap_or(sim_config.seed);
    sim_config.timeout = argv.timeout.unwrap_or(sim_config.timeout);
    if argv.trace.is_some() {
        sim_config.trace = argv.trace;
    }
    if argv.summary.is_some() {
        sim_config.summary = argv.summary;
    }

    unit_config.validate()?;
    mem_config.validate()?;
    if sim_config.trace.is_none() {
        traffic_config.validate()?;
    }

    let mut sim = Sim::new(sim_config, unit_config, mem_config, traffic_config)?;
    let summary = sim.simulate()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
