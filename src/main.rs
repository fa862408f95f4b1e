use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use warpsim::interconn::{anynet, Interconnect, Packet, SimpleInterconnect};
use warpsim::{config, interconn, mem_fetch, trace, Simulator};

#[derive(Parser, Debug)]
#[command(author, version, about = "trace-driven GPU performance simulator")]
struct Options {
    /// Directory holding commands.trace and the kernel traces.
    traces_dir: PathBuf,

    /// Flat `-key value` configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the collected stats as JSON.
    #[arg(long, value_name = "FILE")]
    stats_out: Option<PathBuf>,
}

fn run_simulation<I>(
    interconn: Arc<I>,
    config: Arc<config::GPU>,
    options: &Options,
) -> eyre::Result<stats::Stats>
where
    I: Interconnect<Packet<mem_fetch::MemFetch>>,
{
    let commands = trace::parse_commands(options.traces_dir.join("commands.trace"))
        .wrap_err("failed to parse command trace")?;
    let mut sim = Simulator::new(interconn, config, &options.traces_dir);
    sim.run(&commands)?;
    Ok(sim.stats)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();

    let config = match &options.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
            config::GPU::parse(&contents)?
        }
        None => config::GPU::default(),
    };
    let config = Arc::new(config);

    let num_cores = config.num_simt_clusters;
    let num_mems = config.total_sub_partitions();

    let stats = match &config.network_file {
        Some(network_file) => {
            let topology = anynet::Topology::parse_file(network_file)?;
            let virtual_channels = anynet::VirtualChannels::default();
            virtual_channels.validate()?;
            let network = interconn::anynet::AnyNetwork::new(
                topology,
                virtual_channels,
                config.total_nodes(),
                Some(config.icnt_buffer_size),
            );
            run_simulation(Arc::new(network), config.clone(), &options)?
        }
        None => {
            let network = SimpleInterconnect::new(
                num_cores,
                num_mems,
                Some(config.icnt_buffer_size),
            );
            run_simulation(Arc::new(network), config.clone(), &options)?
        }
    };

    let silent = std::env::var("SILENT").unwrap_or_default().to_lowercase() == "yes";
    if !silent {
        let l1d = stats.l1d_stats.reduce();
        let l2d = stats.l2d_stats.reduce();
        println!();
        println!("{}", style("===== simulation summary =====").bold());
        println!("cycles:               {}", stats.sim.cycles);
        println!("instructions:         {}", stats.sim.instructions);
        println!("blocks:               {}", stats.sim.num_blocks);
        println!(
            "L1D hits/misses:      {}/{}",
            l1d.num_hits(),
            l1d.num_misses()
        );
        println!(
            "L2D hits/misses:      {}/{}",
            l2d.num_hits(),
            l2d.num_misses()
        );
        println!(
            "DRAM reads/writes:    {}/{}",
            stats.dram.total_reads, stats.dram.total_writes
        );
        println!(
            "icnt flits to mem:    {}",
            stats.interconn.flits_to_mem
        );
        println!(
            "icnt flits to shader: {}",
            stats.interconn.flits_to_shader
        );
        for kernel in &stats.kernels {
            println!(
                "kernel {:>3} {:<30} cycles [{} - {}]",
                kernel.launch_id, kernel.name, kernel.start_cycle, kernel.completed_cycle
            );
        }
    }

    if let Some(stats_out) = &options.stats_out {
        let writer = std::io::BufWriter::new(std::fs::File::create(stats_out)?);
        serde_json::to_writer_pretty(writer, &stats)?;
    }
    Ok(())
}
