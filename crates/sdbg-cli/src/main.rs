use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use sdbg_lib::pipeline::{read2sdbg, seq2sdbg};
use sdbg_lib::{BuildConfig, MemPolicy};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "sdbg")]
#[command(version = "0.1.0")]
#[command(about = "Succinct de Bruijn graph builder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MemPolicyArg {
    /// Use as little memory as possible (more level-1 scans)
    Min,
    /// Balance scans against memory
    Auto,
    /// Use the whole budget
    Max,
}

impl From<MemPolicyArg> for MemPolicy {
    fn from(arg: MemPolicyArg) -> Self {
        match arg {
            MemPolicyArg::Min => MemPolicy::Minimum,
            MemPolicyArg::Auto => MemPolicy::Auto,
            MemPolicyArg::Max => MemPolicy::Maximum,
        }
    }
}

#[derive(Args)]
struct CommonArgs {
    /// K-mer length of the graph nodes
    #[arg(short, long)]
    k: usize,

    /// Output prefix for the graph streams
    #[arg(short, long)]
    output: PathBuf,

    /// Number of threads (0 = all available cores)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,

    /// Host memory budget in bytes
    #[arg(short = 'm', long, default_value_t = 4 << 30)]
    memory: u64,

    /// Memory policy
    #[arg(long, value_enum, default_value = "auto")]
    mem_policy: MemPolicyArg,
}

#[derive(Subcommand)]
enum Commands {
    /// Build from pre-extracted edges and/or contig files
    FromEdges {
        #[command(flatten)]
        common: CommonArgs,

        /// Prefix of `.edges.*` files (with an `.edges.info` companion)
        #[arg(long)]
        edges: Option<PathBuf>,

        /// Number of `.edges.<fid>` files
        #[arg(long, default_value = "1")]
        num_edge_files: usize,

        /// Contig FASTA files (each with a `<path>.info` companion)
        #[arg(long)]
        contig: Vec<PathBuf>,

        /// Candidate reads for mercy-edge augmentation
        #[arg(long)]
        mercy_reads: Option<PathBuf>,
    },

    /// Build from reads and a solid-(k+1)-mer bitmap
    FromReads {
        #[command(flatten)]
        common: CommonArgs,

        /// Reads (FASTA/FASTQ, may be gzipped)
        #[arg(short, long)]
        reads: PathBuf,

        /// Raw little-endian u64 solid bitmap (absent = all solid)
        #[arg(long)]
        solid: Option<PathBuf>,

        /// Prefix of `.mercy_cand.<fid>` files
        #[arg(long)]
        mercy_cand: Option<PathBuf>,

        /// Number of mercy candidate files
        #[arg(long, default_value = "0")]
        num_mercy_files: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::FromEdges {
            common,
            edges,
            num_edge_files,
            contig,
            mercy_reads,
        } => {
            let need_mercy = mercy_reads.is_some();
            let config = build_config(&common, need_mercy);
            let opts = seq2sdbg::Seq2SdbgOptions {
                edges_prefix: edges,
                num_edge_files,
                contigs: contig,
                mercy_reads,
                output_prefix: common.output.clone(),
            };
            let stats = seq2sdbg::build(&opts, &config)
                .with_context(|| format!("building graph under {}", common.output.display()))?;
            info!(
                "done: {} edges, {} dollar nodes",
                stats.total_edges, stats.num_dollar_nodes
            );
        }
        Commands::FromReads {
            common,
            reads,
            solid,
            mercy_cand,
            num_mercy_files,
        } => {
            let need_mercy = mercy_cand.is_some();
            let config = build_config(&common, need_mercy);
            let opts = read2sdbg::Read2SdbgOptions {
                reads,
                solid_bitmap: solid,
                mercy_cand_prefix: mercy_cand,
                num_mercy_files,
                output_prefix: common.output.clone(),
            };
            let stats = read2sdbg::build(&opts, &config)
                .with_context(|| format!("building graph under {}", common.output.display()))?;
            info!(
                "done: {} edges, {} dollar nodes",
                stats.total_edges, stats.num_dollar_nodes
            );
        }
    }
    Ok(())
}

fn build_config(common: &CommonArgs, need_mercy: bool) -> BuildConfig {
    BuildConfig {
        kmer_k: common.k,
        num_threads: common.threads,
        host_mem: common.memory,
        mem_policy: common.mem_policy.into(),
        need_mercy,
        ..BuildConfig::default()
    }
}
