//! Inspection tool for paged HNSW index files.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use paged_hnsw::{
    config::HnswConfig,
    hnsw::{HnswIndex, IndexHeader, MemoryHeap, RetrieverCtx},
    logging::init_logging,
    primitives::pager::{Pager, PinMode},
    PageId, SlotId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "hnsw-inspect",
    version,
    about = "Inspect and verify paged HNSW index files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "INDEX", help = "Path to the index file")]
    index: PathBuf,

    #[arg(long, global = true, value_name = "FILE", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Log filter, e.g. info or paged_hnsw=debug")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show header fields and pager statistics
    Info,
    /// Dump the graph library synopsis as hex
    Header,
    /// Run the integrity check
    Verify {
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
    /// Show one node
    Node {
        #[arg(value_name = "SLOT")]
        slot: u32,
    },
    /// Create a fresh index filled with random vectors
    DemoBuild {
        #[arg(long, default_value_t = 1000)]
        rows: u64,
        #[arg(long, default_value_t = 16)]
        dim: u32,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = HnswConfig::load(cli.config.clone())?;
    let level = cli
        .log_level
        .as_deref()
        .or(config.log_level())
        .unwrap_or("warn");
    init_logging(level);

    match cli.command {
        Command::Info => cmd_info(&cli.index, &config),
        Command::Header => cmd_header(&cli.index, &config),
        Command::Verify { json } => cmd_verify(&cli.index, &config, json),
        Command::Node { slot } => cmd_node(&cli.index, &config, SlotId(slot)),
        Command::DemoBuild { rows, dim, seed } => {
            cmd_demo_build(&cli.index, &config, rows, dim, seed)
        }
    }
}

fn open_pager(path: &Path, config: &HnswConfig) -> Result<Pager, Box<dyn Error>> {
    if !path.exists() {
        return Err(format!("index file {} does not exist", path.display()).into());
    }
    Ok(Pager::open(path, config.pager_options()?)?)
}

fn read_header(pager: &Pager) -> Result<IndexHeader, Box<dyn Error>> {
    if pager.page_count() == 0 {
        return Err("index has no pages yet; its build is postponed".into());
    }
    let page = pager.pin_page(PageId::HEADER, PinMode::Shared)?;
    let image = page.read();
    Ok(IndexHeader::decode(&image)?)
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<28} {}", name, value);
}

fn cmd_info(path: &Path, config: &HnswConfig) -> Result<(), Box<dyn Error>> {
    let pager = open_pager(path, config)?;
    let header = read_header(&pager)?;
    let file_size = std::fs::metadata(path)?.len();
    println!("Index");
    print_field("path", path.display());
    print_field("file size", format!("{file_size} bytes"));
    print_field("page size", pager.page_size());
    print_field("pages", pager.page_count());
    println!("Header");
    print_field("vector dim", header.vector_dim);
    print_field("vectors", header.num_vectors);
    print_field("metric", header.metric.as_str());
    print_field("m", header.m);
    print_field("ef construction", header.ef_construction);
    print_field("ef search", header.ef_search);
    print_field("pq subvectors", header.pq_subvectors);
    print_field(
        "tail block",
        header
            .tail_block
            .map_or_else(|| "none".to_string(), |p| p.to_string()),
    );
    print_field("block-map pages", header.blockmap_pages.len());
    let stats = pager.stats();
    println!("Cache");
    print_field("hits", stats.hits);
    print_field("misses", stats.misses);
    print_field("frames", stats.frames);
    Ok(())
}

fn cmd_header(path: &Path, config: &HnswConfig) -> Result<(), Box<dyn Error>> {
    let pager = open_pager(path, config)?;
    let header = read_header(&pager)?;
    println!("{}", hex::encode(&header.library_header));
    Ok(())
}

fn cmd_verify(path: &Path, config: &HnswConfig, json: bool) -> Result<(), Box<dyn Error>> {
    let pager = open_pager(path, config)?;
    let report = paged_hnsw::hnsw::verify::verify_index(&pager)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_field("vectors", report.num_vectors);
        print_field("nodes checked", report.nodes_checked);
        print_field("tombstones", report.tombstones);
        print_field("node blocks", report.node_blocks);
        print_field("block-map pages", report.blockmap_pages);
        for finding in &report.findings {
            println!("  ! {finding}");
        }
        if report.findings_truncated > 0 {
            println!("  ! {} more findings", report.findings_truncated);
        }
        println!("{}", if report.is_clean() { "ok" } else { "FAILED" });
    }
    if !report.is_clean() {
        std::process::exit(2);
    }
    Ok(())
}

#[derive(Serialize)]
struct NodeDump {
    slot: u32,
    key: u64,
    tombstone: bool,
    level: u16,
    block: u32,
    neighbors: Vec<Vec<u32>>,
    payload_hex: String,
}

fn cmd_node(path: &Path, config: &HnswConfig, slot: SlotId) -> Result<(), Box<dyn Error>> {
    let pager = open_pager(path, config)?;
    let header = read_header(&pager)?;
    let mut ctx = RetrieverCtx::reader(&pager, header)?;
    let block = ctx.block_of(slot)?;
    let node = ctx.fetch_immutable(slot)?;
    let view = node.view();
    let neighbors = (0..=view.level())
        .map(|tier| view.neighbors(tier).map(|n| n.map(|s| s.0).collect()))
        .collect::<paged_hnsw::Result<Vec<Vec<u32>>>>()?;
    let dump = NodeDump {
        slot: slot.0,
        key: view.key(),
        tombstone: view.is_tombstone(),
        level: view.level(),
        block: block.0,
        neighbors,
        payload_hex: hex::encode(view.payload()),
    };
    println!("{}", serde_json::to_string_pretty(&dump)?);
    Ok(())
}

fn cmd_demo_build(
    path: &Path,
    config: &HnswConfig,
    rows: u64,
    dim: u32,
    seed: u64,
) -> Result<(), Box<dyn Error>> {
    let pager = Arc::new(Pager::create(path, config.pager_options()?)?);
    let mut options = config.index_options()?;
    options.dimensions = Some(dim);
    let heap = Arc::new(MemoryHeap::new());
    let mut rng = StdRng::seed_from_u64(seed);
    for key in 0..rows {
        let vector: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        heap.push(key, Some(vector));
    }
    let index = HnswIndex::open(Arc::clone(&pager), options, heap)?;
    let report = index.build(&mut rng)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
