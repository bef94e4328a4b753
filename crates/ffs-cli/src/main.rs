#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffs::{BlockPath, InodeNumber, LogicalBlock, MountOptions, Volume, VolumeStats, decompose};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

/// Inode number used for the scratch file of `write`.
const SCRATCH_INO: InodeNumber = InodeNumber(2);

#[derive(Debug, Serialize)]
struct GeometryOutput {
    block_size: u32,
    direct_slots: u32,
    indirect_levels: u32,
    fan_out: u64,
    max_blocks: u64,
    max_file_size: u64,
}

#[derive(Debug, Serialize)]
struct DecomposeOutput {
    lbn: u64,
    level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    direct_slot: Option<u32>,
    offsets: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct Mapping {
    lbn: u64,
    block: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WriteOutput {
    mappings: Vec<Mapping>,
    stats: VolumeStats,
}

/// Flags shared by every command.
#[derive(Debug, Default)]
struct Args {
    positional: Vec<String>,
    config: Option<PathBuf>,
    json: bool,
    create: Option<u64>,
}

impl Args {
    fn parse(mut raw: impl Iterator<Item = String>) -> Result<Self> {
        let mut args = Self::default();
        while let Some(arg) = raw.next() {
            match arg.as_str() {
                "--json" => args.json = true,
                "--config" => {
                    let Some(path) = raw.next() else {
                        bail!("--config requires a file argument");
                    };
                    args.config = Some(PathBuf::from(path));
                }
                "--create" => {
                    let Some(blocks) = raw.next() else {
                        bail!("--create requires a block count");
                    };
                    args.create = Some(
                        blocks
                            .parse()
                            .with_context(|| format!("invalid block count: {blocks}"))?,
                    );
                }
                flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
                _ => args.positional.push(arg),
            }
        }
        Ok(args)
    }

    fn options(&self) -> Result<MountOptions> {
        let Some(path) = &self.config else {
            return Ok(MountOptions::default());
        };
        load_options(path)
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut raw = env::args().skip(1);
    let Some(command) = raw.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "geometry" => {
            let args = Args::parse(raw)?;
            geometry_cmd(&args)
        }
        "decompose" => {
            let args = Args::parse(raw)?;
            let Some(lbn) = args.positional.first() else {
                bail!("decompose requires a logical block number");
            };
            let lbn = parse_lbn(lbn)?;
            decompose_cmd(&args, lbn)
        }
        "write" => {
            let args = Args::parse(raw)?;
            let Some((image, lbns)) = args.positional.split_first() else {
                bail!("write requires <image-path> <lbn>...");
            };
            if lbns.is_empty() {
                bail!("write requires at least one logical block number");
            }
            let lbns = lbns
                .iter()
                .map(|s| parse_lbn(s))
                .collect::<Result<Vec<_>>>()?;
            write_cmd(&args, Path::new(image), &lbns)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ffs-cli\n");
    println!("USAGE:");
    println!("  ffs-cli geometry [--config FILE] [--json]");
    println!("  ffs-cli decompose <lbn> [--config FILE] [--json]");
    println!("  ffs-cli write <image-path> <lbn>... [--create BLOCKS] [--config FILE] [--json]");
}

fn parse_lbn(text: &str) -> Result<LogicalBlock> {
    text.parse()
        .map(LogicalBlock)
        .with_context(|| format!("invalid logical block number: {text}"))
}

fn load_options(path: &Path) -> Result<MountOptions> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let options: MountOptions = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    options
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(options)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn geometry_cmd(args: &Args) -> Result<()> {
    let geo = args.options()?.geometry;
    let output = GeometryOutput {
        block_size: geo.block_size,
        direct_slots: geo.direct_slots,
        indirect_levels: geo.indirect_levels,
        fan_out: geo.fan_out(),
        max_blocks: geo.max_blocks(),
        max_file_size: geo.max_file_size(),
    };
    if args.json {
        return print_json(&output);
    }
    println!("block_size: {}", output.block_size);
    println!("direct_slots (D): {}", output.direct_slots);
    println!("indirect_levels (K): {}", output.indirect_levels);
    println!("fan_out (F): {}", output.fan_out);
    println!("max_blocks: {}", output.max_blocks);
    println!("max_file_size: {}", output.max_file_size);
    Ok(())
}

fn decompose_cmd(args: &Args, lbn: LogicalBlock) -> Result<()> {
    let geo = args.options()?.geometry;
    let path = decompose(&geo, lbn).with_context(|| format!("cannot map logical block {lbn}"))?;
    let output = DecomposeOutput {
        lbn: lbn.0,
        level: path.level(),
        direct_slot: match path {
            BlockPath::Direct { slot } => Some(slot),
            BlockPath::Indirect { .. } => None,
        },
        offsets: path.offsets().to_vec(),
    };
    if args.json {
        return print_json(&output);
    }
    match output.direct_slot {
        Some(slot) => println!("lbn {}: direct slot {slot}", output.lbn),
        None => println!(
            "lbn {}: level {} offsets {:?}",
            output.lbn, output.level, output.offsets
        ),
    }
    Ok(())
}

fn write_cmd(args: &Args, image: &Path, lbns: &[LogicalBlock]) -> Result<()> {
    let options = args.options()?;
    let bs = options.geometry.block_size;
    let vol = match args.create {
        Some(blocks) => Volume::create_file(image, blocks, options)
            .with_context(|| format!("failed to create image {}", image.display()))?,
        None => Volume::open_file(image, options)
            .with_context(|| format!("failed to open image {}", image.display()))?,
    };
    let inode = vol.create_inode(SCRATCH_INO, None)?;

    for &lbn in lbns {
        let offset = lbn
            .0
            .checked_mul(u64::from(bs))
            .with_context(|| format!("logical block {lbn} is past any file offset"))?;
        #[expect(clippy::cast_possible_truncation)]
        let block = vec![lbn.0 as u8; bs as usize];
        vol.write(&inode, offset, &block)
            .with_context(|| format!("failed to write logical block {lbn}"))?;
    }
    vol.flush().context("flush")?;

    let mappings = lbns
        .iter()
        .map(|&lbn| {
            Ok(Mapping {
                lbn: lbn.0,
                block: vol.map(&inode, lbn)?.map(|b| b.0),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let output = WriteOutput {
        mappings,
        stats: vol.stats(),
    };
    if args.json {
        return print_json(&output);
    }
    for m in &output.mappings {
        match m.block {
            Some(block) => println!("lbn {} -> block {block}", m.lbn),
            None => println!("lbn {} -> hole", m.lbn),
        }
    }
    println!(
        "free blocks: {} of {}",
        output.stats.free_blocks, output.stats.total_blocks
    );
    Ok(())
}
