//! dscinspect - inspect dyld shared caches and their code signatures.
//!
//! Print the cache header, image inventory and embedded signature, or copy
//! caches out of an unpacked firmware tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dsc_inspect::dyld::ResolveOptions;
use dsc_inspect::{
    CacheExtractor, CodeSignature, DirectoryExtractor, DyldContext, ExtractOptions,
    MachOFileParser, SignatureStatus,
};

/// Inspect Apple dyld shared caches.
#[derive(Parser, Debug)]
#[command(name = "dscinspect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a dyld_shared_cache
    Info {
        /// List dylibs and their versions
        #[arg(short = 'l', long)]
        dylibs: bool,

        /// Print the code signature
        #[arg(short, long)]
        sig: bool,

        /// Root directory that on-disk dylib paths are resolved against
        #[arg(long)]
        root: Option<PathBuf>,

        /// Path to the dyld_shared_cache file
        cache: PathBuf,
    },

    /// Copy dyld_shared_cache files out of an unpacked firmware tree
    Extract {
        /// Output directory
        #[arg(short, long, default_value = "extracted")]
        output: PathBuf,

        /// Skip sub-cache files (.01, .symbols, ...)
        #[arg(long)]
        no_subcaches: bool,

        /// Unpacked firmware or mounted system volume
        source: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Info {
            dylibs,
            sig,
            root,
            cache,
        } => cmd_info(&cache, dylibs, sig, root, cli.verbose > 0),
        Commands::Extract {
            output,
            no_subcaches,
            source,
        } => cmd_extract(&source, output, !no_subcaches),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Resolves a symlinked cache path against the link's grandparent directory.
///
/// Firmware trees link caches from a sibling directory, so the target is
/// joined to the directory above the link's parent.
fn resolve_cache_path(path: &Path) -> Result<PathBuf> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("file {} does not exist", path.display()))?;
    if !meta.file_type().is_symlink() {
        return Ok(path.to_path_buf());
    }

    let target = fs::read_link(path)
        .with_context(|| format!("failed to read symlink {}", path.display()))?;
    let root = path
        .parent()
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new(""));
    Ok(root.join(target))
}

fn cmd_info(
    cache: &Path,
    show_dylibs: bool,
    show_signature: bool,
    root: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let path = resolve_cache_path(cache)?;
    info!("Opening cache: {}", path.display());
    let cache = DyldContext::open(&path)
        .with_context(|| format!("Failed to open cache: {}", path.display()))?;

    println!("{cache}");

    if show_signature {
        println!("Code Signature");
        println!("==============");
        match cache.code_signature()? {
            SignatureStatus::Signed(sig) => print_signature(sig, verbose),
            SignatureStatus::Unsigned => println!("  - no code signature data"),
        }
        println!();
    }

    if show_dylibs {
        let options = ResolveOptions { root };
        let inventory = cache.inventory_with(&MachOFileParser::new(), &options);

        println!("Images");
        println!("======");
        print!("{inventory}");

        let failed = inventory.unresolved_count();
        if failed > 0 {
            warn!("{} of {} images could not be resolved", failed, inventory.len());
            for entry in inventory.unresolved() {
                if let Some(err) = entry.error() {
                    info!("  {}: {}", entry.image.path, err);
                }
            }
        }
    }

    Ok(())
}

fn print_signature(sig: &CodeSignature, verbose: bool) {
    if verbose {
        println!(
            "SuperBlob @{:#x} ({} bytes) with {} blobs",
            sig.offset,
            sig.length,
            sig.blobs.len()
        );
        for blob in &sig.blobs {
            println!("\t{blob}");
        }
    }

    for cd in &sig.code_directories {
        println!("{cd}");
        if verbose {
            for slot in &cd.special_slots {
                println!("\t\t{slot}");
            }
            for slot in &cd.code_slots {
                println!("\t\t{slot}");
            }
        }
    }

    if !sig.requirements.is_empty() {
        println!(
            "Requirement Set ({} bytes) with {} requirement(s)",
            sig.requirements.iter().map(|r| r.length as u64).sum::<u64>(),
            sig.requirements.len()
        );
        for (idx, req) in sig.requirements.iter().enumerate() {
            println!("\t{idx}: {req}");
        }
    }

    if !sig.cms.is_empty() {
        println!("CMS (RFC3852) signature:");
        for cert in &sig.certificates {
            println!("        {cert}");
        }
    }
}

fn cmd_extract(source: &Path, output: PathBuf, include_subcaches: bool) -> Result<()> {
    let start = Instant::now();
    if !source.exists() {
        bail!("file {} does not exist", source.display());
    }

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("invalid progress template")?,
    );
    progress.set_message(format!("Extracting dyld_shared_cache to {}", output.display()));
    progress.enable_steady_tick(std::time::Duration::from_millis(100));

    let options = ExtractOptions {
        output_dir: output,
        include_subcaches,
    };
    let result = DirectoryExtractor::new().extract(source, &options);
    progress.finish_and_clear();

    let written = result.with_context(|| format!("Failed to extract from {}", source.display()))?;
    for path in &written {
        println!("{}", path.display());
    }
    info!(
        "Extracted {} file(s) from {} in {:.2}s",
        written.len(),
        source.display(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}
