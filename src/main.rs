use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use treepatch::line_proto::LineReader;
use treepatch::patch_format::{self, PatchSummary};
use treepatch::{apply, binary_diff, binary_patch, create};

#[derive(Parser)]
#[command(name = "treepatch", about = "Tree diff/patch engine: create and apply patches between directory trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch document by comparing two directory trees
    Diff {
        /// Path to the old (original) tree
        dir1: PathBuf,
        /// Path to the new (updated) tree
        dir2: PathBuf,
        /// Output path for the patch document (stdout by default)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Verify and apply a patch document to a target tree
    Patch {
        /// Directory to apply the patch in
        #[arg(long, short = 'd', default_value = ".")]
        patch_dir: PathBuf,
        /// Patch document to read (stdin by default)
        #[arg(long, short)]
        input: Option<PathBuf>,
    },
    /// Create a binary-diff-only document for raw file groups
    Bindiff {
        /// Base directory the group paths are relative to
        #[arg(long, short = 'd', default_value = ".")]
        base_dir: PathBuf,
        /// File groups: ORIGINAL PATCHED TARGET-NAME, repeated
        #[arg(required = true)]
        groups: Vec<String>,
        /// Output path for the document (stdout by default)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Verify and apply a binary-diff-only document
    Binpatch {
        /// Directory to apply the patch in
        #[arg(long, short = 'd', default_value = ".")]
        patch_dir: PathBuf,
        /// Patch document to read (stdin by default)
        #[arg(long, short)]
        input: Option<PathBuf>,
        /// Swap + and - lines at parse time for best-effort reverse application
        #[arg(long, short)]
        unpatch: bool,
    },
}

fn open_input(input: Option<&PathBuf>) -> anyhow::Result<Box<dyn BufRead>> {
    Ok(match input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open patch document: {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(std::io::stdin())),
    })
}

fn write_output(output: Option<&PathBuf>, text: &str) -> anyhow::Result<()> {
    match output {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("Failed to write output: {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

/// Status output goes to stderr; stdout is reserved for patch documents.
fn print_summary(summary: &PatchSummary) {
    eprintln!("  Directories removed: {}", summary.dirs_removed);
    eprintln!("  Directories created: {}", summary.dirs_created);
    eprintln!("  Files removed: {}", summary.files_removed);
    eprintln!("  Symlinks created: {}", summary.symlinks_created);
    eprintln!("  New files: {}", summary.files_created);
    eprintln!("  Binary-diffed files: {}", summary.files_bindiffed);
    eprintln!("  Text diff: {}", if summary.text_patched { "yes" } else { "no" });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Diff { dir1, dir2, output } => {
            let start = Instant::now();
            let doc = create::diff_trees(&dir1, &dir2).await?;
            write_output(output.as_ref(), &doc.to_text())?;
            let elapsed = start.elapsed();

            eprintln!("Patch created.");
            print_summary(&doc.summary());
            eprintln!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Patch { patch_dir, input } => {
            let mut reader = LineReader::new(open_input(input.as_ref())?);
            let doc = patch_format::parse_document(&mut reader)?;

            let start = Instant::now();
            let summary = apply::patch_tree(&patch_dir, doc).await?;
            let elapsed = start.elapsed();

            eprintln!("Patch applied successfully.");
            print_summary(&summary);
            eprintln!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Bindiff { base_dir, groups, output } => {
            if groups.len() % 3 != 0 {
                bail!("file groups must be triples: ORIGINAL PATCHED TARGET-NAME");
            }
            let groups: Vec<(String, String, String)> = groups
                .chunks_exact(3)
                .map(|g| (g[0].clone(), g[1].clone(), g[2].clone()))
                .collect();

            let mut out = String::new();
            binary_diff::render_file_groups(&base_dir, &groups, "", &mut out)?;
            write_output(output.as_ref(), &out)?;
        }
        Commands::Binpatch { patch_dir, input, unpatch } => {
            let mut reader = LineReader::new(open_input(input.as_ref())?);
            let records = binary_patch::parse_records(&mut reader, unpatch)?;

            binary_patch::verify_records(&records, &patch_dir)?;
            binary_patch::apply_records(&records, &patch_dir)?;

            eprintln!("Patched {} file(s).", records.len());
        }
    }

    Ok(())
}
