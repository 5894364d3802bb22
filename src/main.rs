use clap::{ArgAction, Parser, Subcommand};
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use tote::checkin::{checkin_save, checkin_status, read_items, replace_archive, run_hook, write_checkin};
use tote::item::{to_stream, Item, ItemReader, ItemWriter};
use tote::save::{extract_file, fill_content, load_content, save_file, save_stream, stat_item};
use tote::scan::{merge_sorted, treescan, Ignore, WalkOptions};
use tote::workdir::WorkDir;
use tote::{fold, unfold, FileStore};

#[derive(Parser)]
#[command(name = "tote", version, about = "Content-addressed, encrypted, deduplicating archive")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save files (or stdin) into the store and print the item stream
    Put {
        path: Vec<PathBuf>,
        /// Recursively descend into directories
        #[arg(long)]
        recursive: bool,
    },
    /// Copy content of items in a stream to stdout
    Cat { tote: Vec<PathBuf> },
    /// Show every path a walk would include
    Scan {
        path: Vec<PathBuf>,
        /// Do not cross filesystem boundaries
        #[arg(long)]
        one_filesystem: bool,
    },
    /// Save files and append their items to an archive
    Append {
        tote: PathBuf,
        file: Vec<PathBuf>,
        /// Recursively descend into directories
        #[arg(long)]
        recursive: bool,
    },
    /// List the items of an archive
    List { tote: PathBuf },
    /// Fold an archive's stream to stdout
    FoldPipe { tote: PathBuf },
    /// Unfold then refold an archive's stream to stdout
    RefoldPipe { tote: PathBuf },
    /// Unfold an archive's stream to stdout
    UnfoldPipe { tote: PathBuf },
    /// Unfold then refold an archive in place
    Refold { tote: PathBuf },
    /// Unfold an archive in place
    Unfold { tote: PathBuf },
    /// Save files and merge their items into an archive
    Add {
        tote: PathBuf,
        file: Vec<PathBuf>,
        /// Recursively descend into directories
        #[arg(long)]
        recursive: bool,
    },
    /// Re-save changed files recorded in an archive
    Refresh { tote: PathBuf },
    /// Show what a checkin would change
    Status,
    /// Take a snapshot of the workspace
    Checkin,
    /// Materialize an archive's items into a directory
    Extract {
        tote: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Copy one blob to stdout
    BlobCat { data: String },
    /// Print the workdir and its store configuration
    ShowWorkdir { path: Option<PathBuf> },
    /// Import every blob from another store directory
    ImportBlobs { path: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        // ── Put ──────────────────────────────────────────────────────────────
        Commands::Put { path, recursive } => {
            let store = WorkDir::attach(None)?.store();
            let mut out = io::stdout().lock();
            if path.is_empty() {
                let saved = save_stream(io::stdin().lock(), &store)?;
                let value = serde_json::to_value(&saved)?;
                let item = Item::Stream(value.as_object().cloned().unwrap_or_default());
                out.write_all(to_stream(&item)?.as_bytes())?;
            } else {
                for file in walk_roots(path, recursive) {
                    let item = save_file(&file, &store)?;
                    out.write_all(to_stream(&item)?.as_bytes())?;
                }
            }
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { tote } => {
            let store = WorkDir::attach(None)?.store();
            let mut out = io::stdout().lock();
            if tote.is_empty() {
                cat_items(ItemReader::new(io::stdin().lock()), &store, &mut out)?;
            } else {
                for path in &tote {
                    let f = std::fs::File::open(path)?;
                    cat_items(ItemReader::new(BufReader::new(f)), &store, &mut out)?;
                }
            }
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { path, one_filesystem } => {
            for root in path {
                let ignore = Ignore::new(&root);
                let opts = WalkOptions {
                    recursive: true,
                    one_filesystem,
                };
                for found in treescan(vec![root.clone()], Some(&ignore), opts) {
                    println!("{}", found.display());
                }
            }
        }

        // ── Append ───────────────────────────────────────────────────────────
        Commands::Append { tote, file, recursive } => {
            let store = WorkDir::attach(None)?.store();
            let f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&tote)?;
            let mut writer = ItemWriter::new(f);
            for path in walk_roots(file, recursive) {
                let item = save_file(&path, &store)?;
                writer.write(&item)?;
                println!("append {}", path.display());
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { tote } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            for item in unfold(items, &store)? {
                let item = item?;
                let size = item
                    .size()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{} {} {}", item.type_name(), size, item.name().unwrap_or("-"));
            }
        }

        // ── Pipes ────────────────────────────────────────────────────────────
        Commands::FoldPipe { tote } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            print_stream(fold(items.into_iter().map(Ok), &store))?;
        }
        Commands::RefoldPipe { tote } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            let unfolded = unfold(items, &store)?;
            print_stream(fold(unfolded, &store))?;
        }
        Commands::UnfoldPipe { tote } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            print_stream(unfold(items, &store)?)?;
        }

        // ── In-place refold / unfold ─────────────────────────────────────────
        Commands::Refold { tote } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            let unfolded: Vec<Item> = unfold(items, &store)?.collect::<tote::Result<_>>()?;
            replace_archive(&tote, &store, fold(unfolded.into_iter().map(Ok), &store))?;
            println!("refolded {}", tote.display());
        }
        Commands::Unfold { tote } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            let unfolded: Vec<Item> = unfold(items, &store)?.collect::<tote::Result<_>>()?;
            replace_archive(&tote, &store, unfolded.into_iter().map(Ok))?;
            println!("unfolded {}", tote.display());
        }

        // ── Add ──────────────────────────────────────────────────────────────
        Commands::Add { tote, file, recursive } => {
            let store = WorkDir::attach(None)?.store();
            let existing = if tote.exists() { read_items(&tote)? } else { Vec::new() };
            let existing: Vec<Item> = unfold(existing, &store)?.collect::<tote::Result<_>>()?;

            let mut added = Vec::new();
            for path in walk_roots(file, recursive) {
                let item = save_file(&path, &store)?;
                println!("add {}", path.display());
                added.push((item.key()?, item));
            }
            added.sort_by(|x, y| x.0.cmp(&y.0));
            let added = added.into_iter().map(|(_, item)| Ok(item));

            // Freshly added names replace existing ones.
            let merged = merge_sorted(existing.into_iter().map(Ok), added)
                .filter_map(|pair| match pair {
                    Ok((a, b)) => b.or(a).map(Ok),
                    Err(e) => Some(Err(e)),
                });
            replace_archive(&tote, &store, fold(merged, &store))?;
        }

        // ── Refresh ──────────────────────────────────────────────────────────
        Commands::Refresh { tote } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            let refreshed: Vec<Item> = unfold(items, &store)?
                .map(|item| refresh_item(item?, &store))
                .collect::<tote::Result<_>>()?;
            replace_archive(&tote, &store, fold(refreshed.into_iter().map(Ok), &store))?;
            println!("refreshed {}", tote.display());
        }

        // ── Status ───────────────────────────────────────────────────────────
        Commands::Status => {
            let wd = WorkDir::attach(None)?;
            let ignore = wd.ignore();
            let store = wd.store();
            for change in checkin_status(wd.path(), &ignore, &store)? {
                println!("{}", change?);
            }
        }

        // ── Checkin ──────────────────────────────────────────────────────────
        Commands::Checkin => {
            let wd = WorkDir::attach(None)?;
            let ignore = wd.ignore();
            let store = wd.store();

            run_hook(wd.path(), "checkin-pre")?;
            let items = checkin_save(wd.path(), &ignore, &store)?;
            let snapshot = write_checkin(wd.path(), &store, items)?;
            if let Err(e) = run_hook(wd.path(), "checkin-post") {
                tracing::warn!("checkin-post: {e}");
            }
            println!("checkin {}", snapshot.display());
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { tote, output_dir } => {
            let store = WorkDir::attach(None)?.store();
            let items = read_items(&tote)?;
            if !output_dir.exists() {
                std::fs::create_dir_all(&output_dir)?;
            }
            for item in unfold(items, &store)? {
                extract_file(&item?, &store, &output_dir)?;
            }
            println!("extracted to {}", output_dir.display());
        }

        // ── Blob access ──────────────────────────────────────────────────────
        Commands::BlobCat { data } => {
            let store = WorkDir::attach(None)?.store();
            let blob = store.load(&data)?;
            io::stdout().lock().write_all(&blob)?;
        }

        // ── Show workdir ─────────────────────────────────────────────────────
        Commands::ShowWorkdir { path } => {
            let wd = WorkDir::attach(path.as_deref())?;
            println!("path = {}", wd.path().display());
            println!(
                "store.path = {}",
                wd.config().get("store", "path").unwrap_or("(unset)")
            );
            println!("store = {}", wd.store().path().display());
        }

        // ── Import blobs ─────────────────────────────────────────────────────
        Commands::ImportBlobs { path } => {
            let store = WorkDir::attach(None)?.store();
            let imported = store.import_blobs(&path)?;
            println!("imported {imported} blob(s) from {}", path.display());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or(default);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Walk each root in turn, with ignore rules rooted at that root.
fn walk_roots(roots: Vec<PathBuf>, recursive: bool) -> impl Iterator<Item = PathBuf> {
    roots.into_iter().flat_map(move |root| {
        let ignore = Ignore::new(&root);
        let opts = WalkOptions {
            recursive,
            ..Default::default()
        };
        treescan(vec![root], Some(&ignore), opts)
            .collect::<Vec<_>>()
            .into_iter()
    })
}

fn cat_items<I, W>(items: I, store: &FileStore, out: &mut W) -> tote::Result<()>
where
    I: Iterator<Item = tote::Result<Item>>,
    W: Write,
{
    for item in items {
        let item = item?;
        for slice in load_content(&item, store)? {
            out.write_all(&slice?)?;
        }
    }
    Ok(())
}

fn print_stream<I: Iterator<Item = tote::Result<Item>>>(items: I) -> tote::Result<()> {
    let mut out = io::stdout().lock();
    for item in items {
        out.write_all(to_stream(&item?)?.as_bytes())?;
    }
    Ok(())
}

/// One archive item re-checked against the filesystem: unchanged items keep
/// their cached content, changed files are re-saved, everything else takes
/// its fresh shape.
fn refresh_item(old: Item, store: &FileStore) -> tote::Result<Item> {
    let Some(name) = old.name().map(str::to_owned) else {
        return Ok(old);
    };
    let path = PathBuf::from(&name);
    let fresh = stat_item(&path, &name);
    let unchanged = old.type_name() == fresh.type_name()
        && old.size() == fresh.size()
        && old.mtime() == fresh.mtime();
    if unchanged {
        return Ok(old);
    }
    let mut fresh = fresh;
    fill_content(&mut fresh, &path, store)?;
    tracing::info!("refresh {name}");
    Ok(fresh)
}
