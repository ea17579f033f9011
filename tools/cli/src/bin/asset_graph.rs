use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use asset_graph::{
    decode_envelope, register_scene_types, AssetData, AssetMetadata, BlobStore, CodecRegistry,
    DirectoryStore, ObjectId, Project, ProjectConfig, RecordStream, StreamKind, World,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(author, version, about = "Asset graph project inspector")]
struct Cli {
    /// Project directory holding `project.toml` and the blob folders.
    #[arg(long, default_value = ".")]
    store: PathBuf,
    /// Raise log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every asset of the project.
    List,
    /// Print one asset's metadata and a summary of its data.
    Show { id: ObjectId },
    /// Print the assets and imports an asset depends on.
    Deps {
        id: ObjectId,
        #[arg(long, default_value_t = false)]
        transitive: bool,
    },
    /// Print the variant chain of an asset, nearest first.
    Chain { id: ObjectId },
    /// Write the effective records of a graph or variant.
    Dump {
        id: ObjectId,
        #[arg(long, value_enum, default_value_t = DumpFormat::Json)]
        format: DumpFormat,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Decode every blob in the store and check every chain.
    Verify,
    /// Print the JSON schema of `project.toml`.
    ConfigSchema,
}

#[derive(Clone, Copy, ValueEnum)]
enum DumpFormat {
    Json,
    Yaml,
}

#[derive(Serialize)]
struct DumpEnvelope<'a> {
    asset: ObjectId,
    chain: Vec<ObjectId>,
    records: &'a RecordStream,
}

type DiskProject = Project<World, DirectoryStore>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Command::ConfigSchema => print_schema(),
        Command::Verify => verify_store(&cli.store),
        command => {
            let project = open(&cli.store)?;
            match command {
                Command::List => list_assets(&project),
                Command::Show { id } => show_asset(&project, id),
                Command::Deps { id, transitive } => print_deps(&project, id, transitive),
                Command::Chain { id } => print_chain(&project, id),
                Command::Dump { id, format, output } => {
                    dump_asset(&project, id, format, output.as_deref())
                }
                Command::Verify | Command::ConfigSchema => Ok(()),
            }
        }
    }
}

fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open(dir: &Path) -> Result<DiskProject> {
    let config = ProjectConfig::load_or_default(dir)
        .with_context(|| format!("read config in {}", dir.display()))?;
    let store = DirectoryStore::new(dir).with_backups(config.storage.keep_backups);
    let mut world = World::new();
    let mut codecs = CodecRegistry::new();
    register_scene_types(&mut world, &mut codecs)?;
    let project = Project::open(world, store, codecs, config)
        .with_context(|| format!("open project in {}", dir.display()))?;
    Ok(project)
}

fn list_assets(project: &DiskProject) -> Result<()> {
    for asset in project.assets() {
        let parent = asset
            .parent
            .map(|parent| parent.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {:<8} {:<24} parent={parent}",
            asset.id,
            asset.kind.label(),
            asset.name
        );
    }
    Ok(())
}

fn show_asset(project: &DiskProject, id: ObjectId) -> Result<()> {
    let metadata = project.metadata(id)?;
    println!("{}", serde_json::to_string_pretty(metadata)?);
    let bytes = project.store().read(id, StreamKind::Data)?;
    match decode_envelope::<AssetData>(&bytes)? {
        AssetData::Graph(stream) => {
            println!("graph: {} records", stream.len());
            print!("{}", stream.summary());
        }
        AssetData::Variant(delta) | AssetData::Instance(delta) => {
            println!(
                "delta: {} overrides, {} added records",
                delta.overrides.len(),
                delta.added.len()
            );
            for record in delta.overrides.records() {
                println!("  {} field {}", record.part, record.field);
            }
            print!("{}", delta.added.summary());
        }
    }
    Ok(())
}

fn print_deps(project: &DiskProject, id: ObjectId, transitive: bool) -> Result<()> {
    let ids: BTreeSet<ObjectId> = if transitive {
        project.dependency_closure(id)?
    } else {
        project.dependencies(id)?.clone()
    };
    let metadata = project.metadata(id)?;
    for dependency in ids {
        match (metadata.import_key(dependency), project.metadata(dependency)) {
            (Some(key), _) => println!("{dependency}  import {key}"),
            (None, Ok(asset)) => println!("{dependency}  {} {}", asset.kind, asset.name),
            (None, Err(_)) => println!("{dependency}  (missing)"),
        }
    }
    Ok(())
}

fn print_chain(project: &DiskProject, id: ObjectId) -> Result<()> {
    for link in project.chain_of(id)? {
        let asset = project.metadata(link)?;
        println!("{link}  {} {}", asset.kind, asset.name);
    }
    Ok(())
}

fn dump_asset(
    project: &DiskProject,
    id: ObjectId,
    format: DumpFormat,
    output: Option<&Path>,
) -> Result<()> {
    let chain = project.load_chain(id)?;
    let records = chain.effective();
    let envelope = DumpEnvelope {
        asset: id,
        chain: chain.ids(),
        records: &records,
    };
    let text = match format {
        DumpFormat::Json => serde_json::to_string_pretty(&envelope)?,
        DumpFormat::Yaml => serde_yaml::to_string(&envelope)?,
    };
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
            info!(asset = %id, path = %path.display(), "dumped asset");
        }
        None => println!("{text}"),
    }
    Ok(())
}

const BLOB_DIRS: [&str; 3] = ["meta", "data", "thumb"];

fn verify_store(dir: &Path) -> Result<()> {
    let store = DirectoryStore::new(dir);
    let mut problems = 0usize;
    let mut blobs = 0usize;
    let mut stored = BTreeSet::new();
    for entry in WalkDir::new(dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        let in_blob_dir = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|name| name.to_str())
            .is_some_and(|name| BLOB_DIRS.contains(&name));
        if !path.is_file() || !in_blob_dir {
            continue;
        }
        if !store.is_blob_path(path) {
            if path.extension().and_then(|ext| ext.to_str()) != Some("bak") {
                problems += 1;
                println!("ORPHAN {}", path.display());
            }
            continue;
        }
        blobs += 1;
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let outcome = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => AssetMetadata::from_json(&bytes).map(|_| ()),
            Some("agd") => decode_envelope::<AssetData>(&bytes).map(|_| ()),
            _ => Ok(()),
        };
        if let Err(err) = outcome {
            problems += 1;
            warn!(path = %path.display(), %err, "blob does not decode");
            println!("BAD    {}: {err}", path.display());
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<ObjectId>().ok())
        {
            stored.insert(id);
        }
    }

    let project = open(dir)?;
    for id in &stored {
        if project.metadata(*id).is_err() {
            problems += 1;
            println!("ORPHAN blobs of {id} have no metadata");
        }
    }
    for asset in project.assets() {
        if let Err(err) = project.chain_of(asset.id) {
            problems += 1;
            println!("BAD    chain of {}: {err}", asset.id);
        }
        if !project.store().exists(asset.id, StreamKind::Data) {
            problems += 1;
            println!("BAD    {} has no data blob", asset.id);
        }
        for dependency in &asset.dependencies {
            if asset.import_key(*dependency).is_none() && project.metadata(*dependency).is_err() {
                problems += 1;
                println!("MISSING {} depends on unknown {dependency}", asset.id);
            }
        }
    }
    info!(blobs, problems, "verified store");
    println!("checked {blobs} blobs, {problems} problems");
    if problems > 0 {
        anyhow::bail!("store verification failed");
    }
    Ok(())
}

fn print_schema() -> Result<()> {
    let schema = ProjectConfig::json_schema();
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
