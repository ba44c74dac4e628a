use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gridvault_project::{Compression, ProjectId, ProjectMetadata, WorkspaceManager};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "gridvault",
    about = "Manage gridvault workspaces and their projects",
    author,
    version
)]
struct Cli {
    /// 指定工作區根目錄；預設為目前目錄。 / Workspace root (defaults to current directory).
    #[arg(long, global = true, value_name = "PATH", env = "GRIDVAULT_WORKSPACE")]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出已登記的專案。 / List registered projects.
    List,
    /// 建立新專案。 / Create a new project.
    Create(CreateArgs),
    /// 刪除專案與其資料夾。 / Delete a project and its directory.
    Delete(DeleteArgs),
    /// 由封存檔匯入專案。 / Import a project from an archive.
    Import(ImportArgs),
    /// 將專案匯出為封存檔。 / Export a project to an archive.
    Export(ExportArgs),
    /// 讀寫工作區偏好設定。 / Read or change workspace preferences.
    #[command(subcommand)]
    Prefs(PrefsCommand),
    /// 管理最近使用的運算式。 / Manage the recent-expression history.
    #[command(subcommand)]
    Expressions(ExpressionsCommand),
}

#[derive(Args)]
struct CreateArgs {
    /// 專案名稱。 / Project name.
    name: String,
    /// 專案標籤，可重複指定。 / Tag to attach; may be repeated.
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
}

#[derive(Args)]
struct DeleteArgs {
    /// 專案代號。 / Project identifier.
    id: ProjectId,
}

#[derive(Args)]
struct ImportArgs {
    /// 封存檔路徑。 / Archive to read.
    #[arg(value_name = "FILE")]
    input: PathBuf,
    /// 指定專案代號；預設配置新代號。 / Identifier to import under; a fresh one is allocated when omitted.
    #[arg(long)]
    id: Option<ProjectId>,
    /// 以 gzip 解壓縮；預設依副檔名判斷。 / Treat the archive as gzip; inferred from the extension when omitted.
    #[arg(long)]
    gzip: bool,
}

#[derive(Args)]
struct ExportArgs {
    /// 專案代號。 / Project identifier.
    id: ProjectId,
    /// 輸出檔案路徑。 / Destination archive path.
    #[arg(long, value_name = "FILE")]
    output: PathBuf,
    /// 以 gzip 壓縮；預設依副檔名判斷。 / Compress with gzip; inferred from the extension when omitted.
    #[arg(long)]
    gzip: bool,
}

#[derive(Subcommand)]
enum PrefsCommand {
    /// 顯示偏好設定值。 / Print a preference as JSON.
    Get {
        key: String,
    },
    /// 以 JSON 設定偏好值。 / Set a preference from a JSON value.
    Set {
        key: String,
        #[arg(value_name = "JSON")]
        value: String,
    },
    /// 移除偏好設定。 / Remove a preference.
    Unset {
        key: String,
    },
}

#[derive(Subcommand)]
enum ExpressionsCommand {
    /// 將運算式加到清單頂端。 / Promote an expression to the top of the history.
    Add {
        expression: String,
    },
    /// 列出最近的運算式（新到舊）。 / List recent expressions, newest first.
    List,
}

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let Cli { workspace, command } = Cli::parse();
    let workspace_root = resolve_workspace(workspace)?;
    let manager = WorkspaceManager::open(&workspace_root)
        .with_context(|| format!("failed to open workspace {}", workspace_root.display()))?;
    debug!(root = %workspace_root.display(), "workspace ready");

    match command {
        Commands::List => list_projects(&manager),
        Commands::Create(args) => create_project(&manager, args),
        Commands::Delete(args) => delete_project(&manager, args),
        Commands::Import(args) => import_project(&manager, args),
        Commands::Export(args) => export_project(&manager, args),
        Commands::Prefs(command) => execute_prefs_command(&manager, command),
        Commands::Expressions(command) => execute_expressions_command(&manager, command),
    }
}

fn list_projects(manager: &WorkspaceManager) -> Result<()> {
    let projects = manager.projects();
    if projects.is_empty() {
        println!("No projects registered");
        return Ok(());
    }
    for (id, metadata) in projects {
        if metadata.tags.is_empty() {
            println!("{id}\t{}", metadata.name);
        } else {
            println!("{id}\t{}\t[{}]", metadata.name, metadata.tags.join(", "));
        }
    }
    Ok(())
}

fn create_project(manager: &WorkspaceManager, args: CreateArgs) -> Result<()> {
    let mut metadata = ProjectMetadata::new(args.name);
    metadata.tags = args.tags;
    let id = manager
        .create_project(metadata)
        .context("failed to create project")?;
    println!("Created project {id}");
    Ok(())
}

fn delete_project(manager: &WorkspaceManager, args: DeleteArgs) -> Result<()> {
    let removed = manager
        .delete_project(args.id)
        .with_context(|| format!("failed to delete project {}", args.id))?;
    if !removed {
        bail!("project {} is not registered", args.id);
    }
    println!("Deleted project {}", args.id);
    Ok(())
}

fn import_project(manager: &WorkspaceManager, args: ImportArgs) -> Result<()> {
    let input = resolve_input_path(&args.input)?;
    let file =
        File::open(&input).with_context(|| format!("failed to open {}", input.display()))?;
    let compression = compression_for(&input, args.gzip);
    let id = match args.id {
        Some(id) => id,
        None => manager
            .reserve_project_id()
            .context("failed to allocate a project id")?,
    };

    match manager.import_project(id, BufReader::new(file), compression) {
        Ok(summary) => {
            println!(
                "Imported project {id} ({} files, {} bytes)",
                summary.files, summary.bytes
            );
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup) = manager.discard_project_dir(id) {
                debug!(project_id = %id, %cleanup, "failed to discard partial import");
            }
            Err(err).with_context(|| format!("failed to import {}", input.display()))
        }
    }
}

fn export_project(manager: &WorkspaceManager, args: ExportArgs) -> Result<()> {
    let output = resolve_input_path(&args.output)?;
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let compression = compression_for(&output, args.gzip);
    let file =
        File::create(&output).with_context(|| format!("failed to create {}", output.display()))?;

    let written = manager
        .export_project(args.id, BufWriter::new(file), compression)
        .map_err(anyhow::Error::from)
        .and_then(|mut writer| writer.flush().map_err(anyhow::Error::from));
    if let Err(err) = written {
        let _ = fs::remove_file(&output);
        return Err(err).with_context(|| format!("failed to export project {}", args.id));
    }
    println!("Exported project {} to {}", args.id, output.display());
    Ok(())
}

fn execute_prefs_command(manager: &WorkspaceManager, command: PrefsCommand) -> Result<()> {
    match command {
        PrefsCommand::Get { key } => {
            let Some(value) = manager.preference(&key) else {
                bail!("preference '{key}' is not set");
            };
            println!("{}", serde_json::to_string_pretty(&value.to_json())?);
        }
        PrefsCommand::Set { key, value } => {
            manager
                .set_preference_json(&key, &value)
                .with_context(|| format!("failed to set preference '{key}'"))?;
            println!("Set preference '{key}'");
        }
        PrefsCommand::Unset { key } => {
            let removed = manager
                .remove_preference(&key)
                .with_context(|| format!("failed to remove preference '{key}'"))?;
            if removed.is_none() {
                bail!("preference '{key}' is not set");
            }
            println!("Removed preference '{key}'");
        }
    }
    Ok(())
}

fn execute_expressions_command(
    manager: &WorkspaceManager,
    command: ExpressionsCommand,
) -> Result<()> {
    match command {
        ExpressionsCommand::Add { expression } => {
            manager
                .add_expression(expression)
                .context("failed to record expression")?;
        }
        ExpressionsCommand::List => {
            for expression in manager.expressions() {
                println!("{expression}");
            }
        }
    }
    Ok(())
}

fn compression_for(path: &Path, gzip: bool) -> Compression {
    if gzip {
        Compression::Gzip
    } else {
        Compression::from_path(path)
    }
}

fn resolve_workspace(workspace: Option<PathBuf>) -> Result<PathBuf> {
    match workspace {
        Some(path) => resolve_input_path(&path),
        None => std::env::current_dir().context("determine current directory"),
    }
}

fn resolve_input_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("determine current directory")?
            .join(path))
    }
}
