//! hidevault CLI - Command line front end for the hidden vault engine.
//!
//! Folders are addressed by name (or numeric id), files by the numeric id
//! shown by `list`. Every command that touches folder contents asks for the
//! folder password.

use anyhow::{Context, Result};
use bytesize::ByteSize;
use clap::{CommandFactory, Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use hidevault_common::{Error, FileId, FolderId};
use hidevault_crypto::KdfParams;
use hidevault_storage::FolderRecord;
use hidevault_vault::{
    EngineConfig, FileSource, ImportRequest, TempCacheManager, VaultManager, CONFIG_FILENAME,
    DEFAULT_MIME_TYPE,
};

#[derive(Parser)]
#[command(name = "hidevault")]
#[command(about = "hidevault - Password-protected encrypted media folders")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Vault root directory (default: platform data directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Engine configuration file (overrides --root).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a password-protected folder.
    CreateFolder {
        /// Folder name.
        name: String,

        /// Parent folder (name or id).
        #[arg(short, long)]
        parent: Option<String>,

        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(short, long)]
        strength: Option<String>,
    },

    /// Check a folder password.
    Check {
        /// Folder name or id.
        folder: String,
    },

    /// Import files into a folder.
    Import {
        /// Folder name or id.
        folder: String,

        /// Files to import.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Mime type to record (default: guessed from the extension).
        #[arg(short, long)]
        mime: Option<String>,
    },

    /// List folders, or the files of one folder.
    List {
        /// Folder name or id. Lists top-level folders when omitted.
        folder: Option<String>,
    },

    /// Decrypt a file to a temporary copy and open it in the system viewer.
    Open {
        /// File id.
        file: FileId,
    },

    /// Decrypt a file to a chosen location.
    Extract {
        /// File id.
        file: FileId,

        /// Destination file path.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Delete a file.
    Rm {
        /// File id.
        file: FileId,
    },

    /// Delete a folder with all its subfolders and files.
    Rmdir {
        /// Folder name or id.
        folder: String,
    },

    /// Change a folder password.
    Passwd {
        /// Folder name or id.
        folder: String,
    },

    /// Remove leftover decrypted copies from the scratch directory.
    Clean,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = resolve_config(cli.root.as_deref(), cli.config.as_deref())?;

    let result = run(cli.command, config).await;
    if let Some(hint) = result.as_ref().err().and_then(retry_hint) {
        eprintln!("{}", hint);
    }
    result
}

async fn run(command: Commands, config: EngineConfig) -> Result<()> {
    match command {
        Commands::CreateFolder {
            name,
            parent,
            strength,
        } => cmd_create_folder(config, &name, parent.as_deref(), strength.as_deref()).await,

        Commands::Check { folder } => cmd_check(&config, &folder).await,

        Commands::Import {
            folder,
            files,
            mime,
        } => cmd_import(&config, &folder, files, mime.as_deref()).await,

        Commands::List { folder } => cmd_list(&config, folder.as_deref()).await,

        Commands::Open { file } => cmd_open(&config, file).await,

        Commands::Extract { file, output } => cmd_extract(&config, file, &output).await,

        Commands::Rm { file } => cmd_rm(&config, file).await,

        Commands::Rmdir { folder } => cmd_rmdir(&config, &folder).await,

        Commands::Passwd { folder } => cmd_passwd(&config, &folder).await,

        Commands::Clean => cmd_clean(&config),

        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "hidevault", &mut io::stdout());
            Ok(())
        }
    }
}

/// Work out the engine configuration from the command line.
fn resolve_config(root: Option<&Path>, config: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = config {
        return EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()));
    }

    let root = match root {
        Some(root) => root.to_path_buf(),
        None => dirs::data_local_dir()
            .context("Could not determine the local data directory; pass --root")?
            .join("hidevault"),
    };

    let config_path = root.join(CONFIG_FILENAME);
    if config_path.exists() {
        EngineConfig::load(&config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))
    } else {
        Ok(EngineConfig::with_root(root))
    }
}

fn open_engine(config: &EngineConfig) -> Result<VaultManager> {
    VaultManager::open(config).context("Failed to open vault")
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

/// Prompt for a new password twice.
fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = prompt_password(prompt)?;
    let confirm = prompt_password("Confirm password: ")?;

    if *password != *confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

/// Resolve a folder by name, falling back to a numeric id.
async fn resolve_folder(engine: &VaultManager, folder: &str) -> Result<FolderRecord> {
    match engine.find_folder(folder).await {
        Ok(record) => Ok(record),
        Err(Error::NotFound(_)) => {
            let id: FolderId = folder
                .parse()
                .with_context(|| format!("No folder named '{}'", folder))?;
            engine
                .storage()
                .folder(id)
                .await
                .with_context(|| format!("No folder named '{}'", folder))
        }
        Err(e) => Err(e).context("Failed to look up folder"),
    }
}

/// Ask for a folder password and fail unless it is correct.
async fn require_password(
    engine: &VaultManager,
    folder: &FolderRecord,
) -> Result<Zeroizing<String>> {
    let password = prompt_password(&format!("Password for '{}': ", folder.name))?;
    if !engine
        .unlock_check(folder.id, password.as_bytes())
        .await
        .context("Failed to check password")?
    {
        anyhow::bail!("Wrong password");
    }
    Ok(password)
}

/// Guess a mime type from a file extension.
fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "bmp" => "image/bmp",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// Remove a partially written plaintext file, reporting when that fails.
fn discard_partial_output(output: &Path) -> bool {
    match std::fs::remove_file(output) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to remove partial output");
            eprintln!("Warning: partial plaintext left at {}", output.display());
            false
        }
    }
}

/// Hint printed after a failure that may go away on its own.
fn retry_hint(err: &anyhow::Error) -> Option<&'static str> {
    err.downcast_ref::<Error>()
        .filter(|e| e.is_retryable())
        .map(|_| "This looks temporary; try the command again.")
}

/// Create a folder.
async fn cmd_create_folder(
    mut config: EngineConfig,
    name: &str,
    parent: Option<&str>,
    strength: Option<&str>,
) -> Result<()> {
    if let Some(strength) = strength {
        config.kdf_params = KdfParams::from_preset(strength)?;
    }

    let engine = open_engine(&config)?;
    let parent = match parent {
        Some(parent) => Some(resolve_folder(&engine, parent).await?.id),
        None => None,
    };

    let password = prompt_new_password("Folder password: ")?;
    let id = engine
        .create_folder(name, password.as_bytes(), parent)
        .await
        .context("Failed to create folder")?;

    println!("Folder created: {} (id {})", name, id);
    Ok(())
}

/// Check a folder password.
async fn cmd_check(config: &EngineConfig, folder: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let folder = resolve_folder(&engine, folder).await?;

    let password = prompt_password(&format!("Password for '{}': ", folder.name))?;
    let ok = engine
        .unlock_check(folder.id, password.as_bytes())
        .await
        .context("Failed to check password")?;

    if ok {
        println!("Password accepted.");
        Ok(())
    } else {
        anyhow::bail!("Wrong password")
    }
}

/// Import files.
async fn cmd_import(
    config: &EngineConfig,
    folder: &str,
    files: Vec<PathBuf>,
    mime: Option<&str>,
) -> Result<()> {
    let engine = open_engine(config)?;
    let folder = resolve_folder(&engine, folder).await?;
    let password = prompt_password(&format!("Password for '{}': ", folder.name))?;

    let requests = files
        .iter()
        .map(|path| {
            let display_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let mime_type = mime.unwrap_or_else(|| guess_mime(path));
            ImportRequest::new(FileSource::new(path), display_name, mime_type)
        })
        .collect();

    let report = engine
        .import_batch(folder.id, password.as_bytes(), requests)
        .await
        .context("Import failed")?;

    for imported in &report.imported {
        println!(
            "  [OK]   {} (id {}, {})",
            imported.display_name,
            imported.file_id,
            ByteSize(imported.size)
        );
    }
    for failure in &report.failed {
        println!("  [FAIL] {}: {}", failure.display_name, failure.error);
    }
    println!(
        "Imported {} of {} file(s).",
        report.imported.len(),
        files.len()
    );

    if !report.is_complete() {
        anyhow::bail!("{} file(s) failed to import", report.failed.len());
    }
    Ok(())
}

/// List folders or files.
async fn cmd_list(config: &EngineConfig, folder: Option<&str>) -> Result<()> {
    let engine = open_engine(config)?;

    let Some(folder) = folder else {
        let folders = engine.list_folders(None).await?;
        if folders.is_empty() {
            println!("No folders.");
        }
        for folder in folders {
            println!("  [DIR]  {} (id {})", folder.name, folder.id);
        }
        return Ok(());
    };

    let folder = resolve_folder(&engine, folder).await?;
    require_password(&engine, &folder).await?;

    let children = engine.list_folders(Some(folder.id)).await?;
    let files = engine.list_files(folder.id).await?;

    if children.is_empty() && files.is_empty() {
        println!("Folder is empty.");
        return Ok(());
    }

    println!("Contents of {}:", folder.name);
    for child in children {
        println!("  [DIR]  {} (id {})", child.name, child.id);
    }
    for file in files {
        println!(
            "  [FILE] {:>6}  {}  {:>10}  {}  {}",
            file.id,
            file.created_at.format("%Y-%m-%d %H:%M"),
            ByteSize(file.file_size).to_string(),
            file.mime_type,
            file.original_file_name
        );
    }
    Ok(())
}

/// Open a file in the system viewer.
async fn cmd_open(config: &EngineConfig, file: FileId) -> Result<()> {
    let engine = open_engine(config)?;
    let record = engine.storage().file(file).await.context("Unknown file")?;
    let folder = engine.storage().folder(record.folder_id).await?;

    let password = prompt_password(&format!("Password for '{}': ", folder.name))?;
    let artifact = engine
        .open_file(file, password.as_bytes())
        .await
        .context("Failed to open file")?;

    let viewer = open::that(artifact.path()).context("Failed to launch viewer");
    if viewer.is_ok() {
        println!("Opened {}. Press Enter when done viewing.", record.original_file_name);
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            io::stdin().read_line(&mut line).map(|_| ())
        })
        .await?
        .context("Failed to read from stdin")?;
    }

    engine
        .release_artifact(&artifact)
        .context("Failed to remove temporary copy")?;
    engine.shutdown()?;
    viewer
}

/// Decrypt a file to disk.
async fn cmd_extract(config: &EngineConfig, file: FileId, output: &Path) -> Result<()> {
    let engine = open_engine(config)?;
    let record = engine.storage().file(file).await.context("Unknown file")?;
    let folder = engine.storage().folder(record.folder_id).await?;

    let password = prompt_password(&format!("Password for '{}': ", folder.name))?;
    let unlocked = engine
        .storage()
        .unlock_file(file, password.as_bytes())
        .await
        .context("Failed to unlock file")?;

    let out = File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let result = engine
        .storage()
        .decrypt_to(unlocked, BufWriter::new(out))
        .await;

    match result {
        Ok(writer) => {
            if let Err(e) = writer.into_inner() {
                discard_partial_output(output);
                return Err(e.into_error()).context("Failed to write output file");
            }
        }
        Err(e) => {
            discard_partial_output(output);
            return Err(e).context("Failed to decrypt file");
        }
    }

    info!(file_id = %file, "File extracted");
    println!(
        "File extracted: {} ({})",
        output.display(),
        ByteSize(record.file_size)
    );
    Ok(())
}

/// Delete a file.
async fn cmd_rm(config: &EngineConfig, file: FileId) -> Result<()> {
    let engine = open_engine(config)?;
    let record = engine.storage().file(file).await.context("Unknown file")?;
    let folder = engine.storage().folder(record.folder_id).await?;
    require_password(&engine, &folder).await?;

    engine
        .delete_file(file)
        .await
        .context("Failed to delete file")?;

    println!("File removed: {}", record.original_file_name);
    Ok(())
}

/// Delete a folder tree.
async fn cmd_rmdir(config: &EngineConfig, folder: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let folder = resolve_folder(&engine, folder).await?;
    require_password(&engine, &folder).await?;

    engine
        .delete_folder(folder.id)
        .await
        .context("Failed to delete folder")?;

    println!("Folder removed: {}", folder.name);
    Ok(())
}

/// Change a folder password.
async fn cmd_passwd(config: &EngineConfig, folder: &str) -> Result<()> {
    let engine = open_engine(config)?;
    let folder = resolve_folder(&engine, folder).await?;

    let old_password = prompt_password(&format!("Current password for '{}': ", folder.name))?;
    let new_password = prompt_new_password("New password: ")?;

    engine
        .change_password(folder.id, old_password.as_bytes(), new_password.as_bytes())
        .await
        .context("Failed to change password")?;

    println!("Password changed successfully!");
    Ok(())
}

/// Sweep the scratch directory.
fn cmd_clean(config: &EngineConfig) -> Result<()> {
    config.validate()?;
    let cache = TempCacheManager::new(&config.scratch_dir, &config.storage_root)?;
    let removed = cache
        .cleanup_all()
        .context("Failed to clean scratch directory")?;

    println!("Removed {} temporary file(s).", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("clip.mov")), "video/quicktime");
        assert_eq!(guess_mime(Path::new("noext")), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_discard_partial_output() {
        let temp = TempDir::new().unwrap();
        let partial = temp.path().join("photo.jpg");
        std::fs::write(&partial, b"half").unwrap();

        assert!(discard_partial_output(&partial));
        assert!(!partial.exists());

        // A directory cannot be removed as a file; the failure is reported.
        let blocked = temp.path().join("blocked");
        std::fs::create_dir(&blocked).unwrap();
        assert!(!discard_partial_output(&blocked));
        assert!(blocked.exists());
    }

    #[test]
    fn test_retry_hint() {
        let timeout = anyhow::Error::from(Error::Timeout("slow disk".to_string()))
            .context("Import failed");
        assert!(retry_hint(&timeout).is_some());

        let wrong = anyhow::Error::from(Error::Unauthorized("folder 1".to_string()));
        assert!(retry_hint(&wrong).is_none());

        assert!(retry_hint(&anyhow::anyhow!("Passwords do not match")).is_none());
    }

    #[test]
    fn test_resolve_config_from_root() {
        let temp = TempDir::new().unwrap();
        let config = resolve_config(Some(temp.path()), None).unwrap();
        assert_eq!(config, EngineConfig::with_root(temp.path()));

        let mut saved = EngineConfig::with_root(temp.path());
        saved.chunk_size = 4096;
        saved.save(temp.path().join(CONFIG_FILENAME)).unwrap();
        let config = resolve_config(Some(temp.path()), None).unwrap();
        assert_eq!(config.chunk_size, 4096);
    }

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["hidevault", "import", "Private", "a.jpg", "b.mp4"]).unwrap();
        match cli.command {
            Commands::Import { folder, files, .. } => {
                assert_eq!(folder, "Private");
                assert_eq!(files.len(), 2);
            }
            _ => panic!("expected import"),
        }

        assert!(Cli::try_parse_from(["hidevault", "rm", "abc"]).is_err());
    }
}
