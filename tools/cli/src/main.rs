//! drivestash CLI - Command line interface for the drive client.
//!
//! This tool exposes the drive client operations a backup system relies on:
//! authorization, listing, upload, download and metadata changes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use drivestash_common::{DriveConfig, Error as DriveError};
use drivestash_drive::{
    authorization_url, CredentialsRecord, DriveClient, DriveFile, FileMetadata, FileSource,
    ARCHIVE_MIME_TYPE,
};

#[derive(Parser)]
#[command(name = "drivestash")]
#[command(about = "drivestash - Resilient drive storage client")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file (defaults apply when omitted).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the authorization URL for issuing new credentials.
    AuthUrl {
        /// Open the URL in the default browser.
        #[arg(long)]
        open: bool,

        /// Client id to authorize (default: the shipped client).
        #[arg(long)]
        client_id: Option<String>,

        /// Redirect URL registered for the client.
        #[arg(long, default_value = "urn:ietf:wg:oauth:2.0:oob")]
        redirect_url: String,
    },

    /// Store a credentials record issued by the authorization flow.
    SaveCredentials {
        /// JSON file holding the record.
        file: PathBuf,
    },

    /// Show a file's metadata.
    Get {
        /// File ID.
        id: String,
    },

    /// List files matching a query.
    List {
        /// Query expression.
        #[arg(short, long, default_value = "trashed = false")]
        query: String,
    },

    /// Upload a file with a resumable upload.
    Upload {
        /// Local file to upload.
        path: PathBuf,

        /// Remote file name.
        #[arg(short, long)]
        name: String,

        /// Parent folder ID.
        #[arg(short, long)]
        parent: Option<String>,

        /// Content type.
        #[arg(short, long, default_value = ARCHIVE_MIME_TYPE)]
        mime: String,
    },

    /// Download a file's content.
    Download {
        /// File ID.
        id: String,

        /// Destination file path.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Delete a file.
    Delete {
        /// File ID.
        id: String,
    },

    /// Create a folder.
    Mkdir {
        /// Folder name.
        name: String,

        /// Parent folder ID.
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Rename a file.
    Rename {
        /// File ID.
        id: String,

        /// New name.
        name: String,
    },

    /// Show which credentials are in use.
    Whoami,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    let result = run(cli.command, config).await;

    if let Err(err) = &result {
        let expired = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<DriveError>())
            .any(DriveError::needs_reauthorization);
        if expired {
            eprintln!("The stored credentials are no longer valid.");
            eprintln!("Run `drivestash auth-url` and save the new credentials to continue.");
        }
    }
    result
}

fn load_config(path: Option<&Path>) -> Result<DriveConfig> {
    match path {
        Some(path) => DriveConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(DriveConfig::default()),
    }
}

async fn run(command: Commands, config: DriveConfig) -> Result<()> {
    if let Commands::AuthUrl {
        open,
        client_id,
        redirect_url,
    } = &command
    {
        return cmd_auth_url(&config, client_id.as_deref(), redirect_url, *open);
    }

    let mut client = DriveClient::new(config).context("Failed to create drive client")?;

    match command {
        Commands::AuthUrl { .. } => Ok(()),
        Commands::SaveCredentials { file } => cmd_save_credentials(&client, &file).await,
        Commands::Get { id } => cmd_get(&client, &id).await,
        Commands::List { query } => cmd_list(&client, &query).await,
        Commands::Upload {
            path,
            name,
            parent,
            mime,
        } => cmd_upload(&mut client, &path, &name, parent, &mime).await,
        Commands::Download { id, output } => cmd_download(&client, &id, &output).await,
        Commands::Delete { id } => cmd_delete(&client, &id).await,
        Commands::Mkdir { name, parent } => cmd_mkdir(&client, &name, parent).await,
        Commands::Rename { id, name } => cmd_rename(&client, &id, &name).await,
        Commands::Whoami => cmd_whoami(&client).await,
    }
}

fn print_file(file: &DriveFile) {
    let kind = if file.is_folder() { "DIR " } else { "FILE" };
    let size = file
        .size_bytes()
        .map(|s| format!(" ({} bytes)", s))
        .unwrap_or_default();
    println!("  [{}] {} {}{}", kind, file.id, file.name, size);
}

/// Print the authorization URL.
fn cmd_auth_url(
    config: &DriveConfig,
    client_id: Option<&str>,
    redirect_url: &str,
    open_browser: bool,
) -> Result<()> {
    let client_id = client_id.unwrap_or(&config.default_client_id);
    let (url, state) = authorization_url(config, client_id, redirect_url)
        .context("Failed to build authorization URL")?;

    println!("Authorize drivestash by visiting:");
    println!("  {}", url);
    println!("State: {}", state);

    if open_browser {
        open::that(&url).context("Failed to open browser")?;
    }
    Ok(())
}

/// Persist a newly issued credentials record.
async fn cmd_save_credentials(client: &DriveClient, file: &Path) -> Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let record = CredentialsRecord::from_json(&contents).context("Invalid credentials record")?;

    client
        .save_credentials(&record)
        .await
        .context("Failed to save credentials")?;

    println!("Credentials saved.");
    Ok(())
}

async fn cmd_get(client: &DriveClient, id: &str) -> Result<()> {
    let file = client.get(id).await.context("Failed to get file")?;
    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}

async fn cmd_list(client: &DriveClient, query: &str) -> Result<()> {
    let files: Vec<DriveFile> = client
        .query(query)
        .try_collect()
        .await
        .context("Failed to list files")?;

    if files.is_empty() {
        println!("No matching files.");
    } else {
        println!("{} matching files:", files.len());
        for file in &files {
            print_file(file);
        }
    }
    Ok(())
}

async fn cmd_upload(
    client: &mut DriveClient,
    path: &Path,
    name: &str,
    parent: Option<String>,
    mime: &str,
) -> Result<()> {
    info!("Uploading {} as {}", path.display(), name);

    let mut source = FileSource::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut metadata = FileMetadata::new(name).with_mime_type(mime);
    if let Some(parent) = parent {
        metadata = metadata.with_parent(parent);
    }

    let file = client
        .create_and_wait(&mut source, metadata, mime, |fraction| {
            print!("\r  {:5.1}%", fraction * 100.0);
            let _ = std::io::stdout().flush();
        })
        .await
        .context("Upload failed")?;

    println!();
    println!("Uploaded {} ({})", file.name, file.id);
    Ok(())
}

async fn cmd_download(client: &DriveClient, id: &str, output: &Path) -> Result<()> {
    let file = client.get(id).await.context("Failed to get file")?;
    let download = client
        .download(id, file.size_bytes().unwrap_or(0))
        .await
        .context("Failed to start download")?;
    let expected = download.size;

    let mut out = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let written = download
        .write_to(&mut out)
        .await
        .context("Failed to download file")?;

    if written != expected {
        anyhow::bail!("Downloaded {} bytes, expected {}", written, expected);
    }
    println!("Downloaded {} ({} bytes) to {}", file.name, written, output.display());
    Ok(())
}

async fn cmd_delete(client: &DriveClient, id: &str) -> Result<()> {
    client.delete(id).await.context("Failed to delete file")?;
    println!("File deleted: {}", id);
    Ok(())
}

async fn cmd_mkdir(client: &DriveClient, name: &str, parent: Option<String>) -> Result<()> {
    let mut metadata = FileMetadata::folder(name);
    if let Some(parent) = parent {
        metadata = metadata.with_parent(parent);
    }

    let folder = client
        .create_folder(metadata)
        .await
        .context("Failed to create folder")?;
    println!("Folder created: {} ({})", folder.name, folder.id);
    Ok(())
}

async fn cmd_rename(client: &DriveClient, id: &str, name: &str) -> Result<()> {
    let file = client
        .update(id, &serde_json::json!({ "name": name }))
        .await
        .context("Failed to rename file")?;
    println!("Renamed {} to {}", file.id, file.name);
    Ok(())
}

async fn cmd_whoami(client: &DriveClient) -> Result<()> {
    if !client.enabled().await {
        println!("No credentials configured. Run `drivestash auth-url` to authorize.");
    } else if client.is_custom_credentials().await {
        println!("Using custom client credentials.");
    } else {
        println!("Using the default drivestash client credentials.");
    }
    Ok(())
}
