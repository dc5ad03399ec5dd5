#![forbid(unsafe_code)]

//! Operator tool for the ReelStory catalog: storage sync, out-of-band admin
//! edits, uploads and drama creation.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};
use reelstory::{
    catalog::{Catalog, NewDrama},
    config::{RuntimeConfig, StorageConfig, default_config_path, load_runtime_config_from},
    storage::{self, ObjectStorage},
    sync::{Synchronizer, VIDEOS_PREFIX},
};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(author, version, about = "Manage the ReelStory catalog.")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", help = "Path to the env file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create episodes for new videos in object storage.
    Sync,
    /// Mark a user as admin, creating the user row if needed.
    GrantAdmin {
        user_id: String,
        #[arg(long = "email", value_name = "EMAIL")]
        email: Option<String>,
    },
    /// Remove admin from a user.
    RevokeAdmin { user_id: String },
    /// Upload a video file, or every video under a directory, to `videos/`.
    Upload {
        path: PathBuf,
        #[arg(
            long = "name",
            value_name = "NAME",
            help = "Object name for a single file (defaults to the file name)"
        )]
        name: Option<String>,
    },
    /// Create a drama.
    CreateDrama {
        #[arg(long = "title")]
        title: String,
        #[arg(long = "description", default_value = "")]
        description: String,
        #[arg(long = "image-url", default_value = "")]
        image_url: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = load_runtime_config_from(&config_path)?;
    let catalog = Catalog::open(&config.database_path)
        .with_context(|| format!("opening catalog at {}", config.database_path.display()))?;

    match cli.command {
        Command::Sync => run_sync(&catalog, &config),
        Command::GrantAdmin { user_id, email } => grant_admin(&catalog, &user_id, email.as_deref()),
        Command::RevokeAdmin { user_id } => {
            match catalog.set_admin(&user_id, false)? {
                Some(_) => println!("Revoked admin from {user_id}"),
                None => bail!("No user with id {user_id}"),
            }
            Ok(())
        }
        Command::Upload { path, name } => {
            let storage = bucket_storage(&config)?;
            upload(storage.as_ref(), &path, name.as_deref())
        }
        Command::CreateDrama {
            title,
            description,
            image_url,
        } => {
            let drama = catalog.create_drama(&NewDrama {
                title,
                description,
                image_url,
            })?;
            println!("Created drama {} ({})", drama.title, drama.id);
            Ok(())
        }
    }
}

/// The in-memory store dies with this process, so bucket commands refuse it.
fn bucket_storage(config: &RuntimeConfig) -> Result<Arc<dyn ObjectStorage>> {
    if matches!(config.storage, StorageConfig::Disabled) {
        bail!(
            "Firebase storage is disabled (DISABLE_FIREBASE=true); \
             set FIREBASE_STORAGE_BUCKET to sync or upload"
        );
    }
    Ok(storage::from_config(&config.storage))
}

fn run_sync(catalog: &Catalog, config: &RuntimeConfig) -> Result<()> {
    let storage = bucket_storage(config)?;
    let report = Synchronizer::new(catalog, storage.as_ref(), &config.sync).run()?;

    for added in &report.added {
        println!("added    {} -> {} ({})", added.file_name, added.title, added.id);
    }
    for failure in &report.errors {
        println!("failed   {}: {}", failure.file_name, failure.error);
    }
    println!("{}", report.summary());
    Ok(())
}

fn grant_admin(catalog: &Catalog, user_id: &str, email: Option<&str>) -> Result<()> {
    if let Some(email) = email {
        let (_, created) = catalog.ensure_user(user_id, email)?;
        if created {
            info!("created user record for {user_id}");
        }
    }
    match catalog.set_admin(user_id, true)? {
        Some(user) => {
            println!("Granted admin to {} <{}>", user.id, user.email);
            Ok(())
        }
        None => bail!("No user with id {user_id}; pass --email to create it"),
    }
}

fn upload(storage: &dyn ObjectStorage, path: &Path, name: Option<&str>) -> Result<()> {
    let files = collect_uploads(path, name)?;
    if files.is_empty() {
        bail!("No video files found under {}", path.display());
    }
    for (file, object_name) in files {
        let content_type = guess_content_type(&file);
        let bytes = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
        let object_path = format!("{VIDEOS_PREFIX}/{object_name}");
        let url = storage
            .upload(&object_path, &content_type, &bytes)
            .with_context(|| format!("uploading {}", file.display()))?;
        println!("{object_path} -> {url}");
    }
    Ok(())
}

/// Files to upload with their object names. A directory contributes every
/// `video/*` file beneath it; `name` only applies to a single file.
fn collect_uploads(path: &Path, name: Option<&str>) -> Result<Vec<(PathBuf, String)>> {
    let metadata = fs::metadata(path).with_context(|| format!("reading {}", path.display()))?;
    if metadata.is_file() {
        let object_name = match name {
            Some(name) => name.to_string(),
            None => file_name(path)?,
        };
        return Ok(vec![(path.to_path_buf(), object_name)]);
    }
    if name.is_some() {
        bail!("--name only applies when uploading a single file");
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", path.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !guess_content_type(entry.path()).starts_with("video/") {
            warn!("skipping non-video file {}", entry.path().display());
            continue;
        }
        files.push((entry.path().to_path_buf(), file_name(entry.path())?));
    }
    Ok(files)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

fn guess_content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
