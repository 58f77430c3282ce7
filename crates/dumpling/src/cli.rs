//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dumpling_service::config::Config;
use dumpling_service::formats::UploadKind;
use dumpling_service::service::DumplingService;
use dumpling_service::types::relative_path;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::logging;
use crate::upload;

/// Dumpling commands.
#[derive(Subcommand)]
enum Command {
    /// Detect the format and build id of a file and list the modules it references.
    Inspect {
        /// The file to inspect.
        file: PathBuf,
        /// Treat the file as a crash dump.
        #[arg(long)]
        dump: bool,
    },

    /// Upload a crash dump together with every module it references that is found locally.
    Triage {
        /// The crash dump, optionally gzip compressed.
        dump: PathBuf,
        /// Who uploaded the dump.
        #[arg(long, default_value = "dumpling")]
        origin: String,
        /// Display name of the dump. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,
        /// Directory that module paths recorded in the dump are resolved against.
        #[arg(long, default_value = "/")]
        sysroot: PathBuf,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so there are no other threads.
    unsafe { logging::init_logging(&config) };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async move {
        let service = DumplingService::from_config(&config).await?;
        match cli.command {
            Command::Inspect { file, dump } => inspect(&service, &config, &file, dump).await,
            Command::Triage {
                dump,
                origin,
                name,
                sysroot,
            } => {
                let name = match name {
                    Some(name) => name,
                    None => file_name(&dump),
                };
                triage(&service, &config, &dump, &origin, &name, &sysroot).await
            }
        }
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    serde_json::to_writer_pretty(stdout.lock(), value)?;
    println!();
    Ok(())
}

async fn inspect(service: &DumplingService, config: &Config, path: &Path, dump: bool) -> Result<()> {
    let upload = upload::prepare(path, &config.scratch_dir())?;
    let kind = if dump {
        UploadKind::Dump
    } else {
        UploadKind::Artifact
    };

    let inspection = service
        .inspect(
            &upload.digest,
            &path.to_string_lossy(),
            kind,
            tokio::fs::File::from_std(upload.body),
            &CancellationToken::new(),
        )
        .await
        .with_context(|| format!("failed to inspect {}", path.display()))?;

    print_json(&inspection)
}

async fn triage(
    service: &DumplingService,
    config: &Config,
    path: &Path,
    origin: &str,
    name: &str,
    sysroot: &Path,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let scratch_dir = config.scratch_dir();

    let upload = upload::prepare(path, &scratch_dir)?;
    let response = service
        .upload_dump(
            &upload.digest,
            &path.to_string_lossy(),
            origin,
            name,
            tokio::fs::File::from_std(upload.body),
            &cancel,
        )
        .await
        .with_context(|| format!("failed to upload dump {}", path.display()))?;

    tracing::info!(
        dump_id = %response.dump_id,
        referenced = response.ref_paths.len(),
        "uploaded dump"
    );

    for local_path in &response.ref_paths {
        let module = sysroot.join(relative_path(local_path));
        if !module.is_file() {
            tracing::warn!(path = %module.display(), "referenced module not found");
            continue;
        }

        let upload = upload::prepare(&module, &scratch_dir)?;
        let result = service
            .upload_artifact(
                &upload.digest,
                local_path,
                Some(&response.dump_id),
                tokio::fs::File::from_std(upload.body),
                &cancel,
            )
            .await;

        match result {
            Ok(digest) => tracing::info!(%digest, path = %local_path, "uploaded module"),
            Err(err) if err.is_client_error() => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(error = dynerr, path = %local_path, "rejected module");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to upload {local_path}"));
            }
        }
    }

    let manifest = service
        .get_manifest(&response.dump_id)
        .await?
        .context("dump disappeared after upload")?;
    print_json(&manifest)
}
