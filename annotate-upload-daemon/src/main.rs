mod config;
mod diagnostics;

use annotate_upload::{
    files, CoordinatorHandle, FileBackend, HttpUploadApi, KvBackend, PersistentStore,
    PushListener, UploadApi, UploadCoordinator, UploadEvent,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Config;
use diagnostics::{Cli, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// How long to wait for final counts after a batch
const FINAL_COUNTS_WAIT: Duration = Duration::from_secs(15);

const PUSH_CHANNEL_SIZE: usize = 256;

/// Open the persisted store, falling back to memory when the state
/// directory is unusable
fn open_store(config: &Config) -> PersistentStore {
    let primary: Option<Box<dyn KvBackend>> = match FileBackend::open(config.store_dir()) {
        Ok(backend) => Some(Box::new(backend)),
        Err(e) => {
            warn!(
                "Cannot use {} for upload state: {}",
                config.store_dir().display(),
                e
            );
            None
        }
    };
    PersistentStore::new(primary, config.pipeline.store.clone())
}

fn http_api(config: &Config) -> Result<HttpUploadApi> {
    HttpUploadApi::new(&config.server.base_url, config.request_timeout())
        .context("Failed to create HTTP client")
}

fn start_pipeline(config: &Config) -> Result<CoordinatorHandle> {
    let api: Arc<dyn UploadApi> = Arc::new(http_api(config)?);

    let push = config.server.push_url.as_ref().map(|url| {
        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_SIZE);
        tokio::spawn(PushListener::new(url.clone()).run(tx));
        rx
    });
    if push.is_none() {
        info!("No push channel configured, tracking uploads by polling");
    }

    let (handle, _task) =
        UploadCoordinator::spawn(config.pipeline.clone(), open_store(config), api, push);
    Ok(handle)
}

/// Print progress until the project's batch finishes. The first Ctrl-C
/// only warns while uploads are in flight, the second one aborts.
async fn follow_batch(
    handle: &CoordinatorHandle,
    project: &str,
    events: &mut broadcast::Receiver<UploadEvent>,
) -> Result<()> {
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(UploadEvent::Progress { project_id, percent, status_line, queued_line, .. })
                    if project_id == project =>
                {
                    match queued_line {
                        Some(queued) => println!("[{:>3}%] {} ({})", percent, status_line, queued),
                        None => println!("[{:>3}%] {}", percent, status_line),
                    }
                }
                Ok(UploadEvent::TaskFailed { project_id, filename, error, will_retry, .. })
                    if project_id == project =>
                {
                    if will_retry {
                        eprintln!("{}: {} (will retry)", filename, error);
                    } else {
                        eprintln!("{}: {}", filename, error);
                    }
                }
                Ok(UploadEvent::BatchFinished { project_id, counters }) if project_id == project => {
                    println!(
                        "Finished: {} uploaded, {} failed of {} files",
                        counters.completed, counters.failed, counters.total_files
                    );
                    return Ok(());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} pipeline events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => bail!("Upload pipeline stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                let status = handle.status().await?;
                if status.in_flight == 0 || interrupted {
                    warn!("Aborting with {} uploads in flight", status.in_flight);
                    std::process::exit(130);
                }
                interrupted = true;
                eprintln!(
                    "{} uploads still in flight. Press Ctrl-C again to abort.",
                    status.in_flight
                );
            }
        }
    }
}

/// Wait briefly for the counts that follow a finished batch
async fn print_final_counts(project: &str, events: &mut broadcast::Receiver<UploadEvent>) {
    let wait = tokio::time::timeout(FINAL_COUNTS_WAIT, async {
        loop {
            match events.recv().await {
                Ok(UploadEvent::CountsUpdated {
                    project_id,
                    counts,
                    source,
                }) if project_id == project => return Some((counts, source)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match wait {
        Ok(Some((counts, source))) => println!(
            "Project {}: {} images, {} annotations ({:?})",
            project,
            counts.image_count,
            counts.total_annotations(),
            source
        ),
        _ => warn!("No counts received for project {}", project),
    }
}

async fn run_upload(config: &Config, project: &str, paths: &[PathBuf]) -> Result<()> {
    let files = files::load_paths(paths)
        .await
        .context("Failed to read input files")?;
    if files.is_empty() {
        bail!("No image files found");
    }
    let total_bytes: u64 = files.iter().map(|f| f.meta.size).sum();
    println!(
        "Uploading {} files ({}) to project {}",
        files.len(),
        diagnostics::format_bytes(total_bytes),
        project
    );

    let handle = start_pipeline(config)?;
    let mut events = handle.subscribe();
    handle.enqueue(project, files).await?;

    follow_batch(&handle, project, &mut events).await?;
    print_final_counts(project, &mut events).await;
    handle.shutdown().await?;
    Ok(())
}

async fn run_resume(config: &Config, project: &str) -> Result<()> {
    let handle = start_pipeline(config)?;
    let mut events = handle.subscribe();
    handle.restore(project).await?;

    // A restore always ends with a count refresh
    print_final_counts(project, &mut events).await;

    match handle.snapshot(project).await? {
        Some(snapshot) if snapshot.batch_active => {
            follow_batch(&handle, project, &mut events).await?;
            print_final_counts(project, &mut events).await;
        }
        Some(snapshot) => println!("{}", snapshot.status_line),
        None => println!("Nothing to resume for project {}", project),
    }

    handle.shutdown().await?;
    Ok(())
}

fn run_status(config: &Config, project: &str, json: bool) -> Result<()> {
    let store = open_store(config);
    let records = store.load(project);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No uploads recorded for project {}", project);
        return Ok(());
    }

    let mut ordered: Vec<_> = records.iter().collect();
    ordered.sort_by_key(|(_, record)| record.created);
    for (id, record) in ordered {
        println!(
            "{}  {:<10} {:>3}%  {}  [{}]{}",
            record.created.format("%Y-%m-%d %H:%M:%S"),
            record.status.as_str(),
            record.progress,
            record.filename,
            id,
            record
                .error
                .as_deref()
                .map(|e| format!("  {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_counts(config: &Config, project: &str) -> Result<()> {
    let api = http_api(config)?;
    let counts = api
        .counts(project)
        .await
        .with_context(|| format!("Failed to fetch counts for project {}", project))?;

    println!("Images: {}", counts.image_count);
    println!("Annotations: {}", counts.total_annotations());
    for (label, count) in &counts.annotations_count {
        println!("  {}: {}", label, count);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        diagnostics::print_version();
        return Ok(());
    }

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.ensure_directories()?;
    info!("Using backend {}", config.server.base_url);

    match &cli.command {
        Command::Upload { project, paths } => run_upload(&config, project, paths).await,
        Command::Resume { project } => run_resume(&config, project).await,
        Command::Status { project, json } => run_status(&config, project, *json),
        Command::Counts { project } => run_counts(&config, project).await,
        Command::DumpConfig => {
            println!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to serialize config")?
            );
            Ok(())
        }
        Command::Version => Ok(()),
    }
}
