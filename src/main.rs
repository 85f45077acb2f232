use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use pacer::cli::{Cli, Command};
use pacer::fingerprint::{content_identity, fingerprint_file};
use pacer::logging::init_logging;
use pacer::simulate::{SimulatedIssuer, SimulatedTransport};
use pacer::ui::QueueProgress;
use pacer::{
    AdmissionController, AnyNotifier, AuthorizationIssuer, CompletionNotifier, DuplicateResolver,
    FileCandidate, HttpIssuer, HttpTransport, LogNotifier, PacerConfig, PoolKind, QueueSettings,
    QueueStats, ResourceMonitor, Transport, TransferQueue, WebhookNotifier,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => PacerConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PacerConfig::load()?,
    };
    cli.apply_overrides(&mut config);
    config.validate()?;

    match cli.command {
        Command::Upload { paths, fingerprint } => {
            let stats = upload(&config, paths, fingerprint).await?;
            if stats.failed > 0 {
                std::process::exit(1);
            }
        }
        Command::Probe => probe(&config)?,
        Command::Demo {
            files,
            duplicates,
            flaky,
        } => {
            demo(&config, files, duplicates, flaky).await?;
        }
    }

    Ok(())
}

fn admission(config: &PacerConfig) -> Arc<AdmissionController> {
    let monitor = Arc::new(ResourceMonitor::new(
        config.host(),
        config.memory_ceiling_bytes(),
        config.pressure_threshold,
    ));
    Arc::new(AdmissionController::new(monitor, config.admission_settings()))
}

fn notifier(config: &PacerConfig) -> Result<AnyNotifier> {
    Ok(match &config.notify_webhook {
        Some(url) => AnyNotifier::Webhook(WebhookNotifier::new(url.clone())?),
        None => AnyNotifier::Log(LogNotifier),
    })
}

fn settings(config: &PacerConfig) -> QueueSettings {
    QueueSettings {
        retry: config.retry_policy(),
        workers: config.workers,
    }
}

async fn upload(config: &PacerConfig, paths: Vec<PathBuf>, fingerprint: bool) -> Result<QueueStats> {
    let admission = admission(config);
    let cancel = CancellationToken::new();

    let mut candidates = Vec::with_capacity(paths.len());
    for path in paths {
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if !meta.is_file() {
            bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let identity = if fingerprint {
            let digest = fingerprint_file(&admission, &path, &cancel)
                .await
                .with_context(|| format!("hashing {}", path.display()))?;
            let identity = content_identity(digest);
            tracing::info!(file = %name, identity = %identity, "fingerprinted");
            identity
        } else {
            name
        };
        candidates.push(FileCandidate::new(identity, meta.len(), path));
    }

    let queue = TransferQueue::new(
        DuplicateResolver::new(HttpIssuer::new(&config.issuer_url)?, config.effective_batch_size()),
        HttpTransport::new()?,
        notifier(config)?,
        admission,
        settings(config),
    );
    run(&queue, candidates).await
}

fn probe(config: &PacerConfig) -> Result<()> {
    let admission = admission(config);
    let monitor = admission.monitor();
    let report = serde_json::json!({
        "recommended_ceilings": {
            "transfer": monitor.recommended_ceiling(PoolKind::Transfer),
            "cpu": monitor.recommended_ceiling(PoolKind::Cpu),
        },
        "diagnostics": admission.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn demo(config: &PacerConfig, files: usize, duplicates: usize, flaky: usize) -> Result<()> {
    const MIB: u64 = 1024 * 1024;
    let names: Vec<String> = (1..=files).map(|i| format!("service-{i:03}.wav")).collect();

    let issuer = SimulatedIssuer::new().with_stored(names.iter().take(duplicates).cloned());
    let transport = names
        .iter()
        .skip(duplicates)
        .take(flaky)
        .fold(SimulatedTransport::new(6 * MIB), |t, name| t.with_failures(name.clone(), 1));
    let candidates = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let size = (i as u64 % 5 + 1) * 3 * MIB;
            FileCandidate::new(name.clone(), size, format!("/demo/{name}"))
        })
        .collect();

    let queue = TransferQueue::new(
        DuplicateResolver::new(issuer, config.effective_batch_size()),
        transport,
        LogNotifier,
        admission(config),
        settings(config),
    );
    run(&queue, candidates).await?;
    Ok(())
}

/// Submit `candidates`, render progress until the queue is idle or the user
/// interrupts, then print the summary.
async fn run<I, T, N>(queue: &TransferQueue<I, T, N>, candidates: Vec<FileCandidate>) -> Result<QueueStats>
where
    I: AuthorizationIssuer + 'static,
    T: Transport + 'static,
    N: CompletionNotifier,
{
    queue.start();
    let report = queue.submit(candidates)?;
    let ui = QueueProgress::start(report.accepted);
    if report.ignored > 0 {
        ui.note(format!("  {} repeated file(s) ignored", report.ignored));
    }

    let mut tick = tokio::time::interval(Duration::from_millis(200));
    let mut resample = tokio::time::interval(Duration::from_secs(5));
    let idle = queue.wait_idle();
    tokio::pin!(idle);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut idle => break,
            _ = &mut interrupt => {
                ui.note("  interrupted, cancelling remaining transfers");
                break;
            }
            _ = tick.tick() => ui.update(&queue.stats()),
            _ = resample.tick() => queue.admission().resample(),
        }
    }
    queue.shutdown().await;

    let stats = queue.stats();
    ui.finish(&stats, &queue.items());
    Ok(stats)
}
