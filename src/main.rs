use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use noteflow::config::PipelineConfig;
use noteflow::document::DocumentStore;
use noteflow::llm::create_models;
use noteflow::notify::{LogNotifier, Notifier, TelegramNotifier};
use noteflow::processors::build_registry;
use noteflow::scheduler::{Scheduler, spawn_scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export NOTEFLOW_VAULT_PATH=/path/to/vault");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    // Initialize tracing; the guard flushes the log file on exit
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "noteflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    eprintln!("📝 NoteFlow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Vault: {}", config.paths.vault.display());
    eprintln!("   Transcripts: {}", config.paths.transcripts.display());
    eprintln!("   Email digests: {}", config.paths.email_digests.display());
    eprintln!("   Model: {} (small: {})", config.ai.model, config.ai.small_model);
    eprintln!(
        "   Tick: every {}s (+ up to {}s jitter), timeout {}s",
        config.scheduler.tick_interval.as_secs(),
        config.scheduler.tick_jitter.as_secs(),
        config.scheduler.invocation_timeout.as_secs(),
    );
    if let Some(dir) = &config.log_dir {
        eprintln!("   Logs: {}", dir.display());
    }

    for dir in config.paths.directories() {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let models = create_models(&config.ai)?;

    let notifier: Arc<dyn Notifier> = match config.telegram.clone() {
        Some(telegram) => {
            eprintln!("   Notifications: telegram (chat {})", telegram.chat_id);
            Arc::new(TelegramNotifier::new(telegram))
        }
        None => {
            eprintln!("   Notifications: log only");
            Arc::new(LogNotifier)
        }
    };

    if let Some(owner) = &config.owner_name {
        eprintln!("   Owner: {owner}");
    }

    let registry = build_registry(&config.paths, &models, notifier, config.owner_name.as_deref())?;
    eprintln!("   Processors: {}\n", registry.keys().join(", "));

    let scheduler = Arc::new(Scheduler::new(
        registry,
        Arc::new(DocumentStore::new()),
        config.scheduler.clone(),
    ));
    let (handle, shutdown) = spawn_scheduler(scheduler);

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    shutdown.store(true, Ordering::Relaxed);

    // The loop only sees the flag between ticks
    let grace = config.scheduler.invocation_timeout + Duration::from_secs(5);
    let abort = handle.abort_handle();
    if tokio::time::timeout(grace, handle).await.is_err() {
        tracing::warn!(grace_secs = grace.as_secs(), "Scheduler did not stop in time, aborting");
        abort.abort();
    }

    Ok(())
}
