//! Core application
//!
//! Singletons initialize in dependency order at startup and tear down in
//! reverse: storage, database (migrations before any pipeline worker),
//! vector store, event bus, AI runtime, stage workers, capture frontend,
//! reconcile loop, API server. Nothing is lazy-on-first-use.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api::monitoring::MonitoringServer;
use crate::api::{ApiServer, ApiState};
use crate::core::banner;
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG, VECTOR_INDEX_FILENAME};
use crate::core::shutdown::ShutdownService;
use crate::core::storage::{AppStorage, DataSubdir};
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::settings;
use crate::data::topics::{EventBus, MetricsEvent};
use crate::data::vector::VectorStore;
use crate::domain::activity::{ActivityNotifier, ActivityService, DetailsGenerator, SummaryWorker};
use crate::domain::ai::openai::OpenAiCompatible;
use crate::domain::ai::providers::unconfigured::{
    UnconfiguredEmbedding, UnconfiguredText, UnconfiguredVlm,
};
use crate::domain::ai::providers::{EmbeddingProvider, TextProvider, VlmProvider};
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::ai::{AiRuntime, Capability};
use crate::domain::capture::source::NullCaptureSource;
use crate::domain::capture::{BackpressureController, CaptureService, CaptureSource, CaptureStatus};
use crate::domain::pipeline::merge::MergeStage;
use crate::domain::pipeline::ocr::{Ocr, OcrStage};
use crate::domain::pipeline::reconcile::Stages;
use crate::domain::pipeline::threads::ThreadAssigner;
use crate::domain::pipeline::vlm::VlmStage;
use crate::domain::pipeline::{BatchBuilder, ReconcileLoop, embed::EmbedStage};
use crate::domain::search::{FtsService, SearchService};
use crate::utils::time::now_ms;

/// Metrics publish interval (seconds)
const METRICS_INTERVAL_SECS: u64 = 5;

/// Platform adapters plugged in by the embedding application. Defaults keep
/// the engine runnable without a platform layer: no frames, no OCR.
#[derive(Default)]
pub struct Adapters {
    pub capture_source: Option<Arc<dyn CaptureSource>>,
    pub ocr: Option<Arc<dyn Ocr>>,
}

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub storage: AppStorage,
    pub database: Arc<SqliteService>,
    pub vectors: Arc<VectorStore>,
    pub bus: Arc<EventBus>,
    pub runtime: Arc<AiRuntime>,
    pub usage: Arc<UsageRecorder>,
    pub traces: Arc<TraceRecorder>,
    pub capture: Arc<CaptureService>,
    pub backpressure: Arc<BackpressureController>,
    pub batcher: Arc<BatchBuilder>,
    pub reconcile: Arc<ReconcileLoop>,
    pub notifier: Arc<ActivityNotifier>,
    pub activity: Arc<ActivityService>,
    pub details: Arc<DetailsGenerator>,
    pub fts: Arc<FtsService>,
    pub search: Arc<SearchService>,
    pub monitoring: Arc<MonitoringServer>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();

        match command {
            Some(Commands::System {
                command: system_cmd,
            }) => {
                return Self::handle_system_command(system_cmd);
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config, Adapters::default()).await?;
        Self::start_server(app).await
    }

    pub async fn init(cli: &CliConfig, adapters: Adapters) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init().await?;

        // Migrations run before any pipeline worker starts
        let database = Arc::new(SqliteService::init(&storage).await?);

        let vectors = Arc::new(
            VectorStore::open_flat(storage.subdir_path(DataSubdir::Vector, VECTOR_INDEX_FILENAME))
                .map_err(|e| anyhow::anyhow!("Failed to open vector index: {e}"))?,
        );

        let bus = Arc::new(EventBus::new());
        let runtime = AiRuntime::new(Arc::clone(&bus));
        let usage = Arc::new(UsageRecorder::new(Arc::clone(&database), Arc::clone(&bus)));
        let traces = Arc::new(TraceRecorder::new());

        // Provider adapters: OpenAI-compatible endpoints per capability,
        // with not-configured stand-ins when the config is silent
        let vlm_provider: Arc<dyn VlmProvider> = match OpenAiCompatible::from_config(
            &config.ai.vlm,
            Capability::Vlm,
        ) {
            Ok(adapter) => Arc::new(adapter),
            Err(_) => {
                tracing::warn!("VLM endpoint not configured; interpretation disabled");
                Arc::new(UnconfiguredVlm)
            }
        };
        let text_provider: Arc<dyn TextProvider> =
            match OpenAiCompatible::from_config(&config.ai.text, Capability::Text) {
                Ok(adapter) => Arc::new(adapter),
                Err(_) => {
                    tracing::warn!("Text endpoint not configured; expansion limited");
                    Arc::new(UnconfiguredText)
                }
            };
        let text_configured = config.ai.text.is_configured();
        let embedding_provider: Arc<dyn EmbeddingProvider> =
            match OpenAiCompatible::from_config(&config.ai.embedding, Capability::Embedding) {
                Ok(adapter) => Arc::new(adapter),
                Err(_) => {
                    tracing::warn!("Embedding endpoint not configured; vector search disabled");
                    Arc::new(UnconfiguredEmbedding)
                }
            };

        // Capture frontend
        let backpressure = BackpressureController::new(
            Arc::clone(&database),
            Arc::clone(&bus),
            config.capture.phash_threshold,
        );
        let capture_source = adapters.capture_source.unwrap_or_else(|| {
            tracing::warn!("No capture adapter registered; capture produces no frames");
            Arc::new(NullCaptureSource)
        });
        let capture = CaptureService::new(
            capture_source,
            Arc::clone(&database),
            Arc::clone(&bus),
            storage.clone(),
            config.capture.clone(),
            backpressure.tuning_rx(),
            runtime.capture_pause_rx(),
        );

        // Pipeline stages
        let assigner = ThreadAssigner::new(
            Arc::clone(&database),
            Arc::clone(&runtime),
            Arc::clone(&text_provider),
            Arc::clone(&usage),
            Arc::clone(&traces),
        );
        let notifier = ActivityNotifier::new(Arc::clone(&bus));
        let embed_stage = EmbedStage::new(
            Arc::clone(&database),
            Arc::clone(&runtime),
            embedding_provider,
            Arc::clone(&vectors),
            Arc::clone(&usage),
            Arc::clone(&traces),
        );
        let stages = Stages {
            vlm: VlmStage::new(
                Arc::clone(&database),
                Arc::clone(&runtime),
                vlm_provider,
                Arc::clone(&usage),
                Arc::clone(&traces),
                Arc::clone(&bus),
                Arc::clone(&assigner),
                config.capture.retention_ms,
                config.ocr.enabled,
            ),
            merge: MergeStage::new(
                Arc::clone(&database),
                Arc::clone(&runtime),
                Arc::clone(&text_provider),
                Arc::clone(&usage),
                Arc::clone(&traces),
                Arc::clone(&bus),
            ),
            assigner,
            embed: Arc::clone(&embed_stage),
            ocr: match (config.ocr.enabled, adapters.ocr) {
                (true, Some(engine)) => {
                    Some(OcrStage::new(Arc::clone(&database), engine))
                }
                (true, None) => {
                    tracing::warn!("OCR enabled but no engine adapter registered");
                    None
                }
                _ => None,
            },
            summary: SummaryWorker::new(
                Arc::clone(&database),
                Arc::clone(&runtime),
                Arc::clone(&text_provider),
                Arc::clone(&usage),
                Arc::clone(&traces),
                Arc::clone(&notifier),
            ),
        };

        let batcher = BatchBuilder::new(Arc::clone(&database));
        let reconcile = ReconcileLoop::new(
            Arc::clone(&database),
            Arc::clone(&runtime),
            Arc::clone(&bus),
            Arc::clone(&batcher),
            stages,
        );

        // Query side
        let fts = FtsService::new(Arc::clone(&database), Arc::clone(&bus));
        fts.ensure_health()
            .await
            .context("FTS health check failed")?;
        let search = SearchService::new(
            Arc::clone(&database),
            Arc::clone(&fts),
            Arc::clone(&vectors),
            Arc::clone(&embed_stage),
            Arc::clone(&runtime),
            text_configured.then(|| Arc::clone(&text_provider)),
        );
        let activity = ActivityService::new(Arc::clone(&database));
        let details = DetailsGenerator::new(
            Arc::clone(&database),
            Arc::clone(&runtime),
            text_provider,
            Arc::clone(&usage),
            Arc::clone(&traces),
            Arc::clone(&bus),
        );

        let shutdown = ShutdownService::new(Arc::clone(&database), Arc::clone(&vectors));
        let monitoring = MonitoringServer::new(
            Arc::clone(&database),
            Arc::clone(&bus),
            Arc::clone(&runtime),
            Arc::clone(&usage),
            Arc::clone(&traces),
            shutdown.subscribe(),
        );

        Ok(Self {
            shutdown,
            config,
            storage,
            database,
            vectors,
            bus,
            runtime,
            usage,
            traces,
            capture,
            backpressure,
            batcher,
            reconcile,
            notifier,
            activity,
            details,
            fts,
            search,
            monitoring,
        })
    }

    fn handle_system_command(cmd: SystemCommands) -> Result<()> {
        match cmd {
            SystemCommands::Prune { yes } => Self::prune_data(yes),
        }
    }

    fn prune_data(skip_confirm: bool) -> Result<()> {
        let data_dir = AppStorage::resolve_data_dir();

        if !data_dir.exists() {
            println!(
                "Nothing to prune. Data directory does not exist: {}",
                data_dir.display()
            );
            return Ok(());
        }

        let data_dir = data_dir.canonicalize().unwrap_or(data_dir);

        println!("This will permanently delete the local data directory:");
        println!("  {}", data_dir.display());
        println!();
        println!(
            "Make sure the engine is not running. \
             Deleting data while it is running will cause data corruption."
        );

        if !skip_confirm {
            print!("\nContinue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        std::fs::remove_dir_all(&data_dir)
            .with_context(|| format!("Failed to delete data directory: {}", data_dir.display()))?;
        println!("Pruned: {}", data_dir.display());
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        app.shutdown.install_signal_handlers();

        app.start_background_tasks().await?;

        if app.config.monitoring.enabled
            && let Err(e) = app.monitoring.ensure_started().await
        {
            tracing::warn!(error = %e, "Failed to start monitoring endpoint");
        }

        banner::print_banner(
            &app.config.server.host,
            app.config.server.port,
            app.config.ocr.enabled,
            &app.storage.data_dir().display().to_string(),
        );

        let state = ApiState {
            db: Arc::clone(&app.database),
            bus: Arc::clone(&app.bus),
            runtime: Arc::clone(&app.runtime),
            capture: Arc::clone(&app.capture),
            search: Arc::clone(&app.search),
            activity: Arc::clone(&app.activity),
            details: Arc::clone(&app.details),
            reconcile: Arc::clone(&app.reconcile),
            usage: Arc::clone(&app.usage),
            traces: Arc::clone(&app.traces),
            monitoring: Arc::clone(&app.monitoring),
            shutdown_rx: app.shutdown.subscribe(),
        };
        let server = ApiServer::new(
            state,
            app.config.server.host.clone(),
            app.config.server.port,
        );
        server.start().await?;

        app.reconcile.stop();
        app.shutdown.shutdown().await;

        Ok(())
    }

    pub async fn start_background_tasks(&self) -> Result<()> {
        self.shutdown
            .register(
                self.database
                    .start_checkpoint_task(self.shutdown.subscribe()),
            )
            .await;

        self.shutdown
            .register(self.vectors.start_flush_task(self.shutdown.subscribe()))
            .await;

        self.shutdown
            .register(self.backpressure.start(self.shutdown.subscribe()))
            .await;

        self.shutdown
            .register(self.notifier.start(self.shutdown.subscribe()))
            .await;

        self.shutdown
            .register(self.batcher.start(self.shutdown.subscribe()))
            .await;

        // Capture resumes where it left off, but never without a VLM
        // endpoint: frames would only pile up against a dead queue
        let persisted = settings::get(self.database.pool()).await?;
        if persisted.capture_enabled {
            if self.config.ai.vlm.is_configured() {
                self.capture.set_status(CaptureStatus::Running);
            } else {
                tracing::warn!("Capture stays stopped: no VLM endpoint configured");
            }
        }
        self.shutdown
            .register(self.capture.start(self.shutdown.subscribe()))
            .await;
        self.shutdown
            .register(self.capture.start_retention_task(self.shutdown.subscribe()))
            .await;

        if let Some(handle) = self.reconcile.start(self.shutdown.subscribe()) {
            self.shutdown.register(handle).await;
        }

        self.shutdown
            .register(self.start_metrics_task())
            .await;

        tracing::debug!("Background tasks started");
        Ok(())
    }

    fn start_metrics_task(&self) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let runtime = Arc::clone(&self.runtime);
        let capture = Arc::clone(&self.capture);
        let database = Arc::clone(&self.database);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(METRICS_INTERVAL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let batches_completed: i64 = sqlx::query_scalar(
                            "SELECT COUNT(*) FROM batches WHERE status = 'succeeded'",
                        )
                        .fetch_one(database.pool())
                        .await
                        .unwrap_or(0);
                        let nodes_created: i64 =
                            sqlx::query_scalar("SELECT COUNT(*) FROM context_nodes")
                                .fetch_one(database.pool())
                                .await
                                .unwrap_or(0);

                        bus.publish_metrics(MetricsEvent {
                            at_ms: now_ms(),
                            frames_captured: capture.frames_captured.load(Ordering::Relaxed),
                            frames_deduplicated: capture
                                .frames_deduplicated
                                .load(Ordering::Relaxed),
                            batches_completed: batches_completed as u64,
                            nodes_created: nodes_created as u64,
                            vlm_limit: runtime.get_limit(Capability::Vlm),
                            text_limit: runtime.get_limit(Capability::Text),
                            embedding_limit: runtime.get_limit(Capability::Embedding),
                        });
                    }
                }
            }
        })
    }
}
