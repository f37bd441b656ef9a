// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use log::{error, info, warn, Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use yastq::app_config::{self, keys, Config, DatabaseSettings, SettingsProvider};
use yastq::database::models::{MediaType, RequestStatus};
use yastq::database::{DatabaseConnection, Repository};
use yastq::extraction::FfmpegExtractor;
use yastq::media::RepositoryMediaState;
use yastq::progress::{ProgressEvent, ProgressReporter};
use yastq::providers::build_backend;
use yastq::requests::{RequestManager, RequestParams};
use yastq::scheduler::{CancellationRegistry, ConcurrencyLimiter, PoolOptions, WorkerPool};
use yastq::subtitle_processor::SrtSubtitleIo;
use yastq::translation::{JobServices, TranslationJob};

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

fn level_filter(level: &app_config::LogLevel) -> LevelFilter {
    match level {
        app_config::LogLevel::Error => LevelFilter::Error,
        app_config::LogLevel::Warn => LevelFilter::Warn,
        app_config::LogLevel::Info => LevelFilter::Info,
        app_config::LogLevel::Debug => LevelFilter::Debug,
        app_config::LogLevel::Trace => LevelFilter::Trace,
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process the queue until interrupted with Ctrl-C
    Run {
        /// Retry failed requests every N seconds (0 disables; overrides the config)
        #[arg(long)]
        retry_sweep_secs: Option<u64>,
    },

    /// Queue a translation for a subtitle file or a media item
    Enqueue(EnqueueArgs),

    /// List requests
    Status {
        /// Only show requests with this status (pending, in_progress, completed, ...)
        #[arg(short, long)]
        status: Option<RequestStatus>,
    },

    /// Show the log of a request
    Logs {
        request_id: i64,
    },

    /// Queue a finished request again
    Retry {
        request_id: i64,
    },

    /// Queue every failed request again
    RetryFailed,

    /// Cancel a pending request
    Cancel {
        request_id: i64,
    },

    /// Delete a finished request and its log
    Remove {
        request_id: i64,
    },

    /// Manage media items
    #[command(subcommand)]
    Media(MediaCommands),

    /// Read or change runtime settings
    #[command(subcommand)]
    Settings(SettingsCommands),

    /// Show translation statistics
    Stats,

    /// Generate shell completions for yastq
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug)]
struct EnqueueArgs {
    /// Subtitle file to translate
    #[arg(long, required_unless_present = "media_id")]
    subtitle: Option<PathBuf>,

    /// Media item whose subtitle should be translated
    #[arg(long)]
    media_id: Option<i64>,

    /// Type of the media item
    #[arg(long, default_value = "movie", requires = "media_id")]
    media_type: MediaType,

    /// Display title
    #[arg(long, default_value = "")]
    title: String,

    /// Source language code (e.g., 'en', 'es', 'fr')
    #[arg(short, long)]
    source_language: String,

    /// Target language code (e.g., 'en', 'es', 'fr')
    #[arg(short, long)]
    target_language: String,
}

#[derive(Subcommand, Debug)]
enum MediaCommands {
    /// Register a video file
    Add {
        path: PathBuf,
        #[arg(long, default_value = "movie")]
        media_type: MediaType,
        #[arg(long)]
        title: Option<String>,
        /// Translate this item before others
        #[arg(long)]
        priority: bool,
        /// Queue the configured target languages right away
        #[arg(long)]
        queue: bool,
    },

    /// Change the priority flag of a media item
    Priority {
        media_id: i64,
        #[arg(long, default_value = "movie")]
        media_type: MediaType,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Queue the configured target languages missing on disk
    Queue {
        media_id: i64,
        #[arg(long, default_value = "movie")]
        media_type: MediaType,
    },

    /// List media items
    List,
}

#[derive(Subcommand, Debug)]
enum SettingsCommands {
    /// Print one setting, or all known settings
    Get {
        key: Option<String>,
    },
    /// Store a setting
    Set {
        key: String,
        value: String,
    },
}

/// yastq - Yet Another Subtitle Translation Queue
///
/// Queues subtitle translations in a local database and processes them
/// with an AI backend, one limiter slot at a time.
#[derive(Parser, Debug)]
#[command(name = "yastq")]
#[command(version)]
#[command(about = "Persistent subtitle translation queue")]
#[command(long_about = "yastq keeps a queue of subtitle translation requests and works through them.

EXAMPLES:
    yastq media add /movies/film.mkv --queue     # Register a video and queue missing languages
    yastq enqueue --subtitle film.en.srt -s en -t fr
    yastq run                                    # Process the queue until Ctrl-C
    yastq status --status failed
    yastq logs 42
    yastq settings set max_concurrent_jobs 2
    yastq completions bash > yastq.bash

CONFIGURATION:
    Configuration is stored in conf.json by default. You can specify a different
    config file with --config-path. If the config file doesn't exist, a default one
    will be created automatically. Runtime settings live in the database and are
    seeded from the config file's \"settings\" map.")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "conf.json", global = true)]
    config_path: String,

    /// Set logging level
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<CliLogLevel>,
}

// @struct: Custom logger implementation
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    // @creates: New logger with specified level
    fn new(level: LevelFilter) -> Self {
        CustomLogger { level }
    }

    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        let logger = Box::new(CustomLogger::new(level));
        log::set_boxed_logger(logger)?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: ANSI colour and emoji for log level
    fn style_for_level(level: Level) -> (&'static str, &'static str) {
        match level {
            Level::Error => ("1;31", "❌ "),
            Level::Warn => ("1;33", "🚧 "),
            Level::Info => ("1;32", " "),
            Level::Debug => ("1;36", "🔍 "),
            Level::Trace => ("1;35", "📋 "),
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let (colour, emoji) = Self::style_for_level(record.level());
            let _ = writeln!(
                std::io::stderr(),
                "\x1B[{}m{} {} {}\x1B[0m",
                colour, now, emoji, record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Everything the commands need, wired from the config file
struct App {
    config: Config,
    repo: Repository,
    settings: Arc<dyn SettingsProvider>,
    cancellations: Arc<CancellationRegistry>,
    progress: Arc<ProgressReporter>,
    pool: Arc<WorkerPool>,
    manager: RequestManager,
}

impl App {
    async fn build(config: Config) -> Result<Self> {
        let connection = match &config.database_path {
            Some(path) => DatabaseConnection::new(path)?,
            None => DatabaseConnection::new_default()?,
        };
        let repo = Repository::new(connection);
        let seeded = repo.seed_settings(config.settings.clone()).await?;
        if seeded > 0 {
            info!("Seeded {} setting(s) from the config file", seeded);
        }

        let settings: Arc<dyn SettingsProvider> = Arc::new(DatabaseSettings::new(repo.clone()));
        let (backend, _meter) = build_backend(&config.provider);
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        limiter.refresh_from_settings(settings.as_ref()).await?;

        let cancellations = Arc::new(CancellationRegistry::new());
        let progress = Arc::new(ProgressReporter::new(repo.clone()));
        let media_state = Arc::new(RepositoryMediaState::new(repo.clone(), settings.clone()));

        let job = TranslationJob::new(JobServices {
            repo: repo.clone(),
            settings: settings.clone(),
            backend,
            limiter,
            cancellations: cancellations.clone(),
            subtitles: Arc::new(SrtSubtitleIo),
            extractor: Arc::new(FfmpegExtractor::default()),
            progress: progress.clone(),
            media_state: media_state.clone(),
        });
        let pool = Arc::new(WorkerPool::new(
            repo.clone(),
            settings.clone(),
            Arc::new(job),
            PoolOptions::from(&config.scheduler),
        ));
        let manager = RequestManager::new(
            repo.clone(),
            settings.clone(),
            cancellations.clone(),
            media_state,
            progress.clone(),
            pool.waker(),
        );

        Ok(Self {
            config,
            repo,
            settings,
            cancellations,
            progress,
            pool,
            manager,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Info until the config says otherwise
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = CommandLineOptions::command();
        generate(shell, &mut cmd, "yastq", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = Config::load_or_create(&cli.config_path)?;
    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    log::set_max_level(level_filter(&config.log_level));
    config.validate().context("Configuration validation failed")?;

    let app = App::build(config).await?;

    match cli.command {
        Commands::Run { retry_sweep_secs } => run_queue(app, retry_sweep_secs).await,
        Commands::Enqueue(args) => enqueue(&app, args).await,
        Commands::Status { status } => print_status(&app, status).await,
        Commands::Logs { request_id } => {
            for entry in app.manager.request_logs(request_id).await? {
                println!("{} [{}] {}", entry.created_at, entry.level, entry.message);
                if let Some(details) = entry.details {
                    println!("    {}", details);
                }
            }
            Ok(())
        }
        Commands::Retry { request_id } => {
            let outcome = app.manager.retry_request(request_id).await?;
            println!("Request {} queued as {}", request_id, outcome.id());
            Ok(())
        }
        Commands::RetryFailed => {
            let queued = app.manager.retry_failed_requests().await?;
            println!("Queued {} request(s)", queued);
            Ok(())
        }
        Commands::Cancel { request_id } => {
            // Running requests belong to the process that runs the queue
            if app.manager.cancel_request(request_id).await? {
                println!("Request {} cancelled", request_id);
            } else if !app.cancellations.is_registered(request_id) {
                warn!("Request {} is not pending; stop the running queue to interrupt it", request_id);
            }
            Ok(())
        }
        Commands::Remove { request_id } => {
            app.manager.remove_request(request_id).await?;
            println!("Request {} removed", request_id);
            Ok(())
        }
        Commands::Media(command) => media_command(&app, command).await,
        Commands::Settings(command) => settings_command(&app, command).await,
        Commands::Stats => {
            let totals = app.repo.get_statistics().await?;
            println!(
                "{} file(s), {} line(s), {} character(s) translated",
                totals.total_files, totals.total_lines, totals.total_characters
            );
            let mut languages: Vec<_> = app.repo.language_statistics().await?.into_iter().collect();
            languages.sort();
            for (language, count) in languages {
                println!("  {}: {}", language, count);
            }
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

async fn run_queue(app: App, retry_sweep_secs: Option<u64>) -> Result<()> {
    let shutdown = app.pool.shutdown_token();

    let mut events = app.progress.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ProgressEvent::Progress { request_id, percent } => {
                    log::debug!("Request {}: {}%", request_id, percent)
                }
                ProgressEvent::Status { request_id, status } => {
                    info!("Request {} is now {}", request_id, status)
                }
            }
        }
    });

    let sweep_secs = retry_sweep_secs.unwrap_or(app.config.scheduler.retry_sweep_interval_secs);
    let manager = Arc::new(app.manager);
    if sweep_secs > 0 {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.retry_failed_requests().await {
                            error!("Retry sweep failed: {:#}", e);
                        }
                    }
                }
            }
        });
    }

    let pool = Arc::clone(&app.pool);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stopping; waiting for running translations");
            pool.shutdown();
        }
    });

    info!("Processing the translation queue (Ctrl-C to stop)");
    let report = app.pool.run().await?;
    info!(
        "Queue stopped: {} completed, {} failed, {} cancelled, {} requeued",
        report.completed, report.failed, report.cancelled, report.abandoned
    );
    Ok(())
}

async fn enqueue(app: &App, args: EnqueueArgs) -> Result<()> {
    let subtitle_path = match args.subtitle {
        Some(path) => Some(
            std::fs::canonicalize(&path)
                .with_context(|| format!("Subtitle file not found: {}", path.display()))?
                .to_string_lossy()
                .into_owned(),
        ),
        None => None,
    };
    let title = match (&subtitle_path, args.title.trim()) {
        (Some(path), "") if args.media_id.is_none() => path.clone(),
        (_, title) => title.to_string(),
    };

    let outcome = app
        .manager
        .create_request(RequestParams {
            media: args.media_id.map(|id| (id, args.media_type)),
            title,
            source_language: args.source_language,
            target_language: args.target_language,
            subtitle_path,
        })
        .await?;

    match outcome {
        yastq::CreateOutcome::Created(id) => println!("Queued request {}", id),
        yastq::CreateOutcome::Existing(id) => println!("Request {} already covers this translation", id),
    }
    Ok(())
}

async fn print_status(app: &App, status: Option<RequestStatus>) -> Result<()> {
    let requests = app.repo.list_requests(status).await?;
    if requests.is_empty() {
        println!("No requests");
        return Ok(());
    }

    for request in requests {
        println!(
            "{:>5}  {:<11} {:>3}%  {}{} -> {}  {}",
            request.id,
            request.status.to_string(),
            request.progress,
            if request.is_priority { "* " } else { "" },
            request.source_language,
            request.target_language,
            request.title
        );
    }
    Ok(())
}

async fn media_command(app: &App, command: MediaCommands) -> Result<()> {
    match command {
        MediaCommands::Add { path, media_type, title, priority, queue } => {
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("Media file not found: {}", path.display()))?;
            let title = match title {
                Some(title) => title,
                None => path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("Cannot derive a title from {}", path.display()))?,
            };
            let media_id = app
                .repo
                .insert_media(media_type, &title, &path.to_string_lossy(), priority)
                .await?;
            println!("Registered {} {} ({})", media_type, media_id, title);

            if queue {
                let outcomes = app.manager.queue_missing_translations(media_id, media_type).await?;
                println!("Queued {} request(s)", outcomes.len());
            }
        }
        MediaCommands::Priority { media_id, media_type, enabled } => {
            let updated = app.manager.set_media_priority(media_id, media_type, enabled).await?;
            println!("Updated {} active request(s)", updated);
        }
        MediaCommands::Queue { media_id, media_type } => {
            let outcomes = app.manager.queue_missing_translations(media_id, media_type).await?;
            println!("Queued {} request(s)", outcomes.len());
        }
        MediaCommands::List => {
            for media in app.repo.list_media().await? {
                println!(
                    "{:>5}  {:<7} {:<11} {}{}",
                    media.id,
                    media.media_type.to_string(),
                    media.translation_state.to_string(),
                    if media.is_priority { "* " } else { "" },
                    media.title
                );
            }
        }
    }
    Ok(())
}

async fn settings_command(app: &App, command: SettingsCommands) -> Result<()> {
    match command {
        SettingsCommands::Get { key: Some(key) } => match app.settings.get_setting(&key).await? {
            Some(value) => println!("{}", value),
            None => return Err(anyhow!("Setting '{}' is not set", key)),
        },
        SettingsCommands::Get { key: None } => {
            let values = app.settings.get_settings(keys::ALL).await?;
            for key in keys::ALL {
                if let Some(value) = values.get(*key) {
                    println!("{} = {}", key, value);
                }
            }
        }
        SettingsCommands::Set { key, value } => {
            app.repo.set_setting(&key, &value).await?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}
