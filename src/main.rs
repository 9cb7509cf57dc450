use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Arg, Command};
use log::LevelFilter;
use modwarden::audit::{AuditRecorder, JsonlAuditSink};
use modwarden::chat::{ChatSender, ErrorNotifier, LogChat, WebhookChat};
use modwarden::clock::{Clock, SystemClock};
use modwarden::config::{Community, Config};
use modwarden::control;
use modwarden::events::{Comment, ModerationEvent, ModmailConversation, StreamItem};
use modwarden::feed::JsonlFeed;
use modwarden::modmail::ModmailResponder;
use modwarden::platform::LoggingPlatform;
use modwarden::supervisor::{RestartPolicy, Supervisor, Task, TaskFactory};
use modwarden::toxicity::{CommentScreener, PerspectiveClient, ToxicityClassifier};
use modwarden::tracker::{CommunityTracker, TrackerSlot, WatermarkPolicy};
use modwarden::worker::{
    CommentHandler, ModLogHandler, ModmailHandler, ReplayGuard, StreamWorker,
};
use modwarden::{ActionClassifier, DryRun, EffectExecutor, RateLimitedDispatcher};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let matches = Command::new("modwarden")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Moderation event pipeline: mirrors removals, notifies moderators, audits actions")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/modwarden.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Start with every external write suppressed")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("FILE")
                .help("Classify a JSON-lines moderation log and print the resulting effects")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("community")
                .long("community")
                .value_name("NAME")
                .help("Community whose settings are used with --replay")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/modwarden.yaml");
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    if matches.get_flag("dry-run") {
        config.dry_run = true;
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(replay_file) = matches.get_one::<String>("replay") {
        let community = matches
            .get_one::<String>("community")
            .cloned()
            .or_else(|| config.monitored.first().cloned())
            .unwrap_or_default();
        if let Err(e) = replay_modlog(&config, replay_file, &community) {
            eprintln!("❌ Replay failed: {e:#}");
            process::exit(1);
        }
        return;
    }

    log::info!("Starting modwarden...");
    if let Err(e) = run(config) {
        log::error!("modwarden error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();

    if let Err(e) = config.validate() {
        println!("❌ Configuration validation failed:");
        println!("Error: {e}");
        process::exit(1);
    }

    let registry = config.registry();
    println!("Dry run: {}", config.dry_run);
    println!("Watermark policy: {:?}", config.watermark_policy);
    println!("Monitored communities: {}", config.monitored.len());
    for name in &config.monitored {
        let community = registry.resolve(name);
        let source = if registry.is_listed(name) {
            "own settings"
        } else {
            "default settings"
        };
        println!("  r/{name} ({source})");
        println!(
            "    mirror: {}, removals: {}",
            community.mirror_board.as_deref().unwrap_or("-"),
            community.removals_board.as_deref().unwrap_or("-")
        );
        println!(
            "    modmail: {}, toxicity: {}, audit: {}",
            community.features.modmail, community.features.toxicity, community.features.audit
        );
        if community.features.toxicity && config.toxicity.is_none() {
            println!("    ⚠️  toxicity is enabled but no toxicity endpoint is configured");
        }
    }
    println!("✅ Configuration is valid");
}

fn replay_modlog(config: &Config, file: &str, community: &str) -> anyhow::Result<()> {
    let community = config.registry().resolve(community);
    println!("🧪 Replaying {file} as r/{}", community.name);
    println!();

    let platform = Arc::new(LoggingPlatform::new(config.offline_moderators.clone()));
    let tracker = CommunityTracker::with_watermark(
        community,
        platform,
        DateTime::<Utc>::default(),
        WatermarkPolicy::Static,
    );
    let classifier = ActionClassifier::new(&config.classifier);

    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?;
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: ModerationEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                println!("❌ line {}: {e}", index + 1);
                continue;
            }
        };

        match classifier.classify(&event, &tracker, Utc::now()) {
            Ok(effects) if effects.is_empty() => println!("· {}: no effects", event.item_id()),
            Ok(effects) => {
                println!("📋 {}", event.item_id());
                for effect in effects {
                    println!("   → {}", effect.label());
                }
            }
            Err(e) => println!("❌ {}: {e}", event.item_id()),
        }
    }
    Ok(())
}

/// Shared pieces every worker is built from.
struct Pipeline {
    config: Config,
    clock: Arc<dyn Clock>,
    dry_run: DryRun,
    notifier: Arc<ErrorNotifier>,
    platform: Arc<LoggingPlatform>,
    chat: Arc<dyn ChatSender>,
    platform_gate: Arc<RateLimitedDispatcher>,
    chat_gate: Arc<RateLimitedDispatcher>,
    toxicity: Option<Arc<dyn ToxicityClassifier>>,
}

impl Pipeline {
    fn new(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dry_run = DryRun::new(config.dry_run);

        let chat: Arc<dyn ChatSender> = if config.chat_webhooks.is_empty() {
            log::warn!("No chat webhooks configured, chat messages are only logged");
            Arc::new(LogChat)
        } else {
            Arc::new(WebhookChat::new(&config.chat_webhooks)?)
        };
        let notifier = Arc::new(ErrorNotifier::new(chat.clone(), config.error_chat.clone()));

        let gate = |name: &str| {
            Arc::new(RateLimitedDispatcher::new(
                name,
                config.dispatch.clone(),
                dry_run.clone(),
                clock.clone(),
                notifier.clone(),
            ))
        };
        let platform_gate = gate("platform");
        let chat_gate = gate("chat");

        let toxicity = match &config.toxicity {
            Some(toxicity) => {
                Some(Arc::new(PerspectiveClient::new(toxicity)?) as Arc<dyn ToxicityClassifier>)
            }
            None => None,
        };

        Ok(Self {
            platform: Arc::new(LoggingPlatform::new(config.offline_moderators.clone())),
            config,
            clock,
            dry_run,
            notifier,
            chat,
            platform_gate,
            chat_gate,
            toxicity,
        })
    }

    /// Executor for one community. Built per task run so the audit trail's
    /// last row is re-read after a restart.
    fn executor(&self, community: &Community) -> Arc<EffectExecutor> {
        let executor = EffectExecutor::new(
            self.platform.clone(),
            self.platform_gate.clone(),
            self.chat.clone(),
            self.chat_gate.clone(),
        );
        match (&community.audit_sheet, community.features.audit) {
            (Some(sheet), true) => {
                let sink = Arc::new(JsonlAuditSink::new(&self.config.audit_dir, sheet));
                let recorder = AuditRecorder::new(sink, self.clock.now());
                let gate = RateLimitedDispatcher::new(
                    &format!("audit {sheet}"),
                    self.config.dispatch.clone(),
                    self.dry_run.clone(),
                    self.clock.clone(),
                    self.notifier.clone(),
                );
                Arc::new(executor.with_audit(recorder, gate))
            }
            _ => Arc::new(executor),
        }
    }

    fn feed_path(&self, community: &Community, category: &str) -> PathBuf {
        Path::new(&self.config.feeds.dir)
            .join(&community.name)
            .join(format!("{category}.jsonl"))
    }

    fn feed<T>(&self, community: &Community, category: &str) -> Arc<JsonlFeed<T>> {
        Arc::new(JsonlFeed::new(
            self.feed_path(community, category),
            self.config.feeds.backlog,
            Duration::from_millis(self.config.feeds.poll_interval_ms),
        ))
    }

    fn modlog_factory(self: &Arc<Self>, community: Community) -> TaskFactory {
        let pipeline = self.clone();
        let source = self.feed::<ModerationEvent>(&community, "modlog");
        // Built on the first run that can reach the mirror board, then kept
        // so an advanced watermark outlives restarts.
        let slot = Arc::new(TrackerSlot::default());
        Arc::new(move || -> anyhow::Result<Box<dyn Task>> {
            let tracker = slot.get_or_try_init(|| {
                CommunityTracker::new(
                    community.clone(),
                    pipeline.platform.clone(),
                    &*pipeline.platform,
                    pipeline.config.watermark_policy,
                    pipeline.clock.now(),
                )
            })?;
            let handler = ModLogHandler::new(
                tracker,
                ActionClassifier::new(&pipeline.config.classifier),
                pipeline.executor(&community),
                pipeline.clock.clone(),
            );
            Ok(Box::new(StreamWorker::new(
                &format!("{}/modlog", community.name),
                source.clone(),
                Arc::new(handler),
                pipeline.notifier.clone(),
            )) as Box<dyn Task>)
        })
    }

    fn modmail_factory(self: &Arc<Self>, community: Community) -> TaskFactory {
        let pipeline = self.clone();
        let source = self.feed::<ModmailConversation>(&community, "modmail");
        let replay = Arc::new(ReplayGuard::default());
        Arc::new(move || -> anyhow::Result<Box<dyn Task>> {
            let responder =
                ModmailResponder::new(pipeline.config.modmail.clone(), pipeline.platform.clone());
            let handler = ModmailHandler::new(
                community.clone(),
                responder,
                pipeline.executor(&community),
                pipeline.clock.clone(),
            );
            Ok(Box::new(StreamWorker::new(
                &format!("{}/modmail", community.name),
                source.clone(),
                Arc::new(handler),
                pipeline.notifier.clone(),
            )
            .with_replay_guard(replay.clone())) as Box<dyn Task>)
        })
    }

    fn comments_factory(
        self: &Arc<Self>,
        community: Community,
        classifier: Arc<dyn ToxicityClassifier>,
    ) -> TaskFactory {
        let pipeline = self.clone();
        let source = self.feed::<Comment>(&community, "comments");
        let replay = Arc::new(ReplayGuard::default());
        Arc::new(move || -> anyhow::Result<Box<dyn Task>> {
            let handler = CommentHandler::new(
                community.clone(),
                CommentScreener::new(classifier.clone()),
                pipeline.executor(&community),
            );
            Ok(Box::new(StreamWorker::new(
                &format!("{}/comments", community.name),
                source.clone(),
                Arc::new(handler),
                pipeline.notifier.clone(),
            )
            .with_replay_guard(replay.clone())) as Box<dyn Task>)
        })
    }

    fn supervisors(self: &Arc<Self>) -> Vec<Supervisor> {
        let registry = self.config.registry();
        let policy = RestartPolicy::from_config(&self.config.supervisor);
        let mut supervisors = Vec::new();

        for name in &self.config.monitored {
            let community = registry.resolve(name);
            let mut add = |category: &str, factory: TaskFactory| {
                supervisors.push(Supervisor::new(
                    &format!("{name}/{category}"),
                    factory,
                    policy.clone(),
                    self.notifier.clone(),
                ));
            };

            add("modlog", self.modlog_factory(community.clone()));
            if community.features.modmail {
                add("modmail", self.modmail_factory(community.clone()));
            }
            if community.features.toxicity {
                match &self.toxicity {
                    Some(classifier) => add(
                        "comments",
                        self.comments_factory(community.clone(), classifier.clone()),
                    ),
                    None => log::warn!(
                        "Toxicity is enabled for {name} but no toxicity endpoint is configured"
                    ),
                }
            }
        }
        supervisors
    }
}

fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let control_socket = config.control_socket.clone();

    let pipeline = Arc::new(Pipeline::new(config)?);
    pipeline.notifier.announce_online(pipeline.dry_run.is_enabled());

    let mut supervisors = pipeline.supervisors();
    for supervisor in &mut supervisors {
        supervisor.start()?;
    }
    log::info!("{} workers running", supervisors.len());

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let outcome = runtime.block_on(wait_for_shutdown(control_socket, pipeline.dry_run.clone()));

    for supervisor in &supervisors {
        supervisor.stop();
    }
    for supervisor in &mut supervisors {
        supervisor.join();
    }
    log::info!("All workers stopped");
    outcome
}

async fn wait_for_shutdown(control_socket: Option<String>, dry_run: DryRun) -> anyhow::Result<()> {
    match control_socket {
        Some(path) => {
            tokio::select! {
                result = control::serve(&path, dry_run) => result?,
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    log::info!("Received shutdown signal, stopping workers...");
    Ok(())
}
