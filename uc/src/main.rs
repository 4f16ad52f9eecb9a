//! Undercity CLI entry point

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use fs2::FileExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use undercity::assess::{ComplexityAssessor, ModelRouter, RouterConfig, scan_metrics};
use undercity::cli::{Cli, Command, DaemonAction};
use undercity::config::{Config, StateDir};
use undercity::control::{ControlServer, DaemonClient, DaemonContext, DaemonLock};
use undercity::domain::{ModelTier, Task};
use undercity::learn::{DecisionCategory, DecisionTracker, FilePatternStore, KnowledgeBase, Resolution, Resolver};
use undercity::llm::{AnthropicClient, CommandAgent, LlmClient};
use undercity::logging;
use undercity::merge::MergeQueue;
use undercity::metrics::{self, MetricsWriter};
use undercity::orchestrator::{Orchestrator, OrchestratorConfig};
use undercity::planner::Planner;
use undercity::ratelimit::{RateLimitTracker, UsageGuard, UsageGuardConfig};
use undercity::state::{StateManager, migrate_legacy};
use undercity::verify::Verifier;
use undercity::worker::{Worker, WorkerConfig};

/// Exit codes: 0 success, 1 generic failure, 2 invalid configuration
#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "config error:".red(), e);
            return 2;
        }
    };
    if let Err(reason) = config.validate() {
        eprintln!("{} {}", "invalid config:".red(), reason);
        return 2;
    }

    match dispatch(cli, config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red(), e);
            1
        }
    }
}

/// Everything a stateful command needs
struct Session {
    config: Config,
    state_dir: StateDir,
    state: StateManager,
    tracker: Arc<RateLimitTracker>,
    guard: Arc<UsageGuard>,
}

impl Session {
    async fn open(config: Config) -> Result<Self> {
        let state_dir = config.state();
        state_dir.ensure()?;

        let state = StateManager::spawn(state_dir.db_path())?;
        migrate_legacy(&state_dir, &state).await?;

        let tracker = Arc::new(RateLimitTracker::load(config.rate_limit.clone(), state_dir.rate_limit_path()));
        let guard = Arc::new(UsageGuard::new(
            tracker.clone(),
            UsageGuardConfig {
                pause_threshold: config.rate_limit.pause_threshold,
                warning_threshold: config.rate_limit.warning_threshold,
                auto_pause: config.rate_limit.auto_pause,
                on_pause: Some(Arc::new(|reason| eprintln!("{} {}", "paused:".yellow(), reason))),
                on_warning: Some(Arc::new(|reason| eprintln!("{} {}", "usage warning:".yellow(), reason))),
            },
        ));

        Ok(Self {
            config,
            state_dir,
            state,
            tracker,
            guard,
        })
    }

    fn build_worker(&self) -> Result<Arc<Worker>> {
        let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::from_config(&self.config.llm)?);
        let agent = Arc::new(CommandAgent::new(&self.config.agent.command));

        let mut verifier = Verifier::new(self.config.verify.clone());
        if self.config.grind.no_typecheck {
            verifier = verifier.without_typecheck();
        }

        let planner = Planner::new(
            llm.clone(),
            self.config.llm.clone(),
            self.guard.clone(),
            KnowledgeBase::new(self.state.clone()),
            FilePatternStore::new(self.state.clone()),
            DecisionTracker::new(self.state.clone()),
            self.config.grind.max_tier,
        );

        let assessor = ComplexityAssessor::with_metrics(scan_metrics("."));
        let router = ModelRouter::new(RouterConfig {
            model_override: self.config.grind.model_override,
            max_tier: self.config.grind.max_tier,
            reviews_enabled: self.config.grind.review,
        });

        Ok(Arc::new(Worker::new(
            self.state.clone(),
            agent,
            llm,
            self.config.llm.clone(),
            self.guard.clone(),
            planner,
            verifier,
            assessor,
            router,
            WorkerConfig {
                max_attempts: self.config.grind.max_attempts,
                max_retries_per_tier: self.config.grind.max_retries_per_tier,
                no_op_threshold: self.config.grind.no_op_threshold,
                review: self.config.grind.review,
                agent_timeout_ms: self.config.agent.timeout_ms,
                retry_base_delay_ms: 1000,
                repo_root: std::path::PathBuf::from("."),
                create_branch: !self.config.grind.no_commit,
                metrics_min_samples: 5,
            },
        )))
    }

    fn build_orchestrator(&self, count: Option<u32>) -> Result<Orchestrator> {
        let worker = self.build_worker()?;
        let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::from_config(&self.config.llm)?);

        let mut merge_queue = MergeQueue::new(self.state.clone(), self.config.merge.clone(), ".")
            .with_verifier(Verifier::new(self.config.verify.clone()));
        if self.config.grind.no_commit {
            merge_queue = merge_queue.without_push();
        }

        Ok(Orchestrator::new(
            self.state.clone(),
            worker,
            Arc::new(merge_queue),
            self.guard.clone(),
            llm,
            self.config.llm.clone(),
            OrchestratorConfig {
                max_concurrent: self.config.grind.max_concurrent,
                count,
                idle_delay_ms: 500,
            },
        ))
    }

    /// Exclusive per-state-directory lock; held for the session's lifetime
    fn acquire_lock(&self) -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.state_dir.orchestrator_lock_path())?;
        file.try_lock_exclusive()
            .context("Another orchestrator is already running against this state directory")?;
        Ok(file)
    }
}

async fn dispatch(cli: Cli, mut config: Config) -> Result<()> {
    match cli.command {
        Command::Grind {
            goal,
            count,
            parallel,
            supervised,
            model,
            worker,
            no_commit,
            no_typecheck,
            review,
        } => {
            logging::init_logging(cli.verbose);

            if let Some(parallel) = parallel {
                config.grind.max_concurrent = parallel;
            }
            if supervised {
                config.grind.max_concurrent = 1;
            }
            if let Some(model) = &model {
                config.grind.model_override =
                    Some(ModelTier::parse(model).ok_or_else(|| eyre::eyre!("unknown model tier: {}", model))?);
            }
            config.grind.no_commit |= no_commit;
            config.grind.no_typecheck |= no_typecheck;
            config.grind.review |= review;
            if let Err(reason) = config.validate() {
                eyre::bail!("invalid config: {}", reason);
            }

            let session = Session::open(config).await?;
            let _lock = session.acquire_lock()?;

            if let Some(goal) = goal {
                let task = Task::new(goal);
                info!(task_id = %task.id, "Created task from goal");
                session.state.create_task(task).await?;
            }

            if worker {
                return run_single_worker(&session).await;
            }

            let orchestrator = session.build_orchestrator(count)?;
            let summary = orchestrator.run_batch().await?;

            MetricsWriter::new(session.state_dir.live_metrics_path(), session.state.clone(), session.tracker.clone())
                .write(Some(&summary.batch_id))
                .await?;
            if let Err(e) = logging::rotate_batch_log(&session.state_dir, &summary.batch_id) {
                warn!(error = %e, "Batch log rotation failed");
            }

            println!(
                "{} {} complete, {} failed, {} blocked",
                "grind:".green(),
                summary.completed,
                summary.failed,
                summary.blocked
            );
            // A session that completed with some failures is still success
            Ok(())
        }

        Command::Limits => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;
            print!("{}", metrics::format_limits(&session.tracker));
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Watch => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;
            loop {
                let board = session.state.board_metrics().await?;
                println!(
                    "{} pending {} | in progress {} | blocked {} | complete {} | failed {}",
                    chrono::Local::now().format("%H:%M:%S"),
                    board.pending,
                    board.in_progress.to_string().cyan(),
                    board.blocked.to_string().yellow(),
                    board.complete.to_string().green(),
                    board.failed.to_string().red(),
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }

        Command::Serve { port, grind } => {
            let port = port.unwrap_or(config.control.port);
            let session = Session::open(config).await?;
            logging::init_file_logging(&session.state_dir, cli.verbose)?;

            let lock = DaemonLock::new(session.state_dir.daemon_lock_path());
            lock.acquire(port)?;

            let orchestrator = session.build_orchestrator(None)?;
            let context = Arc::new(DaemonContext::new(
                session.state.clone(),
                session.tracker.clone(),
                orchestrator.pause_flag(),
                orchestrator.stop_flag(),
                port,
            ));

            let (addr, server) = ControlServer::serve_with_addr(context, port).await?;
            println!("{} listening on {}", "daemon:".green(), addr);

            if grind {
                let stop = orchestrator.stop_flag();
                let grinder = tokio::spawn(async move {
                    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                        if let Err(e) = orchestrator.run_batch().await {
                            warn!(error = %e, "Batch failed");
                        }
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                });
                let result = server.await;
                grinder.abort();
                lock.release();
                result
            } else {
                let result = server.await;
                lock.release();
                result
            }
        }

        Command::Daemon { action } => {
            logging::init_logging(cli.verbose);
            let state_dir = config.state();
            let port = DaemonLock::new(state_dir.daemon_lock_path())
                .live()
                .map(|info| info.port)
                .unwrap_or(config.control.port);
            let client = DaemonClient::new(port);

            match action {
                DaemonAction::Status => {
                    let status = client.status().await?;
                    println!(
                        "daemon pid {} on port {} (up {}s, {})",
                        status.daemon.pid,
                        status.daemon.port,
                        status.daemon.uptime / 1000,
                        if status.daemon.paused { "paused".yellow() } else { "running".green() },
                    );
                    println!(
                        "tasks: {} pending, {} in progress, {} complete",
                        status.tasks.pending, status.tasks.in_progress, status.tasks.complete
                    );
                }
                DaemonAction::Stop => {
                    client.stop().await?;
                    println!("{}", "daemon stopping".green());
                }
                DaemonAction::Pause => {
                    client.pause().await?;
                    println!("{}", "daemon paused".yellow());
                }
                DaemonAction::Resume => {
                    client.resume().await?;
                    println!("{}", "daemon resumed".green());
                }
            }
            Ok(())
        }

        Command::Status { human, events, count } => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;

            if events {
                let mut attempts = session.state.list_attempts(None).await?;
                attempts.sort_by_key(|a| std::cmp::Reverse(a.started_at));
                for attempt in attempts.into_iter().take(count) {
                    let status = if attempt.success { "ok".green() } else { "failed".red() };
                    println!(
                        "{} {} attempt {} [{}] {}",
                        attempt.task_id,
                        status,
                        attempt.number,
                        attempt.tier,
                        attempt.error_message.unwrap_or_default()
                    );
                }
            } else {
                let board = session.state.board_metrics().await?;
                if human {
                    println!(
                        "board: {} tasks ({} pending, {} in progress, {} blocked, {} complete, {} failed)",
                        board.total, board.pending, board.in_progress, board.blocked, board.complete, board.failed
                    );
                } else {
                    println!("{}", serde_json::to_string_pretty(&board)?);
                }
            }
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Postmortem { json } => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;
            let report = metrics::postmortem(&session.state).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_empty() {
                println!("no permanent failures");
            } else {
                for entry in report {
                    println!(
                        "{} [{} after {} attempts on {}]\n  {}",
                        entry.objective.bold(),
                        entry.category.red(),
                        entry.attempts,
                        entry.last_tier,
                        entry.sample_message
                    );
                }
            }
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Insights { json, since, last } => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;

            let since_ms = match since {
                Some(s) => Some(
                    chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                        .context("since must be YYYY-MM-DD")?
                        .and_hms_opt(0, 0, 0)
                        .map(|dt| dt.and_utc().timestamp_millis())
                        .unwrap_or(0),
                ),
                None => None,
            };

            let report = metrics::insights(&session.state, since_ms, last).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for entry in report {
                    println!("[{}] {} (confidence {:.1}, used {})", entry.category, entry.content, entry.confidence, entry.used);
                }
            }
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Patterns => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;
            for entry in metrics::patterns(&session.state).await? {
                println!(
                    "{} [{}] seen {} times, {} fixes\n  {}",
                    entry.signature, entry.category, entry.occurrences, entry.fixes, entry.sample_message
                );
            }
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Decisions { pending, process } => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;
            let tracker = DecisionTracker::new(session.state.clone());

            if process {
                // Resolve everything the system is allowed to answer
                let mut resolved = 0;
                for decision in tracker.pending().await? {
                    if decision.category == DecisionCategory::HumanRequired {
                        continue;
                    }
                    let (resolver, text) = match decision.category {
                        DecisionCategory::AutoHandle => (Resolver::Auto, "Proceed with the conservative default."),
                        _ => (Resolver::Pm, "Follow the repository's existing convention."),
                    };
                    if tracker
                        .resolve(
                            &decision.id,
                            Resolution {
                                resolved_by: resolver,
                                decision: text.to_string(),
                                reasoning: None,
                                confidence: Some(0.6),
                                outcome: None,
                                resolved_at: understore::now_ms(),
                            },
                        )
                        .await?
                    {
                        resolved += 1;
                    }
                }
                println!("resolved {} decisions", resolved);
            } else {
                let decisions = if pending {
                    tracker.pending().await?
                } else {
                    session.state.list_decisions(&[]).await?
                };
                for decision in decisions {
                    let status = match decision.resolution {
                        Some(resolution) => format!("resolved: {}", resolution.decision).green(),
                        None => format!("pending ({})", decision.category).yellow(),
                    };
                    println!("{}\n  {}", decision.question.bold(), status);
                }
            }
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Effectiveness => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;
            for entry in metrics::effectiveness(&session.state).await? {
                println!(
                    "{:>7}: {:>3} attempts, {:>5.1}% success, ${:.2}",
                    entry.tier,
                    entry.attempts,
                    entry.success_rate * 100.0,
                    entry.total_cost_usd
                );
            }
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Visualize { list, session: batch_id, open } => {
            logging::init_logging(cli.verbose);
            let session = Session::open(config).await?;
            let batches = session.state.list_batches().await?;

            if list {
                for batch in &batches {
                    println!(
                        "{} ({} done, {} failed)",
                        batch.id,
                        batch.completed_task_ids.len(),
                        batch.failed_task_ids.len()
                    );
                }
            } else if let Some(id) = batch_id {
                let batch = batches
                    .iter()
                    .find(|b| b.id == id)
                    .ok_or_else(|| eyre::eyre!("unknown session: {}", id))?;
                println!("{}", serde_json::to_string_pretty(batch)?);
            } else if open {
                match batches.last() {
                    Some(batch) => {
                        let path = session
                            .state_dir
                            .visualizations_dir()
                            .join(format!("session-{}.html", batch.id));
                        println!("{}", path.display());
                    }
                    None => println!("no sessions yet"),
                }
            } else {
                println!("{} sessions; use --list, -s <id>, or --open", batches.len());
            }
            session.state.shutdown().await.ok();
            Ok(())
        }

        Command::Init { dir } => {
            logging::init_logging(cli.verbose);
            let state_dir = StateDir::new(dir.unwrap_or_else(|| config.state_dir.clone()));
            state_dir.ensure()?;
            println!("{} {}", "initialised".green(), state_dir.root().display());
            Ok(())
        }

        Command::Setup => {
            logging::init_logging(cli.verbose);
            let mut problems = 0;

            for (name, command) in [
                ("git", "git --version".to_string()),
                ("typecheck", config.verify.typecheck_command.clone().unwrap_or_default()),
                ("test", config.verify.test_command.clone().unwrap_or_default()),
            ] {
                if command.is_empty() {
                    continue;
                }
                let head = command.split_whitespace().next().unwrap_or(&command);
                let found = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(format!("command -v {}", head))
                    .output()
                    .await
                    .map(|o| o.status.success())
                    .unwrap_or(false);
                if found {
                    println!("{} {} ({})", "ok".green(), name, head);
                } else {
                    println!("{} {} command not found: {}", "!!".red(), name, head);
                    problems += 1;
                }
            }

            if !std::path::Path::new(".undercityrc").exists() {
                Config::write_default(".undercityrc")?;
                println!("{} wrote .undercityrc", "ok".green());
            }

            config.state().ensure()?;
            if problems > 0 {
                eyre::bail!("{} setup problems found", problems);
            }
            Ok(())
        }

        Command::Config { init } => {
            logging::init_logging(cli.verbose);
            if init {
                Config::write_default(".undercityrc")?;
                println!("{} wrote .undercityrc", "ok".green());
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            Ok(())
        }

        Command::Oracle { situation } => {
            logging::init_logging(cli.verbose);
            let Some(situation) = situation else {
                println!("usage: uc oracle \"<situation>\"");
                return Ok(());
            };

            let session = Session::open(config).await?;
            let advice = metrics::oracle(&session.state, &situation).await?;
            if advice.is_empty() {
                println!("nothing relevant in the knowledge base yet");
            } else {
                for line in advice {
                    println!("{}", line);
                }
            }
            session.state.shutdown().await.ok();
            Ok(())
        }
    }
}

/// `--worker` mode: run exactly one ready task, no orchestration
async fn run_single_worker(session: &Session) -> Result<()> {
    let worker = session.build_worker()?;
    let mut pending = session.state.list_tasks(Some("pending"), None).await?;
    pending.sort_by_key(|t| std::cmp::Reverse(t.priority));

    let Some(task) = pending.first() else {
        println!("board is empty");
        return Ok(());
    };

    let outcome = worker.run(&task.id).await?;
    println!("{:?}", outcome);
    Ok(())
}
