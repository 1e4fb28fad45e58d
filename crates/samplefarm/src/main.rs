mod cli;
mod format;
mod logging;
mod shutdown;
mod ui;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;

use samplefarm_core::OrchestratorConfig;
use samplefarm_engine::model::{MasterTaskStatus, NewInstance, TaskKind};
use samplefarm_engine::recovery::{self, SWEEP_BATCH};
use samplefarm_engine::store::{MasterQuery, SubTaskQuery};
use samplefarm_engine::{
    Backends, BatchExecute, CreateMasterTask, DirectorySampleSource, EngineConfig, EngineEvent,
    SampleSelection, SampleSource, TaskService, TaskStore, start_engine,
};

use crate::cli::{Cli, Command, CreateArgs, ExecuteArgs, InstanceCommand};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_signal_handler};
use crate::ui::WatchUi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = OrchestratorConfig::load_or_default(cli.config.as_deref())?;
    if let Some(path) = &cli.database {
        cfg.storage.database_path = path.clone();
    }
    if let Some(dir) = &cli.samples_dir {
        cfg.storage.samples_dir = dir.clone();
    }
    let _log_guard = logging::init_logging(&cfg.logging, cli.log_level.as_deref(), cli.log_json)?;

    let store = TaskStore::open(&cfg.storage.database_path)
        .with_context(|| format!("opening database {}", cfg.storage.database_path.display()))?
        .with_timeout(Duration::from_secs(cfg.storage.store_timeout_secs));
    let samples: Arc<dyn SampleSource> =
        Arc::new(DirectorySampleSource::new(cfg.storage.samples_dir.clone()));
    let service = TaskService::new(store, samples.clone());
    let json = cli.json;

    match cli.command {
        Command::Serve { no_recovery } => serve(cfg, service, samples, no_recovery).await,
        Command::Create(args) => create(&cfg, &service, &args, json).await,
        Command::AddSamples {
            master,
            samples,
            priority,
        } => {
            let added = service.add_samples(master, samples, priority).await?;
            if json {
                format::print_json(&serde_json::json!({ "added": added }))
            } else {
                println!("added {added} sample(s) to {master}");
                Ok(())
            }
        }
        Command::Execute(args) => execute(&cfg, &service, &args, json).await,
        Command::Pause { master, reason } => {
            let n = service.pause(master, reason).await?;
            report_count(json, "paused", n)
        }
        Command::Resume { master } => {
            let n = service.resume(master).await?;
            report_count(json, "resumed", n)
        }
        Command::Cancel { master } => {
            let n = service.cancel(master).await?;
            report_count(json, "cancelled", n)
        }
        Command::Status { master } => {
            let status = service.runtime_status(master).await?;
            if json {
                format::print_json(&status)
            } else {
                println!("{}", format::status_block(&status));
                Ok(())
            }
        }
        Command::Show { master } => {
            let task = service.master_detail(master).await?;
            if json {
                format::print_json(&task)
            } else {
                println!("{}", format::master_detail(&task));
                Ok(())
            }
        }
        Command::List {
            status,
            analyzer,
            page,
            page_size,
        } => {
            let tasks = service
                .list_master_tasks(MasterQuery {
                    status,
                    analyzer_type: analyzer,
                    page,
                    page_size,
                })
                .await?;
            if json {
                return format::print_json(&tasks);
            }
            for task in &tasks.items {
                println!("{}", format::master_line(task));
            }
            println!("page {} ({} total)", tasks.page, tasks.total);
            Ok(())
        }
        Command::Subtasks {
            master,
            status,
            keyword,
            page,
            page_size,
        } => {
            let subs = service
                .list_sub_tasks(
                    master,
                    SubTaskQuery {
                        status,
                        keyword,
                        page,
                        page_size,
                    },
                )
                .await?;
            if json {
                return format::print_json(&subs);
            }
            for sub in &subs.items {
                println!("{}", format::sub_task_line(sub));
            }
            println!("page {} ({} total)", subs.page, subs.total);
            Ok(())
        }
        Command::Result { sub_task } => {
            let result = service.analysis_result(sub_task).await?;
            if json {
                format::print_json(&result)
            } else {
                println!("{}", format::result_text(&result)?);
                Ok(())
            }
        }
        Command::Watch {
            master,
            interval_ms,
        } => watch(&service, master, interval_ms, json).await,
        Command::Delete { master } => {
            service.delete_master_task(master).await?;
            if !json {
                println!("deleted {master}");
            }
            Ok(())
        }
        Command::Preview { analyzer, filter } => {
            let preview = service.preview(analyzer, filter.to_filter()).await?;
            if json {
                format::print_json(&preview)
            } else {
                println!("{}", format::preview_block(&preview));
                Ok(())
            }
        }
        Command::History {
            sample,
            page,
            page_size,
        } => {
            let history = service
                .sample_analysis_history(&sample, page, page_size)
                .await?;
            if json {
                return format::print_json(&history);
            }
            println!("{}", format::history_header(&history));
            for analysis in &history.analyses.items {
                println!("{}", format::analysis_line(analysis));
            }
            println!("page {} ({} total)", history.analyses.page, history.analyses.total);
            Ok(())
        }
        Command::Stats {
            analyzer,
            instance,
            days,
        } => {
            let stats = service.task_statistics(analyzer, instance, days).await?;
            if json {
                format::print_json(&stats)
            } else {
                println!("{}", format::stats_block(&stats));
                Ok(())
            }
        }
        Command::Instance(cmd) => instance(&service, cmd, json).await,
        Command::Recover => {
            let stats = recovery::scan_once(service.store(), &cfg.recovery).await?;
            let sweep = recovery::sweep_once(service.store(), SWEEP_BATCH).await?;
            if json {
                format::print_json(&serde_json::json!({ "recovery": stats, "sweep": sweep }))
            } else {
                println!(
                    "stuck {} reset {} finalized {} | sweep examined {} rearmed {}",
                    stats.stuck_found, stats.reset, stats.finalized, sweep.examined, sweep.rearmed
                );
                Ok(())
            }
        }
    }
}

fn report_count(json: bool, verb: &str, n: u32) -> anyhow::Result<()> {
    if json {
        return format::print_json(&serde_json::json!({ verb: n }));
    }
    println!("{verb} {n} sub-task(s)");
    Ok(())
}

async fn create(
    cfg: &OrchestratorConfig,
    service: &TaskService,
    args: &CreateArgs,
    json: bool,
) -> anyhow::Result<()> {
    let samples = if args.samples.is_empty() {
        SampleSelection::Filter(args.filter())
    } else {
        SampleSelection::Ids(args.samples.clone())
    };
    let mut master = service
        .create_master_task(CreateMasterTask {
            name: args.name.clone(),
            analyzer: args.analyzer,
            kind: if args.single {
                TaskKind::Single
            } else {
                TaskKind::Batch
            },
            samples,
            instance_ids: args.instances.clone(),
            parameters: args.parameters.clone(),
            priority: args.priority,
        })
        .await?;
    if args.execute {
        master = service
            .batch_execute(BatchExecute {
                master_task_id: master.id,
                execution: cfg.execution.clone(),
            })
            .await?;
    }
    if json {
        format::print_json(&master)
    } else {
        println!("{}", format::master_line(&master));
        Ok(())
    }
}

async fn execute(
    cfg: &OrchestratorConfig,
    service: &TaskService,
    args: &ExecuteArgs,
    json: bool,
) -> anyhow::Result<()> {
    let current = service.master_detail(args.master).await?;
    let base = current.execution.unwrap_or_else(|| cfg.execution.clone());
    let master = service
        .batch_execute(BatchExecute {
            master_task_id: args.master,
            execution: args.apply(base),
        })
        .await?;
    if json {
        format::print_json(&master)
    } else {
        println!("{}", format::master_line(&master));
        Ok(())
    }
}

async fn instance(service: &TaskService, cmd: InstanceCommand, json: bool) -> anyhow::Result<()> {
    let changed = match cmd {
        InstanceCommand::Add {
            name,
            analyzer,
            base_url,
            description,
            timeout_seconds,
            max_concurrent_tasks,
            health_check_interval,
            disabled,
        } => {
            let mut new = NewInstance::with_defaults(name, analyzer, base_url);
            new.description = description;
            new.enabled = !disabled;
            if let Some(v) = timeout_seconds {
                new.timeout_seconds = v;
            }
            if let Some(v) = max_concurrent_tasks {
                new.max_concurrent_tasks = v;
            }
            if let Some(v) = health_check_interval {
                new.health_check_interval = v;
            }
            service.add_instance(new).await?
        }
        InstanceCommand::List { analyzer } => {
            let instances = service.list_instances(analyzer).await?;
            if json {
                return format::print_json(&instances);
            }
            for inst in &instances {
                println!("{}", format::instance_line(inst));
            }
            return Ok(());
        }
        InstanceCommand::Enable { id } => service.set_instance_enabled(id, true).await?,
        InstanceCommand::Disable { id } => service.set_instance_enabled(id, false).await?,
        InstanceCommand::Remove { id } => {
            service.remove_instance(id).await?;
            if !json {
                println!("removed {id}");
            }
            return Ok(());
        }
    };
    if json {
        format::print_json(&changed)
    } else {
        println!("{}", format::instance_line(&changed));
        Ok(())
    }
}

async fn watch(
    service: &TaskService,
    master: uuid::Uuid,
    interval_ms: u64,
    json: bool,
) -> anyhow::Result<()> {
    let task = service.master_detail(master).await?;
    let mut ui = WatchUi::new(&task.name, task.total_samples, !json && std::io::stderr().is_terminal());

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_signal_handler(Arc::new(ShutdownController::new()), shutdown_tx);

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let last = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = service.runtime_status(master).await?;
                if !json {
                    ui.update(&status);
                }
                if status.status.is_terminal() {
                    break status;
                }
            }
            Some(_) = shutdown_rx.recv() => {
                ui.finish();
                return Ok(());
            }
        }
    };
    ui.finish();

    if json {
        format::print_json(&last)
    } else {
        println!("{}", format::status_block(&last));
        Ok(())
    }
}

async fn serve(
    mut cfg: OrchestratorConfig,
    service: TaskService,
    samples: Arc<dyn SampleSource>,
    no_recovery: bool,
) -> anyhow::Result<()> {
    if no_recovery {
        cfg.recovery.enabled = false;
    }
    let seeded = service.seed_instances(&cfg.instances).await?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("sforch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")?;
    let engine = start_engine(
        EngineConfig::from_config(&cfg),
        service.store().clone(),
        Backends::http(http),
        samples,
    );
    let mut events = engine.subscribe();

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_signal_handler(Arc::new(ShutdownController::new()), shutdown_tx);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %cfg.storage.database_path.display(),
        samples_dir = %cfg.storage.samples_dir.display(),
        instances_seeded = seeded.len(),
        recovery = cfg.recovery.enabled,
        "sforch serving"
    );

    let mut immediate_exit = false;
    loop {
        tokio::select! {
            Some(ev) = shutdown_rx.recv() => match ev {
                ShutdownEvent::Graceful => {
                    tracing::warn!("stop requested, letting in-flight calls finish (interrupt again to exit immediately)");
                    engine.request_stop();
                }
                ShutdownEvent::Immediate => {
                    tracing::warn!("stop requested again, exiting immediately");
                    immediate_exit = true;
                    break;
                }
            },
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event log lagging");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let stopped = matches!(evt, EngineEvent::Stopped);
                log_event(&evt);
                if stopped {
                    break;
                }
            }
        }
    }

    if immediate_exit {
        std::process::exit(130);
    }
    engine.wait().await
}

fn log_event(evt: &EngineEvent) {
    match evt {
        EngineEvent::Started => tracing::info!("engine started"),
        EngineEvent::StopRequested => tracing::info!("engine stopping"),
        EngineEvent::DispatchStarted { master_task_id } => {
            tracing::debug!(%master_task_id, "dispatch loop started");
        }
        EngineEvent::SubTaskSubmitted {
            master_task_id,
            sub_task_id,
            instance_id,
            external_task_id,
        } => tracing::info!(
            %master_task_id,
            %sub_task_id,
            %instance_id,
            external_task_id = %external_task_id,
            "sample submitted"
        ),
        EngineEvent::SubTaskCompleted {
            master_task_id,
            sub_task_id,
        } => tracing::info!(%master_task_id, %sub_task_id, "analysis result stored"),
        EngineEvent::SubTaskFailed {
            master_task_id,
            sub_task_id,
            error,
            will_retry,
        } => tracing::warn!(%master_task_id, %sub_task_id, will_retry, error = %error, "sub-task failed"),
        EngineEvent::MasterFinalized {
            master_task_id,
            status,
        } => {
            if *status == MasterTaskStatus::Completed {
                tracing::info!(%master_task_id, status = %status, "batch finished");
            } else {
                tracing::warn!(%master_task_id, status = %status, "batch finished");
            }
        }
        EngineEvent::InstanceHealthChanged {
            instance_id,
            name,
            status,
        } => tracing::info!(%instance_id, name = %name, status = %status, "instance health changed"),
        EngineEvent::RecoveryCompleted { stats } => tracing::info!(
            stuck_found = stats.stuck_found,
            reset = stats.reset,
            finalized = stats.finalized,
            "recovery scan finished"
        ),
        EngineEvent::SweepCompleted { stats } => tracing::info!(
            examined = stats.examined,
            rearmed = stats.rearmed,
            "failed-task sweep finished"
        ),
        EngineEvent::Warning { message } => tracing::warn!("{message}"),
        EngineEvent::Error { message } => tracing::error!("{message}"),
        EngineEvent::Stopped => tracing::info!("engine stopped"),
    }
}
