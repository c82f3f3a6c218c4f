use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use slotgate::clock::{Clock, SystemClock};
use slotgate::factory::{OpenedStore, build_engine, open_counter_store};
use slotgate::keys;
use slotgate::scheduler::{
    Job, JobHandler, LoggingFailureReporter, Scheduler, SchedulerError, TokioDispatcher, Worker,
};
use slotgate::settings::AppConfig;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Admits jobs read from stdin under per-queue minute and hour ceilings
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// capacity of the worker channel
    #[arg(long, default_value = "1024")]
    channel_capacity: usize,

    /// how often expired counters are purged from the store
    #[arg(long, default_value = "300")]
    purge_interval_secs: u64,
}

/// One job submission per stdin line.
#[derive(Debug, Deserialize)]
struct SubmitLine {
    queue: String,
    payload: String,
}

/// Stands in for the business side: admitted jobs are only logged.
struct LogJobHandler;

#[async_trait]
impl JobHandler for LogJobHandler {
    async fn run(&self, job: &Job) -> anyhow::Result<()> {
        info!(
            queue = %job.queue,
            job_id = %job.id,
            defer_cycles = job.defer_cycles,
            payload = %String::from_utf8_lossy(&job.payload),
            "executing job"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    slotgate::trace::init(cfg.logging.format)?;

    let clock: Arc<dyn Clock> = SystemClock::new_arc();
    let metrics = slotgate::metrics::init()?;
    let opened = open_counter_store(&cfg.store, Arc::clone(&clock)).await?;
    let engine = Arc::new(build_engine(&cfg, Arc::clone(&opened.store), Some(metrics.clone())));

    let reporter = Arc::new(LoggingFailureReporter);
    let (dispatcher, rx) = TokioDispatcher::new(args.channel_capacity, reporter.clone());
    let scheduler = Arc::new(
        Scheduler::new(
            engine,
            dispatcher.clone(),
            reporter,
            Arc::new(LogJobHandler),
            Arc::clone(&clock),
        )
        .with_metrics(metrics.clone()),
    );
    let mut worker =
        tokio::spawn(Worker::new(Arc::clone(&scheduler), rx).run(dispatcher.subscribe_shutdown()));

    if let Some(slate) = opened.slate.clone() {
        let mut shutdown = dispatcher.subscribe_shutdown();
        let every = Duration::from_secs(args.purge_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = slate.purge_expired(keys::COUNTER_PREFIX).await {
                            warn!(error = %e, "failed to purge expired counters");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    info!(queues = cfg.queues.len(), "slotgate started, reading jobs from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let submit: SubmitLine = match serde_json::from_str(&line) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed job line");
                        continue;
                    }
                };
                match scheduler.submit(&submit.queue, Bytes::from(submit.payload)).await {
                    Ok(handle) => info!(queue = %handle.queue, job_id = %handle.job_id, "accepted"),
                    Err(e) => warn!(error = %e, "job not accepted"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            // Only returns early when the counter store is lost
            stopped = &mut worker => return stop(stopped?, &dispatcher, &opened).await,
        }
    }

    // Stdin closed: keep serving deferred jobs until interrupted
    if dispatcher.pending() > 0 {
        info!(pending = dispatcher.pending(), "waiting for deferred jobs, ctrl-c to stop");
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal?,
            stopped = &mut worker => return stop(stopped?, &dispatcher, &opened).await,
        }
    }

    dispatcher.shutdown();
    let stopped = worker.await?;
    info!("{}", metrics.render());
    stop(stopped, &dispatcher, &opened).await
}

async fn stop(
    worker_result: Result<(), SchedulerError>,
    dispatcher: &TokioDispatcher,
    opened: &OpenedStore,
) -> anyhow::Result<()> {
    dispatcher.shutdown();
    if let Err(e) = opened.close().await {
        warn!(error = %e, "failed to close counter store");
    }
    worker_result?;
    Ok(())
}
