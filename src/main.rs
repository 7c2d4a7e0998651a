use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use taskgrid::metrics::start_metrics_server;
use taskgrid::{
    LocalServer, LoopbackChannel, NodeRegistry, RemoteServer, SchedulerConfig, SharedTask,
    TaskBuilder, TaskPriority, TaskScheduler,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TASKGRID_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = SchedulerConfig::load(&path);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = config
                .as_ref()
                .map(|c| c.get_logging_level())
                .unwrap_or_else(|_| "info".to_string());
            EnvFilter::new(level)
        }))
        .init();

    let config = config.unwrap_or_else(|err| {
        warn!(path = %path, error = %err, "config unavailable, using defaults");
        SchedulerConfig::default()
    });
    info!(?config, "scheduler configuration");

    if config.metrics_enabled {
        if let Err(e) = start_metrics_server(config.metrics_port) {
            warn!(error = %e, "metrics server failed to start");
        }
    }

    // Nodes: two in-process servers and one served over the loopback transport
    let registry = Arc::new(NodeRegistry::new());
    registry.bind(
        "edge-1",
        Arc::new(LoopbackChannel::new(LocalServer::from_config("edge-1", &config))),
    );

    let scheduler = TaskScheduler::from_config(&config);
    scheduler
        .add_server(&LocalServer::from_config("local-a", &config))
        .await?;
    scheduler
        .add_server(&LocalServer::from_config("local-b", &config))
        .await?;
    let remote = RemoteServer::connect("edge-1", registry.clone(), config.remote.clone()).await?;
    scheduler.add_server(&remote).await?;

    let priorities = TaskPriority::ORDER;
    let mut ids = Vec::new();

    for n in 0..12 {
        let id = format!("job-{}", &Uuid::new_v4().to_string()[..8]);
        let work_ms = 5 + (n as u64 * 7) % 35;
        let mut builder = TaskBuilder::new(id.clone())
            .priority(priorities[n % priorities.len()])
            .estimated(Duration::from_millis(work_ms))
            .work(Duration::from_millis(work_ms));

        // every fourth job waits on the one before it
        if n % 4 == 3 {
            if let Some(prev) = ids.last() {
                builder = builder.depends_on([String::clone(prev)]);
            }
        }

        let task: SharedTask = Arc::new(builder.build()?);
        scheduler.schedule_task(task).await?;
        ids.push(id);
    }
    info!(submitted = ids.len(), "demo tasks submitted");

    let completed = scheduler.execute_all().await?;
    for (server, tasks) in &completed {
        let ids: Vec<&str> = tasks.iter().map(|t| t.id()).collect();
        info!(server = %server, completed = ?ids, "server results");
    }

    let report: BTreeMap<_, _> = scheduler.server_stats().await.into_iter().collect();
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
