use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vigil_core::{ChangeEvent, SystemClock};
use vigil_limit::RateLimiter;
use vigil_sched::{action_hash, ActionExecutor, Scheduler};
use vigil_triggers::{BaseMatcher, Evaluator, FieldDiffTrigger, PodCrashLoopTrigger};

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Vigil trigger engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a GVK and evaluate the configured triggers against its events
    Run {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        #[arg(long = "gvk", default_value = "v1/Pod")]
        gvk: String,
        /// Kubernetes namespace (default: all namespaces)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Trigger configuration file (YAML)
        #[arg(long = "config")]
        config: String,
    },
    /// Parse a trigger configuration file and report what it defines
    Validate {
        #[arg(long = "config")]
        config: String,
    },
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TriggerKind {
    PodCrashLoop,
    FieldDiff,
}

/// One configured trigger instance plus the action it schedules on fire.
#[derive(Debug, Deserialize)]
struct TriggerConfig {
    name: String,
    kind: TriggerKind,
    #[serde(default)]
    name_prefix: Option<String>,
    #[serde(default)]
    namespace_prefix: Option<String>,
    #[serde(default)]
    labels_selector: Option<String>,
    #[serde(default = "default_restart_count")]
    restart_count: i32,
    #[serde(default)]
    restart_reason: Option<String>,
    #[serde(default = "default_rate_limit_secs")]
    rate_limit_secs: i64,
    #[serde(default)]
    monitored_fields: Vec<String>,
    action: ActionConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct ActionConfig {
    name: String,
    #[serde(default)]
    params: serde_json::Value,
    /// Delay sequence in seconds; empty means run once, immediately.
    #[serde(default)]
    delays_secs: Vec<u64>,
    #[serde(default = "default_true")]
    replace_existing: bool,
}

fn default_restart_count() -> i32 {
    2
}

fn default_rate_limit_secs() -> i64 {
    3600
}

fn default_true() -> bool {
    true
}

impl TriggerConfig {
    fn matcher(&self) -> BaseMatcher {
        BaseMatcher {
            name_prefix: self.name_prefix.clone(),
            namespace_prefix: self.namespace_prefix.clone(),
            labels_selector: self
                .labels_selector
                .clone()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    fn build(&self) -> Box<dyn vigil_triggers::Trigger> {
        match self.kind {
            TriggerKind::PodCrashLoop => Box::new(PodCrashLoopTrigger {
                base: self.matcher(),
                restart_count: self.restart_count,
                restart_reason: self.restart_reason.clone(),
                rate_limit_secs: self.rate_limit_secs,
            }),
            TriggerKind::FieldDiff => Box::new(FieldDiffTrigger::new(
                self.matcher(),
                self.monitored_fields.clone(),
            )),
        }
    }
}

fn load_config(path: &str) -> Result<ConfigFile> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let cfg: ConfigFile = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path))?;
    Ok(cfg)
}

/// Placeholder executor: the real transport to a renderer/notifier lives
/// behind this trait; here each invocation is just recorded in the log.
struct LogExecutor;

#[async_trait::async_trait]
impl ActionExecutor for LogExecutor {
    async fn run(&self, action_name: &str, params: &serde_json::Value) -> Result<()> {
        info!(action = %action_name, %params, "action invoked");
        Ok(())
    }
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

async fn handle_fired(
    cfg: &TriggerConfig,
    event: &ChangeEvent,
    scheduler: &Scheduler,
    executor: &dyn ActionExecutor,
) {
    let action = &cfg.action;
    if action.delays_secs.is_empty() {
        if let Err(e) = executor.run(&action.name, &action.params).await {
            warn!(trigger = %cfg.name, action = %action.name, error = %e, "action failed");
        }
        return;
    }
    // One logical job per (trigger, resource); repeat firings for the same
    // resource replace the pending series instead of stacking a new one.
    let tag = format!(
        "{}_{}_{}",
        cfg.name,
        event.current.name(),
        event.current.namespace().unwrap_or("")
    );
    let key = action_hash(&action.name, &action.params, &[("key".to_string(), tag)]);
    let delays: Vec<Duration> = action
        .delays_secs
        .iter()
        .map(|s| Duration::from_secs(*s))
        .collect();
    info!(trigger = %cfg.name, resource = %event.current.name(), delays = ?action.delays_secs, "scheduling action series");
    scheduler.schedule_series(&key, &delays, &action.name, action.params.clone(), action.replace_existing);
}

async fn run(gvk: String, namespace: Option<String>, config_path: String) -> Result<()> {
    let cfg = load_config(&config_path)?;
    if cfg.triggers.is_empty() {
        anyhow::bail!("{}: no triggers configured", config_path);
    }

    let limiter = Arc::new(RateLimiter::new(Arc::new(SystemClock)));
    let mut evaluator = Evaluator::new(limiter);
    for t in &cfg.triggers {
        evaluator.register(t.name.clone(), t.build());
        info!(trigger = %t.name, kind = ?t.kind, "trigger registered");
    }

    let executor = Arc::new(LogExecutor);
    let scheduler = Scheduler::new(executor.clone());

    let queue_cap = std::env::var("VIGIL_EVENT_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1024);
    let (tx, mut rx) = mpsc::channel::<ChangeEvent>(queue_cap);
    let watch_gvk = gvk.clone();
    let watch_ns = namespace.clone();
    let watcher = tokio::spawn(async move {
        if let Err(e) = vigil_watch::start_watcher(&watch_gvk, watch_ns.as_deref(), tx).await {
            error!(error = %e, "watcher failed");
        }
    });

    info!(gvk = %gvk, ns = ?namespace, "engine running; Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            maybe = rx.recv() => {
                let Some(event) = maybe else {
                    warn!("event stream closed");
                    break;
                };
                match evaluator.evaluate(&event) {
                    Ok(fired) => {
                        for id in fired {
                            if let Some(t) = cfg.triggers.iter().find(|t| t.name == id) {
                                handle_fired(t, &event, &scheduler, executor.as_ref()).await;
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "evaluation failed"),
                }
            }
        }
    }
    watcher.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { gvk, namespace, config } => run(gvk, namespace, config).await,
        Commands::Validate { config } => {
            let cfg = load_config(&config)?;
            for t in &cfg.triggers {
                println!(
                    "{} ({:?}) -> action {} delays {:?}",
                    t.name, t.kind, t.action.name, t.action.delays_secs
                );
            }
            info!(count = cfg.triggers.len(), "config ok");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let yaml = r#"
triggers:
  - name: crash-loop
    kind: pod_crash_loop
    namespace_prefix: prod
    restart_reason: CrashLoopBackOff
    action:
      name: crash_report
  - name: deploy-report
    kind: field_diff
    monitored_fields: [image]
    action:
      name: report_rendering_task
      params:
        report_name: "Deployment change report"
      delays_secs: [60, 300, 3600]
"#;
        let cfg: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.triggers.len(), 2);
        let crash = &cfg.triggers[0];
        assert_eq!(crash.kind, TriggerKind::PodCrashLoop);
        assert_eq!(crash.restart_count, 2);
        assert_eq!(crash.rate_limit_secs, 3600);
        assert!(crash.action.delays_secs.is_empty());
        let report = &cfg.triggers[1];
        assert_eq!(report.kind, TriggerKind::FieldDiff);
        assert!(report.action.replace_existing);
        assert_eq!(report.action.delays_secs, vec![60, 300, 3600]);
    }

    #[test]
    fn empty_selector_means_no_selector() {
        let t = TriggerConfig {
            name: "x".into(),
            kind: TriggerKind::FieldDiff,
            name_prefix: None,
            namespace_prefix: None,
            labels_selector: Some("  ".into()),
            restart_count: 2,
            restart_reason: None,
            rate_limit_secs: 3600,
            monitored_fields: vec![],
            action: ActionConfig {
                name: "a".into(),
                params: serde_json::Value::Null,
                delays_secs: vec![],
                replace_existing: true,
            },
        };
        assert!(t.matcher().labels_selector.is_none());
    }
}
