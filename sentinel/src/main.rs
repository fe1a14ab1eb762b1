use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use orchestrator::{
    BackendSelector, Coordinator, ExecutionBackend, LocalBackend, ProbeJob, ProbeRegistry, RemoteBackend, Scheduler,
};
use probe::{NoBrowser, NoCompletion, ProbeServices};
use sentinel_core::{CancellationToken, ProbeKind, RecordStore, RunId};
use tracing::{info, warn};

mod config;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "sentinel", version, about = "Autonomous web security scan orchestrator")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./sentinel.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database (overrides config and SENTINEL_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Poll for queued runs and drive them to completion
    Worker {
        /// Drain at most one run, then exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },
    /// Queue a new run
    Submit {
        /// Target URL
        target: String,
        /// Probe types, comma separated (default: exposure,headers_tls)
        #[arg(long, value_delimiter = ',')]
        probes: Vec<String>,
        /// Run configuration as a JSON object (auth, instructions, max_steps)
        #[arg(long, value_name = "JSON")]
        run_config: Option<String>,
    },
    /// Cancel a run and its unfinished sessions
    Cancel { run_id: RunId },
    /// Show a run with its sessions and findings (JSON)
    Status { run_id: RunId },
    /// Execute one probe job (remote function entry point); prints {"status": ...}
    Probe {
        /// Job JSON, or @FILE to read it from a file
        #[arg(long, value_name = "JSON|@FILE")]
        job: String,
    },
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(cfg: &Config) -> Result<Arc<dyn RecordStore>> {
    let path = cfg.db_path();
    let store = store_sqlite::SqliteStore::open(&path).with_context(|| format!("open store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn registry() -> ProbeRegistry {
    ProbeRegistry::new()
        .with(Arc::new(web_surface::CrawlerProbe))
        .with(Arc::new(web_surface::HeadersProbe))
        .with(Arc::new(browser_checks::ExposureProbe))
        .with(Arc::new(browser_checks::AuthAbuseProbe))
        .with(Arc::new(browser_checks::SqliProbe))
        .with(Arc::new(browser_checks::XssProbe))
        .with(Arc::new(llm_analysis::LlmAnalysisProbe))
        .with(Arc::new(red_team::RedTeamProbe::default()))
}

/// Must run inside the runtime: the completion client may start a pacer.
fn services(cfg: &Config) -> Result<ProbeServices> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("sentinel/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut services = ProbeServices::offline(http);
    services.page = cfg.page();
    if let Some(steps) = cfg.explorer.max_steps {
        services.max_exploration_steps = steps;
    }
    match &cfg.browser.webdriver_url {
        Some(url) => services.browser = Arc::new(browser::WebDriverBrowser::new(url.clone(), cfg.browser_command_timeout())?),
        None => {
            warn!("no WebDriver endpoint configured; browser probes will fail");
            services.browser = Arc::new(NoBrowser);
        }
    }
    let openai = cfg.openai();
    if openai.api_key.is_some() || cfg.completion.base_url.is_some() {
        services.completion = Arc::new(completion::OpenAiClient::new(openai)?);
    } else {
        warn!("no completion service configured; llm_analysis and red_team will fail");
        services.completion = Arc::new(NoCompletion);
    }
    Ok(services)
}

fn local_backend(cfg: &Config, store: Arc<dyn RecordStore>) -> Result<LocalBackend> {
    Ok(LocalBackend::new(registry(), store, Arc::new(services(cfg)?)))
}

fn backends(cfg: &Config, store: Arc<dyn RecordStore>) -> Result<BackendSelector> {
    let local: Arc<dyn ExecutionBackend> = Arc::new(local_backend(cfg, store)?);
    let mut selector = BackendSelector::local_only(local);
    if let Some(remote) = cfg.remote() {
        let kinds: Vec<ProbeKind> = if cfg.execution.remote_probes.is_empty() {
            ProbeKind::ALL.to_vec()
        } else {
            cfg.execution.remote_probes.iter().map(|p| ProbeKind::resolve(p)).collect()
        };
        info!(endpoint = %remote.endpoint, probes = kinds.len(), "remote execution enabled");
        selector = selector.with_remote(Arc::new(RemoteBackend::new(remote)?), kinds);
    }
    Ok(selector)
}

fn read_job(arg: &str) -> Result<ProbeJob> {
    let raw = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("read job file {path}"))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&raw).context("parse probe job")
}

async fn worker(cfg: Config, once: bool) -> Result<()> {
    let store = open_store(&cfg)?;
    let scheduler = Scheduler::new(store.clone(), backends(&cfg, store.clone())?);
    let coordinator = Coordinator::new(store, scheduler, cfg.coordinator());
    if once {
        match coordinator.run_once().await? {
            Some((id, status)) => println!("{}", serde_json::json!({ "run_id": id, "status": status })),
            None => info!("no queued runs"),
        }
        return Ok(());
    }
    let shutdown = CancellationToken::new();
    let trip = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; finishing current run");
            trip.cancel();
        }
    });
    coordinator.run_forever(shutdown).await;
    Ok(())
}

async fn status(store: &dyn RecordStore, run_id: RunId) -> Result<serde_json::Value> {
    let Some(run) = store.get_run(run_id).await? else { bail!("run {run_id} not found") };
    let sessions = store.sessions_for_run(run_id, None).await?;
    let findings = store.findings_for_run(run_id).await?;
    Ok(serde_json::json!({
        "run": run,
        "sessions": sessions,
        "findings": findings,
    }))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);
    let mut cfg = config::load_config(cli.config.as_deref())?;
    cfg.apply_env(|k| std::env::var(k).ok());
    if let Some(db) = cli.db {
        cfg.store.path = Some(db);
    }

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Version => {
            println!("sentinel {} (core {})", env!("CARGO_PKG_VERSION"), sentinel_core::version());
        }
        Commands::Worker { once } => rt.block_on(worker(cfg, once))?,
        Commands::Submit { target, probes, run_config } => {
            let configuration = match run_config {
                Some(s) => serde_json::from_str(&s).context("parse --run-config")?,
                None => serde_json::Value::Null,
            };
            let store = open_store(&cfg)?;
            let run = rt.block_on(orchestrator::submit_run(store.as_ref(), &target, &probes, configuration))?;
            println!("{}", serde_json::to_string(&run)?);
        }
        Commands::Cancel { run_id } => {
            let store = open_store(&cfg)?;
            rt.block_on(orchestrator::cancel_run(store.as_ref(), run_id))?;
            println!("{}", serde_json::json!({ "run_id": run_id, "status": "CANCELLED" }));
        }
        Commands::Status { run_id } => {
            let store = open_store(&cfg)?;
            let report = rt.block_on(status(store.as_ref(), run_id))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Probe { job } => {
            let job = read_job(&job)?;
            let store = open_store(&cfg)?;
            let status = rt.block_on(async {
                let local = local_backend(&cfg, store)?;
                local.dispatch(&job, &CancellationToken::new()).await
            })?;
            println!("{}", serde_json::json!({ "status": status.as_str() }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::MemoryStore;

    #[test]
    fn every_kind_has_a_probe() {
        let reg = registry();
        for kind in ProbeKind::ALL {
            assert_eq!(reg.resolve(kind).map(|p| p.kind()), Some(kind));
        }
    }

    #[test]
    fn job_reads_inline_json() {
        let id = uuid::Uuid::now_v7();
        let raw = serde_json::json!({
            "run_id": id, "session_id": id, "target_url": "https://a.test",
            "probe_type": "custom", "configuration": null
        });
        let job = read_job(&raw.to_string()).unwrap();
        assert_eq!(job.kind(), ProbeKind::Exposure);
    }

    #[test]
    fn cli_parses_submit() {
        let cli = Cli::try_parse_from(["sentinel", "--log-json", "submit", "https://a.test", "--probes", "xss,sqli"]).unwrap();
        assert!(cli.log_json);
        match cli.command {
            Commands::Submit { probes, .. } => assert_eq!(probes, ["xss", "sqli"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_of_unknown_run_is_an_error() {
        let store = MemoryStore::new();
        assert!(status(&store, uuid::Uuid::now_v7()).await.is_err());
        let run = orchestrator::submit_run(&store, "https://a.test", &[], serde_json::Value::Null).await.unwrap();
        let report = status(&store, run.id).await.unwrap();
        assert_eq!(report["sessions"].as_array().map(Vec::len), Some(2));
    }
}
