use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PATH: &str = "sentinel.yaml";

#[derive(Debug, Default, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct WorkerConfig {
    pub poll_interval_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub run_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ExecutionConfig {
    /// Base URL of the remote function host; local execution when unset.
    pub remote_endpoint: Option<String>,
    pub remote_token: Option<String>,
    pub remote_timeout_secs: Option<u64>,
    /// Probe types sent to the remote host. All of them when empty.
    #[serde(default)]
    pub remote_probes: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct BrowserConfig {
    pub webdriver_url: Option<String>,
    pub headless: Option<bool>,
    pub user_agent: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub navigation_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct CompletionConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ExplorerConfig {
    pub max_steps: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub explorer: ExplorerConfig,
}

/// Explicit paths must exist; the default `./sentinel.yaml` is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_PATH);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("read config {}", path.display()))?;
    serde_yaml::from_str(&s).with_context(|| format!("parse config {}", path.display()))
}

fn secs(v: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(v.unwrap_or(default))
}

impl Config {
    /// Environment wins over the file. `var` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let get = |k: &str| var(k).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("SENTINEL_DB") {
            self.store.path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SENTINEL_WEBDRIVER_URL") {
            self.browser.webdriver_url = Some(v);
        }
        if let Some(v) = get("SENTINEL_REMOTE_ENDPOINT") {
            self.execution.remote_endpoint = Some(v);
        }
        if let Some(v) = get("SENTINEL_REMOTE_TOKEN") {
            self.execution.remote_token = Some(v);
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.completion.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.completion.base_url = Some(v);
        }
        if let Some(v) = get("SENTINEL_MODEL") {
            self.completion.model = Some(v);
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.store.path.clone().unwrap_or_else(|| PathBuf::from("sentinel.db"))
    }

    pub fn coordinator(&self) -> orchestrator::CoordinatorOptions {
        let d = orchestrator::CoordinatorOptions::default();
        let w = &self.worker;
        orchestrator::CoordinatorOptions {
            poll_interval: w.poll_interval_ms.map(Duration::from_millis).unwrap_or(d.poll_interval),
            error_backoff: w.error_backoff_ms.map(Duration::from_millis).unwrap_or(d.error_backoff),
            run_timeout: w.run_timeout_secs.map(Duration::from_secs).unwrap_or(d.run_timeout),
        }
    }

    pub fn remote(&self) -> Option<orchestrator::RemoteOptions> {
        let e = &self.execution;
        e.remote_endpoint.as_ref().map(|endpoint| orchestrator::RemoteOptions {
            endpoint: endpoint.clone(),
            token: e.remote_token.clone(),
            timeout: secs(e.remote_timeout_secs, 15 * 60),
        })
    }

    pub fn page(&self) -> browser::PageOptions {
        let d = browser::PageOptions::default();
        let b = &self.browser;
        browser::PageOptions {
            headless: b.headless.unwrap_or(d.headless),
            user_agent: b.user_agent.clone().or(d.user_agent),
            viewport: d.viewport,
            navigation_timeout: b.navigation_timeout_secs.map(Duration::from_secs).unwrap_or(d.navigation_timeout),
        }
    }

    pub fn browser_command_timeout(&self) -> Duration {
        secs(self.browser.command_timeout_secs, 60)
    }

    pub fn openai(&self) -> completion::OpenAiOptions {
        let d = completion::OpenAiOptions::default();
        let c = &self.completion;
        completion::OpenAiOptions {
            base_url: c.base_url.clone().unwrap_or(d.base_url),
            api_key: c.api_key.clone(),
            model: c.model.clone().unwrap_or(d.model),
            timeout: c.timeout_secs.map(Duration::from_secs).unwrap_or(d.timeout),
            requests_per_minute: c.requests_per_minute.unwrap_or(d.requests_per_minute),
        }
    }
}
