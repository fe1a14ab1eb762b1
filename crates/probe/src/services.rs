//! External collaborators handed to every probe.

use std::sync::Arc;

use async_trait::async_trait;
use browser::{BrowserDriver, BrowserPage, DriverError, PageOptions};
use completion::{CompletionError, CompletionRequest, CompletionService};

#[derive(Clone)]
pub struct ProbeServices {
    pub browser: Arc<dyn BrowserDriver>,
    pub completion: Arc<dyn CompletionService>,
    pub http: reqwest::Client,
    pub page: PageOptions,
    /// Default exploration step budget when a run does not set one.
    pub max_exploration_steps: usize,
}

impl ProbeServices {
    /// Services with no browser and no completion backend configured; probes
    /// needing either fail cleanly through their lifecycle.
    pub fn offline(http: reqwest::Client) -> Self {
        ProbeServices {
            browser: Arc::new(NoBrowser),
            completion: Arc::new(NoCompletion),
            http,
            page: PageOptions::default(),
            max_exploration_steps: 10,
        }
    }
}

pub struct NoBrowser;

#[async_trait]
impl BrowserDriver for NoBrowser {
    async fn open_page(&self, _opts: &PageOptions) -> Result<Box<dyn BrowserPage>, DriverError> {
        Err(DriverError::Session("no browser driver configured".into()))
    }
}

pub struct NoCompletion;

#[async_trait]
impl CompletionService for NoCompletion {
    async fn complete(&self, _req: &CompletionRequest) -> Result<String, CompletionError> {
        Err(CompletionError::Transport("no completion service configured".into()))
    }
}
