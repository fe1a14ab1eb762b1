//! Scriptable in-memory page. Records every action and lets a test react
//! to them by changing content or raising signals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::*;

/// Driver action as seen by a reaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Goto(String),
    Click(String),
    Fill(String, String),
    Press(String, Key),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Content(String),
    Url(String),
    Signal(PageSignal),
}

type Reaction = Arc<dyn Fn(&Action) -> Vec<Effect> + Send + Sync>;

#[derive(Default)]
struct State {
    url: String,
    title: String,
    content: String,
    signals: Vec<PageSignal>,
    log: Vec<String>,
    driver_calls: usize,
}

/// Cloning shares the page, so a test can keep a handle to inspect what a
/// probe did with it.
#[derive(Clone, Default)]
pub struct FakePage {
    state: Arc<Mutex<State>>,
    elements: Arc<HashMap<String, usize>>,
    scripts: Arc<Vec<(String, Value)>>,
    reaction: Option<Reaction>,
    fail_after: Option<usize>,
}

impl FakePage {
    pub fn new(url: &str) -> Self {
        let page = FakePage::default();
        page.lock().url = url.to_string();
        page
    }

    pub fn title(self, title: &str) -> Self {
        self.lock().title = title.to_string();
        self
    }

    pub fn content(self, html: &str) -> Self {
        self.lock().content = html.to_string();
        self
    }

    /// `count` elements answer `query_all(selector)`; handles are `selector#i`.
    pub fn elements(mut self, selector: &str, count: usize) -> Self {
        Arc::make_mut(&mut self.elements).insert(selector.to_string(), count);
        self
    }

    /// Scripts containing `needle` evaluate to `value`; others to null.
    pub fn script(mut self, needle: &str, value: Value) -> Self {
        Arc::make_mut(&mut self.scripts).push((needle.to_string(), value));
        self
    }

    pub fn react(mut self, f: impl Fn(&Action) -> Vec<Effect> + Send + Sync + 'static) -> Self {
        self.reaction = Some(Arc::new(f));
        self
    }

    /// Every driver call after the first `n` fails with a lost session.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Recorded actions, e.g. `goto https://a.test`, `fill input#0 x`.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.lock().log.iter().filter(|l| l.starts_with(prefix)).count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn call(&self, entry: String) -> Result<(), DriverError> {
        let mut st = self.lock();
        st.driver_calls += 1;
        if self.fail_after.map_or(false, |n| st.driver_calls > n) {
            return Err(DriverError::Session("fake session closed".into()));
        }
        st.log.push(entry);
        Ok(())
    }

    fn act(&self, action: Action) {
        let effects = self.reaction.as_ref().map(|r| r(&action)).unwrap_or_default();
        let mut st = self.lock();
        if let Action::Goto(url) = &action {
            st.url = url.clone();
        }
        for e in effects {
            match e {
                Effect::Content(c) => st.content = c,
                Effect::Url(u) => st.url = u,
                Effect::Signal(s) => st.signals.push(s),
            }
        }
    }

    fn element(&self, el: &ElementHandle) -> Result<(), DriverError> {
        let known = el
            .0
            .rsplit_once('#')
            .and_then(|(sel, i)| Some((self.elements.get(sel)?, i.parse::<usize>().ok()?)))
            .map_or(false, |(count, i)| i < *count);
        if known { Ok(()) } else { Err(DriverError::Element(format!("no such element {}", el.0))) }
    }
}

#[async_trait]
impl BrowserPage for FakePage {
    async fn goto(&self, url: &str, _wait: WaitPolicy) -> Result<(), DriverError> {
        self.call(format!("goto {url}"))?;
        self.act(Action::Goto(url.to_string()));
        Ok(())
    }

    async fn title(&self) -> Result<String, DriverError> {
        self.call("title".into())?;
        Ok(self.lock().title.clone())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.call("current_url".into())?;
        Ok(self.lock().url.clone())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError> {
        self.call(format!("query {selector}"))?;
        let n = self.elements.get(selector).copied().unwrap_or(0);
        Ok((0..n).map(|i| ElementHandle(format!("{selector}#{i}"))).collect())
    }

    async fn click(&self, el: &ElementHandle) -> Result<(), DriverError> {
        self.call(format!("click {}", el.0))?;
        self.element(el)?;
        self.act(Action::Click(el.0.clone()));
        Ok(())
    }

    async fn fill(&self, el: &ElementHandle, text: &str) -> Result<(), DriverError> {
        self.call(format!("fill {} {text}", el.0))?;
        self.element(el)?;
        self.act(Action::Fill(el.0.clone(), text.to_string()));
        Ok(())
    }

    async fn press(&self, el: &ElementHandle, key: Key) -> Result<(), DriverError> {
        self.call(format!("press {} {key:?}", el.0))?;
        self.element(el)?;
        self.act(Action::Press(el.0.clone(), key));
        Ok(())
    }

    async fn content(&self) -> Result<String, DriverError> {
        self.call("content".into())?;
        Ok(self.lock().content.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.call("screenshot".into())?;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        self.call("evaluate".into())?;
        Ok(self.scripts.iter().find(|(needle, _)| script.contains(needle.as_str())).map(|(_, v)| v.clone()).unwrap_or(Value::Null))
    }

    async fn evaluate_on(&self, el: &ElementHandle, script: &str) -> Result<Value, DriverError> {
        self.element(el)?;
        self.evaluate(script).await
    }

    async fn add_cookie(&self, name: &str, value: &str) -> Result<(), DriverError> {
        self.call(format!("cookie {name}={value}"))
    }

    async fn wait_for_settle(&self, _timeout: Duration) -> Result<(), DriverError> {
        self.call("settle".into())
    }

    async fn drain_signals(&self) -> Vec<PageSignal> {
        std::mem::take(&mut self.lock().signals)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.lock().log.push("close".into());
        Ok(())
    }
}

/// Hands out clones of one shared page.
#[derive(Clone)]
pub struct FakeBrowser {
    pub page: FakePage,
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn open_page(&self, _opts: &PageOptions) -> Result<Box<dyn BrowserPage>, DriverError> {
        Ok(Box::new(self.page.clone()))
    }
}
