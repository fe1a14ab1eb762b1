//! Page snapshot handed to the decision step.

use browser::{BrowserPage, DriverError, PageSignal, INTERACTIVE_SELECTOR};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedElement {
    pub index: usize,
    pub tag: String,
    pub label: String,
    pub selector: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub elements: Vec<ObservedElement>,
    /// Passive signals from the last few steps, oldest first.
    pub signals: Vec<PageSignal>,
}

/// Element enumeration in document order; indices match `query_all` on
/// the same selector, which is what click and type resolve against.
fn elements_script(max: usize) -> String {
    let selector = serde_json::to_string(INTERACTIVE_SELECTOR).unwrap_or_else(|_| "'a, button, input'".into());
    format!(
        r#"return Array.from(document.querySelectorAll({selector})).slice(0, {max}).map((el, index) => {{
    const tag = el.tagName.toLowerCase();
    const label = (el.innerText || el.name || el.id || el.placeholder || el.value || 'Unlabeled').trim().substring(0, 50);
    const cls = typeof el.className === 'string' ? el.className.split(' ')[0] : '';
    const selector = el.id ? '#' + el.id : cls ? '.' + cls : tag;
    return {{ index, tag, label, selector }};
}});"#
    )
}

/// Snapshot title, address and up to `max_elements` interactive elements.
/// Signals are not drained here; the caller owns the signal window.
pub async fn observe(page: &dyn BrowserPage, max_elements: usize) -> Result<Observation, DriverError> {
    let url = page.current_url().await?;
    let title = page.title().await?;
    let raw = page.evaluate(&elements_script(max_elements)).await?;
    let mut elements: Vec<ObservedElement> = serde_json::from_value(raw).unwrap_or_default();
    elements.truncate(max_elements);
    Ok(Observation { url, title, elements, signals: Vec::new() })
}

impl Observation {
    pub fn render(&self) -> String {
        let mut out = format!("URL: {}\nTitle: {}\nInteractive Elements:\n", self.url, self.title);
        if self.elements.is_empty() {
            out.push_str("(none)\n");
        }
        for el in &self.elements {
            out.push_str(&format!("[{}] <{}> \"{}\" (selector hint: {})\n", el.index, el.tag, el.label, el.selector));
        }
        if !self.signals.is_empty() {
            out.push_str("Recent Signals:\n");
            for s in &self.signals {
                out.push_str(&format!("- {s}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser::fake::FakePage;
    use serde_json::json;

    fn elements(n: usize) -> serde_json::Value {
        json!((0..n).map(|i| json!({"index": i, "tag": "a", "label": format!("link {i}"), "selector": "a"})).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn element_list_is_capped() {
        let page = FakePage::new("https://a.test/").title("Home").script("querySelectorAll", elements(45));
        let obs = observe(&page, 30).await.unwrap();
        assert_eq!(obs.elements.len(), 30);
        assert_eq!(obs.url, "https://a.test/");
        assert!(elements_script(30).contains(".slice(0, 30)"));
    }

    #[test]
    fn render_lists_elements_and_signals() {
        let obs = Observation {
            url: "https://a.test/".into(),
            title: "Home".into(),
            elements: vec![ObservedElement { index: 0, tag: "input".into(), label: "q".into(), selector: "#q".into() }],
            signals: vec![PageSignal::Response { url: "https://a.test/api".into(), status: 500 }],
        };
        let text = obs.render();
        assert!(text.contains("[0] <input> \"q\" (selector hint: #q)"));
        assert!(text.contains("- HTTP 500 https://a.test/api"));
    }
}
