//! Bug tracker client.
//!
//! Thin Bugzilla REST client behind the [`BugTracker`] trait. Comments and
//! needinfo requests are how sync failures reach a human, so every call here
//! is made from an error path somewhere else; callers decide whether a
//! tracker failure is fatal.

use anyhow::{Context, bail};
use serde::Deserialize;
use serde_json::json;

/// Bug URL in the canonical `show_bug.cgi` form.
pub fn bug_url(base: &str, bug: u64) -> String {
    format!("{}/show_bug.cgi?id={}", base.trim_end_matches('/'), bug)
}

/// Extract a bug id from a `show_bug.cgi?id=` URL.
pub fn id_from_url(base: &str, url: &str) -> Option<u64> {
    let rest = url.strip_prefix(base.trim_end_matches('/'))?;
    let query = rest.strip_prefix("/show_bug.cgi?")?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("id="))
        .and_then(|id| id.parse().ok())
}

/// The calls the sync engine makes against the bug tracker.
pub trait BugTracker {
    /// File a new bug and return its id.
    fn file_bug(
        &self,
        summary: &str,
        body: &str,
        product: &str,
        component: &str,
        whiteboard: &str,
    ) -> anyhow::Result<u64>;

    fn comment(&self, bug: u64, text: &str) -> anyhow::Result<()>;

    /// Comment and request needinfo from `users` in one update.
    fn comment_with_needinfo(&self, bug: u64, text: &str, users: &[String])
    -> anyhow::Result<()>;

    fn bug_url(&self, bug: u64) -> String;

    fn id_from_url(&self, url: &str) -> Option<u64>;
}

/// [`BugTracker`] backed by the Bugzilla REST API.
pub struct BugzillaClient {
    base: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct CreatedBug {
    id: u64,
}

impl BugzillaClient {
    pub fn new(base: impl Into<String>, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<reqwest::blocking::Response> {
        let url = format!("{}/rest/{}", self.base, path);
        let mut req = self.client.request(method, &url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("X-BUGZILLA-API-KEY", key);
        }
        let resp = req
            .send()
            .with_context(|| format!("Bugzilla request to {} failed", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            bail!("Bugzilla returned {} for {}: {}", status, url, text);
        }
        Ok(resp)
    }
}

impl BugTracker for BugzillaClient {
    fn file_bug(
        &self,
        summary: &str,
        body: &str,
        product: &str,
        component: &str,
        whiteboard: &str,
    ) -> anyhow::Result<u64> {
        let payload = json!({
            "product": product,
            "component": component,
            "summary": summary,
            "description": body,
            "whiteboard": whiteboard,
            "version": "unspecified",
        });
        let resp = self.request(reqwest::Method::POST, "bug", payload)?;
        let created: CreatedBug = resp.json().context("Failed to parse Bugzilla response")?;
        log::info!("Filed bug {}: {}", created.id, summary);
        Ok(created.id)
    }

    fn comment(&self, bug: u64, text: &str) -> anyhow::Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("bug/{}/comment", bug),
            json!({ "comment": text }),
        )?;
        Ok(())
    }

    fn comment_with_needinfo(
        &self,
        bug: u64,
        text: &str,
        users: &[String],
    ) -> anyhow::Result<()> {
        let flags: Vec<serde_json::Value> = users
            .iter()
            .map(|user| json!({ "name": "needinfo", "status": "?", "requestee": user }))
            .collect();
        self.request(
            reqwest::Method::PUT,
            &format!("bug/{}", bug),
            json!({ "comment": { "body": text }, "flags": flags }),
        )?;
        Ok(())
    }

    fn bug_url(&self, bug: u64) -> String {
        bug_url(&self.base, bug)
    }

    fn id_from_url(&self, url: &str) -> Option<u64> {
        id_from_url(&self.base, url)
    }
}
