//! Conversion between live tabs and persisted tab records.
//!
//! The tree store has no custom fields, so the active and pinned flags are
//! encoded as glyph prefixes on the record title, always in that order.
//! URLs the host refuses to open directly are routed through the
//! extension's redirector page, which forwards to the real target.

use url::Url;

use crate::store::TreeNode;
use crate::window::TabSnapshot;

pub const ACTIVE_MARK: &str = "🔹";
pub const PINNED_MARK: &str = "📌";

const REDIRECT_PAGE: &str = "pages/url.html";
const BLANK_URL: &str = "about:blank";
const PLACEHOLDER_URLS: [&str; 2] = ["about:newtab", "about:home"];
const RESTRICTED_SCHEMES: [&str; 5] = ["chrome", "javascript", "data", "file", "about"];

/// Title and URL to persist for one tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    pub title: String,
    pub url: String,
}

/// How to reopen a persisted record. `url: None` opens the host default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabSpec {
    pub title: String,
    pub url: Option<String>,
    pub active: bool,
    pub pinned: bool,
}

#[derive(Debug, Clone)]
pub struct Converter {
    redirect_url: String,
    new_tab_url: Option<String>,
}

impl Converter {
    /// `redirect_url` is the absolute URL of the redirector page
    pub fn new(redirect_url: impl Into<String>, new_tab_url: Option<String>) -> Self {
        Self {
            redirect_url: redirect_url.into(),
            new_tab_url,
        }
    }

    pub fn redirect_page() -> &'static str {
        REDIRECT_PAGE
    }

    /// Whether `url` is a blank or new-tab placeholder
    pub fn is_placeholder(&self, url: &str) -> bool {
        url.eq_ignore_ascii_case(BLANK_URL) || self.is_new_tab(url)
    }

    fn is_new_tab(&self, url: &str) -> bool {
        PLACEHOLDER_URLS.iter().any(|p| url.eq_ignore_ascii_case(p))
            || self.new_tab_url.as_deref() == Some(url)
    }

    /// Target and title carried by a redirector URL
    pub fn unwrap_redirect(&self, url: &str) -> Option<(String, Option<String>)> {
        let rest = url.strip_prefix(&self.redirect_url)?;
        if !rest.is_empty() && !rest.starts_with('?') {
            return None;
        }
        let parsed = Url::parse(url).ok()?;
        let mut target = None;
        let mut title = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "url" => target = Some(value.into_owned()),
                "title" => title = Some(value.into_owned()),
                _ => {}
            }
        }
        target.map(|t| (t, title))
    }

    pub fn wrap_redirect(&self, target: &str, title: &str, deferred: bool) -> String {
        let mut params = vec![("url", target), ("title", title)];
        if deferred {
            params.push(("deferred", "1"));
        }
        match Url::parse_with_params(&self.redirect_url, &params) {
            Ok(url) => url.to_string(),
            Err(e) => {
                tracing::warn!("invalid redirector URL {}: {}", self.redirect_url, e);
                target.to_string()
            }
        }
    }

    pub fn to_record(&self, tab: &TabSnapshot) -> RecordDraft {
        let (url, carried_title) = match self.unwrap_redirect(&tab.url) {
            Some((target, title)) => (target, title),
            None => (tab.url.clone(), None),
        };

        let base = if !tab.title.is_empty() && tab.title != tab.url {
            tab.title.clone()
        } else {
            carried_title
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| url.clone())
        };

        let mut title = String::new();
        if tab.active {
            title.push_str(ACTIVE_MARK);
        }
        if tab.pinned {
            title.push_str(PINNED_MARK);
        }
        title.push_str(&base);

        RecordDraft { title, url }
    }

    pub fn to_tab(&self, record: &TreeNode, discard_favicon: bool) -> TabSpec {
        let mut title = record.title.as_str();
        let active = match title.strip_prefix(ACTIVE_MARK) {
            Some(rest) => {
                title = rest;
                true
            }
            None => false,
        };
        let pinned = match title.strip_prefix(PINNED_MARK) {
            Some(rest) => {
                title = rest;
                true
            }
            None => false,
        };

        let raw = record.url.as_deref().unwrap_or_default();
        let url = if raw.is_empty() || self.is_new_tab(raw) {
            None
        } else if raw.eq_ignore_ascii_case(BLANK_URL) {
            Some(BLANK_URL.to_string())
        } else if is_restricted(raw) || discard_favicon {
            Some(self.wrap_redirect(raw, title, discard_favicon))
        } else {
            Some(raw.to_string())
        };

        TabSpec {
            title: title.to_string(),
            url,
            active,
            pinned,
        }
    }
}

/// Schemes the host will not open from an extension
fn is_restricted(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => RESTRICTED_SCHEMES.contains(&parsed.scheme()),
        Err(_) => true,
    }
}
