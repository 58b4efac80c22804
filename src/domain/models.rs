//! Upstream JSON document shapes.
//!
//! Only the fields the mirror inspects are typed; everything else is carried
//! through untouched via flattened maps so clients see the full upstream
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardList {
    pub boards: Vec<Board>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub board: String,
    pub title: String,
    #[serde(default)]
    pub ws_board: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of a board catalog as delivered upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPage {
    pub page: i64,
    #[serde(default)]
    pub threads: Vec<CatalogThread>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogThread {
    pub no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub com: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tim: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogThread {
    pub fn is_sticky(&self) -> bool {
        self.sticky == Some(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub com: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tim: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Thread {
    /// A closed or archived thread can no longer change upstream.
    pub fn is_immutable(&self) -> bool {
        self.posts
            .first()
            .map(|op| op.closed == Some(1) || op.archived == Some(1))
            .unwrap_or(false)
    }

    pub fn op(&self) -> Option<&Post> {
        self.posts.first()
    }
}

/// Collapse catalog pages into a single thread list, preserving upstream order.
pub fn flatten_catalog(pages: Vec<CatalogPage>) -> Vec<CatalogThread> {
    pages.into_iter().flat_map(|page| page.threads).collect()
}

/// Display title for a thread: subject when present, else a comment excerpt.
pub fn thread_title(sub: Option<&str>, com: Option<&str>) -> String {
    if let Some(sub) = sub.filter(|value| !value.is_empty()) {
        return sub.to_string();
    }
    match com {
        Some(com) => {
            let stripped = strip_html(com);
            let mut title: String = stripped.chars().take(60).collect();
            if stripped.chars().count() > 60 {
                title.push('…');
            }
            title
        }
        None => "Untitled".to_string(),
    }
}

/// Drop HTML tags and decode the handful of entities upstream emits in
/// subjects and comments.
pub fn strip_html(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => output.push(ch),
            _ => {}
        }
    }
    output
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}
