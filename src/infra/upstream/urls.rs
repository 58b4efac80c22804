//! Upstream endpoint construction.

use crate::config::UpstreamSettings;
use crate::domain::keys::{ImageKey, ImageVariant};

/// Builds upstream URLs from validated bases. Board slugs and file names are
/// validated before they reach this point.
#[derive(Debug, Clone)]
pub struct UpstreamUrls {
    api_base: String,
    media_base: String,
}

impl UpstreamUrls {
    pub fn new(api_base: impl Into<String>, media_base: impl Into<String>) -> Self {
        Self {
            api_base: trimmed(api_base.into()),
            media_base: trimmed(media_base.into()),
        }
    }

    pub fn boards(&self) -> String {
        format!("{}/boards.json", self.api_base)
    }

    pub fn catalog(&self, board: &str) -> String {
        format!("{}/{board}/catalog.json", self.api_base)
    }

    pub fn thread(&self, board: &str, no: u64) -> String {
        format!("{}/{board}/thread/{no}.json", self.api_base)
    }

    pub fn image(&self, key: &ImageKey) -> String {
        match key.variant {
            ImageVariant::Thumb => format!("{}/{}/{}s.jpg", self.media_base, key.board, key.tim),
            ImageVariant::Full => {
                format!("{}/{}/{}{}", self.media_base, key.board, key.tim, key.ext)
            }
        }
    }
}

impl From<&UpstreamSettings> for UpstreamUrls {
    fn from(settings: &UpstreamSettings) -> Self {
        UpstreamUrls::new(settings.api_base.clone(), settings.media_base.clone())
    }
}

fn trimmed(base: String) -> String {
    base.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_document_urls() {
        let urls = UpstreamUrls::new("https://a.4cdn.org/", "https://i.4cdn.org");

        assert_eq!(urls.boards(), "https://a.4cdn.org/boards.json");
        assert_eq!(urls.catalog("g"), "https://a.4cdn.org/g/catalog.json");
        assert_eq!(
            urls.thread("g", 123456),
            "https://a.4cdn.org/g/thread/123456.json"
        );
    }

    #[test]
    fn builds_media_urls_per_variant() {
        let urls = UpstreamUrls::new("https://a.4cdn.org", "https://i.4cdn.org");

        assert_eq!(
            urls.image(&ImageKey::thumb("g", 17)),
            "https://i.4cdn.org/g/17s.jpg"
        );
        assert_eq!(
            urls.image(&ImageKey::full("g", 17, ".webm")),
            "https://i.4cdn.org/g/17.webm"
        );
    }
}
