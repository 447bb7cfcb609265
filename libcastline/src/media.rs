//! Public URLs for stored media

use crate::config::MediaConfig;
use crate::types::Media;

/// Turns stored media paths into URLs a platform can fetch
#[derive(Debug, Clone)]
pub struct MediaUrlResolver {
    base_url: String,
}

impl MediaUrlResolver {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(&config.public_base_url)
    }

    pub fn url_for(&self, media: &Media) -> String {
        let path = media.file_path.trim_start_matches('/');
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path)
    }

    /// URLs in the same order as `media`
    pub fn urls(&self, media: &[Media]) -> Vec<String> {
        media.iter().map(|m| self.url_for(m)).collect()
    }
}
