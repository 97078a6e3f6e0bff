//! Inbound path to upstream URL translation

use std::fmt;
use std::sync::Arc;

/// Hook that may substitute the translated URL
pub type UrlRewrite = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Maps local paths under the mount prefix onto the upstream API
#[derive(Clone)]
pub struct UrlTranslator {
    base: String,
    mount_prefix: String,
    rewrite: Option<UrlRewrite>,
}

impl UrlTranslator {
    /// Create a translator for an upstream base URL
    #[must_use]
    pub fn new(api_url: &str, mount_prefix: &str) -> Self {
        Self {
            base: api_url.trim_end_matches('/').to_string(),
            mount_prefix: mount_prefix.trim_end_matches('/').to_string(),
            rewrite: None,
        }
    }

    /// Install a rewrite hook applied after translation
    #[must_use]
    pub fn with_rewrite(mut self, rewrite: UrlRewrite) -> Self {
        self.rewrite = Some(rewrite);
        self
    }

    /// Translate an inbound path and query into an absolute upstream URL
    ///
    /// The result is not validated; a malformed URL fails at connect time.
    #[must_use]
    pub fn translate(&self, path_and_query: &str) -> String {
        let rest = self.strip_prefix(path_and_query);
        let rest = rest.trim_start_matches('/');

        let url = if rest.is_empty() {
            format!("{}/", self.base)
        } else {
            format!("{}/{rest}", self.base)
        };

        match &self.rewrite {
            Some(rewrite) => rewrite(&url),
            None => url,
        }
    }

    fn strip_prefix<'a>(&self, path: &'a str) -> &'a str {
        if self.mount_prefix.is_empty() {
            return path;
        }

        match path.strip_prefix(self.mount_prefix.as_str()) {
            // Only strip whole segments: "/giphy" must not eat "/giphyx"
            Some(rest) if rest.is_empty() || rest.starts_with(['/', '?']) => rest,
            _ => path,
        }
    }
}

impl fmt::Debug for UrlTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlTranslator")
            .field("base", &self.base)
            .field("mount_prefix", &self.mount_prefix)
            .field("rewrite", &self.rewrite.is_some())
            .finish()
    }
}
