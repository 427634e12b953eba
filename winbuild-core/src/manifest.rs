//! Manifest argument assembly
//!
//! Collects the per-version image references that make up the combined
//! manifest. A tag is only recorded once its single-arch build and push has
//! succeeded, so the rendered argument list never names an image that was
//! not pushed.

use serde::Serialize;

use crate::domain::target::BuildTarget;

/// Ordered `docker manifest create` arguments for one run
#[derive(Debug, Clone, Serialize)]
pub struct ManifestArgs {
    target: BuildTarget,
    tags: Vec<String>,
}

impl ManifestArgs {
    pub fn new(target: BuildTarget) -> Self {
        Self {
            target,
            tags: Vec::new(),
        }
    }

    /// Records `{target}_{version}` after that version was pushed
    ///
    /// Recording the same version twice has no effect.
    pub fn record(&mut self, version: &str) {
        let tagged = self.target.tagged(version);
        if !self.tags.contains(&tagged) {
            self.tags.push(tagged);
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Renders `target tag1 tag2 ...`
    pub fn render(&self) -> String {
        std::iter::once(self.target.as_str())
            .chain(self.tags.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
