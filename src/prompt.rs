//! System prompts loaded from markdown files.
//!
//! Prompts live as `<dir>/<name>.md` and are read once per name into a
//! bounded moka cache. Call [`PromptStore::reload()`] after editing them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use moka::sync::Cache;
use tracing::debug;

use crate::{LoopError, Result};

const MAX_PROMPTS: u64 = 64;

/// Clones share the loaded prompts.
#[derive(Clone)]
pub struct PromptStore {
    dir: PathBuf,
    cache: Cache<String, Arc<str>>,
}

impl PromptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Cache::builder().max_capacity(MAX_PROMPTS).build(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The raw text of prompt `name`.
    ///
    /// # Errors
    ///
    /// [`LoopError::InvalidInput`] for names that are empty or would leave
    /// the prompt directory; [`LoopError::Configuration`] if the file cannot
    /// be read.
    pub fn get(&self, name: &str) -> Result<Arc<str>> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(LoopError::InvalidInput(format!("invalid prompt name: {name:?}")));
        }
        self.cache
            .try_get_with(name.to_owned(), || {
                let path = self.dir.join(format!("{name}.md"));
                debug!(path = %path.display(), "loading prompt");
                std::fs::read_to_string(&path)
                    .map(Arc::from)
                    .map_err(|e| {
                        LoopError::Configuration(format!(
                            "failed to read prompt {}: {e}",
                            path.display()
                        ))
                    })
            })
            .map_err(|e| (*e).clone())
    }

    /// Prompt `name` with markdown decoration removed, ready to send.
    pub fn cleaned(&self, name: &str) -> Result<String> {
        self.get(name).map(|text| clean_markdown(&text))
    }

    /// Forget every loaded prompt.
    pub fn reload(&self) {
        self.cache.invalidate_all();
    }
}

/// Strip code fences (with an optional `json` tag), heading markers and
/// bold markers, along with the whitespace that follows fences and
/// headings.
pub fn clean_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("```") {
            rest = after.strip_prefix("json").unwrap_or(after).trim_start();
        } else if c == '#' {
            rest = rest.trim_start_matches('#').trim_start();
        } else if let Some(after) = rest.strip_prefix("**") {
            rest = after;
        } else {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out
}
