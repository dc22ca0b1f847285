//! Model context-window catalog.

use std::collections::BTreeMap;

/// Fallback context window for unrecognized models.
pub const DEFAULT_CONTEXT_WINDOW: usize = 200_000;

const BUILTIN_CONTEXT_WINDOWS: [(&str, usize); 10] = [
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-haiku-4", 200_000),
    ("claude-3", 200_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o", 128_000),
    ("gpt-5", 400_000),
    ("o3", 200_000),
    ("gemini-2.5", 1_048_576),
    ("mistral-large", 128_000),
];

/// Maps model identifiers to context-window sizes by longest matching prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    windows: BTreeMap<String, usize>,
    fallback: usize,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            windows: BUILTIN_CONTEXT_WINDOWS
                .iter()
                .map(|(prefix, tokens)| ((*prefix).to_string(), *tokens))
                .collect(),
            fallback: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

impl ModelCatalog {
    /// Built-in table with `overrides` merged over it.
    pub fn with_overrides(overrides: &BTreeMap<String, usize>) -> Self {
        let mut catalog = Self::default();
        for (prefix, tokens) in overrides {
            catalog.windows.insert(prefix.clone(), *tokens);
        }
        catalog
    }

    pub fn insert(&mut self, prefix: impl Into<String>, tokens: usize) {
        self.windows.insert(prefix.into(), tokens);
    }

    /// Context window for `model`, in tokens.
    pub fn context_window(&self, model: &str) -> usize {
        self.windows
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, tokens)| *tokens)
            .unwrap_or(self.fallback)
    }

    /// Token count at which compaction triggers for `model`.
    pub fn compaction_threshold(&self, model: &str, fraction: f64) -> usize {
        (self.context_window(model) as f64 * fraction).floor() as usize
    }
}
