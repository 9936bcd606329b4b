//! Keyword filtering over extracted text.

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{
    prelude::*,
    store::{ImageRecord, RecordStatus},
};

/// How keywords select records.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, JsonSchema, Serialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    /// Show records whose text contains any keyword.
    #[default]
    Contains,
    /// Show records whose text contains none of the keywords.
    ExcludesAll,
}

/// Parsed keywords plus a mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterConfig {
    keywords: Vec<String>,
    mode: FilterMode,
}

impl FilterConfig {
    /// Parse a comma-separated keyword list. Both `,` and the full-width `，`
    /// separate keywords. Keywords are trimmed and lowercased, and empty or
    /// repeated ones are dropped.
    pub fn parse(raw: &str, mode: FilterMode) -> Self {
        let mut keywords: Vec<String> = Vec::new();
        for keyword in raw.split([',', '，']) {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
        Self { keywords, mode }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Does `text` contain any keyword?
    fn matches(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }

    /// Should this record be shown? Failed records never are.
    pub fn is_visible(&self, record: &ImageRecord) -> bool {
        if record.status() == RecordStatus::Failed {
            return false;
        }
        if self.keywords.is_empty() {
            return true;
        }
        let matches = self.matches(record.extracted_text().unwrap_or_default());
        match self.mode {
            FilterMode::Contains => matches,
            FilterMode::ExcludesAll => !matches,
        }
    }

    /// The visible records, in store order.
    pub fn visible<'a>(&self, records: &'a [ImageRecord]) -> Vec<&'a ImageRecord> {
        records.iter().filter(|r| self.is_visible(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RecordStore, RecordUpdate, tests::store_with};

    /// A store whose records have the given outcomes.
    fn store_with_outcomes(outcomes: &[Result<&str, &str>]) -> RecordStore {
        let (mut store, _) = store_with(outcomes.len());
        let ids = store.records().iter().map(|r| r.id()).collect::<Vec<_>>();
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            store.update(id, RecordUpdate::Start);
            let update = match outcome {
                Ok(text) => RecordUpdate::Done((*text).to_owned()),
                Err(error) => RecordUpdate::Failed((*error).to_owned()),
            };
            store.update(id, update);
        }
        store
    }

    fn visible_names(config: &FilterConfig, store: &RecordStore) -> Vec<String> {
        config
            .visible(store.records())
            .into_iter()
            .map(|r| r.source().name.clone())
            .collect()
    }

    #[test]
    fn test_parse() {
        let config = FilterConfig::parse(" Apple, pie ,,APPLE，香蕉 ", FilterMode::Contains);
        assert_eq!(config.keywords(), ["apple", "pie", "香蕉"]);
        assert!(FilterConfig::parse(" , ，", FilterMode::Contains)
            .keywords()
            .is_empty());
    }

    #[test]
    fn test_any_keyword_matches() {
        let store = store_with_outcomes(&[Ok("Apple Pie")]);
        let config = FilterConfig::parse("banana, pie", FilterMode::Contains);
        assert!(config.is_visible(&store.records()[0]));
    }

    #[test]
    fn test_excludes_all_inverts() {
        let store = store_with_outcomes(&[Ok("apple pie"), Ok("cherry tart")]);
        let config = FilterConfig::parse("banana, pie", FilterMode::ExcludesAll);
        assert_eq!(visible_names(&config, &store), ["img1.png"]);
    }

    #[test]
    fn test_empty_keywords_show_everything_but_failures() {
        let (store, _) = store_with(1);
        let failed = store_with_outcomes(&[Ok("a"), Err("boom"), Ok("")]);
        for mode in [FilterMode::Contains, FilterMode::ExcludesAll] {
            let config = FilterConfig::parse("", mode);
            assert_eq!(visible_names(&config, &failed), ["img0.png", "img2.png"]);
            // Pending records are shown too.
            assert_eq!(visible_names(&config, &store), ["img0.png"]);
        }
    }

    #[test]
    fn test_failed_records_hidden_in_both_modes() {
        let store = store_with_outcomes(&[Err("timeout")]);
        for mode in [FilterMode::Contains, FilterMode::ExcludesAll] {
            let config = FilterConfig::parse("anything", mode);
            assert!(config.visible(store.records()).is_empty());
        }
    }

    #[test]
    fn test_records_without_text() {
        let (store, _) = store_with(1);
        let contains = FilterConfig::parse("x", FilterMode::Contains);
        let excludes = FilterConfig::parse("x", FilterMode::ExcludesAll);
        assert!(!contains.is_visible(&store.records()[0]));
        assert!(excludes.is_visible(&store.records()[0]));
    }

    #[test]
    fn test_filtering_is_idempotent() {
        let store = store_with_outcomes(&[Ok("receipt total"), Ok("menu"), Err("x")]);
        let config = FilterConfig::parse("total", FilterMode::Contains);
        let first = visible_names(&config, &store);
        let second = visible_names(&config, &store);
        assert_eq!(first, second);
        assert_eq!(first, ["img0.png"]);
    }
}
