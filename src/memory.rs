//! File-backed `MemoryStore` collaborator.
//!
//! An append-only, per-user on-disk log of timestamped records, searched
//! by simple keyword-overlap scoring. The orchestrator only depends on
//! `search` and `record_turn`; this adapter is one valid backend, not the
//! interface.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::error::{Result, VoiceError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryRecord {
    recorded_at: chrono::DateTime<chrono::Utc>,
    user_text: String,
    assistant_text: String,
}

impl MemoryRecord {
    fn snippet(&self) -> String {
        format!("User: {}\nAssistant: {}", self.user_text, self.assistant_text)
    }

    fn score(&self, query_words: &[String]) -> usize {
        let haystack = format!("{} {}", self.user_text, self.assistant_text).to_lowercase();
        query_words.iter().filter(|w| haystack.contains(w.as_str())).count()
    }
}

pub struct MemoryStore {
    root_dir: PathBuf,
    enabled: bool,
}

impl MemoryStore {
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        if config.enabled {
            std::fs::create_dir_all(&config.root_dir)?;
        }
        Ok(Self {
            root_dir: config.root_dir.clone(),
            enabled: config.enabled,
        })
    }

    fn user_log_path(&self, user_id: &str) -> PathBuf {
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root_dir.join(format!("{safe}.jsonl"))
    }

    /// Return up to `limit` memory snippets relevant to `query_text`, most
    /// relevant first. Empty when disabled or nothing is on file.
    pub async fn search(&self, query_text: &str, user_id: &str, limit: usize) -> Result<Vec<String>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let path = self.user_log_path(user_id);
        let query_text = query_text.to_owned();
        tokio::task::spawn_blocking(move || Self::search_blocking(&path, &query_text, limit))
            .await
            .map_err(|e| VoiceError::Memory(format!("search task failed: {e}")))?
    }

    fn search_blocking(path: &Path, query_text: &str, limit: usize) -> Result<Vec<String>> {
        let records = Self::read_records(path)?;
        let query_words: Vec<String> = query_text
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .filter(|w| w.len() > 2)
            .collect();

        let mut scored: Vec<(usize, &MemoryRecord)> = records
            .iter()
            .map(|r| (r.score(&query_words), r))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored.into_iter().take(limit).map(|(_, r)| r.snippet()).collect())
    }

    /// Append the user/assistant text of a completed turn. Called exactly
    /// once per `Completed` turn.
    pub async fn record_turn(&self, user_id: &str, user_text: &str, assistant_text: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.user_log_path(user_id);
        let record = MemoryRecord {
            recorded_at: chrono::Utc::now(),
            user_text: user_text.to_owned(),
            assistant_text: assistant_text.to_owned(),
        };
        tokio::task::spawn_blocking(move || Self::append_blocking(&path, &record))
            .await
            .map_err(|e| VoiceError::Memory(format!("record task failed: {e}")))?
    }

    fn read_records(path: &Path) -> Result<Vec<MemoryRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn append_blocking(path: &Path, record: &MemoryRecord) -> Result<()> {
        use std::io::Write;
        let json = serde_json::to_string(record)
            .map_err(|e| VoiceError::Memory(format!("failed to encode record: {e}")))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{json}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> MemoryConfig {
        MemoryConfig {
            enabled: true,
            root_dir: dir.to_path_buf(),
            recall_limit: 5,
        }
    }

    #[tokio::test]
    async fn record_then_search_finds_matching_turn() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(&config(dir.path())).unwrap();
        store
            .record_turn("alice", "what is the capital of france", "paris")
            .await
            .unwrap();
        store.record_turn("alice", "tell me a joke", "knock knock").await.unwrap();

        let hits = store.search("capital france", "alice", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("paris"));
    }

    #[tokio::test]
    async fn search_is_empty_for_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(&config(dir.path())).unwrap();
        let hits = store.search("anything", "nobody", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn disabled_store_never_reads_or_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.enabled = false;
        let store = MemoryStore::new(&cfg).unwrap();
        store.record_turn("alice", "hello", "hi").await.unwrap();
        assert!(!dir.path().join("alice.jsonl").exists());
    }
}
