//! Fetching, caching, and scoring of agent knowledge sources.
//!
//! Relevance is keyword/topic scoring over the user's message, without
//! embeddings. Fetched content is cached in memory for the session and on
//! disk with a per-source TTL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use murmur_core::config::{AgentConfig, KnowledgeSource};

/// Confidence below this is not worth injecting.
const RELEVANCE_THRESHOLD: f32 = 0.3;

/// Truncation limit for fetched content, roughly 12k tokens.
const MAX_CONTENT_CHARS: usize = 50_000;

const FETCH_TIMEOUT_SECS: u64 = 30;

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid regex"));
static SCRIPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("valid regex"));
static STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("valid regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

// ---------------------------------------------------------------------------
// Cache entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedKnowledge {
    pub source_name: String,
    pub url: String,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Fetches knowledge source content with TTL caching, and scores sources
/// for relevance against a user message.
pub struct KnowledgeService {
    cache_dir: PathBuf,
    memory_cache: HashMap<String, CachedKnowledge>,
    client: reqwest::Client,
}

impl KnowledgeService {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent("murmur-knowledge-fetcher/1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        info!("KnowledgeService initialized: {}", cache_dir.display());
        Self {
            cache_dir,
            memory_cache: HashMap::new(),
            client,
        }
    }

    fn cache_key(url: &str) -> String {
        format!("{:08x}", crc32fast::hash(url.as_bytes()))
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    // -----------------------------------------------------------------------
    // Relevance scoring
    // -----------------------------------------------------------------------

    /// Score a source against the user message. Exact keyword hits weigh
    /// 1.0, partial word overlap 0.5; topics weigh 0.5 and 0.3. The result
    /// is normalized to [0, 1] and compared to the relevance threshold.
    pub fn check_relevance(&self, user_message: &str, source: &KnowledgeSource) -> (bool, f32) {
        let message_lower = user_message.to_lowercase();
        let message_words: Vec<String> = WORD_RE
            .find_iter(&message_lower)
            .map(|m| m.as_str().to_string())
            .collect();

        let mut score = 0.0f32;
        let mut max_possible = 0.0f32;

        for keyword in &source.keywords {
            max_possible += 1.0;
            let keyword_lower = keyword.to_lowercase();
            if message_lower.contains(&keyword_lower) {
                score += 1.0;
            } else if message_words.iter().any(|word| keyword_lower.contains(word.as_str())) {
                score += 0.5;
            }
        }

        for topic in &source.topics {
            max_possible += 0.5;
            let topic_lower = topic.to_lowercase();
            if message_lower.contains(&topic_lower) {
                score += 0.5;
            } else if message_words.iter().any(|word| word == &topic_lower) {
                score += 0.3;
            }
        }

        let confidence = if max_possible > 0.0 {
            score / max_possible
        } else {
            0.0
        };
        let is_relevant = confidence >= RELEVANCE_THRESHOLD;

        debug!(
            "Relevance for '{}': score={score:.2}, confidence={confidence:.2}, relevant={is_relevant}",
            source.name
        );
        (is_relevant, confidence)
    }

    /// Sources relevant to the message, highest confidence first.
    pub fn relevant_sources<'a>(
        &self,
        user_message: &str,
        agent: &'a AgentConfig,
    ) -> Vec<(&'a KnowledgeSource, f32)> {
        let mut relevant: Vec<(&KnowledgeSource, f32)> = agent
            .knowledge_sources
            .iter()
            .filter_map(|source| {
                let (is_relevant, confidence) = self.check_relevance(user_message, source);
                is_relevant.then_some((source, confidence))
            })
            .collect();
        relevant.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        relevant
    }

    // -----------------------------------------------------------------------
    // Fetching and caching
    // -----------------------------------------------------------------------

    /// Content for a source, from cache if fresh, fetched otherwise.
    /// Returns None when the source cannot be fetched; callers degrade by
    /// injecting less knowledge, never by failing the chat turn.
    pub async fn fetch_knowledge(&mut self, source: &KnowledgeSource) -> Option<String> {
        if let Some(content) = self.cached(&source.url) {
            return Some(content);
        }

        let response = match self.client.get(&source.url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Error fetching {}: {e}", source.name);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                "Failed to fetch {}: HTTP {}",
                source.name,
                response.status()
            );
            return None;
        }
        let raw = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!("Error reading {}: {e}", source.name);
                return None;
            }
        };

        let content = truncate_chars(&extract_text_from_html(&raw), MAX_CONTENT_CHARS);
        info!("Fetched knowledge from {} ({} chars)", source.name, content.len());

        self.store_in_cache(source, content.clone());
        Some(content)
    }

    /// Up to `max_sources` (source name, content) pairs relevant to the
    /// user message, in descending relevance order.
    pub async fn fetch_relevant_knowledge(
        &mut self,
        user_message: &str,
        agent: &AgentConfig,
        max_sources: usize,
    ) -> Vec<(String, String)> {
        let selected: Vec<KnowledgeSource> = self
            .relevant_sources(user_message, agent)
            .into_iter()
            .take(max_sources)
            .map(|(source, _)| source.clone())
            .collect();

        let mut results = Vec::new();
        for source in &selected {
            if let Some(content) = self.fetch_knowledge(source).await {
                results.push((source.name.clone(), content));
            }
        }
        results
    }

    /// Fresh cached content for a URL, if any, checking memory then disk.
    pub(crate) fn cached(&mut self, url: &str) -> Option<String> {
        let key = Self::cache_key(url);

        if let Some(entry) = self.memory_cache.get(&key) {
            if Utc::now() < entry.expires_at {
                debug!("Memory cache hit for {url}");
                return Some(entry.content.clone());
            }
        }

        let path = self.cache_path(&key);
        let text = std::fs::read_to_string(&path).ok()?;
        let entry: CachedKnowledge = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Corrupt knowledge cache file {}: {e}", path.display());
                return None;
            }
        };
        if Utc::now() >= entry.expires_at {
            return None;
        }
        debug!("Disk cache hit for {url}");
        let content = entry.content.clone();
        self.memory_cache.insert(key, entry);
        Some(content)
    }

    pub(crate) fn store_in_cache(&mut self, source: &KnowledgeSource, content: String) {
        let now = Utc::now();
        let entry = CachedKnowledge {
            source_name: source.name.clone(),
            url: source.url.clone(),
            content,
            fetched_at: now,
            expires_at: now + chrono::Duration::hours(source.cache_ttl_hours as i64),
        };

        let key = Self::cache_key(&source.url);
        let path = self.cache_path(&key);
        if let Err(e) = std::fs::create_dir_all(&self.cache_dir) {
            warn!("Failed to create knowledge cache dir: {e}");
        } else {
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(&path, json) {
                        warn!("Failed to cache {} to disk: {e}", source.name);
                    }
                }
                Err(e) => warn!("Failed to serialize cache entry: {e}"),
            }
        }

        self.memory_cache.insert(key, entry);
    }
}

// ---------------------------------------------------------------------------
// HTML stripping
// ---------------------------------------------------------------------------

/// Basic readable-text extraction: drop script/style, strip tags, decode
/// the common entities, collapse whitespace.
fn extract_text_from_html(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, "");
    let text = STYLE_RE.replace_all(&text, "");
    let text = TAG_RE.replace_all(&text, " ");
    let text = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}\n\n[Content truncated...]")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
