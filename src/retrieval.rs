//! Retrieval Engine
//!
//! Ranks heuristics (and optionally learnings) against a piece of text,
//! usually the tail of an agent's live reasoning.
//!
//! Pipeline:
//! 1. Keep the trailing window of the query text
//! 2. Score candidates by embedding similarity, or by keyword overlap when
//!    the embedding backend is absent, failing or too slow
//! 3. Drop candidates under the floor, apply golden/pattern boosts, sort
//! 4. Suppress recently shown items, then cut to top-K

use crate::config::RetrievalConfig;
use crate::db::Store;
use crate::dedup::{DedupTracker, DEFAULT_SESSION};
use crate::embeddings::{cosine_similarity, EmbedItem, EmbeddingIndex};
use crate::error::{EngineError, Result};
use crate::heuristics::{HeuristicFilter, HeuristicService, HeuristicView};
use crate::learnings::list_learnings;
use crate::types::{IngressRecord, Learning, Mode};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, warn};

/// Learnings considered per query when learnings are requested
const LEARNING_CANDIDATES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub text: String,
    pub domain: Option<String>,
    pub mode: Mode,
    /// Dedup session; unnamed callers share one
    pub session_id: Option<String>,
    pub exclude_recently_shown: bool,
    pub include_learnings: bool,
    /// Overrides the configured top-K
    pub top_k: Option<usize>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            domain: None,
            mode: Mode::General,
            session_id: None,
            exclude_recently_shown: true,
            include_learnings: false,
            top_k: None,
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl From<IngressRecord> for RetrievalQuery {
    fn from(record: IngressRecord) -> Self {
        Self {
            text: record.text,
            domain: record.domain.filter(|d| !d.trim().is_empty()),
            mode: record.mode.unwrap_or_default(),
            session_id: record.session_id,
            exclude_recently_shown: true,
            include_learnings: false,
            top_k: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Semantic,
    Keyword,
}

/// A retrievable piece of knowledge
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Knowledge {
    Heuristic(HeuristicView),
    Learning(Learning),
}

impl Knowledge {
    /// Namespaced id, also the embedding cache key
    pub fn item_id(&self) -> String {
        match self {
            Knowledge::Heuristic(v) => format!("h:{}", v.heuristic.id),
            Knowledge::Learning(l) => format!("l:{}", l.id),
        }
    }

    pub fn is_golden(&self) -> bool {
        matches!(self, Knowledge::Heuristic(v) if v.heuristic.is_golden)
    }

    /// Text that is embedded and keyword-matched
    pub fn text(&self) -> String {
        match self {
            Knowledge::Heuristic(v) => v.heuristic.rule.clone(),
            Knowledge::Learning(l) if l.body.trim().is_empty() => l.title.clone(),
            Knowledge::Learning(l) => format!("{}. {}", l.title, l.body),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedItem {
    pub id: String,
    pub knowledge: Knowledge,
    /// Boosted score used for ranking
    pub score: f32,
    /// Raw similarity (cosine or keyword overlap)
    pub similarity: f32,
    pub method: RetrievalMethod,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub items: Vec<RetrievedItem>,
    pub method: RetrievalMethod,
    pub candidates: usize,
    pub suppressed: usize,
    pub elapsed_ms: u64,
}

/// Last `max_chars` characters of `text`
pub fn trailing_window(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect()
}

/// Crude stem: longer words lose their last two chars (focus/focused)
fn stem(word: &str) -> &str {
    if word.len() > 5 && word.is_char_boundary(word.len() - 2) {
        &word[..word.len() - 2]
    } else {
        word
    }
}

/// Share of the candidate's terms that occur in the query, stem-tolerant
pub fn keyword_overlap(query: &str, candidate: &str) -> f32 {
    let terms: HashSet<String> = words(candidate).into_iter().collect();
    if terms.is_empty() {
        return 0.0;
    }
    let query_words: HashSet<String> = words(query).into_iter().collect();
    let matched = terms
        .iter()
        .filter(|term| {
            query_words
                .iter()
                .any(|w| w.starts_with(stem(term)) || term.starts_with(stem(w)))
        })
        .count();
    matched as f32 / terms.len() as f32
}

/// Whole-word phrase match
fn matches_pattern(text: &str, pattern: &str) -> bool {
    let normalize = |s: &str| {
        let joined = s
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        format!(" {joined} ")
    };
    normalize(text).contains(&normalize(pattern))
}

#[derive(Clone)]
pub struct RetrievalEngine {
    heuristics: HeuristicService,
    store: Store,
    index: EmbeddingIndex,
    dedup: DedupTracker,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        heuristics: HeuristicService,
        store: Store,
        index: EmbeddingIndex,
        dedup: DedupTracker,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            heuristics,
            store,
            index,
            dedup,
            config,
        }
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn dedup(&self) -> &DedupTracker {
        &self.dedup
    }

    async fn candidates(&self, query: &RetrievalQuery) -> Result<Vec<Knowledge>> {
        let filter = HeuristicFilter {
            domain: query.domain.clone(),
            ..HeuristicFilter::default()
        };
        let mut candidates: Vec<Knowledge> = self
            .heuristics
            .list(filter)
            .await?
            .into_iter()
            .map(Knowledge::Heuristic)
            .collect();

        if query.include_learnings {
            let domain = query.domain.clone();
            let learnings = self
                .store
                .call(move |conn| list_learnings(conn, domain.as_deref(), LEARNING_CANDIDATES))
                .await?;
            candidates.extend(learnings.into_iter().map(Knowledge::Learning));
        }
        Ok(candidates)
    }

    async fn semantic_scores(&self, window: &str, candidates: &[Knowledge]) -> Result<HashMap<String, f32>> {
        let query_vec = self.index.embed_query(window).await?;
        let items: Vec<EmbedItem> = candidates
            .iter()
            .map(|c| EmbedItem {
                id: c.item_id(),
                text: c.text(),
            })
            .collect();
        let vectors = self.index.vectors_for(&items).await?;
        Ok(vectors
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(&query_vec, v)))
            .collect())
    }

    /// Similarity per candidate id and the method that produced it
    async fn score(&self, window: &str, candidates: &[Knowledge]) -> (HashMap<String, f32>, RetrievalMethod) {
        if self.index.is_enabled() {
            let timeout = self.config.embed_timeout();
            match tokio::time::timeout(timeout, self.semantic_scores(window, candidates)).await {
                Ok(Ok(scores)) => return (scores, RetrievalMethod::Semantic),
                Ok(Err(err)) => {
                    warn!(error = %err, "embedding failed, falling back to keyword scoring");
                }
                Err(_) => {
                    warn!(timeout_ms = self.config.embed_timeout_ms, "embedding timed out, falling back to keyword scoring");
                }
            }
        }
        let scores = candidates
            .iter()
            .map(|c| (c.item_id(), keyword_overlap(window, &c.text())))
            .collect();
        (scores, RetrievalMethod::Keyword)
    }

    fn boost(&self, knowledge: &Knowledge, similarity: f32, mode: Mode) -> f32 {
        let mut score = similarity;
        if knowledge.is_golden() {
            score *= 1.0 + self.config.golden_boost;
        }
        if mode == Mode::Planning {
            let text = knowledge.text();
            if self
                .config
                .high_value_patterns
                .iter()
                .any(|p| matches_pattern(&text, p))
            {
                score *= 1.0 + self.config.pattern_boost;
            }
        }
        score
    }

    /// Ranked, deduplicated knowledge for `query`
    pub async fn query(&self, query: &RetrievalQuery) -> Result<RetrievalResult> {
        let started = Instant::now();
        if query.text.trim().is_empty() {
            return Err(EngineError::validation("query text must not be empty"));
        }
        let window = trailing_window(&query.text, self.config.query_window_chars);
        let top_k = query.top_k.unwrap_or(self.config.top_k);

        let candidates = self.candidates(query).await?;
        let candidate_count = candidates.len();
        let (scores, method) = self.score(window, &candidates).await;
        let floor = match method {
            RetrievalMethod::Semantic => self.config.similarity_floor,
            RetrievalMethod::Keyword => self.config.keyword_floor,
        };

        let mut ranked: Vec<RetrievedItem> = candidates
            .into_iter()
            .filter_map(|knowledge| {
                let id = knowledge.item_id();
                let similarity = scores.get(&id).copied().unwrap_or(0.0);
                if similarity < floor {
                    return None;
                }
                let score = self.boost(&knowledge, similarity, query.mode);
                Some(RetrievedItem {
                    id,
                    knowledge,
                    score,
                    similarity,
                    method,
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let (items, suppressed) = if query.exclude_recently_shown {
            let session = query.session_id.as_deref().unwrap_or(DEFAULT_SESSION);
            let out = self
                .dedup
                .filter(session, ranked, top_k, |item| (item.id.as_str(), item.knowledge.is_golden()));
            (out.kept, out.suppressed)
        } else {
            ranked.truncate(top_k);
            (ranked, 0)
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            ?method,
            candidates = candidate_count,
            returned = items.len(),
            suppressed,
            elapsed_ms,
            "retrieval complete"
        );
        Ok(RetrievalResult {
            items,
            method,
            candidates: candidate_count,
            suppressed,
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, FraudConfig, PromotionConfig, StoreConfig};
    use crate::embeddings::{l2_normalize, Embedder};
    use crate::events::EventBus;
    use crate::fraud::FraudDetector;
    use crate::learnings::insert_learning;
    use crate::migrations::run_migrations;
    use crate::types::{LearningKind, NewHeuristic, NewLearning};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const VOCAB: [&str; 6] = ["null", "dereference", "timeout", "retry", "plan", "cache"];

    /// One dimension per vocabulary word
    struct VocabEmbedder;

    #[async_trait]
    impl Embedder for VocabEmbedder {
        fn model_id(&self) -> &str {
            "vocab"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let lower = text.to_lowercase();
            let v: Vec<f32> = VOCAB
                .iter()
                .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
                .collect();
            Ok(l2_normalize(&v))
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_id(&self) -> &str {
            "failing"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(EngineError::Embedding("backend down".into()))
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model_id(&self) -> &str {
            "slow"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0])
        }
    }

    /// Vocabulary vectors, but each call takes a while
    struct PacedEmbedder {
        per_call: Duration,
    }

    #[async_trait]
    impl Embedder for PacedEmbedder {
        fn model_id(&self) -> &str {
            "paced"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            tokio::time::sleep(self.per_call).await;
            VocabEmbedder.embed(text).await
        }
    }

    struct Fixture {
        engine: RetrievalEngine,
        heuristics: HeuristicService,
        store: Store,
    }

    async fn fixture(embedder: Option<Arc<dyn Embedder>>) -> Fixture {
        fixture_with_timeout(embedder, 50).await
    }

    async fn fixture_with_timeout(embedder: Option<Arc<dyn Embedder>>, embed_timeout_ms: u64) -> Fixture {
        let store = Store::open_in_memory(&StoreConfig::default()).unwrap();
        store.call(|conn| run_migrations(conn).map(|_| ())).await.unwrap();
        let promotion = PromotionConfig::default();
        let heuristics = HeuristicService::new(
            store.clone(),
            promotion.clone(),
            FraudDetector::new(FraudConfig::default(), &promotion),
            EventBus::new(64),
        );
        let config = RetrievalConfig {
            embed_timeout_ms,
            ..RetrievalConfig::default()
        };
        let engine = RetrievalEngine::new(
            heuristics.clone(),
            store.clone(),
            EmbeddingIndex::new(store.clone(), embedder),
            DedupTracker::new(DedupConfig::default()),
            config,
        );
        Fixture {
            engine,
            heuristics,
            store,
        }
    }

    async fn make_golden(store: &Store, id: &str) {
        let id = id.to_string();
        store
            .call(move |conn| {
                conn.execute(
                    "UPDATE heuristics SET is_golden = 1, confidence = 0.95 WHERE id = ?1",
                    [&id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    fn rules(result: &RetrievalResult) -> Vec<String> {
        result
            .items
            .iter()
            .map(|i| match &i.knowledge {
                Knowledge::Heuristic(v) => v.heuristic.rule.clone(),
                Knowledge::Learning(l) => l.title.clone(),
            })
            .collect()
    }

    #[test]
    fn test_trailing_window_is_char_safe() {
        assert_eq!(trailing_window("abcdef", 3), "def");
        assert_eq!(trailing_window("ab", 10), "ab");
        assert_eq!(trailing_window("héllo wörld", 5), "wörld");
        assert_eq!(trailing_window("abc", 0), "");
    }

    #[test]
    fn test_keyword_overlap() {
        let score = keyword_overlap(
            "crash from null dereference in the handler",
            "Always null-check before dereference",
        );
        assert!((score - 0.4).abs() < 1e-6);
        assert_eq!(keyword_overlap("anything", "a b c"), 0.0);
        assert!(keyword_overlap("we focused on it", "keep focus") > 0.0);
    }

    #[test]
    fn test_pattern_match_is_whole_word() {
        assert!(matches_pattern("Write an ADR for every schema change", "adr"));
        assert!(!matches_pattern("Validate the address field", "adr"));
        assert!(matches_pattern("Use sequential-thinking first", "sequential thinking"));
    }

    #[tokio::test]
    async fn test_semantic_ranking_and_floor() {
        let fx = fixture(Some(Arc::new(VocabEmbedder))).await;
        fx.heuristics
            .record(NewHeuristic::new("backend", "Always null-check before dereference", ""))
            .await
            .unwrap();
        fx.heuristics
            .record(NewHeuristic::new("backend", "Set a timeout on every retry loop", ""))
            .await
            .unwrap();

        let result = fx
            .engine
            .query(&RetrievalQuery::new("segfault: null dereference in parser"))
            .await
            .unwrap();
        assert_eq!(result.method, RetrievalMethod::Semantic);
        assert_eq!(result.candidates, 2);
        assert_eq!(rules(&result), vec!["Always null-check before dereference"]);
        assert!((result.items[0].similarity - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_failing_backend_falls_back_to_keywords() {
        let fx = fixture(Some(Arc::new(FailingEmbedder))).await;
        fx.heuristics
            .record(NewHeuristic::new("backend", "Always null-check before dereference", ""))
            .await
            .unwrap();

        let result = fx
            .engine
            .query(&RetrievalQuery::new("crash from null dereference in the handler"))
            .await
            .unwrap();
        assert_eq!(result.method, RetrievalMethod::Keyword);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].method, RetrievalMethod::Keyword);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_to_keywords() {
        let fx = fixture(Some(Arc::new(SlowEmbedder))).await;
        fx.heuristics
            .record(NewHeuristic::new("backend", "Always null-check before dereference", ""))
            .await
            .unwrap();

        let started = Instant::now();
        let result = fx
            .engine
            .query(&RetrievalQuery::new("null dereference again"))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.method, RetrievalMethod::Keyword);
        assert_eq!(result.items.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_queries_keep_embedding_in_background() {
        let embedder = Arc::new(PacedEmbedder {
            per_call: Duration::from_millis(25),
        });
        let fx = fixture_with_timeout(Some(embedder), 100).await;
        let topics = ["null", "dereference", "timeout", "retry", "plan", "cache"];
        for n in 0..10 {
            fx.heuristics
                .record(NewHeuristic::new(
                    "backend",
                    &format!("Rule {n}: watch the {} path closely", topics[n % topics.len()]),
                    "",
                ))
                .await
                .unwrap();
        }

        // ten candidates at 25ms each cannot fit in one 100ms budget
        let query = RetrievalQuery::new("null dereference in the parser");
        let first = fx.engine.query(&query).await.unwrap();
        assert_eq!(first.method, RetrievalMethod::Keyword);

        let mut methods = vec![first.method];
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let result = fx.engine.query(&query).await.unwrap();
            methods.push(result.method);
            if result.method == RetrievalMethod::Semantic {
                break;
            }
        }
        assert_eq!(methods.last(), Some(&RetrievalMethod::Semantic), "methods: {methods:?}");

        let persisted: i64 = fx
            .store
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM heuristic_embeddings", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(persisted, 10);
    }

    #[tokio::test]
    async fn test_dedup_across_calls_spares_golden() {
        let fx = fixture(None).await;
        let golden = fx
            .heuristics
            .record(NewHeuristic::new("backend", "Check null before dereference", ""))
            .await
            .unwrap();
        fx.heuristics
            .record(NewHeuristic::new("backend", "Always null-check before dereference", ""))
            .await
            .unwrap();
        make_golden(&fx.store, &golden.id).await;

        let query = RetrievalQuery::new("null dereference crash").session("agent-1");
        let mut counts = Vec::new();
        for _ in 0..3 {
            let result = fx.engine.query(&query).await.unwrap();
            counts.push(result.items.len());
            assert!(result.items.iter().any(|i| i.knowledge.is_golden()));
        }
        assert_eq!(counts, vec![2, 1, 1]);

        // another session is unaffected
        let other = fx
            .engine
            .query(&RetrievalQuery::new("null dereference crash").session("agent-2"))
            .await
            .unwrap();
        assert_eq!(other.items.len(), 2);
    }

    #[tokio::test]
    async fn test_golden_and_planning_boosts() {
        let fx = fixture(None).await;
        let plain = fx
            .heuristics
            .record(NewHeuristic::new("arch", "Write a design doc before large changes", ""))
            .await
            .unwrap();
        let golden = fx
            .heuristics
            .record(NewHeuristic::new("arch", "Keep large changes behind flags", ""))
            .await
            .unwrap();
        make_golden(&fx.store, &golden.id).await;

        let mut query = RetrievalQuery::new("planning large changes to storage").mode(Mode::Planning);
        query.exclude_recently_shown = false;
        let result = fx.engine.query(&query).await.unwrap();
        let find = |id: &str| {
            result
                .items
                .iter()
                .find(|i| i.id == format!("h:{id}"))
                .cloned()
                .unwrap()
        };
        let golden_item = find(&golden.id);
        assert!((golden_item.score - golden_item.similarity * 1.2).abs() < 1e-5);
        let plain_item = find(&plain.id);
        assert!((plain_item.score - plain_item.similarity * 1.15).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_domain_filter_learnings_and_empty_text() {
        let fx = fixture(None).await;
        fx.heuristics
            .record(NewHeuristic::new("frontend", "Debounce cache invalidation events", ""))
            .await
            .unwrap();
        fx.store
            .call(|conn| {
                insert_learning(
                    conn,
                    &NewLearning {
                        domain: "backend".into(),
                        kind: LearningKind::Failure,
                        title: "Cache invalidation storm".into(),
                        body: String::new(),
                        heuristic_id: None,
                        source_agent: None,
                    },
                )
                .map(|_| ())
            })
            .await
            .unwrap();

        let mut query = RetrievalQuery::new("cache invalidation storm again").domain("backend");
        query.include_learnings = true;
        let result = fx.engine.query(&query).await.unwrap();
        assert_eq!(rules(&result), vec!["Cache invalidation storm"]);

        assert!(matches!(
            fx.engine.query(&RetrievalQuery::new("   ")).await,
            Err(EngineError::Validation(_))
        ));
    }
}
