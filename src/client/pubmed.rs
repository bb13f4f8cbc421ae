use super::eutils::{EutilsSource, LiteratureSource, SearchRequest};
use super::key_pool::{ApiKeyPool, Credential, PoolStatus};
use super::rate_limiter::RateGovernor;
use super::{Article, SearchResult, SortOrder};
use crate::config::{AbstractMode, Config};
use crate::repositories::{
    cache_key, CacheNamespace, FileCache, FileCacheStats, MemoryCache, MemoryCacheStats,
};
use crate::{Error, Result};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Abstracts shorter than this are refetched in deep mode
pub const DEEP_ABSTRACT_MIN_CHARS: usize = 1000;

/// Usage of every cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsReport {
    pub memory: MemoryCacheStats,
    pub papers: FileCacheStats,
    pub fulltext: FileCacheStats,
}

/// Access layer in front of the literature database.
///
/// Every upstream call goes through the shared rate governor with a credential
/// drawn from the pool, and its outcome is reported back to the pool. Search
/// results are cached in memory, article records on disk.
pub struct PubMedClient {
    source: Arc<dyn LiteratureSource>,
    pool: Arc<ApiKeyPool>,
    governor: RateGovernor,
    memory: MemoryCache<SearchResult>,
    papers: FileCache,
    fulltext: FileCache,
    abstract_mode: AbstractMode,
}

impl std::fmt::Debug for PubMedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubMedClient")
            .field("source", &self.source.name())
            .field("pool", &self.pool)
            .field("abstract_mode", &self.abstract_mode)
            .finish_non_exhaustive()
    }
}

impl PubMedClient {
    /// Create a client talking to E-utilities over HTTP
    pub async fn new(config: &Config, pool: Arc<ApiKeyPool>) -> Result<Self> {
        let source = EutilsSource::new(&config.upstream)?;
        Ok(Self::with_source(config, pool, Arc::new(source)).await)
    }

    /// Create a client over an arbitrary upstream source
    pub async fn with_source(
        config: &Config,
        pool: Arc<ApiKeyPool>,
        source: Arc<dyn LiteratureSource>,
    ) -> Self {
        let root = config.cache.directory.as_path();
        let papers = FileCache::open(root, CacheNamespace::papers(config.cache.paper_expiry())).await;
        let fulltext = FileCache::open(
            root,
            CacheNamespace::fulltext(config.cache.fulltext_expiry(), config.cache.max_fulltext_bytes),
        )
        .await;

        info!(
            "PubMed client ready: source={}, keys={}, strategy={}, abstract mode={:?}",
            source.name(),
            pool.len(),
            pool.strategy(),
            config.abstract_mode
        );

        Self {
            source,
            governor: RateGovernor::new(Arc::clone(&pool)),
            pool,
            memory: MemoryCache::new(config.cache.memory_max_entries, config.cache.memory_ttl()),
            papers,
            fulltext,
            abstract_mode: config.abstract_mode,
        }
    }

    /// Search for articles.
    ///
    /// A repeated search with identical parameters is served from memory
    /// without touching the upstream or the governor.
    #[instrument(skip(self))]
    pub async fn search(
        &self,
        query: &str,
        max_results: u32,
        days_back: u32,
        sort: &str,
    ) -> Result<SearchResult> {
        if query.trim().is_empty() {
            return Err(Error::InvalidInput {
                field: "query".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let sort = SortOrder::parse(sort);
        let key = cache_key(query, max_results, days_back, sort.upstream_value());
        if let Some(cached) = self.memory.get(&key) {
            debug!("Search served from memory cache");
            return Ok(cached);
        }

        let request = SearchRequest {
            term: date_filtered_term(query, days_back, Utc::now().date_naive()),
            max_results,
            sort,
        };

        let credential = self.dispatch().await?;
        let page = self
            .settle(
                credential.as_ref(),
                "esearch",
                self.source.search_ids(&request, credential.as_ref()).await,
            )?;

        let articles = if page.ids.is_empty() {
            Vec::new()
        } else {
            self.fetch_article_details(&page.ids).await?
        };

        let result = SearchResult {
            articles,
            total: page.total,
            query: request.term,
        };
        info!(
            "Search returned {} of {} matches",
            result.articles.len(),
            result.total
        );

        self.memory.set(key, result.clone());
        Ok(result)
    }

    /// Fetch article records in the order given.
    ///
    /// Records found on disk are reused; the rest are fetched in one upstream
    /// call and written back. Identifiers the upstream omits come back as
    /// placeholders and are not persisted.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn fetch_article_details(&self, ids: &[String]) -> Result<Vec<Article>> {
        let mut resolved: HashMap<String, Article> = HashMap::with_capacity(ids.len());
        let mut unresolved = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.papers.get_record::<Article>(id).await {
                Some(article) => {
                    resolved.insert(id.clone(), article);
                }
                None => unresolved.push(id.clone()),
            }
        }

        if !unresolved.is_empty() {
            debug!(
                "Fetching {} of {} articles from upstream",
                unresolved.len(),
                seen.len()
            );

            let credential = self.dispatch().await?;
            let mut fetched = self.settle(
                credential.as_ref(),
                "esummary",
                self.source
                    .fetch_summaries(&unresolved, credential.as_ref())
                    .await,
            )?;

            if self.abstract_mode == AbstractMode::Deep {
                self.deepen_abstracts(&unresolved, &mut fetched).await;
            }

            for id in &unresolved {
                if let Some(article) = fetched.remove(id) {
                    self.papers.set_record(id, &article).await;
                    resolved.insert(id.clone(), article);
                } else {
                    debug!("Upstream omitted {}, using placeholder", id);
                }
            }
        }

        Ok(ids
            .iter()
            .map(|id| {
                resolved
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Article::new(id.as_str()))
            })
            .collect())
    }

    /// Replace short or missing abstracts with the full text abstract
    async fn deepen_abstracts(&self, order: &[String], fetched: &mut HashMap<String, Article>) {
        for id in order {
            let Some(article) = fetched.get_mut(id) else {
                continue;
            };
            let short = article
                .abstract_text
                .as_ref()
                .map_or(true, |text| text.chars().count() < DEEP_ABSTRACT_MIN_CHARS);
            if !short {
                continue;
            }

            let outcome = match self.dispatch().await {
                Ok(credential) => self.settle(
                    credential.as_ref(),
                    "efetch",
                    self.source.fetch_abstract(id, credential.as_ref()).await,
                ),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(text) if !text.trim().is_empty() => {
                    article.abstract_text = Some(text.trim().to_string());
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to fetch full abstract for {}: {}", id, e),
            }
        }
    }

    /// Pick a credential and wait for the governor
    async fn dispatch(&self) -> Result<Option<Credential>> {
        let credential = self.pool.select();
        if credential.is_none() && !self.pool.is_empty() {
            return Err(Error::NoCredentialAvailable {
                reason: format!("none of {} keys could be selected", self.pool.len()),
            });
        }
        self.governor.acquire().await;
        Ok(credential)
    }

    /// Report the outcome of an upstream call against its credential
    fn settle<T>(&self, credential: Option<&Credential>, endpoint: &str, result: Result<T>) -> Result<T> {
        match (&result, credential) {
            (Ok(_), Some(credential)) => self.pool.report_success(credential),
            (Err(e), Some(credential)) => {
                warn!("{} failed with key {}: {}", endpoint, credential.key_prefix(), e);
                self.pool.report_failure(credential);
            }
            (Err(e), None) => warn!("{} failed: {}", endpoint, e),
            (Ok(_), None) => {}
        }
        result
    }

    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub async fn cache_stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            memory: self.memory.stats(),
            papers: self.papers.stats().await,
            fulltext: self.fulltext.stats().await,
        }
    }

    /// Drop every cached search result
    pub fn clear_memory(&self) -> usize {
        let removed = self.memory.clear();
        info!("Cleared {} search results from memory", removed);
        removed
    }

    /// Drop expired search results
    pub fn clean_memory(&self) -> usize {
        self.memory.clean_expired()
    }

    /// Delete expired records of every namespace
    pub async fn clean_files(&self) -> u64 {
        self.papers.clean_expired().await + self.fulltext.clean_expired().await
    }

    /// Delete every record of every namespace
    pub async fn clear_files(&self) -> u64 {
        self.papers.clear().await + self.fulltext.clear().await
    }

    /// Full-text store shared with the download pipeline
    #[must_use]
    pub const fn fulltext(&self) -> &FileCache {
        &self.fulltext
    }

    #[must_use]
    pub const fn papers(&self) -> &FileCache {
        &self.papers
    }
}

/// Append the publication date filter for the last `days_back` days
#[must_use]
pub fn date_filtered_term(query: &str, days_back: u32, today: NaiveDate) -> String {
    if days_back == 0 {
        return query.to_string();
    }
    let since = today
        .checked_sub_days(Days::new(u64::from(days_back)))
        .unwrap_or(NaiveDate::MIN);
    format!(
        "{query} AND (\"{}\"[Date - Publication] : \"3000\"[Date - Publication])",
        since.format("%Y-%m-%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::key_pool::{KeyStrategy, RequestIntervals};
    use crate::client::SearchPage;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeSource {
        ids: Vec<String>,
        omitted: Vec<String>,
        fail_search: bool,
        searches: AtomicUsize,
        summaries: AtomicUsize,
        abstracts: AtomicUsize,
        requests: Mutex<Vec<SearchRequest>>,
        summary_batches: Mutex<Vec<Vec<String>>>,
    }

    impl FakeSource {
        fn returning(ids: &[&str]) -> Self {
            Self {
                ids: ids.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl LiteratureSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn search_ids(
            &self,
            request: &SearchRequest,
            _credential: Option<&Credential>,
        ) -> Result<SearchPage> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if self.fail_search {
                return Err(Error::Upstream {
                    endpoint: "esearch.fcgi".to_string(),
                    code: 503,
                    message: "Service Unavailable".to_string(),
                });
            }
            Ok(SearchPage {
                ids: self.ids.clone(),
                total: self.ids.len() as u64 * 10,
            })
        }

        async fn fetch_summaries(
            &self,
            ids: &[String],
            _credential: Option<&Credential>,
        ) -> Result<HashMap<String, Article>> {
            self.summaries.fetch_add(1, Ordering::SeqCst);
            self.summary_batches.lock().unwrap().push(ids.to_vec());
            Ok(ids
                .iter()
                .filter(|id| !self.omitted.contains(id))
                .map(|id| {
                    let mut article = Article::new(id.as_str());
                    article.title = Some(format!("Title {id}"));
                    article.abstract_text = Some("short".to_string());
                    (id.clone(), article)
                })
                .collect())
        }

        async fn fetch_abstract(&self, pmid: &str, _credential: Option<&Credential>) -> Result<String> {
            self.abstracts.fetch_add(1, Ordering::SeqCst);
            Ok(format!("Full abstract of {pmid}\n"))
        }
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.cache.directory = dir.to_path_buf();
        config.rate_limiting.keyed_interval_ms = 1;
        config.rate_limiting.anonymous_interval_ms = 1;
        config
    }

    async fn client_with(config: &Config, pool: ApiKeyPool, source: &Arc<FakeSource>) -> PubMedClient {
        let pool = Arc::new(pool.with_intervals(RequestIntervals::from(&config.rate_limiting)));
        PubMedClient::with_source(config, pool, Arc::clone(source) as Arc<dyn LiteratureSource>).await
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_second_identical_search_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::returning(&["1", "2"]));
        let client = client_with(&test_config(dir.path()), ApiKeyPool::anonymous(), &source).await;

        let first = client.search("cancer", 5, 0, "relevance").await.unwrap();
        let second = client.search("cancer", 5, 0, "relevance").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.total, 20);
        assert_eq!(source.searches.load(Ordering::SeqCst), 1);
        assert_eq!(source.summaries.load(Ordering::SeqCst), 1);

        let stats = client.cache_stats().await;
        assert_eq!(stats.memory.current_size, 1);
        assert_eq!(stats.memory.hits, 1);
        assert_eq!(stats.papers.entries, 2);
    }

    #[tokio::test]
    async fn test_omitted_ids_become_aligned_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource {
            omitted: ids(&["B"]),
            ..FakeSource::default()
        });
        let client = client_with(&test_config(dir.path()), ApiKeyPool::anonymous(), &source).await;

        let articles = client.fetch_article_details(&ids(&["A", "B", "C"])).await.unwrap();
        let pmids: Vec<&str> = articles.iter().map(|a| a.pmid.as_str()).collect();
        assert_eq!(pmids, vec!["A", "B", "C"]);
        assert_eq!(articles[0].title.as_deref(), Some("Title A"));
        assert!(articles[1].title.is_none());
        assert_eq!(articles[1].url, "https://pubmed.ncbi.nlm.nih.gov/B/");
        assert_eq!(articles[2].title.as_deref(), Some("Title C"));

        // placeholders are not persisted, so only B goes upstream again
        client.fetch_article_details(&ids(&["A", "B", "C"])).await.unwrap();
        let batches = source.summary_batches.lock().unwrap().clone();
        assert_eq!(batches, vec![ids(&["A", "B", "C"]), ids(&["B"])]);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_reported_to_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource {
            fail_search: true,
            ..FakeSource::default()
        });
        let pool = ApiKeyPool::new(vec![Credential::new("abcdefgh1234", "a@x.org")], KeyStrategy::Single);
        let client = client_with(&test_config(dir.path()), pool, &source).await;

        let err = client.search("cancer", 5, 0, "relevance").await.unwrap_err();
        assert!(matches!(err, Error::Upstream { code: 503, .. }));
        assert!(err.is_retryable());
        assert_eq!(client.pool_status().keys[0].failures, 1);
        // failures are not cached
        assert_eq!(client.cache_stats().await.memory.current_size, 0);
    }

    #[tokio::test]
    async fn test_empty_results_are_cached_without_summary_call() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let client = client_with(&test_config(dir.path()), ApiKeyPool::anonymous(), &source).await;

        let result = client.search("nothing matches", 5, 0, "relevance").await.unwrap();
        assert!(result.articles.is_empty());
        client.search("nothing matches", 5, 0, "relevance").await.unwrap();

        assert_eq!(source.searches.load(Ordering::SeqCst), 1);
        assert_eq!(source.summaries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_carries_date_filter_and_sort() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let client = client_with(&test_config(dir.path()), ApiKeyPool::anonymous(), &source).await;

        let result = client.search("cancer", 5, 30, "date").await.unwrap();
        let request = source.requests.lock().unwrap()[0].clone();
        assert_eq!(request.sort, SortOrder::PubDate);
        assert!(request.term.starts_with("cancer AND (\""));
        assert!(request.term.ends_with("\"3000\"[Date - Publication])"));
        assert_eq!(result.query, request.term);
    }

    #[tokio::test]
    async fn test_deep_mode_fetches_full_abstracts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.abstract_mode = AbstractMode::Deep;
        let source = Arc::new(FakeSource::default());
        let client = client_with(&config, ApiKeyPool::anonymous(), &source).await;

        let articles = client.fetch_article_details(&ids(&["10", "11"])).await.unwrap();
        assert_eq!(source.abstracts.load(Ordering::SeqCst), 2);
        assert_eq!(articles[0].abstract_text.as_deref(), Some("Full abstract of 10"));

        // the enriched record is what gets persisted
        let stored: Option<Article> = client.papers().get_record("11").await;
        assert_eq!(stored.unwrap().abstract_text.as_deref(), Some("Full abstract of 11"));
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let client = client_with(&test_config(dir.path()), ApiKeyPool::anonymous(), &source).await;

        assert!(matches!(
            client.search("  ", 5, 0, "relevance").await,
            Err(Error::InvalidInput { .. })
        ));
        assert_eq!(source.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unusable_cache_directory_still_serves_requests() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_directory = dir.path().join("cache");
        std::fs::write(&not_a_directory, "plain file").unwrap();

        let source = Arc::new(FakeSource::returning(&["1", "2"]));
        let client = client_with(&test_config(&not_a_directory), ApiKeyPool::anonymous(), &source).await;

        let result = client.search("cancer", 5, 0, "relevance").await.unwrap();
        assert_eq!(result.articles.len(), 2);

        let articles = client.fetch_article_details(&ids(&["1"])).await.unwrap();
        assert_eq!(articles[0].title.as_deref(), Some("Title 1"));

        // nothing could be persisted, so the detail fetch went upstream again
        let batches = source.summary_batches.lock().unwrap().clone();
        assert_eq!(batches, vec![ids(&["1", "2"]), ids(&["1"])]);
        assert_eq!(client.cache_stats().await.papers.entries, 0);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_refetched_and_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::default());
        let client = client_with(&test_config(dir.path()), ApiKeyPool::anonymous(), &source).await;

        client.fetch_article_details(&ids(&["A"])).await.unwrap();
        std::fs::write(dir.path().join("papers/A.json"), "{ not json").unwrap();

        let articles = client.fetch_article_details(&ids(&["A"])).await.unwrap();
        assert_eq!(articles[0].title.as_deref(), Some("Title A"));

        let batches = source.summary_batches.lock().unwrap().clone();
        assert_eq!(batches, vec![ids(&["A"]), ids(&["A"])]);

        let stored: Option<Article> = client.papers().get_record("A").await;
        assert_eq!(stored.unwrap().title.as_deref(), Some("Title A"));
    }

    #[test]
    fn test_date_filtered_term() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(date_filtered_term("cancer", 0, today), "cancer");
        assert_eq!(
            date_filtered_term("cancer", 7, today),
            "cancer AND (\"2024-03-03\"[Date - Publication] : \"3000\"[Date - Publication])"
        );
    }
}
