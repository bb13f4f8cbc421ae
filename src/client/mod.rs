pub mod eutils;
pub mod key_pool;
pub mod pubmed;
pub mod rate_limiter;

pub use eutils::{EutilsSource, LiteratureSource, SearchPage, SearchRequest};
pub use key_pool::{ApiKeyPool, Credential, KeyStatus, KeyStrategy, PoolStatus, RequestIntervals};
pub use pubmed::{CacheStatsReport, PubMedClient};
pub use rate_limiter::RateGovernor;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Canonical landing page for a PubMed record
#[must_use]
pub fn pubmed_url(pmid: &str) -> String {
    format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/")
}

/// Article metadata as returned to collaborators and stored in the record cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    /// PubMed identifier
    pub pmid: String,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub publication_date: Option<String>,
    #[serde(default)]
    pub volume: String,
    #[serde(default)]
    pub issue: String,
    #[serde(default)]
    pub pages: String,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub doi: String,
    pub url: String,
    #[serde(default)]
    pub publication_types: Vec<String>,
    #[serde(default)]
    pub mesh_terms: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Article {
    /// Create an article with only its identifier and URL.
    ///
    /// Also used as the placeholder for identifiers the upstream did not return.
    #[must_use]
    pub fn new(pmid: impl Into<String>) -> Self {
        let pmid = pmid.into();
        Self {
            url: pubmed_url(&pmid),
            pmid,
            title: None,
            authors: Vec::new(),
            journal: None,
            publication_date: None,
            volume: String::new(),
            issue: String::new(),
            pages: String::new(),
            abstract_text: None,
            doi: String::new(),
            publication_types: Vec::new(),
            mesh_terms: Vec::new(),
            keywords: Vec::new(),
        }
    }
}

/// Result of a search request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SearchResult {
    /// Articles in upstream ranking order
    pub articles: Vec<Article>,
    /// Total number of matches reported upstream
    pub total: u64,
    /// Query term actually sent upstream, including any date filter
    pub query: String,
}

/// Sort order accepted by `search`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Relevance,
    PubDate,
}

impl SortOrder {
    /// Parse a sort tag; `date` and `pubdate` are accepted aliases and unknown
    /// tags fall back to relevance.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "date" | "pubdate" | "pub_date" | "pub+date" => Self::PubDate,
            _ => Self::Relevance,
        }
    }

    /// Value of the upstream `sort` parameter
    #[must_use]
    pub const fn upstream_value(self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::PubDate => "pub_date",
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl std::fmt::Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.upstream_value())
    }
}
