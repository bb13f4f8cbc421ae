use super::key_pool::Credential;
use super::{pubmed_url, Article, SortOrder};
use crate::config::UpstreamConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Parameters of an id search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Full query term, date filter included
    pub term: String,
    pub max_results: u32,
    pub sort: SortOrder,
}

/// One page of matching identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// Identifiers in upstream ranking order
    pub ids: Vec<String>,
    /// Total number of matches, not just this page
    pub total: u64,
}

/// Upstream literature database.
///
/// Implementations perform exactly one request per call and never retry;
/// throttling and credential bookkeeping are the caller's job.
#[async_trait]
pub trait LiteratureSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Find identifiers matching a query
    async fn search_ids(
        &self,
        request: &SearchRequest,
        credential: Option<&Credential>,
    ) -> Result<SearchPage>;

    /// Fetch summaries for a batch of identifiers.
    ///
    /// Identifiers the upstream does not return are simply absent from the map.
    async fn fetch_summaries(
        &self,
        ids: &[String],
        credential: Option<&Credential>,
    ) -> Result<HashMap<String, Article>>;

    /// Fetch the plain-text abstract of one article
    async fn fetch_abstract(&self, pmid: &str, credential: Option<&Credential>) -> Result<String>;
}

/// NCBI E-utilities over HTTP
#[derive(Debug, Clone)]
pub struct EutilsSource {
    client: Client,
    base_url: String,
    timeout: Duration,
    tool_name: String,
    default_email: String,
}

impl EutilsSource {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!(
                "pubmed-research-mcp/",
                env!("CARGO_PKG_VERSION"),
                " (Literature Search Tool)"
            ))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout(),
            tool_name: config.tool_name.clone(),
            default_email: config.default_email.clone(),
        })
    }

    /// Build an endpoint URL carrying the common identification parameters
    fn endpoint_url(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        credential: Option<&Credential>,
    ) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{endpoint}", self.base_url)).map_err(|e| {
            Error::InvalidInput {
                field: "upstream.base_url".to_string(),
                reason: e.to_string(),
            }
        })?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("db", "pubmed");
            for (key, value) in params {
                query.append_pair(key, value);
            }
            query.append_pair("tool", &self.tool_name);
            query.append_pair(
                "email",
                credential.map_or(self.default_email.as_str(), |c| c.email.as_str()),
            );
            if let Some(credential) = credential {
                query.append_pair("api_key", &credential.api_key);
            }
        }

        Ok(url)
    }

    async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        credential: Option<&Credential>,
    ) -> Result<Vec<u8>> {
        let url = self.endpoint_url(endpoint, params, credential)?;
        debug!(
            "{} request to {} (key: {})",
            self.name(),
            endpoint,
            credential.map_or_else(|| "anonymous".to_string(), Credential::key_prefix)
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
            return Err(Error::RateLimitExceeded { retry_after });
        }
        if !status.is_success() {
            return Err(Error::Upstream {
                endpoint: endpoint.to_string(),
                code: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;
        Ok(body.to_vec())
    }

    fn transport_error(&self, endpoint: &str, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::NetworkTimeout {
                timeout: self.timeout,
                message: format!("{endpoint}: {err}"),
            }
        } else {
            Error::Http(err)
        }
    }
}

/// Decode a JSON response body
fn decode<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Parse {
        context: endpoint.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl LiteratureSource for EutilsSource {
    fn name(&self) -> &str {
        "eutils"
    }

    async fn search_ids(
        &self,
        request: &SearchRequest,
        credential: Option<&Credential>,
    ) -> Result<SearchPage> {
        let retmax = request.max_results.to_string();
        let body = self
            .get(
                "esearch.fcgi",
                &[
                    ("term", request.term.as_str()),
                    ("retmax", retmax.as_str()),
                    ("retmode", "json"),
                    ("sort", request.sort.upstream_value()),
                ],
                credential,
            )
            .await?;

        let response: EsearchResponse = decode("esearch.fcgi", &body)?;
        let page = SearchPage {
            total: response.result.count.parse().unwrap_or(0),
            ids: response.result.idlist,
        };
        debug!("esearch returned {} of {} ids", page.ids.len(), page.total);
        Ok(page)
    }

    async fn fetch_summaries(
        &self,
        ids: &[String],
        credential: Option<&Credential>,
    ) -> Result<HashMap<String, Article>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let joined = ids.join(",");
        let body = self
            .get(
                "esummary.fcgi",
                &[("id", joined.as_str()), ("retmode", "json")],
                credential,
            )
            .await?;

        let response: EsummaryResponse = decode("esummary.fcgi", &body)?;
        let articles: HashMap<String, Article> = ids
            .iter()
            .filter_map(|id| {
                let document = response.result.get(id)?;
                match SummaryDocument::deserialize(document) {
                    Ok(document) if document.error.is_none() => {
                        Some((id.clone(), document.into_article(id)))
                    }
                    Ok(document) => {
                        debug!("esummary reported {} for {}", document.error.unwrap_or_default(), id);
                        None
                    }
                    Err(e) => {
                        warn!("Malformed esummary document for {}: {}", id, e);
                        None
                    }
                }
            })
            .collect();

        if articles.len() < ids.len() {
            debug!("esummary omitted {} of {} ids", ids.len() - articles.len(), ids.len());
        }
        Ok(articles)
    }

    async fn fetch_abstract(&self, pmid: &str, credential: Option<&Credential>) -> Result<String> {
        let body = self
            .get(
                "efetch.fcgi",
                &[("id", pmid), ("rettype", "abstract"), ("retmode", "text")],
                credential,
            )
            .await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[derive(Debug, Deserialize)]
struct EsearchResponse {
    #[serde(rename = "esearchresult", default)]
    result: EsearchResult,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EsearchResult {
    /// Sent as a decimal string
    count: String,
    idlist: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EsummaryResponse {
    #[serde(default)]
    result: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryDocument {
    title: String,
    authors: Vec<SummaryAuthor>,
    source: String,
    pubdate: String,
    volume: String,
    issue: String,
    pages: String,
    elocationid: String,
    articleids: Vec<SummaryArticleId>,
    pubtype: Vec<String>,
    #[serde(rename = "abstract")]
    abstract_text: String,
    meshterms: Vec<String>,
    keywords: Vec<String>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryAuthor {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryArticleId {
    idtype: String,
    value: String,
}

impl SummaryDocument {
    fn into_article(self, pmid: &str) -> Article {
        let doi = self
            .articleids
            .iter()
            .find(|id| id.idtype == "doi")
            .map(|id| id.value.clone())
            .or_else(|| {
                self.elocationid
                    .strip_prefix("doi:")
                    .map(|doi| doi.trim().to_string())
            })
            .unwrap_or_default();

        Article {
            pmid: pmid.to_string(),
            title: non_empty(self.title),
            authors: self
                .authors
                .into_iter()
                .map(|author| author.name)
                .filter(|name| !name.is_empty())
                .collect(),
            journal: non_empty(self.source),
            publication_date: non_empty(self.pubdate),
            volume: self.volume,
            issue: self.issue,
            pages: self.pages,
            abstract_text: non_empty(self.abstract_text),
            doi,
            url: pubmed_url(pmid),
            publication_types: self.pubtype,
            mesh_terms: self.meshterms,
            keywords: self.keywords,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
