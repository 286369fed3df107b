use crate::chunking::date_chunks;
use crate::config::RetrievalConfig;
use crate::content::{page_from_fetched, publication_date};
use crate::error::{CollectError, ConfigError};
use crate::geo::country_code;
use crate::models::{
    ContentKind, SearchRequest, SearchResult, SkippedItem, VariableBinding, Variables, WebPage,
};
use crate::rerank::rerank_results;
use crate::template::{expand_templates, QueryTemplate};
use crate::traits::{PageFetcher, Reranker, SearchProvider};
use async_stream::stream;
use futures::stream::{self as futures_stream, Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize)]
pub struct RetrievalReport {
    pub pages: Vec<WebPage>,
    pub skipped: Vec<SkippedItem>,
}

/// Geography filters for one instantiated query.
#[derive(Debug, Default, PartialEq)]
struct SearchFilters {
    country: Option<String>,
    country_code: Option<String>,
    sites: Vec<String>,
}

/// Turns query templates into fetched web pages: expand, search, dedupe,
/// optionally rerank, then fetch.
pub struct PageRetriever<S, F>
where
    S: SearchProvider,
    F: PageFetcher,
{
    search: S,
    fetcher: F,
    reranker: Option<Arc<dyn Reranker>>,
}

impl<S, F> PageRetriever<S, F>
where
    S: SearchProvider,
    F: PageFetcher,
{
    pub fn new(search: S, fetcher: F) -> Self {
        Self {
            search,
            fetcher,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Every search call needed for the templates, in query, date chunk,
    /// result page order.
    pub fn plan_requests(
        templates: &[QueryTemplate],
        variables: &Variables,
        config: &RetrievalConfig,
    ) -> Result<Vec<SearchRequest>, CollectError> {
        config.validate()?;
        let queries = expand_templates(templates, variables)?;
        let chunks = date_chunks(&config.date_range, config.time_chunking)?;

        let mut requests = Vec::with_capacity(
            queries.len() * chunks.len() * config.results_pages_per_query as usize,
        );
        for expanded in queries {
            let filters = filters_for(&expanded.binding, config)?;
            for chunk in &chunks {
                for page in 0..config.results_pages_per_query {
                    requests.push(SearchRequest {
                        query: expanded.query.clone(),
                        binding: expanded.binding.clone(),
                        date_range: *chunk,
                        page,
                        news_only: config.news_only,
                        country_code: filters.country_code.clone(),
                        country: filters.country.clone(),
                        sites: filters.sites.clone(),
                    });
                }
            }
        }

        debug!(
            requests = requests.len(),
            date_chunks = chunks.len(),
            "planned search requests"
        );
        Ok(requests)
    }

    /// Runs every planned search, drops repeated urls and reranks when
    /// configured.
    pub async fn search(
        &self,
        templates: &[QueryTemplate],
        variables: &Variables,
        config: &RetrievalConfig,
    ) -> Result<Vec<SearchResult>, CollectError> {
        let reranker = self.reranker_for(config)?;
        let requests = Self::plan_requests(templates, variables, config)?;
        let request_count = requests.len();

        let batches = futures_stream::iter(requests)
            .map(|request| async move { self.search.search(&request).await })
            .buffered(config.search_concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?;

        let found = batches.iter().map(Vec::len).sum::<usize>();
        let results = dedupe_by_url(batches.into_iter().flatten());
        info!(
            requests = request_count,
            found,
            unique = results.len(),
            "search finished"
        );

        match reranker {
            Some(reranker) => {
                let kept = rerank_results(reranker, results, config.rerank_top_n).await?;
                info!(kept = kept.len(), top_n = config.rerank_top_n, "reranked results");
                Ok(kept)
            }
            None => Ok(results),
        }
    }

    /// Yields unique results as search calls complete, in request order.
    ///
    /// Results are not reranked; reranking needs the full result set.
    pub fn search_stream<'a>(
        &'a self,
        templates: &'a [QueryTemplate],
        variables: &'a Variables,
        config: &'a RetrievalConfig,
    ) -> Pin<Box<dyn Stream<Item = Result<SearchResult, CollectError>> + Send + 'a>> {
        Box::pin(stream! {
            let requests = match Self::plan_requests(templates, variables, config) {
                Ok(requests) => requests,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };

            let mut calls = futures_stream::iter(requests)
                .map(|request| async move { self.search.search(&request).await })
                .buffered(config.search_concurrency.max(1));

            let mut seen = HashSet::new();
            while let Some(batch) = calls.next().await {
                match batch {
                    Ok(results) => {
                        for result in results {
                            if seen.insert(result.url.clone()) {
                                yield Ok(result);
                            }
                        }
                    }
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }
        })
    }

    /// Fetches each result's page. Failed and timed-out fetches are skipped.
    pub async fn fetch_pages(
        &self,
        results: Vec<SearchResult>,
        config: &RetrievalConfig,
    ) -> RetrievalReport {
        let outcomes = futures_stream::iter(results)
            .map(|result| async move {
                let url = result.url.clone();
                match tokio::time::timeout(config.fetch_timeout, self.fetcher.fetch(&url)).await {
                    Ok(Ok(fetched)) => Ok(page_from_fetched(fetched, Some(result))),
                    Ok(Err(error)) => Err(SkippedItem::new(url, error.to_string())),
                    Err(_) => Err(SkippedItem::new(
                        url,
                        CollectError::Timeout(format!("no response within {:?}", config.fetch_timeout))
                            .to_string(),
                    )),
                }
            })
            .buffered(config.fetch_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = RetrievalReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(mut page) => {
                    if config.lookup_publication_dates {
                        fill_publication_date(&mut page);
                    }
                    report.pages.push(page);
                }
                Err(skipped) => {
                    warn!(url = %skipped.url, reason = %skipped.reason, "skipped page");
                    report.skipped.push(skipped);
                }
            }
        }

        info!(
            fetched = report.pages.len(),
            skipped = report.skipped.len(),
            "page fetch finished"
        );
        report
    }

    /// Search followed by page fetching, or search results only when
    /// `fetch_pages` is off.
    pub async fn retrieve(
        &self,
        templates: &[QueryTemplate],
        variables: &Variables,
        config: &RetrievalConfig,
    ) -> Result<RetrievalReport, CollectError> {
        let results = self.search(templates, variables, config).await?;

        if !config.fetch_pages {
            let pages = results.into_iter().map(unfetched_page).collect();
            return Ok(RetrievalReport {
                pages,
                skipped: Vec::new(),
            });
        }

        Ok(self.fetch_pages(results, config).await)
    }

    fn reranker_for(&self, config: &RetrievalConfig) -> Result<Option<&dyn Reranker>, CollectError> {
        if !config.rerank {
            return Ok(None);
        }
        match &self.reranker {
            Some(reranker) => Ok(Some(reranker.as_ref())),
            None => Err(ConfigError::InvalidValue {
                name: "rerank".to_string(),
                details: "reranking is enabled but no reranker is configured".to_string(),
            }
            .into()),
        }
    }
}

fn dedupe_by_url(results: impl IntoIterator<Item = SearchResult>) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    results
        .into_iter()
        .filter(|result| seen.insert(result.url.clone()))
        .collect()
}

fn filters_for(binding: &VariableBinding, config: &RetrievalConfig) -> Result<SearchFilters, ConfigError> {
    let mut filters = SearchFilters {
        sites: config.source_allow_list.clone(),
        ..SearchFilters::default()
    };
    if let Some(country) = &config.geolocation_country {
        filters.country_code = Some(country_code(country)?.to_string());
        filters.country = Some(country.clone());
    }

    let Some(assignment) = &config.per_value_countries else {
        return Ok(filters);
    };
    let Some(value) = binding.get(&assignment.variable) else {
        return Ok(filters);
    };

    if let Some(country) = lookup_value(&assignment.geolocation, value) {
        filters.country_code = Some(country_code(country)?.to_string());
        filters.country = Some(country.clone());
    }
    if let Some(sites) = lookup_value(&assignment.sources, value) {
        filters.sites = sites.clone();
    }
    Ok(filters)
}

fn lookup_value<'a, T>(map: &'a std::collections::HashMap<String, T>, value: &str) -> Option<&'a T> {
    map.get(value).or_else(|| {
        map.iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(value.trim()))
            .map(|(_, mapped)| mapped)
    })
}

fn fill_publication_date(page: &mut WebPage) {
    if page.kind != ContentKind::Html {
        return;
    }
    let Some(result) = page.result.as_mut() else {
        return;
    };
    if result.published.is_none() {
        result.published = publication_date(&String::from_utf8_lossy(&page.content));
    }
}

fn unfetched_page(result: SearchResult) -> WebPage {
    WebPage {
        url: result.url.clone(),
        content: Vec::new(),
        kind: ContentKind::Other,
        title: Some(result.title.clone()),
        text: String::new(),
        ocr: false,
        result: Some(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CountryAssignment;
    use crate::models::DateRange;
    use crate::rerank::CharacterNgramReranker;
    use crate::testing::{FakeFetcher, FakeSearch};
    use std::time::Duration;

    fn variables(name: &str, values: &[&str]) -> Variables {
        let mut variables = Variables::new();
        variables.insert(
            name.to_string(),
            values.iter().map(|value| value.to_string()).collect(),
        );
        variables
    }

    fn html(title: &str, body: &str) -> String {
        format!("<html><head><title>{title}</title></head><body><p>{body}</p></body></html>")
    }

    #[tokio::test]
    async fn same_url_across_date_chunks_appears_once() {
        let search = FakeSearch::new().results(
            "acme revenue",
            &[("https://a.com/report", "Acme report"), ("https://b.com/news", "Acme news")],
        );
        let retriever = PageRetriever::new(search, FakeFetcher::new());
        let config = RetrievalConfig {
            date_range: DateRange::parse(Some("2020-01-01"), Some("2022-12-31")).unwrap(),
            time_chunking: true,
            fetch_pages: false,
            ..Default::default()
        };
        let templates = vec![QueryTemplate::new("acme revenue").unwrap()];

        let results = retriever
            .search(&templates, &Variables::new(), &config)
            .await
            .unwrap();

        let requests = retriever.search.recorded();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].search_text().contains("after:2020-01-01"));
        assert!(requests[2].search_text().contains("before:2022-12-31"));
        assert_eq!(
            results.iter().map(|result| result.url.as_str()).collect::<Vec<_>>(),
            vec!["https://a.com/report", "https://b.com/news"]
        );
    }

    #[tokio::test]
    async fn timed_out_fetch_is_skipped_and_others_continue() {
        let search = FakeSearch::new().results(
            "acme",
            &[("https://slow.com", "Slow"), ("https://fast.com", "Fast")],
        );
        let fetcher = FakeFetcher::new()
            .html("https://slow.com", &html("Slow", "late"))
            .slow("https://slow.com", Duration::from_secs(5))
            .html("https://fast.com", &html("Fast", "Acme revenue was $10 million"));
        let retriever = PageRetriever::new(search, fetcher);
        let config = RetrievalConfig {
            fetch_timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let report = retriever
            .retrieve(&[QueryTemplate::new("acme").unwrap()], &Variables::new(), &config)
            .await
            .unwrap();

        assert_eq!(report.pages.len(), 1);
        assert_eq!(report.pages[0].url, "https://fast.com");
        assert!(report.pages[0].text.contains("Acme revenue"));
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].url, "https://slow.com");
        assert!(report.skipped[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn per_value_countries_set_geolocation_per_query() {
        let search = FakeSearch::new();
        let retriever = PageRetriever::new(search, FakeFetcher::new());
        let config = RetrievalConfig {
            per_value_countries: Some(CountryAssignment::geolocation(
                "country",
                [("Kenya", "Kenya"), ("France", "France")],
            )),
            fetch_pages: false,
            ..Default::default()
        };

        retriever
            .search(
                &[QueryTemplate::new("cholera cases {country}").unwrap()],
                &variables("Country", &["Kenya", "France"]),
                &config,
            )
            .await
            .unwrap();

        let requests = retriever.search.recorded();
        let codes = requests
            .iter()
            .map(|request| (request.query.as_str(), request.country_code.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            codes,
            vec![
                ("cholera cases Kenya", Some("ke")),
                ("cholera cases France", Some("fr")),
            ]
        );
    }

    #[tokio::test]
    async fn per_value_sources_override_sites_for_assigned_values_only() {
        let retriever = PageRetriever::new(FakeSearch::new(), FakeFetcher::new());
        let config = RetrievalConfig {
            per_value_countries: Some(
                CountryAssignment::geolocation("country", Vec::<(String, String)>::new())
                    .with_sources("kenya", ["nation.africa", "standardmedia.co.ke"]),
            ),
            news_only: true,
            fetch_pages: false,
            ..Default::default()
        };

        retriever
            .search(
                &[QueryTemplate::new("cholera cases {country}").unwrap()],
                &variables("country", &["Kenya", "France"]),
                &config,
            )
            .await
            .unwrap();

        let requests = retriever.search.recorded();
        assert_eq!(requests.len(), 2);

        assert_eq!(requests[0].query, "cholera cases Kenya");
        assert_eq!(requests[0].sites, vec!["nation.africa", "standardmedia.co.ke"]);
        assert!(requests[0].search_text().contains("site:nation.africa"));

        assert_eq!(requests[1].query, "cholera cases France");
        assert!(requests[1].sites.is_empty());
        assert_eq!(requests[1].country_code, None);
        assert!(!requests[1].search_text().contains("site:"));
        assert!(requests.iter().all(|request| request.news_only));
    }

    #[test]
    fn global_sites_with_per_value_sources_is_rejected_before_searching() {
        let config = RetrievalConfig {
            source_allow_list: vec!["reuters.com".to_string()],
            per_value_countries: Some(
                CountryAssignment::geolocation("country", Vec::<(String, String)>::new())
                    .with_sources("Kenya", ["nation.africa"]),
            ),
            ..Default::default()
        };
        let result = PageRetriever::<FakeSearch, FakeFetcher>::plan_requests(
            &[QueryTemplate::new("cholera cases {country}").unwrap()],
            &variables("country", &["Kenya"]),
            &config,
        );
        assert!(matches!(
            result,
            Err(CollectError::Config(ConfigError::ConflictingCountryAssignment))
        ));
    }

    #[test]
    fn unknown_geolocation_country_is_a_config_error() {
        let config = RetrievalConfig {
            geolocation_country: Some("Atlantis".to_string()),
            ..Default::default()
        };
        let result = PageRetriever::<FakeSearch, FakeFetcher>::plan_requests(
            &[QueryTemplate::new("q").unwrap()],
            &Variables::new(),
            &config,
        );
        assert!(matches!(
            result,
            Err(CollectError::Config(ConfigError::UnknownCountry(_)))
        ));
    }

    #[tokio::test]
    async fn rerank_without_reranker_is_a_config_error() {
        let retriever = PageRetriever::new(FakeSearch::new(), FakeFetcher::new());
        let config = RetrievalConfig {
            rerank: true,
            ..Default::default()
        };
        let result = retriever
            .search(&[QueryTemplate::new("q").unwrap()], &Variables::new(), &config)
            .await;
        assert!(matches!(result, Err(CollectError::Config(_))));
    }

    #[tokio::test]
    async fn rerank_keeps_top_n_per_query() {
        let search = FakeSearch::new().results(
            "acme revenue",
            &[
                ("https://weather.com", "Weather forecast for the weekend"),
                ("https://acme.com", "Acme revenue annual report"),
                ("https://sports.com", "Football results"),
            ],
        );
        let retriever = PageRetriever::new(search, FakeFetcher::new())
            .with_reranker(Arc::new(CharacterNgramReranker::default()));
        let config = RetrievalConfig {
            rerank: true,
            rerank_top_n: 1,
            fetch_pages: false,
            ..Default::default()
        };

        let results = retriever
            .search(&[QueryTemplate::new("acme revenue").unwrap()], &Variables::new(), &config)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].url, "https://acme.com");
        assert!(results[0].score.is_some());
    }

    #[tokio::test]
    async fn stream_yields_unique_results() {
        let search = FakeSearch::new().results("acme", &[("https://a.com", "A")]);
        let retriever = PageRetriever::new(search, FakeFetcher::new());
        let config = RetrievalConfig {
            results_pages_per_query: 3,
            ..Default::default()
        };
        let templates = vec![QueryTemplate::new("acme").unwrap()];
        let variables = Variables::new();

        let results = retriever
            .search_stream(&templates, &variables, &config)
            .try_collect::<Vec<_>>()
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(retriever.search.recorded().len(), 3);
    }

    #[tokio::test]
    async fn publication_date_is_read_from_fetched_html() {
        let search = FakeSearch::new().results("acme", &[("https://a.com", "A")]);
        let fetcher = FakeFetcher::new().html(
            "https://a.com",
            r#"<html><head><meta property="article:published_time" content="2023-04-05T10:00:00Z"></head><body>Acme</body></html>"#,
        );
        let retriever = PageRetriever::new(search, fetcher);
        let config = RetrievalConfig {
            lookup_publication_dates: true,
            ..Default::default()
        };

        let report = retriever
            .retrieve(&[QueryTemplate::new("acme").unwrap()], &Variables::new(), &config)
            .await
            .unwrap();

        let published = report.pages[0].result.as_ref().unwrap().published;
        assert_eq!(published, chrono::NaiveDate::from_ymd_opt(2023, 4, 5));
    }
}
