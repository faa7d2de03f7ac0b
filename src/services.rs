//! HTTP clients for search sources and enrichment providers.
//!
//! Each client maps HTTP failures onto the pipeline's error classes:
//! 408/429/5xx and network errors are transient, rejected credentials are
//! run-fatal, anything else is a data error.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::errors::AppError;
use crate::location::LocationExpander;
use crate::models::{
    CnpjCompany, CnpjSearchFilters, InstagramProfile, MapsPlace, ScrapedContacts, SourcePayload,
    SourceType, WhoisData,
};
use crate::normalize::{
    digits_only, extract_emails, extract_instagram_username, extract_phones,
    extract_whatsapp_numbers, normalize_cnpj, normalize_email,
};

// ============ Traits ============

/// What a discovery round asks a source for.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub search_term: String,
    pub location: String,
    pub cnpj_filters: Option<CnpjSearchFilters>,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchPage {
    Results(Vec<SourcePayload>),
    /// The source has nothing more for this query.
    Exhausted,
}

#[async_trait]
pub trait SearchSource: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Fetches one page (1-based).
    async fn fetch_page(&self, request: &SearchRequest, page: u32)
        -> Result<SearchPage, AppError>;
}

#[async_trait]
pub trait WhoisLookup: Send + Sync {
    /// `None` when the registry has no record for the domain.
    async fn lookup(&self, domain: &str) -> Result<Option<WhoisData>, AppError>;
}

#[async_trait]
pub trait WebsiteScraper: Send + Sync {
    /// `None` when the site answers with a client error (gone, forbidden).
    async fn scrape(&self, url: &str) -> Result<Option<ScrapedContacts>, AppError>;
}

#[async_trait]
pub trait CnpjRegistry: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the CNPJ is unknown to the registry.
    async fn lookup(&self, cnpj: &str) -> Result<Option<CnpjCompany>, AppError>;
}

#[async_trait]
pub trait WhatsappValidator: Send + Sync {
    async fn has_whatsapp(&self, phone_e164: &str) -> Result<bool, AppError>;
}

/// Search sources keyed by type, plus the optional sub-location expander.
#[derive(Clone, Default)]
pub struct SearchSources {
    sources: HashMap<SourceType, Arc<dyn SearchSource>>,
    expander: Option<Arc<dyn LocationExpander>>,
}

impl SearchSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn SearchSource>) -> Self {
        self.sources.insert(source.source_type(), source);
        self
    }

    pub fn get(&self, source: SourceType) -> Option<Arc<dyn SearchSource>> {
        self.sources.get(&source).cloned()
    }

    pub fn with_location_expander(mut self, expander: Arc<dyn LocationExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn location_expander(&self) -> Option<Arc<dyn LocationExpander>> {
        self.expander.clone()
    }
}

/// Optional enrichment providers; a missing provider means the lookup is skipped.
#[derive(Clone, Default)]
pub struct EnrichmentProviders {
    pub whois: Option<Arc<dyn WhoisLookup>>,
    pub website: Option<Arc<dyn WebsiteScraper>>,
    pub cnpj: Option<Arc<dyn CnpjRegistry>>,
    pub whatsapp: Option<Arc<dyn WhatsappValidator>>,
}

// ============ Shared helpers ============

pub(crate) fn status_error(service: &str, status: StatusCode, body: &str) -> AppError {
    let body: String = body.chars().take(300).collect();
    tracing::error!("{} returned error {}: {}", service, status, body);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            AppError::ExternalApiError(format!("{} returned status {}", service, status))
        }
        s if s.is_server_error() => {
            AppError::ExternalApiError(format!("{} returned status {}", service, status))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AppError::RunFatal(format!("{} rejected the API credentials", service))
        }
        _ => AppError::MalformedData(format!("{} returned status {}: {}", service, status, body)),
    }
}

pub(crate) async fn send(service: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AppError> {
    request
        .send()
        .await
        .map_err(|e| AppError::ExternalApiError(format!("{} request failed: {}", service, e)))
}

pub(crate) async fn error_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string())
}

pub(crate) async fn parse_json<T: serde::de::DeserializeOwned>(
    service: &str,
    response: reqwest::Response,
) -> Result<T, AppError> {
    response.json::<T>().await.map_err(|e| {
        AppError::MalformedData(format!("Failed to parse {} response: {}", service, e))
    })
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

// ============ Google Maps (Serper places) ============

pub struct MapsSearchService {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct PlacesResponse {
    #[serde(default)]
    places: Vec<MapsPlace>,
}

impl MapsSearchService {
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl SearchSource for MapsSearchService {
    fn source_type(&self) -> SourceType {
        SourceType::GoogleMaps
    }

    async fn fetch_page(
        &self,
        request: &SearchRequest,
        page: u32,
    ) -> Result<SearchPage, AppError> {
        let url = join_url(&self.base_url, "places");
        let body = json!({
            "q": request.search_term,
            "location": request.location,
            "gl": "br",
            "hl": "pt-br",
            "page": page,
        });
        tracing::info!(
            "Fetching Maps page {} for '{}' in '{}'",
            page,
            request.search_term,
            request.location
        );
        tracing::debug!("Maps URL: {} (X-API-KEY: [REDACTED])", url);

        let response = send(
            "Maps API",
            self.client
                .post(&url)
                .header("X-API-KEY", &self.api_key)
                .json(&body),
        )
        .await?;

        // Serper answers 500 once a query has no further pages.
        if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::info!("Maps API returned 500 on page {}, treating as exhausted", page);
            return Ok(SearchPage::Exhausted);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error("Maps API", status, &error_body(response).await));
        }

        let parsed: PlacesResponse = parse_json("Maps API", response).await?;
        if parsed.places.is_empty() {
            return Ok(SearchPage::Exhausted);
        }
        tracing::info!("✓ Maps page {} returned {} places", page, parsed.places.len());
        Ok(SearchPage::Results(
            parsed
                .places
                .into_iter()
                .map(SourcePayload::GoogleMaps)
                .collect(),
        ))
    }
}

// ============ Instagram (Serper web search) ============

pub struct InstagramSearchService {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct OrganicResponse {
    #[serde(default)]
    organic: Vec<OrganicResult>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: Option<String>,
}

impl InstagramSearchService {
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    /// Profile from an organic hit; `None` for posts, reels and non-profile pages.
    fn profile_from_result(result: &OrganicResult) -> Option<InstagramProfile> {
        let username = extract_instagram_username(&result.link)?;
        // Titles look like "Padaria Centro (@padaria_centro) • Instagram photos and videos"
        let full_name = result
            .title
            .split(" (@")
            .next()
            .map(|t| t.split(" • ").next().unwrap_or(t).trim().to_string())
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("instagram"));
        Some(InstagramProfile {
            profile_url: format!("https://www.instagram.com/{}/", username),
            username,
            full_name,
            biography: result.snippet.clone(),
            external_url: None,
            followers: None,
        })
    }
}

#[async_trait]
impl SearchSource for InstagramSearchService {
    fn source_type(&self) -> SourceType {
        SourceType::Instagram
    }

    async fn fetch_page(
        &self,
        request: &SearchRequest,
        page: u32,
    ) -> Result<SearchPage, AppError> {
        let url = join_url(&self.base_url, "search");
        let query = format!(
            "site:instagram.com {} {}",
            request.search_term.trim(),
            request.location.trim()
        );
        let body = json!({
            "q": query.trim(),
            "num": request.page_size.min(100),
            "page": page,
            "gl": "br",
            "hl": "pt-br",
        });
        tracing::info!("Fetching Instagram search page {} for '{}'", page, query.trim());

        let response = send(
            "Search API",
            self.client
                .post(&url)
                .header("X-API-KEY", &self.api_key)
                .json(&body),
        )
        .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error("Search API", status, &error_body(response).await));
        }

        let parsed: OrganicResponse = parse_json("Search API", response).await?;
        if parsed.organic.is_empty() {
            return Ok(SearchPage::Exhausted);
        }
        let profiles: Vec<SourcePayload> = parsed
            .organic
            .iter()
            .filter_map(Self::profile_from_result)
            .map(SourcePayload::Instagram)
            .collect();
        tracing::info!(
            "✓ Search page {} returned {} hits, {} profiles",
            page,
            parsed.organic.len(),
            profiles.len()
        );
        Ok(SearchPage::Results(profiles))
    }
}

// ============ CNPJ registry search ============

pub struct CnpjSearchService {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CnpjSearchResponse {
    #[serde(default)]
    data: Vec<CnpjCompany>,
}

impl CnpjSearchService {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl SearchSource for CnpjSearchService {
    fn source_type(&self) -> SourceType {
        SourceType::Cnpj
    }

    async fn fetch_page(
        &self,
        request: &SearchRequest,
        page: u32,
    ) -> Result<SearchPage, AppError> {
        let page_str = page.to_string();
        let limit = request.page_size.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("q", request.search_term.as_str()),
            ("page", page_str.as_str()),
            ("limit", limit.as_str()),
        ];
        if let Some(filters) = &request.cnpj_filters {
            if let Some(uf) = filters.uf.as_deref() {
                params.push(("uf", uf));
            }
            if let Some(municipio) = filters.municipio.as_deref() {
                params.push(("municipio", municipio));
            }
            if let Some(cnae) = filters.cnae.as_deref() {
                params.push(("cnae", cnae));
            }
            if filters.only_active {
                params.push(("situacao", "ativa"));
            }
        }

        let url = reqwest::Url::parse_with_params(&join_url(&self.base_url, "companies"), &params)
            .map_err(|e| AppError::InternalError(format!("Failed to build URL: {}", e)))?;
        tracing::info!("Fetching CNPJ registry page {}", page);

        let response = send("CNPJ search", self.client.get(url)).await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error("CNPJ search", status, &error_body(response).await));
        }
        let parsed: CnpjSearchResponse = parse_json("CNPJ search", response).await?;
        if parsed.data.is_empty() {
            return Ok(SearchPage::Exhausted);
        }
        Ok(SearchPage::Results(
            parsed
                .data
                .into_iter()
                .map(|mut company| {
                    company.cnpj = digits_only(&company.cnpj);
                    company.provider.get_or_insert_with(|| "search".to_string());
                    SourcePayload::Cnpj(company)
                })
                .collect(),
        ))
    }
}

// ============ WHOIS ============

pub struct WhoisService {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct WhoisResponse {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default, alias = "ownerid", alias = "owner_id")]
    owner_document: Option<String>,
    #[serde(default)]
    phones: Vec<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    emails: Vec<String>,
    #[serde(default)]
    email: Option<String>,
}

impl WhoisService {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl WhoisLookup for WhoisService {
    async fn lookup(&self, domain: &str) -> Result<Option<WhoisData>, AppError> {
        let url = reqwest::Url::parse_with_params(
            &join_url(&self.base_url, "whois"),
            &[("domain", domain)],
        )
        .map_err(|e| AppError::InternalError(format!("Failed to build URL: {}", e)))?;
        tracing::debug!("WHOIS lookup for {}", domain);

        let response = send("WHOIS", self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error("WHOIS", status, &error_body(response).await));
        }
        let parsed: WhoisResponse = parse_json("WHOIS", response).await?;

        let mut phones = parsed.phones;
        phones.extend(parsed.phone);
        let mut emails = parsed.emails;
        emails.extend(parsed.email);
        Ok(Some(WhoisData {
            domain: parsed.domain.unwrap_or_else(|| domain.to_string()),
            owner: parsed.owner,
            owner_document: parsed.owner_document,
            phones,
            emails,
        }))
    }
}

// ============ Website scraper ============

/// Bytes of HTML inspected per page.
const MAX_PAGE_BYTES: usize = 512 * 1024;

pub struct WebsiteScraperService {
    client: Client,
}

impl WebsiteScraperService {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Contacts found in a page: `mailto:`, `tel:` and WhatsApp link targets,
    /// plus emails and phones written in the visible text. Scripts, styles and
    /// attribute values other than `href` are never searched.
    pub fn extract_contacts(url: &str, html: &str) -> ScrapedContacts {
        let document = Html::parse_document(html);
        let mut emails = Vec::new();
        let mut phones = Vec::new();
        let mut whatsapp = Vec::new();

        if let Ok(link_selector) = Selector::parse("a[href]") {
            for href in document
                .select(&link_selector)
                .filter_map(|el| el.value().attr("href"))
                .map(str::trim)
            {
                let lower = href.to_ascii_lowercase();
                if let Some(target) = lower.strip_prefix("mailto:") {
                    let address = target.split('?').next().unwrap_or_default();
                    emails.extend(normalize_email(address));
                } else if lower.starts_with("tel:") {
                    phones.extend(extract_phones(href.get(4..).unwrap_or_default()));
                } else {
                    whatsapp.extend(extract_whatsapp_numbers(href));
                }
            }
        }

        let text = visible_text(&document);
        emails.extend(extract_emails(&text));
        phones.extend(extract_phones(&text));
        whatsapp.extend(extract_whatsapp_numbers(&text));

        ScrapedContacts {
            url: url.to_string(),
            emails: unique(emails),
            phones: unique(phones),
            whatsapp: unique(whatsapp),
        }
    }
}

/// Text nodes outside scripts, styles and templates, joined by spaces.
fn visible_text(document: &Html) -> String {
    const HIDDEN: [&str; 4] = ["script", "style", "noscript", "template"];
    document
        .root_element()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| HIDDEN.contains(&el.name()))
            });
            (!hidden).then(|| text.trim())
        })
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn unique(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[async_trait]
impl WebsiteScraper for WebsiteScraperService {
    async fn scrape(&self, url: &str) -> Result<Option<ScrapedContacts>, AppError> {
        let target = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{}", url)
        };
        tracing::debug!("Scraping website {}", target);

        let response = send("Website", self.client.get(&target)).await?;
        let status = response.status();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            tracing::info!("Website {} answered {}, nothing to scrape", target, status);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error("Website", status, ""));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Website body read failed: {}", e)))?;
        let html: String = body.chars().take(MAX_PAGE_BYTES).collect();
        Ok(Some(Self::extract_contacts(&target, &html)))
    }
}

// ============ CNPJ lookups ============

/// OpenCNPJ (cnpja) office endpoint.
pub struct OpenCnpjService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CnpjaText {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CnpjaCompanyInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    equity: Option<f64>,
    #[serde(default)]
    size: Option<CnpjaText>,
}

#[derive(Debug, Default, Deserialize)]
struct CnpjaAddress {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CnpjaActivity {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjaPhone {
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CnpjaEmail {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CnpjaOffice {
    #[serde(default)]
    tax_id: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    founded: Option<String>,
    #[serde(default)]
    company: Option<CnpjaCompanyInfo>,
    #[serde(default)]
    status: Option<CnpjaText>,
    #[serde(default)]
    address: Option<CnpjaAddress>,
    #[serde(default)]
    main_activity: Option<CnpjaActivity>,
    #[serde(default)]
    phones: Vec<CnpjaPhone>,
    #[serde(default)]
    emails: Vec<CnpjaEmail>,
}

impl OpenCnpjService {
    pub fn new(client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn into_company(cnpj: &str, office: CnpjaOffice) -> CnpjCompany {
        let company = office.company.unwrap_or_default();
        let address = office.address.unwrap_or_default();
        let activity = office.main_activity.unwrap_or_default();
        CnpjCompany {
            cnpj: office
                .tax_id
                .map(|t| digits_only(&t))
                .unwrap_or_else(|| cnpj.to_string()),
            razao_social: company.name,
            nome_fantasia: office.alias,
            situacao: office.status.and_then(|s| s.text),
            porte: company.size.and_then(|s| s.text),
            capital_social: company.equity,
            cnae_principal: match (activity.id, activity.text) {
                (Some(id), Some(text)) => Some(format!("{} - {}", id.to_string().trim_matches('"'), text)),
                (None, text) => text,
                (Some(id), None) => Some(id.to_string().trim_matches('"').to_string()),
            },
            data_abertura: office.founded,
            municipio: address.city,
            uf: address.state,
            phones: office
                .phones
                .into_iter()
                .filter_map(|p| match (p.area, p.number) {
                    (Some(area), Some(number)) => Some(format!("{}{}", area, number)),
                    (None, Some(number)) => Some(number),
                    _ => None,
                })
                .collect(),
            emails: office.emails.into_iter().filter_map(|e| e.address).collect(),
            provider: Some("opencnpj".to_string()),
        }
    }
}

#[async_trait]
impl CnpjRegistry for OpenCnpjService {
    fn name(&self) -> &'static str {
        "opencnpj"
    }

    async fn lookup(&self, cnpj: &str) -> Result<Option<CnpjCompany>, AppError> {
        let url = join_url(&self.base_url, &format!("office/{}", cnpj));
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", key);
        }
        tracing::debug!("OpenCNPJ lookup {} (Authorization: [REDACTED])", cnpj);

        let response = send("OpenCNPJ", request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error("OpenCNPJ", status, &error_body(response).await));
        }
        let office: CnpjaOffice = parse_json("OpenCNPJ", response).await?;
        Ok(Some(Self::into_company(cnpj, office)))
    }
}

/// BrasilAPI CNPJ endpoint (public, no key).
pub struct BrasilApiService {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BrasilApiCompany {
    #[serde(default)]
    cnpj: Option<String>,
    #[serde(default)]
    razao_social: Option<String>,
    #[serde(default)]
    nome_fantasia: Option<String>,
    #[serde(default)]
    descricao_situacao_cadastral: Option<String>,
    #[serde(default)]
    porte: Option<String>,
    #[serde(default)]
    capital_social: Option<f64>,
    #[serde(default)]
    cnae_fiscal: Option<i64>,
    #[serde(default)]
    cnae_fiscal_descricao: Option<String>,
    #[serde(default)]
    data_inicio_atividade: Option<String>,
    #[serde(default)]
    municipio: Option<String>,
    #[serde(default)]
    uf: Option<String>,
    #[serde(default)]
    ddd_telefone_1: Option<String>,
    #[serde(default)]
    ddd_telefone_2: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl BrasilApiService {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    fn into_company(cnpj: &str, data: BrasilApiCompany) -> CnpjCompany {
        CnpjCompany {
            cnpj: data
                .cnpj
                .map(|c| digits_only(&c))
                .unwrap_or_else(|| cnpj.to_string()),
            razao_social: data.razao_social,
            nome_fantasia: data.nome_fantasia.filter(|n| !n.trim().is_empty()),
            situacao: data.descricao_situacao_cadastral,
            porte: data.porte,
            capital_social: data.capital_social,
            cnae_principal: match (data.cnae_fiscal, data.cnae_fiscal_descricao) {
                (Some(code), Some(text)) => Some(format!("{} - {}", code, text)),
                (Some(code), None) => Some(code.to_string()),
                (None, text) => text,
            },
            data_abertura: data.data_inicio_atividade,
            municipio: data.municipio,
            uf: data.uf,
            phones: [data.ddd_telefone_1, data.ddd_telefone_2]
                .into_iter()
                .flatten()
                .filter(|p| !p.trim().is_empty())
                .collect(),
            emails: data.email.into_iter().filter(|e| !e.trim().is_empty()).collect(),
            provider: Some("brasilapi".to_string()),
        }
    }
}

#[async_trait]
impl CnpjRegistry for BrasilApiService {
    fn name(&self) -> &'static str {
        "brasilapi"
    }

    async fn lookup(&self, cnpj: &str) -> Result<Option<CnpjCompany>, AppError> {
        let url = join_url(&self.base_url, &format!("api/cnpj/v1/{}", cnpj));
        tracing::debug!("BrasilAPI lookup {}", cnpj);

        let response = send("BrasilAPI", self.client.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error("BrasilAPI", status, &error_body(response).await));
        }
        let data: BrasilApiCompany = parse_json("BrasilAPI", response).await?;
        Ok(Some(Self::into_company(cnpj, data)))
    }
}

/// Tries registries in order until one knows the CNPJ.
///
/// Returns the last error only when no registry gave a definitive answer.
pub struct CnpjFallbackChain {
    registries: Vec<Arc<dyn CnpjRegistry>>,
}

impl CnpjFallbackChain {
    pub fn new(registries: Vec<Arc<dyn CnpjRegistry>>) -> Self {
        Self { registries }
    }
}

#[async_trait]
impl CnpjRegistry for CnpjFallbackChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn lookup(&self, cnpj: &str) -> Result<Option<CnpjCompany>, AppError> {
        let cnpj = normalize_cnpj(cnpj)
            .ok_or_else(|| AppError::MalformedData(format!("invalid CNPJ: {}", cnpj)))?;
        let mut last_error = None;
        let mut answered_not_found = false;

        for registry in &self.registries {
            match registry.lookup(&cnpj).await {
                Ok(Some(company)) => {
                    tracing::info!("✓ CNPJ {} found via {}", cnpj, registry.name());
                    return Ok(Some(company));
                }
                Ok(None) => {
                    tracing::debug!("CNPJ {} not found in {}", cnpj, registry.name());
                    answered_not_found = true;
                }
                Err(e) => {
                    tracing::warn!("⚠ {} failed for CNPJ {}: {}", registry.name(), cnpj, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered_not_found => Err(e),
            _ => Ok(None),
        }
    }
}

// ============ WhatsApp ============

pub struct WhatsappService {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct WhatsappCheckResponse {
    #[serde(alias = "exists", alias = "valid")]
    has_whatsapp: bool,
}

impl WhatsappService {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl WhatsappValidator for WhatsappService {
    async fn has_whatsapp(&self, phone_e164: &str) -> Result<bool, AppError> {
        let url = join_url(&self.base_url, "check");
        let response = send(
            "WhatsApp validator",
            self.client
                .post(&url)
                .json(&json!({ "phone": digits_only(phone_e164) })),
        )
        .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(status_error(
                "WhatsApp validator",
                status,
                &error_body(response).await,
            ));
        }
        let parsed: WhatsappCheckResponse = parse_json("WhatsApp validator", response).await?;
        Ok(parsed.has_whatsapp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_classes() {
        assert!(status_error("x", StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            status_error("x", StatusCode::UNAUTHORIZED, ""),
            AppError::RunFatal(_)
        ));
        assert!(matches!(
            status_error("x", StatusCode::BAD_REQUEST, "bad q"),
            AppError::MalformedData(_)
        ));
    }

    #[test]
    fn test_profile_from_search_hit() {
        let hit = OrganicResult {
            title: "Padaria Centro (@padaria_centro) • Instagram photos and videos".into(),
            link: "https://www.instagram.com/padaria_centro/".into(),
            snippet: Some("Pães artesanais. (11) 98765-4321".into()),
        };
        let profile = InstagramSearchService::profile_from_result(&hit).unwrap();
        assert_eq!(profile.username, "padaria_centro");
        assert_eq!(profile.full_name.as_deref(), Some("Padaria Centro"));

        let post = OrganicResult {
            title: "Instagram".into(),
            link: "https://www.instagram.com/p/Cx123/".into(),
            snippet: None,
        };
        assert!(InstagramSearchService::profile_from_result(&post).is_none());
    }

    #[test]
    fn test_extract_contacts_from_html() {
        let html = r#"<a href="mailto:vendas@padaria.com.br">Email</a>
            <a href="tel:+551134567890">Ligue</a>
            <a href="https://wa.me/5511987654321">WhatsApp</a>"#;
        let contacts = WebsiteScraperService::extract_contacts("https://padaria.com.br", html);
        assert_eq!(contacts.emails, vec!["vendas@padaria.com.br".to_string()]);
        assert!(contacts.phones.contains(&"1134567890".to_string()));
        assert_eq!(contacts.whatsapp, vec!["11987654321".to_string()]);
    }

    #[test]
    fn test_extract_contacts_ignores_scripts_and_attributes() {
        let html = r#"<html><head>
            <script>var tracking = "(11) 4002-8922"; var owner = "dev@tracker.io";</script>
            <style>.x { content: "suporte@css.com" }</style>
            </head><body>
            <div data-phone="(21) 3333-2222">Loja</div>
            <a href="mailto:Contato@Padaria.com.br?subject=Pedido">Fale conosco</a>
            <p>Atendimento: (11) 3456-7890</p>
            </body></html>"#;
        let contacts = WebsiteScraperService::extract_contacts("https://padaria.com.br", html);
        assert_eq!(contacts.emails, vec!["contato@padaria.com.br".to_string()]);
        assert_eq!(contacts.phones, vec!["1134567890".to_string()]);
        assert!(contacts.whatsapp.is_empty());
    }
}
