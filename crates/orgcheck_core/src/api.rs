use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde_json::{Map, Value};

use crate::config::ApiContext;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Backstop for page-until-empty endpoints that never return an empty page.
pub const MAX_PAGES: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Which service root the endpoint lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiBase {
    Platform,
    Analytics,
}

/// One admin API request. The endpoint is a template: an `{orgId}` placeholder
/// is resolved against the ApiContext when the call is issued.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub endpoint: String,
    pub method: Method,
    pub base: ApiBase,
    pub body: Option<Value>,
    pub allowed_statuses: Vec<u16>,
}

impl ApiCall {
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Get,
            base: ApiBase::Platform,
            body: None,
            allowed_statuses: vec![200],
        }
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: Method::Post,
            base: ApiBase::Platform,
            body: Some(body),
            allowed_statuses: vec![200],
        }
    }

    pub fn on(mut self, base: ApiBase) -> Self {
        self.base = base;
        self
    }

    pub fn with_allowed_statuses(mut self, statuses: &[u16]) -> Self {
        self.allowed_statuses = statuses.to_vec();
        self
    }
}

/// Seam between the checkers and the HTTP transport.
///
/// `call_json` is the data path: an empty success body is an error there.
/// `call_accepted` is the boolean path for endpoints that acknowledge with an
/// empty body.
pub trait PlatformApi {
    fn call_json(&mut self, call: &ApiCall) -> Result<Value>;
    fn call_accepted(&mut self, call: &ApiCall) -> Result<bool>;
    fn request_count(&self) -> usize;
}

pub fn resolve_url(context: &ApiContext, base: ApiBase, endpoint: &str) -> String {
    let root = match base {
        ApiBase::Platform => &context.platform_url,
        ApiBase::Analytics => &context.analytics_url,
    };
    format!(
        "{}/rest/{}",
        root.trim_end_matches('/'),
        endpoint.replace("{orgId}", &context.org_id)
    )
}

/// Blocking HTTP implementation of PlatformApi. Sequential, no retries.
pub struct PlatformClient {
    client: Client,
    context: ApiContext,
    request_count: usize,
}

impl PlatformClient {
    pub fn new(context: ApiContext) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .build()
            .context("failed to build platform HTTP client")?;
        Ok(Self {
            client,
            context,
            request_count: 0,
        })
    }

    fn execute(&mut self, call: &ApiCall) -> Result<Option<Value>> {
        let url = resolve_url(&self.context, call.base, &call.endpoint);
        let mut request = match call.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        request = request.header("Authorization", format!("Bearer {}", self.context.token));
        if let Some(body) = &call.body {
            request = request
                .header("Content-Type", "application/json")
                .json(body);
        }
        let response = request
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        self.request_count += 1;

        let status = response.status().as_u16();
        let text = response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))?;
        if !call.allowed_statuses.contains(&status) {
            let error_code = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|payload| {
                    payload
                        .get("errorCode")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "no errorCode".to_string());
            eprintln!("ERROR {status} {error_code} from {url}");
            bail!("HTTP {status} ({error_code}) from {url}");
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        let payload =
            serde_json::from_str(&text).with_context(|| format!("invalid JSON from {url}"))?;
        Ok(Some(payload))
    }
}

impl PlatformApi for PlatformClient {
    fn call_json(&mut self, call: &ApiCall) -> Result<Value> {
        match self.execute(call)? {
            Some(payload) => Ok(payload),
            None => bail!(
                "empty response body from {} where data was expected",
                call.endpoint
            ),
        }
    }

    fn call_accepted(&mut self, call: &ApiCall) -> Result<bool> {
        self.execute(call)?;
        Ok(true)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Pagination configuration for one endpoint.
///
/// `array_key` absent means the page response IS the array. `page_count_key`
/// absent means fetching continues until an empty page comes back.
#[derive(Debug, Clone)]
pub struct Paging {
    pub array_key: Option<&'static str>,
    pub page_count_key: Option<&'static str>,
    pub page_in_body: bool,
    pub start_page: u64,
    pub max_pages: u64,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            array_key: None,
            page_count_key: None,
            page_in_body: false,
            start_page: 0,
            max_pages: MAX_PAGES,
        }
    }
}

/// Fetch every page of a paginated endpoint and return the concatenated items.
/// Any failed page call fails the whole fetch; no partial results are returned.
pub fn fetch_paged(
    api: &mut dyn PlatformApi,
    call: &ApiCall,
    paging: &Paging,
) -> Result<Vec<Value>> {
    let mut gathered = Vec::new();
    let mut page = paging.start_page;
    loop {
        if page - paging.start_page >= paging.max_pages {
            bail!(
                "pagination for {} did not terminate within {} pages",
                call.endpoint,
                paging.max_pages
            );
        }
        let page_call = paged_call(call, paging, page)?;
        let payload = api.call_json(&page_call)?;
        let (items, declared_total) = extract_page(&payload, paging, &call.endpoint)?;
        let batch_len = items.len();
        gathered.extend(items);
        page += 1;
        let more = match declared_total {
            Some(total) => page < total,
            None => batch_len > 0,
        };
        if !more {
            return Ok(gathered);
        }
    }
}

fn paged_call(call: &ApiCall, paging: &Paging, page: u64) -> Result<ApiCall> {
    let mut paged = call.clone();
    if paging.page_in_body {
        let body = paged
            .body
            .get_or_insert_with(|| Value::Object(Map::new()));
        match body {
            Value::Object(map) => {
                map.insert("page".to_string(), Value::from(page));
            }
            _ => bail!(
                "cannot inject page number into non-object body for {}",
                call.endpoint
            ),
        }
    } else {
        let separator = if paged.endpoint.contains('?') { '&' } else { '?' };
        paged.endpoint = format!("{}{separator}page={page}", paged.endpoint);
    }
    Ok(paged)
}

fn extract_page(
    payload: &Value,
    paging: &Paging,
    endpoint: &str,
) -> Result<(Vec<Value>, Option<u64>)> {
    let items = match paging.array_key {
        Some(key) => payload
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| anyhow!("page response from {endpoint} has no {key} array"))?,
        None => payload
            .as_array()
            .cloned()
            .ok_or_else(|| anyhow!("page response from {endpoint} is not an array"))?,
    };
    let declared_total = match paging.page_count_key {
        Some(key) => Some(
            payload
                .get(key)
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("page response from {endpoint} has no numeric {key}"))?,
        ),
        None => None,
    };
    Ok((items, declared_total))
}

/// Drop later occurrences of records whose `key` value was already seen.
/// Records missing the key are kept as-is.
pub fn dedupe_by_key(items: Vec<Value>, key: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut output = Vec::new();
    for item in items {
        match item.get(key).and_then(Value::as_str) {
            Some(value) if !seen.insert(value.to_string()) => {}
            _ => output.push(item),
        }
    }
    output
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub pipeline: String,
    pub total_count: i64,
}

impl SearchOutcome {
    /// The empty pipeline is requested as an empty string but reported back
    /// as the literal name "empty".
    pub fn pipeline_matches(&self, target: &str) -> bool {
        self.pipeline == target || (self.pipeline == "empty" && target.is_empty())
    }
}

/// Run one live search with elevated content visibility against the given
/// pipeline (empty string for the default pipeline).
pub fn run_search(api: &mut dyn PlatformApi, pipeline: &str, query: &str) -> Result<SearchOutcome> {
    let endpoint = format!(
        "search/v2?organizationId={{orgId}}&pipeline={pipeline}&viewAllContent=true&q={query}"
    );
    let payload = api.call_json(&ApiCall::get(endpoint))?;
    let total_count = payload
        .get("totalCount")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("search response is missing totalCount"))?;
    let pipeline = payload
        .get("pipeline")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(SearchOutcome {
        pipeline,
        total_count,
    })
}
