use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use reqwest::blocking::Client;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

const LLM_TIMEOUT: Duration = Duration::from_secs(60);

const STAGE1_PROMPT: &str = r#"Из этого HTML-фрагмента извлеки данные и сформируй JSON-массив. Формат объекта: {
  "brand": "",
  "model": "",
  "body_code": "",
  "years": "",
  "generation": "",
  "type": "",
  "url": "",
  "region": ""
} Требования: - Вернуть строго валидный JSON. - Не добавлять комментарии, описания, текст до или после JSON.
- Если данных нет — вернуть пустой массив [].
- Все строки оставить как в исходном тексте (ничего не сокращать и не интерпретировать).
- URL должен быть полным.
- Не писать объяснений. В ответе должно быть только содержимое JSON.

ФРАГМЕНТ HTML

"#;

const STAGE3_PROMPT: &str = r#"Из следующего HTML блока выдели HTML с техническими характеристиками, сохранив исходную разметку. Верни JSON объект вида {"specs_html": "..."} без лишнего текста. Если данных нет — верни {"specs_html": ""}.

HTML:
"#;

/// One vehicle model variant extracted from a listing block. Fields absent
/// from the LLM's JSON deserialize to empty strings, so missing-column
/// handling lives here rather than being scattered over the stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingRecord {
    pub brand: String,
    pub model: String,
    pub body_code: String,
    pub years: String,
    pub generation: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub region: String,
    pub entry_url: String,
}

impl ListingRecord {
    /// Stage-1 column order; `into_row` must match.
    pub const COLUMNS: [&'static str; 9] = [
        "brand",
        "model",
        "body_code",
        "years",
        "generation",
        "type",
        "url",
        "region",
        "entry_url",
    ];

    pub fn into_row(self) -> Vec<String> {
        vec![
            self.brand,
            self.model,
            self.body_code,
            self.years,
            self.generation,
            self.kind,
            self.url,
            self.region,
            self.entry_url,
        ]
    }
}

/// The pluggable capability that turns HTML into structured data: a remote
/// LLM endpoint when configured, a deterministic selector fallback otherwise.
pub trait Extractor {
    fn listing_records(&self, html_fragment: &str, base_url: &str) -> Result<Vec<ListingRecord>>;
    fn spec_fragment(&self, html_fragment: &str) -> Result<String>;
}

/// Factory: endpoint present selects the remote client.
pub fn build_extractor(
    endpoint: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
) -> Result<Box<dyn Extractor>> {
    match endpoint {
        Some(endpoint) => {
            info!("Using LLM extractor with endpoint {}", endpoint);
            Ok(Box::new(LlmExtractor::new(endpoint, api_key, model)?))
        }
        None => {
            info!("No LLM endpoint configured, using heuristic extractor");
            Ok(Box::new(HeuristicExtractor))
        }
    }
}

/// Outcome of a soft-failable extraction: either the capability's result or
/// a substituted default after a recovered failure. Stage runners match on
/// this instead of inspecting error types.
pub enum Extraction<T> {
    Extracted(T),
    Recovered(T),
}

impl<T> Extraction<T> {
    pub fn is_recovered(&self) -> bool {
        matches!(self, Extraction::Recovered(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Extraction::Extracted(value) | Extraction::Recovered(value) => value,
        }
    }
}

/// Stage-1 soft-fail wrapper: extraction errors become an empty record list.
pub fn listing_records_or_empty(
    extractor: &dyn Extractor,
    html_fragment: &str,
    base_url: &str,
) -> Extraction<Vec<ListingRecord>> {
    match extractor.listing_records(html_fragment, base_url) {
        Ok(records) => Extraction::Extracted(records),
        Err(err) => {
            warn!("Record extraction failed, substituting empty list: {:#}", err);
            Extraction::Recovered(Vec::new())
        }
    }
}

/// Stage-3 soft-fail wrapper: extraction errors become an empty fragment.
pub fn spec_fragment_or_empty(extractor: &dyn Extractor, html_fragment: &str) -> Extraction<String> {
    match extractor.spec_fragment(html_fragment) {
        Ok(specs) => Extraction::Extracted(specs),
        Err(err) => {
            warn!("Spec extraction failed, substituting empty fragment: {:#}", err);
            Extraction::Recovered(String::new())
        }
    }
}

/// Resolves `href` against `base`; unparseable inputs pass through unchanged.
pub fn resolve_url(base: &str, href: &str) -> String {
    if href.is_empty() {
        return String::new();
    }
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => href.to_string(),
    }
}

/// Remote extraction client: POSTs `{model?, input}` to an HTTP endpoint and
/// expects JSON back, optionally wrapped in an `"output"` envelope or
/// string-encoded.
pub struct LlmExtractor {
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    client: Client,
}

impl LlmExtractor {
    pub fn new(endpoint: String, api_key: Option<String>, model: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(Self {
            endpoint,
            api_key,
            model,
            client,
        })
    }

    fn post(&self, prompt: String) -> Result<Value> {
        let mut payload = serde_json::json!({ "input": prompt });
        if let Some(model) = &self.model {
            payload["model"] = Value::String(model.clone());
        }
        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let value = request
            .send()
            .and_then(|resp| resp.error_for_status())
            .with_context(|| format!("LLM request to {} failed", self.endpoint))?
            .json()
            .context("LLM response is not valid JSON")?;
        Ok(value)
    }
}

impl Extractor for LlmExtractor {
    fn listing_records(&self, html_fragment: &str, base_url: &str) -> Result<Vec<ListingRecord>> {
        let response = self.post(format!("{STAGE1_PROMPT}{html_fragment}"))?;
        parse_listing_response(response, base_url)
    }

    fn spec_fragment(&self, html_fragment: &str) -> Result<String> {
        let response = self.post(format!("{STAGE3_PROMPT}{html_fragment}"))?;
        parse_specs_response(response)
    }
}

fn unwrap_output_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("output") {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    }
}

fn parse_listing_response(value: Value, base_url: &str) -> Result<Vec<ListingRecord>> {
    let value = match unwrap_output_envelope(value) {
        Value::String(text) => serde_json::from_str(&text)
            .context("LLM returned a string that is not valid JSON")?,
        other => other,
    };
    let Value::Array(items) = value else {
        bail!("unexpected LLM response shape for record extraction");
    };
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        if !item.is_object() {
            debug!("Skipping non-object item from LLM: {}", item);
            continue;
        }
        let mut record: ListingRecord =
            serde_json::from_value(item).context("malformed record object from LLM")?;
        if !record.url.is_empty() {
            record.url = resolve_url(base_url, &record.url);
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_specs_response(value: Value) -> Result<String> {
    let value = match unwrap_output_envelope(value) {
        // Some providers double-encode the JSON object.
        Value::String(text) => {
            serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
        }
        other => other,
    };
    match value.get("specs_html") {
        Some(Value::String(specs)) => Ok(specs.clone()),
        Some(Value::Null) => Ok(String::new()),
        _ => bail!("unexpected LLM response shape for spec extraction"),
    }
}

static BLOCK_DIV: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static SPECS_CONTAINER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".b-left-side").unwrap());
static YEARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}\s*[-–—]\s*(?:\d{4})?").unwrap());

/// Deterministic fallback that approximates the LLM with fixed selectors:
/// the first link of each block yields the URL, its text splits into
/// brand/model, and a year-range pattern in the block text fills `years`.
pub struct HeuristicExtractor;

impl Extractor for HeuristicExtractor {
    fn listing_records(&self, html_fragment: &str, base_url: &str) -> Result<Vec<ListingRecord>> {
        let fragment = Html::parse_fragment(html_fragment);
        let divs: Vec<ElementRef> = fragment.select(&BLOCK_DIV).collect();
        let blocks = if divs.is_empty() {
            vec![fragment.root_element()]
        } else {
            divs
        };

        let mut records = Vec::new();
        for block in blocks {
            let Some(anchor) = block.select(&ANCHOR).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let text = normalize_ws(&anchor.text().collect::<Vec<_>>().join(" "));
            if text.is_empty() {
                continue;
            }
            let mut parts = text.split_whitespace();
            let brand = parts.next().unwrap_or_default().to_string();
            let model = parts.collect::<Vec<_>>().join(" ");
            let block_text = block.text().collect::<Vec<_>>().join(" ");
            let years = YEARS_RE
                .find(&block_text)
                .map(|m| normalize_ws(m.as_str()))
                .unwrap_or_default();
            records.push(ListingRecord {
                brand,
                model,
                years,
                url: resolve_url(base_url, href),
                ..Default::default()
            });
        }
        Ok(records)
    }

    fn spec_fragment(&self, html_fragment: &str) -> Result<String> {
        let fragment = Html::parse_fragment(html_fragment);
        match fragment.select(&SPECS_CONTAINER).next() {
            Some(container) => Ok(container.html()),
            None => Ok(html_fragment.to_string()),
        }
    }
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listing_record_defaults_missing_fields() {
        let record: ListingRecord = serde_json::from_str(r#"{"brand":"Toyota"}"#).unwrap();
        assert_eq!(record.brand, "Toyota");
        assert_eq!(record.model, "");
        assert_eq!(record.url, "");
    }

    #[test]
    fn listing_record_row_matches_column_order() {
        let record = ListingRecord {
            brand: "Toyota".into(),
            kind: "sedan".into(),
            entry_url: "e".into(),
            ..Default::default()
        };
        let row = record.into_row();
        assert_eq!(row.len(), ListingRecord::COLUMNS.len());
        assert_eq!(row[0], "Toyota");
        assert_eq!(row[5], "sedan");
        assert_eq!(row[8], "e");
    }

    #[test]
    fn parse_listing_unwraps_output_envelope() {
        let value = json!({"output": [{"brand": "Lada", "url": "https://x.ru/lada/"}]});
        let records = parse_listing_response(value, "https://x.ru/").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].brand, "Lada");
    }

    #[test]
    fn parse_listing_accepts_string_encoded_array() {
        let value = json!({"output": r#"[{"brand":"Lada"}]"#});
        let records = parse_listing_response(value, "https://x.ru/").unwrap();
        assert_eq!(records[0].brand, "Lada");
    }

    #[test]
    fn parse_listing_resolves_relative_urls() {
        let value = json!([{"brand": "Lada", "url": "/granta/"}]);
        let records = parse_listing_response(value, "https://www.drom.ru/catalog/").unwrap();
        assert_eq!(records[0].url, "https://www.drom.ru/granta/");
    }

    #[test]
    fn parse_listing_skips_non_object_items() {
        let value = json!([{"brand": "Lada"}, "noise", 42]);
        let records = parse_listing_response(value, "https://x.ru/").unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn parse_listing_rejects_non_array() {
        let value = json!({"brand": "Lada"});
        assert!(parse_listing_response(value, "https://x.ru/").is_err());
    }

    #[test]
    fn parse_specs_variants() {
        assert_eq!(
            parse_specs_response(json!({"specs_html": "<table/>"})).unwrap(),
            "<table/>"
        );
        assert_eq!(
            parse_specs_response(json!({"output": {"specs_html": "<p/>"}})).unwrap(),
            "<p/>"
        );
        assert_eq!(
            parse_specs_response(json!({"output": r#"{"specs_html": "<b/>"}"#})).unwrap(),
            "<b/>"
        );
        assert_eq!(
            parse_specs_response(json!({"specs_html": null})).unwrap(),
            ""
        );
        assert!(parse_specs_response(json!({"something": "else"})).is_err());
    }

    #[test]
    fn heuristic_extracts_brand_model_url_and_years() {
        let html = r#"<div><a href="/toyota/corolla/">Toyota Corolla</a><span>2015 - 2020</span></div>"#;
        let records = HeuristicExtractor
            .listing_records(html, "https://www.drom.ru/catalog/")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].brand, "Toyota");
        assert_eq!(records[0].model, "Corolla");
        assert_eq!(records[0].years, "2015 - 2020");
        assert_eq!(records[0].url, "https://www.drom.ru/toyota/corolla/");
    }

    #[test]
    fn heuristic_without_divs_uses_whole_fragment() {
        let html = r#"<a href="https://www.drom.ru/lada/granta/">Lada Granta</a>"#;
        let records = HeuristicExtractor
            .listing_records(html, "https://www.drom.ru/")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].model, "Granta");
    }

    #[test]
    fn heuristic_skips_blocks_without_links_or_text() {
        let html = r#"<div><p>no link here</p></div><div><a href="/x/"> </a></div>"#;
        let records = HeuristicExtractor
            .listing_records(html, "https://www.drom.ru/")
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn heuristic_spec_fragment_selects_left_side() {
        let html = r#"<div class="wrap"><div class="b-left-side"><table><tr><td>spec</td></tr></table></div></div>"#;
        let specs = HeuristicExtractor.spec_fragment(html).unwrap();
        assert!(specs.contains("b-left-side"));
        assert!(specs.contains("spec"));
        assert!(!specs.contains("wrap"));
    }

    #[test]
    fn heuristic_spec_fragment_falls_back_to_whole_input() {
        let html = "<p>bare specs</p>";
        assert_eq!(HeuristicExtractor.spec_fragment(html).unwrap(), html);
    }

    #[test]
    fn resolve_url_handles_absolute_relative_and_empty() {
        assert_eq!(
            resolve_url("https://a.ru/b/", "https://c.ru/d"),
            "https://c.ru/d"
        );
        assert_eq!(resolve_url("https://a.ru/b/", "c"), "https://a.ru/b/c");
        assert_eq!(resolve_url("https://a.ru/b/", ""), "");
        assert_eq!(resolve_url("not a base", "x/y"), "x/y");
    }

    #[test]
    fn factory_without_endpoint_is_heuristic() {
        let extractor = build_extractor(None, None, None).unwrap();
        // Heuristic works offline; the remote client would need a network.
        let records = extractor
            .listing_records(
                r#"<div><a href="/a/">Brand Model</a></div>"#,
                "https://www.drom.ru/",
            )
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    struct FailingExtractor;

    impl Extractor for FailingExtractor {
        fn listing_records(&self, _: &str, _: &str) -> Result<Vec<ListingRecord>> {
            bail!("capability down")
        }

        fn spec_fragment(&self, _: &str) -> Result<String> {
            bail!("capability down")
        }
    }

    #[test]
    fn soft_fail_wrappers_substitute_defaults() {
        let records = listing_records_or_empty(&FailingExtractor, "<div/>", "https://x.ru/");
        assert!(records.is_recovered());
        assert!(records.into_inner().is_empty());

        let specs = spec_fragment_or_empty(&FailingExtractor, "<div/>");
        assert!(specs.is_recovered());
        assert_eq!(specs.into_inner(), "");

        let ok = spec_fragment_or_empty(&HeuristicExtractor, "<p>x</p>");
        assert!(!ok.is_recovered());
    }
}
