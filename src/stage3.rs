use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::extract::{self, Extraction, Extractor};
use crate::fetch::Fetch;
use crate::runner::{self, RowOutcome, SetupError, StageStats};
use crate::stage2::{self, Configuration, STAGE2_OUTPUT};
use crate::state::StateManager;
use crate::table::Table;

pub const STAGE3_STATE_KEY: &str = "stage3";
pub const STAGE3_OUTPUT: &str = "stage3_results.csv";
const SPECS_COLUMN: (&str, &str) = ("configuration_specs", "[]");

static LEFT_SIDE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body div.b-left-side").unwrap());
static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// One configuration's extracted spec fragment, JSON-encoded into the
/// `configuration_specs` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpec {
    pub name: String,
    pub url: String,
    pub specs_html: String,
}

/// Stage 3: per-configuration spec fetch. For each stage-2 row, visits every
/// configuration URL and patches the collected spec fragments positionally.
/// A failure on one configuration yields an empty fragment for it; the row
/// still completes.
pub fn run_stage3(
    data_dir: &Path,
    state: &StateManager,
    fetcher: &dyn Fetch,
    extractor: &dyn Extractor,
) -> Result<StageStats> {
    let stage2_path = data_dir.join(STAGE2_OUTPUT);
    if !stage2_path.exists() {
        return Err(SetupError::MissingStageOutput {
            stage: 2,
            path: stage2_path,
        }
        .into());
    }
    let base = Table::load(&stage2_path, &stage2::output_schema())?;
    let output_path = data_dir.join(STAGE3_OUTPUT);
    let mut table = Table::load_with_defaults(&base, &output_path, &[SPECS_COLUMN])?;
    let total = table.len();

    let stats = runner::drive_rows(state, STAGE3_STATE_KEY, total, |row| {
        let raw = match table.value(row, "configurations") {
            Some("") | None => "[]".to_string(),
            Some(raw) => raw.to_string(),
        };
        let configurations: Vec<Configuration> = match serde_json::from_str(&raw) {
            Ok(configurations) => configurations,
            Err(err) => {
                warn!("Row {} has invalid configurations JSON ({}), skipping", row, err);
                Vec::new()
            }
        };

        if configurations.is_empty() {
            info!("Stage 3: no configurations for row {}", row);
            table.patch_row(row, "configuration_specs", "[]")?;
            table.flush(&output_path)?;
            return Ok(RowOutcome::Done);
        }

        info!("Stage 3: processing row {}/{}", row + 1, total);
        let (specs, recovered) = fetch_specs(fetcher, extractor, &configurations);
        table.patch_row(row, "configuration_specs", &serde_json::to_string(&specs)?)?;
        table.flush(&output_path)?;
        Ok(if recovered > 0 {
            RowOutcome::Recovered
        } else {
            RowOutcome::Done
        })
    });
    Ok(stats)
}

fn fetch_specs(
    fetcher: &dyn Fetch,
    extractor: &dyn Extractor,
    configurations: &[Configuration],
) -> (Vec<ConfigurationSpec>, usize) {
    let mut recovered = 0;
    let mut specs = Vec::with_capacity(configurations.len());
    for configuration in configurations {
        if configuration.url.is_empty() {
            continue;
        }
        let extraction = fetch_one(fetcher, extractor, &configuration.url);
        if extraction.is_recovered() {
            recovered += 1;
        }
        specs.push(ConfigurationSpec {
            name: configuration.name.clone(),
            url: configuration.url.clone(),
            specs_html: extraction.into_inner(),
        });
    }
    (specs, recovered)
}

fn fetch_one(fetcher: &dyn Fetch, extractor: &dyn Extractor, url: &str) -> Extraction<String> {
    let html = match fetcher.fetch(url) {
        Ok(html) => html,
        Err(err) => {
            warn!("Failed to fetch configuration {}: {:#}", url, err);
            return Extraction::Recovered(String::new());
        }
    };
    let fragment = spec_target(&html);
    extract::spec_fragment_or_empty(extractor, &fragment)
}

/// Narrows a configuration page to the fragment handed to the extractor:
/// the left-side column when present, else the body, else the whole page.
fn spec_target(html: &str) -> String {
    let document = Html::parse_document(html);
    if let Some(el) = document.select(&LEFT_SIDE).next() {
        return el.html();
    }
    if let Some(el) = document.select(&BODY).next() {
        return el.html();
    }
    html.to_string()
}
