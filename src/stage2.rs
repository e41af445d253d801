use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::extract::{resolve_url, ListingRecord};
use crate::fetch::Fetch;
use crate::runner::{self, RowOutcome, SetupError, StageStats};
use crate::stage1::STAGE1_OUTPUT;
use crate::state::StateManager;
use crate::table::Table;

pub const STAGE2_STATE_KEY: &str = "stage2";
pub const STAGE2_OUTPUT: &str = "stage2_results.csv";
pub const STAGE2_COLUMNS: [(&str, &str); 3] = [
    ("main_image_url", ""),
    ("image_urls", "[]"),
    ("configurations", "[]"),
];

static MAIN_IMAGE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("a.b-image.b-image_type_centred-image.b-image_theme_cat-resp-main[href]")
        .unwrap()
});
static THUMB_IMAGE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.b-line__thumb.b-image[href]").unwrap());
static CONFIGURATION_ROW: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr.y7l57t2").unwrap());
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").unwrap());
static CELL_LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// A configuration link found on a model page; stage 3 visits these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub name: String,
    pub url: String,
}

/// Columns of the stage-2 output: the stage-1 schema plus the enrichment
/// columns, in file order.
pub fn output_schema() -> Vec<&'static str> {
    ListingRecord::COLUMNS
        .iter()
        .copied()
        .chain(STAGE2_COLUMNS.iter().map(|(col, _)| *col))
        .collect()
}

struct PageDetails {
    main_image: Option<String>,
    images: Vec<String>,
    configurations: Vec<Configuration>,
}

/// Stage 2: per-model enrichment. Visits each stage-1 row's URL and patches
/// in the main image, thumbnail list and configuration links positionally.
pub fn run_stage2(data_dir: &Path, state: &StateManager, fetcher: &dyn Fetch) -> Result<StageStats> {
    let stage1_path = data_dir.join(STAGE1_OUTPUT);
    if !stage1_path.exists() {
        return Err(SetupError::MissingStageOutput {
            stage: 1,
            path: stage1_path,
        }
        .into());
    }
    let base = Table::load(&stage1_path, &ListingRecord::COLUMNS)?;
    let output_path = data_dir.join(STAGE2_OUTPUT);
    let mut table = Table::load_with_defaults(&base, &output_path, &STAGE2_COLUMNS)?;
    let total = table.len();

    let stats = runner::drive_rows(state, STAGE2_STATE_KEY, total, |row| {
        let url = table.value(row, "url").unwrap_or_default().to_string();
        if url.is_empty() {
            // A skipped row is still a processed unit; checkpoint past it.
            warn!("Row {} has no URL, skipping", row);
            return Ok(RowOutcome::Done);
        }
        info!("Stage 2: processing {} ({}/{})", url, row + 1, total);
        let html = fetcher.fetch(&url)?;
        let details = extract_details(&html, &url);

        table.patch_row(
            row,
            "main_image_url",
            details.main_image.as_deref().unwrap_or_default(),
        )?;
        table.patch_row(row, "image_urls", &serde_json::to_string(&details.images)?)?;
        table.patch_row(
            row,
            "configurations",
            &serde_json::to_string(&details.configurations)?,
        )?;
        table.flush(&output_path)?;
        Ok(RowOutcome::Done)
    });
    Ok(stats)
}

fn extract_details(html: &str, base_url: &str) -> PageDetails {
    let document = Html::parse_document(html);

    let main_image = document
        .select(&MAIN_IMAGE)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(|href| resolve_url(base_url, href));

    let images: Vec<String> = document
        .select(&THUMB_IMAGE)
        .filter_map(|el| el.value().attr("href"))
        .map(|href| resolve_url(base_url, href))
        .collect();

    let mut configurations = Vec::new();
    for row in document.select(&CONFIGURATION_ROW) {
        let cells: Vec<_> = row.select(&CELL).collect();
        if cells.len() < 2 {
            continue;
        }
        let Some(link) = cells[1].select(&CELL_LINK).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let name = link.text().collect::<String>().trim().to_string();
        configurations.push(Configuration {
            name,
            url: resolve_url(base_url, href),
        });
    }

    PageDetails {
        main_image,
        images,
        configurations,
    }
}
