use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Result;
use scraper::{Html, Selector};
use tracing::{debug, error, info, warn};

use crate::extract::{self, Extractor, ListingRecord};
use crate::fetch::Fetch;
use crate::runner::{SetupError, StageStats};
use crate::state::{self, StateManager};
use crate::table::KeyedTable;

pub const STAGE1_STATE_KEY: &str = "stage1";
pub const STAGE1_OUTPUT: &str = "stage1_results.csv";
const STAGE1_KEY_COLUMNS: [&str; 2] = ["entry_url", "url"];

static LISTING_BLOCK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.css-18bfsxm.e1ei9t6a4").unwrap());

/// Stage 1: listing discovery. Walks entry URLs, splits each page into
/// listing blocks, extracts records per block and appends them with
/// `(entry_url, url)` dedupe. Checkpoints a secondary `block_index` after
/// every block so a crash mid-entry resumes at the exact block.
pub struct Stage1Processor<'a> {
    entry_points: Vec<String>,
    output_path: PathBuf,
    state: &'a StateManager,
    fetcher: &'a dyn Fetch,
    extractor: &'a dyn Extractor,
    table: KeyedTable,
}

impl<'a> Stage1Processor<'a> {
    pub fn new(
        entry_points: Vec<String>,
        output_path: PathBuf,
        state: &'a StateManager,
        fetcher: &'a dyn Fetch,
        extractor: &'a dyn Extractor,
    ) -> Result<Self> {
        let table = KeyedTable::load(&output_path, &ListingRecord::COLUMNS, &STAGE1_KEY_COLUMNS)?;
        Ok(Self {
            entry_points,
            output_path,
            state,
            fetcher,
            extractor,
            table,
        })
    }

    pub fn process(&mut self) -> StageStats {
        let cursor = self.state.stage(STAGE1_STATE_KEY);
        let entry_start = state::offset(&cursor, "entry_index");
        let block_start = state::offset(&cursor, "block_index");
        let mut stats = StageStats::default();

        for idx in entry_start..self.entry_points.len() {
            let entry_url = self.entry_points[idx].clone();
            // The inner offset only applies to the entry we stopped inside.
            let start_block = if idx == entry_start { block_start } else { 0 };
            if let Err(err) = self.process_entry(idx, &entry_url, start_block, &mut stats) {
                error!("Failed to process entry {}: {:#}", entry_url, err);
                stats.halted = true;
                break;
            }
        }
        stats
    }

    fn process_entry(
        &mut self,
        idx: usize,
        entry_url: &str,
        start_block: usize,
        stats: &mut StageStats,
    ) -> Result<()> {
        info!(
            "Processing entry {} ({}/{})",
            entry_url,
            idx + 1,
            self.entry_points.len()
        );
        let html = self.fetcher.fetch(entry_url)?;
        let blocks = listing_blocks(&html);
        if blocks.is_empty() {
            warn!("No listing blocks found for {}", entry_url);
        }

        for b_idx in start_block..blocks.len() {
            let extraction =
                extract::listing_records_or_empty(self.extractor, &blocks[b_idx], entry_url);
            if extraction.is_recovered() {
                stats.recovered += 1;
            }
            let mut records = extraction.into_inner();
            for record in &mut records {
                record.entry_url = entry_url.to_string();
            }
            let inserted = self
                .table
                .append_new(records.into_iter().map(ListingRecord::into_row).collect())?;
            debug!("Block {} of {}: {} new records", b_idx, entry_url, inserted);

            // Flush before advancing the cursor: resume may reprocess this
            // block, never skip it.
            self.table.flush(&self.output_path)?;
            self.state.update(
                STAGE1_STATE_KEY,
                &[("entry_index", idx as u64), ("block_index", b_idx as u64 + 1)],
            )?;
            stats.processed += 1;
        }

        self.state.update(
            STAGE1_STATE_KEY,
            &[("entry_index", idx as u64 + 1), ("block_index", 0)],
        )?;
        Ok(())
    }
}

pub fn run_stage1(
    entry_points_path: &Path,
    data_dir: &Path,
    state: &StateManager,
    fetcher: &dyn Fetch,
    extractor: &dyn Extractor,
) -> Result<StageStats> {
    if !entry_points_path.exists() {
        return Err(SetupError::MissingEntryPoints(entry_points_path.to_path_buf()).into());
    }
    let content = fs::read_to_string(entry_points_path)?;
    let entry_points: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();
    let output_path = data_dir.join(STAGE1_OUTPUT);
    let mut processor = Stage1Processor::new(entry_points, output_path, state, fetcher, extractor)?;
    Ok(processor.process())
}

fn listing_blocks(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document.select(&LISTING_BLOCK).map(|el| el.html()).collect()
}
