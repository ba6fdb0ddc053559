//! Offline integrity check of an index file.

use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{info, warn};

use super::blockmap::{block_capacity, BlockHeader};
use super::header::IndexHeader;
use super::retriever::RetrieverCtx;
use crate::primitives::pager::{Pager, PinMode};
use crate::types::{page::PageHeader, page::PageKind, PageId, Result, SlotId};

/// Slots checked between retriever resets.
const RESET_EVERY: u32 = 256;
/// Findings recorded before the rest are only counted.
const MAX_FINDINGS: usize = 64;

/// What [`verify_index`] found.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// Nodes the header claims.
    pub num_vectors: u32,
    /// Vector dimensionality.
    pub vector_dim: u32,
    /// Pages in the file.
    pub page_count: u32,
    /// Block-map pages listed in the header.
    pub blockmap_pages: u32,
    /// Distinct node blocks reached.
    pub node_blocks: u32,
    /// Nodes decoded.
    pub nodes_checked: u32,
    /// Nodes carrying the tombstone key.
    pub tombstones: u32,
    /// Problems found.
    pub findings: Vec<String>,
    /// Problems beyond `findings`.
    pub findings_truncated: u32,
}

impl VerifyReport {
    /// True when nothing was found.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.findings_truncated == 0
    }

    fn finding(&mut self, message: String) {
        if self.findings.len() < MAX_FINDINGS {
            warn!(finding = %message, "hnsw.verify.finding");
            self.findings.push(message);
        } else {
            self.findings_truncated += 1;
        }
    }
}

/// Checks the header, block map, node blocks and neighbor ids, holding the
/// header latch shared so no insertion runs meanwhile.
pub fn verify_index(pager: &Pager) -> Result<VerifyReport> {
    let mut report = VerifyReport {
        page_count: pager.page_count(),
        ..VerifyReport::default()
    };
    if report.page_count == 0 {
        return Ok(report);
    }
    let header_page = pager.pin_page(PageId::HEADER, PinMode::Shared)?;
    let _latch = header_page.latch_shared();
    let header = match IndexHeader::decode(&header_page.read()) {
        Ok(header) => header,
        Err(err) => {
            report.finding(format!("header: {err}"));
            return Ok(report);
        }
    };
    report.num_vectors = header.num_vectors;
    report.vector_dim = header.vector_dim;
    report.blockmap_pages = header.blockmap_pages.len() as u32;

    for &page_id in &header.blockmap_pages {
        check_page_kind(pager, page_id, PageKind::BlockMap, &mut report)?;
    }
    let layout = match header.layout() {
        Ok(layout) => layout,
        Err(err) => {
            report.finding(format!("layout: {err}"));
            return Ok(report);
        }
    };
    let max_level = layout
        .max_level_within(block_capacity(pager.page_size()))
        .unwrap_or(0);
    let num_vectors = header.num_vectors;

    let mut blocks = FxHashSet::default();
    let mut ctx = RetrieverCtx::reader(pager, header)?;
    for slot in (0..num_vectors).map(SlotId) {
        if slot.0 > 0 && slot.0 % RESET_EVERY == 0 {
            ctx.reset();
        }
        let block = match ctx.block_of(slot) {
            Ok(block) => block,
            Err(err) => {
                report.finding(format!("slot {slot}: block map: {err}"));
                continue;
            }
        };
        if block.0 >= report.page_count {
            report.finding(format!("slot {slot}: block {block} past end of file"));
            continue;
        }
        if blocks.insert(block) {
            check_page_kind(pager, block, PageKind::NodeBlock, &mut report)?;
        }
        let node = match ctx.fetch_immutable(slot) {
            Ok(node) => node,
            Err(err) => {
                report.finding(format!("slot {slot}: node: {err}"));
                continue;
            }
        };
        report.nodes_checked += 1;
        if node.view().is_tombstone() {
            report.tombstones += 1;
        }
        let level = node.level();
        let mut problems = Vec::new();
        if level > max_level {
            problems.push(format!("slot {slot}: level {level} above {max_level}"));
        }
        for tier in 0..=level.min(max_level) {
            match node.neighbors(tier) {
                Ok(neighbors) => {
                    for neighbor in neighbors {
                        if neighbor.0 >= num_vectors {
                            problems.push(format!(
                                "slot {slot}: tier {tier} links to {neighbor} past {num_vectors}"
                            ));
                        }
                    }
                }
                Err(err) => problems.push(format!("slot {slot}: tier {tier}: {err}")),
            }
        }
        drop(node);
        for problem in problems {
            report.finding(problem);
        }
    }
    ctx.release_all();
    report.node_blocks = blocks.len() as u32;
    info!(
        num_vectors = report.num_vectors,
        blocks = report.node_blocks,
        findings = report.findings.len(),
        "hnsw.verify"
    );
    Ok(report)
}

fn check_page_kind(
    pager: &Pager,
    page_id: PageId,
    kind: PageKind,
    report: &mut VerifyReport,
) -> Result<()> {
    if page_id.0 >= pager.page_count() {
        report.finding(format!("page {page_id} past end of file"));
        return Ok(());
    }
    let page = match pager.pin_page(page_id, PinMode::Shared) {
        Ok(page) => page,
        Err(err) => {
            report.finding(format!("page {page_id}: {err}"));
            return Ok(());
        }
    };
    let image = page.read();
    match PageHeader::decode(&image) {
        Ok(header) if header.kind == kind => {}
        Ok(header) => report.finding(format!(
            "page {page_id}: expected {kind:?}, found {:?}",
            header.kind
        )),
        Err(err) => report.finding(format!("page {page_id}: {err}")),
    }
    if kind == PageKind::NodeBlock {
        if let Err(err) = BlockHeader::decode(&image) {
            report.finding(format!("page {page_id}: {err}"));
        }
    }
    Ok(())
}
