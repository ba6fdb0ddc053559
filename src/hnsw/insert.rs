//! Single-vector insertion under the header latch.
//!
//! ```text
//! Validating -> HeaderLocked -> Reserving -> Linking -> Committing -> Released
//! ```
//!
//! Every failure after `HeaderLocked` unwinds through drops: the retriever
//! restores extra dirtied pages, the transaction rolls back registered pages,
//! and only then is the header latch released.

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use super::blockmap::block_capacity;
use super::build::BuildReport;
use super::codec::HNSW_MAX_DIM;
use super::graph::GraphLibrary;
use super::header::IndexHeader;
use super::options::IndexOptions;
use super::retriever::RetrieverCtx;
use super::store::NodeStore;
use crate::primitives::pager::{Pager, PinMode};
use crate::types::{HnswError, Lsn, PageId, Result, SlotId};

/// Steps of one insertion, logged as they are entered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPhase {
    /// Input checks, no locks held.
    Validating,
    /// Header page pinned, latched exclusive and registered.
    HeaderLocked,
    /// Level sampled, node slot being placed.
    Reserving,
    /// Graph library linking the node.
    Linking,
    /// Header rewritten and transaction committing.
    Committing,
    /// Pins and latch released.
    Released,
}

impl InsertPhase {
    /// Name used in log events.
    pub fn as_str(self) -> &'static str {
        match self {
            InsertPhase::Validating => "validating",
            InsertPhase::HeaderLocked => "header_locked",
            InsertPhase::Reserving => "reserving",
            InsertPhase::Linking => "linking",
            InsertPhase::Committing => "committing",
            InsertPhase::Released => "released",
        }
    }
}

/// Result of [`HnswIndex::insert`](super::index::HnswIndex::insert).
#[derive(Clone, Debug, PartialEq)]
pub enum InsertOutcome {
    /// The node was committed.
    Inserted {
        /// Slot assigned to the node.
        slot: SlotId,
        /// Sampled level.
        level: u16,
        /// Commit sequence number.
        lsn: Lsn,
    },
    /// The vector was absent; nothing to index.
    Skipped,
    /// The index had no pages yet; a full build ran instead and indexed the
    /// row.
    Postponed(BuildReport),
}

/// `1 / ln(connectivity)`, the level multiplier.
pub fn level_exponent(connectivity: u16) -> f64 {
    1.0 / (connectivity.max(2) as f64).ln()
}

/// Samples `floor(-ln(U) * level_exponent)` with `U` uniform in `(0, 1]`,
/// clamped to `max_level`.
pub fn generate_new_level<R: Rng + ?Sized>(rng: &mut R, connectivity: u16, max_level: u16) -> u16 {
    let uniform = 1.0 - rng.gen::<f64>();
    let level = (-uniform.ln() * level_exponent(connectivity)).floor();
    if level >= max_level as f64 {
        max_level
    } else {
        level as u16
    }
}

/// Input checks of the `Validating` phase. `Ok(None)` for an absent vector.
pub fn validate_vector(vector: Option<&[f32]>, expected: Option<u32>) -> Result<Option<&[f32]>> {
    let Some(vector) = vector else {
        return Ok(None);
    };
    if vector.is_empty() {
        return Err(HnswError::Invalid("vector is empty"));
    }
    check_dimension(expected, vector)?;
    Ok(Some(vector))
}

fn check_dimension(expected: Option<u32>, vector: &[f32]) -> Result<()> {
    let actual = u32::try_from(vector.len()).unwrap_or(u32::MAX);
    if let Some(expected) = expected {
        if actual != expected {
            return Err(HnswError::DimensionMismatch { expected, actual });
        }
    }
    if actual > HNSW_MAX_DIM {
        return Err(HnswError::DimensionTooLarge {
            actual,
            max: HNSW_MAX_DIM,
        });
    }
    Ok(())
}

fn enter(key: u64, phase: InsertPhase) {
    debug!(key, phase = phase.as_str(), "hnsw.insert.phase");
}

fn link_error(err: HnswError) -> HnswError {
    match err {
        HnswError::Io(_) | HnswError::Corruption(_) | HnswError::StorageExhausted(_) => err,
        other => HnswError::LibraryLink(other.to_string()),
    }
}

/// Runs `HeaderLocked` through `Released` for a validated vector on an index
/// that already has its header page.
pub(crate) fn insert_locked<L, R>(
    pager: &Pager,
    options: &IndexOptions,
    library: &mut L,
    rng: &mut R,
    key: u64,
    vector: &[f32],
) -> Result<InsertOutcome>
where
    L: GraphLibrary,
    R: Rng + ?Sized,
{
    enter(key, InsertPhase::HeaderLocked);
    // Drop order matters: ctx, then txn, then the latch.
    let header_page = pager.pin_page(PageId::HEADER, PinMode::Exclusive)?;
    let _latch = header_page.latch_exclusive();
    let mut txn = pager.begin_txn();
    txn.register(&header_page)?;
    let header = IndexHeader::decode(&header_page.read())?;
    check_dimension(Some(header.vector_dim), vector)?;
    library.load_header(&header.library_header)?;

    if let Some(budget) = options.memory_budget_bytes {
        // Worst case for one insert: a fresh node block and block-map page.
        let projected = (pager.page_count() as u64 + 2) * pager.page_size() as u64;
        if projected > budget {
            warn!(key, projected, budget, "hnsw.insert.over_budget");
            return Err(HnswError::MemoryBudgetExceeded { projected, budget });
        }
    }

    enter(key, InsertPhase::Reserving);
    let mut ctx = RetrieverCtx::writer(pager, header)?;
    let max_level = ctx
        .layout()
        .max_level_within(block_capacity(pager.page_size()))
        .ok_or_else(|| HnswError::InvalidLayout("a level 0 node does not fit a block".into()))?;
    let level = generate_new_level(rng, library.connectivity(), max_level);
    let total = ctx.header().num_vectors.saturating_add(1);
    ctx.reserve(total)?;
    let slot = ctx.reserve_new(&mut txn, key, level)?;

    enter(key, InsertPhase::Linking);
    library
        .add(&mut ctx, slot, key, vector, level)
        .map_err(link_error)?;

    enter(key, InsertPhase::Committing);
    let mut next = ctx.header().clone();
    next.num_vectors += ctx.pending();
    next.library_header = library.header_blob();
    next.encode(&mut header_page.write()?)?;
    let pages = txn.registered().count();
    let lsn = txn.commit()?;
    ctx.mark_committed();

    ctx.release_all();
    enter(key, InsertPhase::Released);
    debug!(
        key,
        slot = slot.0,
        level,
        pages,
        lsn = lsn.0,
        num_vectors = next.num_vectors,
        "hnsw.insert.committed"
    );
    Ok(InsertOutcome::Inserted { slot, level, lsn })
}
