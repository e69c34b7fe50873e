//! Overlap selector: ordered prior images usable as coaddition inputs.
//!
//! Pipeline: fine-tag index prune, cone search around the target tile
//! center, footprint refinement, temporal filter, self-exclusion, then a
//! deterministic sort by angular separation. An empty result is a valid
//! "not enough inputs yet" outcome.

use crate::error::OpsResult;
use nocturn_core::tags::{FINE_TAG_LEVEL, disc_cover};
use nocturn_core::{Footprint, SkyCoord, TessellationIndex, TileId};
use nocturn_registry::RegistryStore;
use nocturn_registry::models::OverlapCandidateRow;

/// Temporal filter modes, mutually exclusive.
#[derive(Clone, Copy, Debug)]
pub enum EpochFilter {
    /// Default: inputs strictly earlier than the new observation's epoch.
    Before(f64),
    /// Reference-window mode: inputs within an explicit mjd range,
    /// overriding the default.
    Window { start: f64, end: f64 },
}

impl EpochFilter {
    fn accepts(&self, mjdobs: f64) -> bool {
        match self {
            Self::Before(epoch) => mjdobs < *epoch,
            Self::Window { start, end } => *start <= mjdobs && mjdobs <= *end,
        }
    }
}

/// One selected coaddition input, in ranked order.
#[derive(Clone, Debug)]
pub struct CoaddInput {
    pub rid: i64,
    pub expid: i64,
    pub chipid: i16,
    pub field: i64,
    pub fid: i16,
    pub mjdobs: f64,
    pub filename: String,
    pub center: SkyCoord,
    pub separation_deg: f64,
}

fn candidate_footprint(row: &OverlapCandidateRow) -> OpsResult<Footprint> {
    Ok(Footprint::new([
        SkyCoord::new(row.ra1, row.dec1)?,
        SkyCoord::new(row.ra2, row.dec2)?,
        SkyCoord::new(row.ra3, row.dec3)?,
        SkyCoord::new(row.ra4, row.dec4)?,
    ]))
}

/// Select ordered prior best-version images overlapping the target tile.
///
/// The footprint refinement is the inherited 5-point approximation of
/// polygon intersection: the target tile center inside the candidate's
/// footprint, or any of the target's 4 corners inside it. It can under- or
/// over-select near the poles or for unusually large footprints; changing
/// it to exact spherical-polygon intersection is an open question that
/// needs sign-off, not a silent fix.
pub async fn select_coadd_inputs(
    registry: &dyn RegistryStore,
    tessellation: &TessellationIndex,
    field: TileId,
    fid: i16,
    epoch: EpochFilter,
    exclude_rid: Option<i64>,
    radius_deg: f64,
) -> OpsResult<Vec<CoaddInput>> {
    let (center, corners) = tessellation.tile_bounds(field)?;

    // Index prune: the cone's fine-tag cover. The exact cone test follows
    // in the query itself.
    let cover = disc_cover(&center, radius_deg, FINE_TAG_LEVEL)?;
    let fine_tags: Vec<i64> = cover.into_iter().map(|t| t as i64).collect();

    let candidates = registry
        .overlap_candidates(fid, center.ra, center.dec, radius_deg, &fine_tags)
        .await?;

    let mut selected = Vec::new();
    for row in candidates {
        if exclude_rid == Some(row.rid) {
            continue;
        }
        if !epoch.accepts(row.mjdobs) {
            continue;
        }

        let footprint = candidate_footprint(&row)?;
        let overlaps = footprint.contains(&center)
            || corners.iter().any(|corner| footprint.contains(corner));
        if !overlaps {
            continue;
        }

        let candidate_center = SkyCoord::new(row.ra0, row.dec0)?;
        selected.push(CoaddInput {
            rid: row.rid,
            expid: row.expid,
            chipid: row.chipid,
            field: row.field,
            fid: row.fid,
            mjdobs: row.mjdobs,
            filename: row.filename,
            center: candidate_center,
            separation_deg: center.separation_deg(&candidate_center),
        });
    }

    // Ascending separation; ties broken by natural key order.
    selected.sort_by(|a, b| {
        a.separation_deg
            .total_cmp(&b.separation_deg)
            .then_with(|| a.expid.cmp(&b.expid))
            .then_with(|| a.chipid.cmp(&b.chipid))
    });

    tracing::debug!(
        field,
        fid,
        n_selected = selected.len(),
        "Overlap selection complete"
    );
    Ok(selected)
}
