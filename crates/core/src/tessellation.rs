//! Sky tessellation index.
//!
//! The celestial sphere is partitioned into rectangular (RA, Dec) tiles
//! arranged in declination bands; every valid coordinate belongs to exactly
//! one tile. The tile table is immutable reference data, loaded once at
//! startup and held here as sorted arrays searched by binary search: first
//! the declination band, then the RA bin within the band, both O(log n).

use crate::coord::{Footprint, SkyCoord};
use crate::error::{Error, Result};
use crate::tags::{COARSE_TAG_LEVEL, FINE_TAG_LEVEL, nested_tag};
use std::collections::HashMap;

/// Identifier of one tile of the sky tessellation.
pub type TileId = i64;

const EDGE_TOL: f64 = 1e-9;

/// One cell of the fixed sky partition.
///
/// Bounds follow the half-open convention: a tile owns coordinates with
/// ramin <= ra < ramax and decmin <= dec < decmax, except that the closing
/// band edges at dec = +90 and ra wrap are owned by the closing tile.
#[derive(Clone, Debug, PartialEq)]
pub struct SkyTile {
    pub tile_id: TileId,
    pub center: SkyCoord,
    pub ramin: f64,
    pub ramax: f64,
    pub decmin: f64,
    pub decmax: f64,
    /// Coarse spatial tag of the tile center.
    pub coarse_tag: u64,
    /// Fine spatial tag of the tile center.
    pub fine_tag: u64,
}

impl SkyTile {
    /// Build a tile from its bounds, computing the center and its tags.
    pub fn from_bounds(
        tile_id: TileId,
        ramin: f64,
        ramax: f64,
        decmin: f64,
        decmax: f64,
    ) -> Result<Self> {
        let center = SkyCoord::new((ramin + ramax) / 2.0, (decmin + decmax) / 2.0)?;
        Ok(Self {
            tile_id,
            center,
            ramin,
            ramax,
            decmin,
            decmax,
            coarse_tag: nested_tag(&center, COARSE_TAG_LEVEL)?,
            fine_tag: nested_tag(&center, FINE_TAG_LEVEL)?,
        })
    }

    /// The four corners, in order (ramin,decmin), (ramax,decmin),
    /// (ramax,decmax), (ramin,decmax). An ramax of exactly 360 is folded
    /// to the canonical range.
    pub fn corners(&self) -> [SkyCoord; 4] {
        let fold = |ra: f64| if ra >= 360.0 { ra - 360.0 } else { ra };
        let c = |ra: f64, dec: f64| SkyCoord {
            ra: fold(ra),
            dec,
        };
        [
            c(self.ramin, self.decmin),
            c(self.ramax, self.decmin),
            c(self.ramax, self.decmax),
            c(self.ramin, self.decmax),
        ]
    }

    pub fn footprint(&self) -> Footprint {
        Footprint::new(self.corners())
    }
}

struct RaBin {
    ramin: f64,
    ramax: f64,
    tile_id: TileId,
}

struct DecBand {
    decmin: f64,
    decmax: f64,
    bins: Vec<RaBin>,
}

/// Immutable, deterministic tile lookup structure.
pub struct TessellationIndex {
    bands: Vec<DecBand>,
    tiles: HashMap<TileId, SkyTile>,
}

impl TessellationIndex {
    /// Build the index from the full tile table.
    ///
    /// Validates that the tiles form a total partition: declination bands
    /// cover [-90, 90] without gaps, and each band's RA bins cover [0, 360)
    /// without gaps or overlaps.
    pub fn from_tiles(tile_rows: Vec<SkyTile>) -> Result<Self> {
        if tile_rows.is_empty() {
            return Err(Error::Tessellation("empty tile table".into()));
        }

        let mut tiles = HashMap::with_capacity(tile_rows.len());
        let mut by_band: HashMap<(u64, u64), Vec<RaBin>> = HashMap::new();
        let mut band_bounds: HashMap<(u64, u64), (f64, f64)> = HashMap::new();

        for t in tile_rows {
            let key = (t.decmin.to_bits(), t.decmax.to_bits());
            band_bounds.entry(key).or_insert((t.decmin, t.decmax));
            by_band.entry(key).or_default().push(RaBin {
                ramin: t.ramin,
                ramax: t.ramax,
                tile_id: t.tile_id,
            });
            if tiles.insert(t.tile_id, t).is_some() {
                return Err(Error::Tessellation("duplicate tile id".into()));
            }
        }

        let mut bands: Vec<DecBand> = by_band
            .into_iter()
            .map(|(key, mut bins)| {
                bins.sort_by(|a, b| a.ramin.total_cmp(&b.ramin));
                let (decmin, decmax) = band_bounds[&key];
                DecBand {
                    decmin,
                    decmax,
                    bins,
                }
            })
            .collect();
        bands.sort_by(|a, b| a.decmin.total_cmp(&b.decmin));

        // Coverage checks: the lookup relies on the partition being total.
        let mut dec_cursor = -90.0;
        for band in &bands {
            if (band.decmin - dec_cursor).abs() > EDGE_TOL {
                return Err(Error::Tessellation(format!(
                    "declination gap at {dec_cursor}"
                )));
            }
            dec_cursor = band.decmax;

            let mut ra_cursor = 0.0;
            for bin in &band.bins {
                if (bin.ramin - ra_cursor).abs() > EDGE_TOL {
                    return Err(Error::Tessellation(format!(
                        "RA gap at {ra_cursor} in band [{}, {})",
                        band.decmin, band.decmax
                    )));
                }
                ra_cursor = bin.ramax;
            }
            if (ra_cursor - 360.0).abs() > EDGE_TOL {
                return Err(Error::Tessellation(format!(
                    "band [{}, {}) covers RA only to {ra_cursor}",
                    band.decmin, band.decmax
                )));
            }
        }
        if (dec_cursor - 90.0).abs() > EDGE_TOL {
            return Err(Error::Tessellation(format!(
                "declination coverage ends at {dec_cursor}"
            )));
        }

        Ok(Self { bands, tiles })
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Map a coordinate to the tile that owns it.
    ///
    /// Pure and stable across invocations; ra+360 maps to the same tile as
    /// ra. Coordinates outside the valid domain are rejected.
    pub fn lookup_tile(&self, ra: f64, dec: f64) -> Result<TileId> {
        let coord = SkyCoord::new(ra, dec)?;

        let band_idx = self
            .bands
            .partition_point(|b| b.decmax <= coord.dec)
            .min(self.bands.len() - 1); // dec == +90 belongs to the top band
        let band = &self.bands[band_idx];

        let bin_idx = band
            .bins
            .partition_point(|b| b.ramax <= coord.ra)
            .min(band.bins.len() - 1);
        Ok(band.bins[bin_idx].tile_id)
    }

    pub fn tile(&self, tile_id: TileId) -> Result<&SkyTile> {
        self.tiles.get(&tile_id).ok_or(Error::UnknownTile(tile_id))
    }

    /// Center and four corners of a tile.
    pub fn tile_bounds(&self, tile_id: TileId) -> Result<(SkyCoord, [SkyCoord; 4])> {
        let tile = self.tile(tile_id)?;
        Ok((tile.center, tile.corners()))
    }

    /// Tiles sharing an edge or corner with the given tile.
    ///
    /// KNOWN GAP, preserved from the source system: the enumeration does
    /// not necessarily include ALL adjacent tiles. Corner adjacency across
    /// declination-band boundaries (and across the RA wrap in an adjacent
    /// band) can be missed where bin edges only touch within rounding.
    /// Operators relying on exhaustive adjacency must not use this as
    /// their only source.
    pub fn neighbors(&self, tile_id: TileId) -> Result<Vec<TileId>> {
        let tile = self.tile(tile_id)?;
        let band_idx = self
            .bands
            .iter()
            .position(|b| b.decmin == tile.decmin && b.decmax == tile.decmax)
            .ok_or_else(|| Error::Tessellation(format!("tile {tile_id} not in any band")))?;

        let mut out = Vec::new();

        // Same band: bins sharing a vertical edge, including across the
        // RA wrap.
        let band = &self.bands[band_idx];
        for bin in &band.bins {
            if bin.tile_id == tile_id {
                continue;
            }
            let touches = (bin.ramax - tile.ramin).abs() <= EDGE_TOL
                || (bin.ramin - tile.ramax).abs() <= EDGE_TOL
                || ((bin.ramax - 360.0).abs() <= EDGE_TOL && tile.ramin.abs() <= EDGE_TOL)
                || (bin.ramin.abs() <= EDGE_TOL && (tile.ramax - 360.0).abs() <= EDGE_TOL);
            if touches {
                out.push(bin.tile_id);
            }
        }

        // Adjacent bands: bins whose RA span overlaps or touches ours.
        for adj in [band_idx.wrapping_sub(1), band_idx + 1] {
            let Some(aband) = self.bands.get(adj) else {
                continue;
            };
            if adj == band_idx {
                continue;
            }
            for bin in &aband.bins {
                if bin.ramin <= tile.ramax + EDGE_TOL && bin.ramax >= tile.ramin - EDGE_TOL {
                    out.push(bin.tile_id);
                }
            }
        }

        out.sort_unstable();
        out.dedup();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A small synthetic partition: three declination bands, the middle one
    /// split into four RA bins, the caps into two each.
    fn small_index() -> TessellationIndex {
        let mut tiles = Vec::new();
        let mut id = 1;
        for (decmin, decmax, nbins) in [(-90.0, -30.0, 2), (-30.0, 30.0, 4), (30.0, 90.0, 2)] {
            let width = 360.0 / nbins as f64;
            for i in 0..nbins {
                let ramin = i as f64 * width;
                tiles.push(
                    SkyTile::from_bounds(id, ramin, ramin + width, decmin, decmax).unwrap(),
                );
                id += 1;
            }
        }
        TessellationIndex::from_tiles(tiles).unwrap()
    }

    #[test]
    fn test_lookup_total_coverage() {
        let index = small_index();
        let mut ra = 0.0;
        while ra < 360.0 {
            let mut dec = -90.0;
            while dec <= 90.0 {
                let id = index.lookup_tile(ra, dec).unwrap();
                let tile = index.tile(id).unwrap();
                assert!(
                    tile.ramin - 1e-9 <= ra && ra <= tile.ramax + 1e-9,
                    "ra={ra} outside tile {id}"
                );
                assert!(
                    tile.decmin - 1e-9 <= dec && dec <= tile.decmax + 1e-9,
                    "dec={dec} outside tile {id}"
                );
                dec += 7.3;
            }
            ra += 11.7;
        }
    }

    #[test]
    fn test_lookup_wraparound() {
        let index = small_index();
        assert_eq!(
            index.lookup_tile(12.0, 0.0).unwrap(),
            index.lookup_tile(372.0, 0.0).unwrap()
        );
    }

    #[test]
    fn test_lookup_rejects_invalid() {
        let index = small_index();
        assert!(index.lookup_tile(-1.0, 0.0).is_err());
        assert!(index.lookup_tile(0.0, 91.0).is_err());
        assert!(index.lookup_tile(800.0, 0.0).is_err());
    }

    #[test]
    fn test_lookup_poles_and_edges() {
        let index = small_index();
        // The closing edges belong to the top band / wrapping bin.
        assert!(index.lookup_tile(0.0, 90.0).is_ok());
        assert!(index.lookup_tile(0.0, -90.0).is_ok());
        // Band edge goes to the upper band (half-open convention).
        let id = index.lookup_tile(10.0, 30.0).unwrap();
        let tile = index.tile(id).unwrap();
        assert_eq!(tile.decmin, 30.0);
    }

    #[test]
    fn test_tile_bounds_enclose_lookup_point() {
        let index = small_index();
        for (ra, dec) in [(5.0, 10.0), (182.0, -45.0), (359.0, 88.0), (91.0, -29.9)] {
            let id = index.lookup_tile(ra, dec).unwrap();
            let (center, corners) = index.tile_bounds(id).unwrap();
            let tile = index.tile(id).unwrap();
            assert!(tile.ramin <= ra && ra < tile.ramax);
            assert!(tile.decmin <= dec && dec < tile.decmax);
            assert!(center.dec > tile.decmin && center.dec < tile.decmax);
            assert_eq!(corners[0].dec, tile.decmin);
            assert_eq!(corners[2].dec, tile.decmax);
        }
    }

    #[test]
    fn test_unknown_tile() {
        let index = small_index();
        assert!(matches!(
            index.tile_bounds(9999),
            Err(Error::UnknownTile(9999))
        ));
    }

    #[test]
    fn test_neighbors_same_band_and_adjacent_bands() {
        let index = small_index();
        // Tile 3 is the first bin (0..90) of the middle band.
        let n = index.neighbors(3).unwrap();
        // Same band: bins at 90..180 (id 4) and 270..360 (id 6, across wrap).
        assert!(n.contains(&4));
        assert!(n.contains(&6));
        // Adjacent bands: southern bin 0..180 (id 1), northern bin 0..180 (id 7).
        assert!(n.contains(&1));
        assert!(n.contains(&7));
        assert!(!n.contains(&3));
    }

    #[test]
    fn test_partition_validation() {
        // A gap in RA coverage is rejected.
        let tiles = vec![
            SkyTile::from_bounds(1, 0.0, 180.0, -90.0, 90.0).unwrap(),
            SkyTile::from_bounds(2, 200.0, 360.0, -90.0, 90.0).unwrap(),
        ];
        assert!(TessellationIndex::from_tiles(tiles).is_err());
    }
}
