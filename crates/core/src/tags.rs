//! Hierarchical spatial tags.
//!
//! Tags are pixel indices of the well-known equal-area NESTED hierarchical
//! pixelization of the sphere (lonlat convention, nside = 2^level). They are
//! cheap secondary indexes: spatially close points share long common bit
//! prefixes, and a tag at a coarser level is the fine tag shifted right by
//! twice the level difference. The tessellation index remains authoritative
//! for placement; tags only prune queries.
//!
//! Stored tags are never recomputed with a different scheme: the functions
//! here are pure and bit-exact, so recomputation always reproduces persisted
//! values.

use crate::coord::SkyCoord;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::f64::consts::PI;

/// Coarse tag level (nside 64, cells of roughly a degree).
pub const COARSE_TAG_LEVEL: u8 = 6;

/// Fine tag level (nside 512, arcminute-scale cells).
pub const FINE_TAG_LEVEL: u8 = 9;

const MAX_LEVEL: u8 = 13;

/// Angular size of one cell at the given level, in degrees.
///
/// This is the usual resolution parameter sqrt(pi/3)/nside.
pub fn cell_size_deg(level: u8) -> f64 {
    let nside = (1u64 << level) as f64;
    (PI / 3.0).sqrt().to_degrees() / nside
}

/// Compute the NESTED pixel index of a point at the given level.
pub fn nested_tag(coord: &SkyCoord, level: u8) -> Result<u64> {
    if level > MAX_LEVEL {
        return Err(Error::InvalidTagLevel(level));
    }
    let nside: i64 = 1 << level;

    let z = coord.dec.to_radians().sin();
    let za = z.abs();
    // coord.ra is normalized to [0,360), so tt lies in [0,4).
    let tt = coord.ra / 90.0;

    let (face, ix, iy) = if za <= 2.0 / 3.0 {
        // Equatorial region: indices along the ascending and descending
        // edge lines crossing the point.
        let temp1 = nside as f64 * (0.5 + tt);
        let temp2 = nside as f64 * (z * 0.75);
        let jp = (temp1 - temp2).floor() as i64;
        let jm = (temp1 + temp2).floor() as i64;

        let ifp = jp >> level;
        let ifm = jm >> level;
        let face = if ifp == ifm {
            (ifp & 3) + 4
        } else if ifp < ifm {
            ifp & 3
        } else {
            (ifm & 3) + 8
        };

        let ix = jm & (nside - 1);
        let iy = nside - (jp & (nside - 1)) - 1;
        (face, ix, iy)
    } else {
        // Polar caps.
        let ntt = (tt.floor() as i64).min(3);
        let tp = tt - ntt as f64;
        let tmp = nside as f64 * (3.0 * (1.0 - za)).sqrt();

        let jp = ((tp * tmp).floor() as i64).min(nside - 1);
        let jm = (((1.0 - tp) * tmp).floor() as i64).min(nside - 1);

        if z >= 0.0 {
            (ntt, nside - jm - 1, nside - jp - 1)
        } else {
            (ntt + 8, jp, jm)
        }
    };

    let npix_per_face = (nside as u64) * (nside as u64);
    Ok(face as u64 * npix_per_face + (spread_bits(ix as u64) | (spread_bits(iy as u64) << 1)))
}

/// Interleave the low 32 bits of `v` into the even bit positions.
fn spread_bits(v: u64) -> u64 {
    let mut x = v & 0x0000_0000_ffff_ffff;
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

/// Deterministic covering set of tags for a small disc.
///
/// Samples the disc center plus concentric rings out to two cells beyond
/// the requested radius, at quarter-cell spacing; the sampling lattice is
/// dense enough that every cell whose interior reaches into the disc gets
/// at least one sample. The result is a superset meant only for index
/// pruning: an exact spatial test must follow. Intended for radii of a few
/// tile widths; not meaningful for discs that contain a celestial pole.
pub fn disc_cover(center: &SkyCoord, radius_deg: f64, level: u8) -> Result<BTreeSet<u64>> {
    let mut tags = BTreeSet::new();
    tags.insert(nested_tag(center, level)?);

    let cell = cell_size_deg(level);
    let step = cell / 4.0;
    let rmax = radius_deg + 2.0 * cell;

    let mut r = step;
    while r <= rmax {
        let n = ((2.0 * PI * r / step).ceil() as usize).max(8);
        for k in 0..n {
            let theta = 2.0 * PI * (k as f64) / (n as f64);
            let dec = (center.dec + r * theta.sin()).clamp(-90.0, 90.0);
            let cos_dec = dec.to_radians().cos().max(1e-9);
            let ra = (center.ra + r * theta.cos() / cos_dec).rem_euclid(360.0);
            let sample = SkyCoord::new(ra, dec)?;
            tags.insert(nested_tag(&sample, level)?);
        }
        r += step;
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(ra: f64, dec: f64, level: u8) -> u64 {
        nested_tag(&SkyCoord::new(ra, dec).unwrap(), level).unwrap()
    }

    #[test]
    fn test_base_faces() {
        // At level 0 the tag is the base face index.
        assert_eq!(tag(0.0, 0.0, 0), 4);
        assert_eq!(tag(90.0, 0.0, 0), 5);
        assert_eq!(tag(180.0, 0.0, 0), 6);
        assert_eq!(tag(270.0, 0.0, 0), 7);
        // Polar caps: faces 0..4 north, 8..12 south.
        assert_eq!(tag(45.0, 60.0, 0), 0);
        assert_eq!(tag(135.0, 60.0, 0), 1);
        assert_eq!(tag(225.0, -60.0, 0), 10);
        assert_eq!(tag(315.0, -60.0, 0), 11);
    }

    #[test]
    fn test_tag_range() {
        for level in [0u8, 3, COARSE_TAG_LEVEL, FINE_TAG_LEVEL] {
            let npix = 12 * (1u64 << level) * (1u64 << level);
            for (ra, dec) in [
                (0.0, 0.0),
                (359.999, 89.999),
                (123.456, -45.0),
                (271.0, -89.999),
                (0.0, 90.0),
                (0.0, -90.0),
            ] {
                assert!(tag(ra, dec, level) < npix, "ra={ra} dec={dec} level={level}");
            }
        }
    }

    #[test]
    fn test_nested_prefix_hierarchy() {
        // The coarse tag of a point is its fine tag shifted right by twice
        // the level difference.
        for (ra, dec) in [
            (12.3, 4.5),
            (200.0, -70.0),
            (359.0, 89.0),
            (90.0, 66.7),
            (45.0, -41.0),
        ] {
            let fine = tag(ra, dec, FINE_TAG_LEVEL);
            let coarse = tag(ra, dec, COARSE_TAG_LEVEL);
            let shift = 2 * (FINE_TAG_LEVEL - COARSE_TAG_LEVEL) as u32;
            assert_eq!(coarse, fine >> shift, "ra={ra} dec={dec}");
        }
    }

    #[test]
    fn test_tag_deterministic_and_wraparound() {
        for (ra, dec) in [(10.0, -5.0), (0.25, 0.25), (300.0, 45.0)] {
            let a = tag(ra, dec, FINE_TAG_LEVEL);
            let b = tag(ra, dec, FINE_TAG_LEVEL);
            let c = tag(ra + 360.0, dec, FINE_TAG_LEVEL);
            assert_eq!(a, b);
            assert_eq!(a, c);
        }
    }

    #[test]
    fn test_nearby_points_share_tag() {
        // Two points a few arcseconds apart land in the same fine cell
        // (cells are ~7 arcmin at level 9) away from cell edges.
        let a = tag(100.0, 30.0, FINE_TAG_LEVEL);
        let b = tag(100.0005, 30.0005, FINE_TAG_LEVEL);
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_level() {
        let c = SkyCoord::new(0.0, 0.0).unwrap();
        assert!(nested_tag(&c, 14).is_err());
    }

    #[test]
    fn test_disc_cover_contains_ring_samples() {
        let center = SkyCoord::new(150.0, 20.0).unwrap();
        let cover = disc_cover(&center, 0.18, FINE_TAG_LEVEL).unwrap();
        assert!(cover.contains(&nested_tag(&center, FINE_TAG_LEVEL).unwrap()));

        // Points on the sampling rings along the first bearing are covered
        // by construction, out to two cells beyond the radius.
        let cell = cell_size_deg(FINE_TAG_LEVEL);
        let step = cell / 4.0;
        let cos_dec = 20.0f64.to_radians().cos();
        let mut r = step;
        while r <= 0.18 + 2.0 * cell {
            let p = SkyCoord::new(150.0 + r / cos_dec, 20.0).unwrap();
            let t = nested_tag(&p, FINE_TAG_LEVEL).unwrap();
            assert!(cover.contains(&t), "ring sample at r={r} not covered");
            r += step;
        }

        // Recomputation is deterministic.
        let again = disc_cover(&center, 0.18, FINE_TAG_LEVEL).unwrap();
        assert_eq!(cover, again);
    }

    #[test]
    fn test_disc_cover_excludes_far_cells() {
        let center = SkyCoord::new(150.0, 20.0).unwrap();
        let cover = disc_cover(&center, 0.18, FINE_TAG_LEVEL).unwrap();
        let far = SkyCoord::new(155.0, 20.0).unwrap();
        assert!(!cover.contains(&nested_tag(&far, FINE_TAG_LEVEL).unwrap()));
    }
}
