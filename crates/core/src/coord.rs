//! Sky coordinates and footprint geometry.
//!
//! Coordinates are equatorial (RA, Dec) in degrees. RA wraps at 360; an
//! input of ra+360 refers to the same point on the sphere and normalizes to
//! the canonical [0,360) range before any lookup or tag computation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A point on the celestial sphere, RA and Dec in degrees.
///
/// Construction through [`SkyCoord::new`] guarantees ra in [0,360) and
/// dec in [-90,90].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    pub ra: f64,
    pub dec: f64,
}

impl SkyCoord {
    /// Validate and normalize a coordinate pair.
    ///
    /// RA in [360,720) is folded back by one turn so that callers passing
    /// ra+360 land on the identical point. Anything else out of range is an
    /// `InvalidCoordinate` error.
    pub fn new(ra: f64, dec: f64) -> Result<Self> {
        if !ra.is_finite() || !dec.is_finite() {
            return Err(Error::InvalidCoordinate { ra, dec });
        }
        let ra = if (360.0..720.0).contains(&ra) {
            ra - 360.0
        } else {
            ra
        };
        if !(0.0..360.0).contains(&ra) || !(-90.0..=90.0).contains(&dec) {
            return Err(Error::InvalidCoordinate { ra, dec });
        }
        Ok(Self { ra, dec })
    }

    /// Unit vector on the sphere (x toward ra=0/dec=0, z toward the north
    /// celestial pole). Used for cone searches via dot products.
    pub fn unit_vector(&self) -> [f64; 3] {
        let ra = self.ra.to_radians();
        let dec = self.dec.to_radians();
        [
            dec.cos() * ra.cos(),
            dec.cos() * ra.sin(),
            dec.sin(),
        ]
    }

    /// Angular separation to another point, in degrees (haversine form,
    /// numerically stable at small separations).
    pub fn separation_deg(&self, other: &SkyCoord) -> f64 {
        let ra1 = self.ra.to_radians();
        let dec1 = self.dec.to_radians();
        let ra2 = other.ra.to_radians();
        let dec2 = other.dec.to_radians();

        let sd = ((dec2 - dec1) / 2.0).sin();
        let sr = ((ra2 - ra1) / 2.0).sin();
        let h = sd * sd + dec1.cos() * dec2.cos() * sr * sr;
        2.0 * h.sqrt().min(1.0).asin().to_degrees()
    }
}

/// A four-corner image footprint on the sky.
///
/// Corners are stored in traversal order around the quadrilateral. The
/// containment test is a planar even-odd crossing test in (RA, Dec) with RA
/// unwrapped around the probe point. This is the cheap approximation the
/// overlap selector is specified to use; it degrades near the celestial
/// poles and for unusually large footprints.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub corners: [SkyCoord; 4],
}

impl Footprint {
    pub fn new(corners: [SkyCoord; 4]) -> Self {
        Self { corners }
    }

    /// Axis-aligned footprint from RA/Dec bounds, corner order
    /// (ramin,decmin), (ramax,decmin), (ramax,decmax), (ramin,decmax).
    pub fn from_bounds(ramin: f64, ramax: f64, decmin: f64, decmax: f64) -> Result<Self> {
        Ok(Self {
            corners: [
                SkyCoord::new(ramin, decmin)?,
                SkyCoord::new(ramax, decmin)?,
                SkyCoord::new(ramax, decmax)?,
                SkyCoord::new(ramin, decmax)?,
            ],
        })
    }

    /// Even-odd crossing test for a probe point.
    ///
    /// Corner RAs are unwrapped to within half a turn of the probe point so
    /// footprints straddling RA=0 test correctly.
    pub fn contains(&self, point: &SkyCoord) -> bool {
        let px = point.ra;
        let py = point.dec;

        let unwrap = |ra: f64| -> f64 {
            let mut d = ra - px;
            if d > 180.0 {
                d -= 360.0;
            } else if d < -180.0 {
                d += 360.0;
            }
            px + d
        };

        let xs: [f64; 4] = [
            unwrap(self.corners[0].ra),
            unwrap(self.corners[1].ra),
            unwrap(self.corners[2].ra),
            unwrap(self.corners[3].ra),
        ];
        let ys: [f64; 4] = [
            self.corners[0].dec,
            self.corners[1].dec,
            self.corners[2].dec,
            self.corners[3].dec,
        ];

        let mut inside = false;
        let mut j = 3;
        for i in 0..4 {
            let (xi, yi) = (xs[i], ys[i]);
            let (xj, yj) = (xs[j], ys[j]);
            if (yi > py) != (yj > py) {
                let x_cross = xi + (py - yi) / (yj - yi) * (xj - xi);
                if px < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}
