//! Coarse seismic regions for earthquake predictions.

use serde::{Deserialize, Serialize};

/// Locations considered when naming a region.
const REGION_SAMPLE: usize = 100;
const MIN_LOCATIONS: usize = 3;
/// Share of sampled locations the leading region must hold.
const MIN_REGION_SHARE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Iceland,
    SouthAtlantic,
    Alaska,
    Japan,
    Philippines,
    Indonesia,
    PacificIslands,
    Chile,
    California,
    TurkeyGreece,
    Taiwan,
    Antarctic,
    Global,
}

impl Region {
    pub const ALL: [Region; 13] = [
        Region::Iceland,
        Region::SouthAtlantic,
        Region::Alaska,
        Region::Japan,
        Region::Philippines,
        Region::Indonesia,
        Region::PacificIslands,
        Region::Chile,
        Region::California,
        Region::TurkeyGreece,
        Region::Taiwan,
        Region::Antarctic,
        Region::Global,
    ];

    /// First matching bounding box, checked in a fixed order; anything else
    /// is `Global`.
    pub fn from_coords(lat: f64, lon: f64) -> Self {
        let within = |lat_lo: f64, lat_hi: f64, lon_lo: f64, lon_hi: f64| {
            lat > lat_lo && lat < lat_hi && lon > lon_lo && lon < lon_hi
        };
        if within(63.0, 67.0, -25.0, -13.0) {
            Region::Iceland
        } else if within(-61.0, -54.0, -30.0, -24.0) {
            Region::SouthAtlantic
        } else if lat > 50.0 && lon < -130.0 {
            Region::Alaska
        } else if within(30.0, 50.0, 125.0, 150.0) {
            Region::Japan
        } else if within(4.0, 20.0, 118.0, 128.0) {
            Region::Philippines
        } else if within(-15.0, 10.0, 90.0, 145.0) {
            Region::Indonesia
        } else if lat < -10.0 && lat > -60.0 && lon > 160.0 {
            Region::PacificIslands
        } else if within(-45.0, -10.0, -85.0, -60.0) {
            Region::Chile
        } else if within(30.0, 45.0, -130.0, -110.0) {
            Region::California
        } else if within(32.0, 42.0, 25.0, 45.0) {
            Region::TurkeyGreece
        } else if within(20.0, 28.0, 119.0, 123.0) {
            Region::Taiwan
        } else if lat < -60.0 {
            Region::Antarctic
        } else {
            Region::Global
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Iceland => "Iceland",
            Region::SouthAtlantic => "South Atlantic",
            Region::Alaska => "Alaska",
            Region::Japan => "Japan",
            Region::Philippines => "Philippines",
            Region::Indonesia => "Indonesia",
            Region::PacificIslands => "Pacific Islands",
            Region::Chile => "Chile",
            Region::California => "California",
            Region::TurkeyGreece => "Turkey/Greece",
            Region::Taiwan => "Taiwan",
            Region::Antarctic => "Antarctic",
            Region::Global => "Global",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Region::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown region '{}'", s))
    }
}

/// The region holding at least 30% of the latest 100 locations, if any.
/// `Global` never qualifies, and fewer than three locations name nothing.
pub fn most_frequent(locations: &[(f64, f64)]) -> Option<Region> {
    if locations.len() < MIN_LOCATIONS {
        return None;
    }
    let sample = &locations[locations.len().saturating_sub(REGION_SAMPLE)..];
    let mut counts: Vec<(Region, usize)> = Vec::new();
    for &(lat, lon) in sample {
        let region = Region::from_coords(lat, lon);
        match counts.iter_mut().find(|(r, _)| *r == region) {
            Some((_, n)) => *n += 1,
            None => counts.push((region, 1)),
        }
    }
    // Ties go to the region seen first.
    let (region, count) = counts
        .into_iter()
        .fold(None, |best: Option<(Region, usize)>, (r, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((r, n)),
        })?;
    (region != Region::Global && count as f64 / sample.len() as f64 >= MIN_REGION_SHARE).then_some(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_boxes() {
        assert_eq!(Region::from_coords(64.5, -18.0), Region::Iceland);
        assert_eq!(Region::from_coords(61.0, -150.0), Region::Alaska);
        assert_eq!(Region::from_coords(36.0, 140.0), Region::Japan);
        assert_eq!(Region::from_coords(-33.0, -71.0), Region::Chile);
        assert_eq!(Region::from_coords(35.0, -118.0), Region::California);
        assert_eq!(Region::from_coords(-75.0, 0.0), Region::Antarctic);
        assert_eq!(Region::from_coords(48.0, 2.0), Region::Global);
    }

    #[test]
    fn test_most_frequent_needs_three_and_a_share() {
        let japan = (36.0, 140.0);
        let paris = (48.0, 2.0);
        assert_eq!(most_frequent(&[japan, japan]), None);
        assert_eq!(most_frequent(&[japan, japan, paris]), Some(Region::Japan));
        assert_eq!(most_frequent(&[paris, paris, paris, japan]), None);

        let mut spread = vec![japan; 2];
        spread.extend(std::iter::repeat(paris).take(3));
        spread.extend(std::iter::repeat((64.5, -18.0)).take(3));
        spread.extend(std::iter::repeat((-33.0, -71.0)).take(3));
        // Three regions tie at 3 of 11; Global was seen first and wins, so
        // nothing is named.
        assert_eq!(most_frequent(&spread), None);
    }

    #[test]
    fn test_only_latest_hundred_count() {
        let mut locations = vec![(36.0, 140.0); 200];
        locations.extend(std::iter::repeat((48.0, 2.0)).take(100));
        assert_eq!(most_frequent(&locations), None);
    }
}
