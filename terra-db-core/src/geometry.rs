//! Geometry codec and spatial keys.
//!
//! Geometries are stored as WKT (the `GeometryEncoding::Wkt` flag value).
//! The geo-grid key is a Morton (Z-order) code of the reference point on a
//! 2^15 x 2^15 grid, which clusters nearby features in storage order.

use crate::error::{Error, Result};
use geo::{Centroid, Intersects};
use geo_types::{Geometry, Point};
use std::str::FromStr;
use wkt::ToWkt;

/// Grid level used for [`geo_grid`].
pub const GEO_GRID_LEVEL: u32 = 15;

/// Parse WKT into a geo-types Geometry.
pub fn parse_wkt(wkt: &str) -> Result<Geometry<f64>> {
    wkt::Wkt::from_str(wkt)
        .map_err(|e| Error::codec(format!("WKT parse error: {e:?}")))
        .and_then(|w| {
            w.try_into()
                .map_err(|e: wkt::conversion::Error| Error::codec(format!("WKT conversion error: {e:?}")))
        })
}

/// Render a geometry as WKT.
pub fn to_wkt(geometry: &Geometry<f64>) -> String {
    geometry.wkt_string()
}

/// Point used for spatial clustering when no explicit reference point is given.
pub fn reference_point(geometry: &Geometry<f64>) -> Option<Point<f64>> {
    geometry.centroid()
}

/// Morton code of `point` at [`GEO_GRID_LEVEL`]. Coordinates are clamped to
/// the WGS84 range, so the result is always non-negative.
pub fn geo_grid(point: &Point<f64>) -> i32 {
    let cells = (1u32 << GEO_GRID_LEVEL) as f64;
    let lon = point.x().clamp(-180.0, 180.0);
    let lat = point.y().clamp(-90.0, 90.0);
    let max = (1u32 << GEO_GRID_LEVEL) - 1;
    let x = (((lon + 180.0) / 360.0) * cells) as u32;
    let y = (((lat + 90.0) / 180.0) * cells) as u32;
    interleave(x.min(max), y.min(max)) as i32
}

fn interleave(x: u32, y: u32) -> u32 {
    let mut code = 0u32;
    for bit in 0..GEO_GRID_LEVEL {
        code |= ((x >> bit) & 1) << (2 * bit);
        code |= ((y >> bit) & 1) << (2 * bit + 1);
    }
    code
}

/// Geometry intersection test used by spatial predicates.
pub fn intersects(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    a.intersects(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_polygon() {
        let geom = parse_wkt("POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))").unwrap();
        assert!(matches!(geom, Geometry::Polygon(_)));
        assert!(parse_wkt("POLYGON((0 0").is_err());
    }

    #[test]
    fn test_wkt_roundtrip_point() {
        let geom = parse_wkt("POINT(13.4 52.5)").unwrap();
        let again = parse_wkt(&to_wkt(&geom)).unwrap();
        assert_eq!(geom, again);
    }

    #[test]
    fn test_geo_grid_clusters_neighbours() {
        let berlin = geo_grid(&Point::new(13.40, 52.52));
        let potsdam = geo_grid(&Point::new(13.41, 52.52));
        let sydney = geo_grid(&Point::new(151.2, -33.8));
        assert!(berlin >= 0);
        assert!((berlin - potsdam).abs() < (berlin - sydney).abs());
        assert_eq!(geo_grid(&Point::new(400.0, 100.0)), geo_grid(&Point::new(180.0, 90.0)));
    }

    #[test]
    fn test_intersects() {
        let poly = parse_wkt("POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))").unwrap();
        let inside = parse_wkt("POINT(5 5)").unwrap();
        let outside = parse_wkt("POINT(15 5)").unwrap();
        assert!(intersects(&poly, &inside));
        assert!(!intersects(&poly, &outside));
    }
}
