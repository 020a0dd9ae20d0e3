//! `$near` distance evaluation for planar coordinate pairs and GeoJSON.

use bson::{Bson, Document};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    lookup::{Branch, expand_arrays_in_branches},
    value::as_f64,
};

use super::MatchResult;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;


#[derive(Debug, Clone, PartialEq)]
enum NearTarget {
    /// A coordinate pair compared with Euclidean distance.
    Planar(Option<(f64, f64)>),
    /// A GeoJSON point compared with great-circle distance in meters.
    Sphere(Option<(f64, f64)>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NearQuery {
    target: NearTarget,
    max_distance: Option<f64>,
}

impl NearQuery {
    /// Compiles the operand of `$near`; `selector` is the enclosing operator object, which
    /// may carry `$maxDistance` for the planar form.
    pub(crate) fn compile(operand: &Bson, selector: &Document) -> DocumentStoreResult<Self> {
        if let Bson::Document(near) = operand {
            if let Some(geometry) = near.get("$geometry") {
                return Ok(Self {
                    target: NearTarget::Sphere(geo_json_point(geometry)),
                    max_distance: near.get("$maxDistance").and_then(as_f64),
                });
            }
        }

        if !matches!(operand, Bson::Array(_) | Bson::Document(_)) {
            return Err(DocumentStoreError::compile("$near argument must be coordinate pair or GeoJSON"));
        }

        Ok(Self {
            target: NearTarget::Planar(coordinate_pair(operand)),
            max_distance: selector.get("$maxDistance").and_then(as_f64),
        })
    }

    fn distance(&self, value: Option<&Bson>) -> Option<f64> {
        let value = value?;

        match self.target {
            NearTarget::Planar(center) => {
                let (x0, y0) = center?;
                let (x1, y1) = coordinate_pair(value)?;

                Some(((x0 - x1).powi(2) + (y0 - y1).powi(2)).sqrt())
            }
            NearTarget::Sphere(center) => {
                let Bson::Document(geometry) = value else {
                    return None;
                };

                match geometry.get_str("type").ok()? {
                    "Point" => Some(point_distance(center?, geo_json_point(value)?)),
                    _ => {
                        if self.within_radius(geometry, center?) {
                            Some(0.0)
                        } else {
                            self.max_distance.map(|max| max + 1.0)
                        }
                    }
                }
            }
        }
    }

    fn within_radius(&self, geometry: &Document, center: (f64, f64)) -> bool {
        let Some(radius) = self.max_distance else {
            return true;
        };

        let coordinates = match (geometry.get_str("type"), geometry.get("coordinates")) {
            (Ok("Point"), Some(point)) => {
                return coordinate_pair(point).is_some_and(|point| point_distance(center, point) <= radius);
            }
            (Ok("LineString"), Some(Bson::Array(points))) => points,
            (Ok("Polygon"), Some(Bson::Array(rings))) => match rings.first() {
                Some(Bson::Array(points)) => points,
                _ => return true,
            },
            _ => return true,
        };

        coordinates
            .iter()
            .filter_map(coordinate_pair)
            .all(|point| point_distance(center, point) <= radius)
    }

    /// Finds the nearest in-range branch. Ties keep the earlier branch.
    pub(crate) fn matches(&self, branches: &[Branch<'_>]) -> DocumentStoreResult<MatchResult> {
        let mut result = MatchResult::unmatched();

        for branch in expand_arrays_in_branches(branches.to_vec(), false) {
            let Some(distance) = self.distance(branch.value) else {
                continue;
            };

            if self.max_distance.is_some_and(|max| distance > max) {
                continue;
            }

            if result.distance.is_some_and(|current| current <= distance) {
                continue;
            }

            result.result = true;
            result.distance = Some(distance);
            result.array_indices = (!branch.array_indices.is_empty()).then_some(branch.array_indices);
        }

        Ok(result)
    }
}

/// First two values of an array or document, as numbers.
fn coordinate_pair(value: &Bson) -> Option<(f64, f64)> {
    let mut values: Box<dyn Iterator<Item = &Bson>> = match value {
        Bson::Array(arr) => Box::new(arr.iter()),
        Bson::Document(doc) => Box::new(doc.values()),
        _ => return None,
    };

    let x = values.next().and_then(as_f64)?;
    let y = values.next().and_then(as_f64)?;

    Some((x, y))
}

fn geo_json_point(geometry: &Bson) -> Option<(f64, f64)> {
    match geometry {
        Bson::Document(doc) => doc.get("coordinates").and_then(coordinate_pair),
        _ => None,
    }
}

/// Haversine distance in meters between two `[longitude, latitude]` pairs.
fn point_distance((lon1, lat1): (f64, f64), (lon2, lat2): (f64, f64)) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}


#[cfg(test)]
mod tests {
    use bson::doc;

    use crate::matcher::Matcher;

    #[test]
    fn test_planar_near_reports_nearest_distance() {
        let matcher = Matcher::new(doc! { "loc": { "$near": [0, 0], "$maxDistance": 10 } }).unwrap();
        assert!(matcher.has_geo_query());

        let result = matcher.document_matches(&doc! { "loc": [3, 4] }).unwrap();
        assert!(result.result);
        assert_eq!(result.distance, Some(5.0));

        let result = matcher.document_matches(&doc! { "loc": [30, 40] }).unwrap();
        assert!(!result.result);
    }

    #[test]
    fn test_near_picks_closest_branch() {
        let matcher = Matcher::new(doc! { "locs": { "$near": [0, 0] } }).unwrap();
        let result = matcher
            .document_matches(&doc! { "locs": [[6, 8], [3, 4]] })
            .unwrap();

        assert_eq!(result.distance, Some(5.0));
    }

    #[test]
    fn test_geo_json_point_distance() {
        let matcher = Matcher::new(doc! {
            "loc": { "$near": { "$geometry": { "type": "Point", "coordinates": [0.0, 0.0] }, "$maxDistance": 200_000.0 } }
        })
        .unwrap();

        let near = matcher
            .document_matches(&doc! { "loc": { "type": "Point", "coordinates": [1.0, 0.0] } })
            .unwrap();
        assert!(near.result);
        assert!((near.distance.unwrap() - 111_195.0).abs() < 10.0);

        let far = matcher
            .document_matches(&doc! { "loc": { "type": "Point", "coordinates": [10.0, 0.0] } })
            .unwrap();
        assert!(!far.result);
    }

    #[test]
    fn test_near_must_be_at_root() {
        assert!(Matcher::new(doc! { "$and": [{ "loc": { "$near": [0, 0] } }] }).is_err());
        assert!(Matcher::new(doc! { "loc": { "$near": 5 } }).is_err());
        assert!(Matcher::new(doc! { "loc": { "$maxDistance": 5 } }).is_err());
    }
}
