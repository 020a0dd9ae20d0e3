//! Sort specifications and document comparators.
//!
//! A [`Sorter`] orders documents by the lexicographically least sort key each document can
//! produce. When a sort field crosses arrays, a document yields one candidate key per array
//! position, and multiple array-valued sort fields must line up on identical positions.
//!
//! # Example
//!
//! ```ignore
//! use livelayer_core::sorter::{SortSpec, Sorter};
//!
//! let sorter = Sorter::new(SortSpec::new().asc("age").desc("name"))?;
//! let ordering = sorter.compare(&older, &younger)?;
//! ```

use std::{cmp::Ordering, collections::HashMap};
use bson::{Bson, Document};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    index::IdKey,
    lookup::{Branch, Lookup, expand_arrays_in_branches},
    matcher::{CompareOp, ElementMatcher, Matcher, Selector},
    value::{as_f64, compare, is_operator_object, is_truthy},
};

static NULL: Bson = Bson::Null;

/// `$near` distances of matched documents, keyed by `_id`.
pub type Distances = HashMap<IdKey, f64>;

/// One candidate sort key: a value per sort field, `None` for absent values.
pub type SortKey<'a> = Vec<Option<&'a Bson>>;


/// A single sort field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub path: String,
    pub ascending: bool,
}

/// An ordered list of sort fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortSpec {
    fields: Vec<SortField>,
}

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an ascending field.
    pub fn asc(mut self, path: impl Into<String>) -> Self {
        self.fields.push(SortField { path: path.into(), ascending: true });
        self
    }

    /// Appends a descending field.
    pub fn desc(mut self, path: impl Into<String>) -> Self {
        self.fields.push(SortField { path: path.into(), ascending: false });
        self
    }

    pub fn fields(&self) -> &[SortField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses a sort specification.
    ///
    /// Accepts a `{path: direction}` document, where a non-negative direction is ascending,
    /// or an array whose entries are either `"path"` (ascending) or `["path", "asc" | "desc"]`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] for any other shape.
    pub fn parse(spec: &Bson) -> DocumentStoreResult<Self> {
        match spec {
            Bson::Document(doc) => Ok(Self::from(doc.clone())),
            Bson::Array(entries) => {
                let mut parsed = Self::new();

                for entry in entries {
                    parsed = match entry {
                        Bson::String(path) => parsed.asc(path.as_str()),
                        Bson::Array(pair) => match (pair.first(), pair.get(1)) {
                            (Some(Bson::String(path)), Some(Bson::String(direction))) if direction == "desc" => {
                                parsed.desc(path.as_str())
                            }
                            (Some(Bson::String(path)), _) => parsed.asc(path.as_str()),
                            _ => return Err(bad_spec(spec)),
                        },
                        _ => return Err(bad_spec(spec)),
                    };
                }

                Ok(parsed)
            }
            _ => Err(bad_spec(spec)),
        }
    }
}

fn bad_spec(spec: &Bson) -> DocumentStoreError {
    DocumentStoreError::compile(format!("Bad sort specification: {}", spec))
}

/// Loose "direction >= 0" test applied to map-form directions.
fn is_ascending(direction: &Bson) -> bool {
    match direction {
        Bson::Boolean(_) | Bson::Null => true,
        Bson::String(s) if s.trim().is_empty() => true,
        Bson::String(s) => s.trim().parse::<f64>().is_ok_and(|n| n >= 0.0),
        other => as_f64(other).is_some_and(|n| n >= 0.0),
    }
}

impl From<Document> for SortSpec {
    fn from(doc: Document) -> Self {
        doc
            .into_iter()
            .fold(Self::new(), |spec, (path, direction)| {
                if is_ascending(&direction) { spec.asc(path) } else { spec.desc(path) }
            })
    }
}

impl TryFrom<Bson> for SortSpec {
    type Error = DocumentStoreError;

    fn try_from(spec: Bson) -> DocumentStoreResult<Self> {
        Self::parse(&spec)
    }
}

#[derive(Debug, Clone)]
struct SortPart {
    path: String,
    ascending: bool,
    lookup: Lookup,
}

/// Per-path constraints taken from a companion selector.
#[derive(Debug, Clone)]
struct KeyFilter {
    constraints: HashMap<String, Vec<ElementMatcher>>,
}

/// A compiled sort specification.
#[derive(Debug, Clone)]
pub struct Sorter {
    parts: Vec<SortPart>,
    key_filter: Option<KeyFilter>,
}

impl Sorter {
    /// Compiles a sort specification.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] for empty or `$`-prefixed paths.
    pub fn new(spec: impl Into<SortSpec>) -> DocumentStoreResult<Self> {
        let spec = spec.into();
        let mut parts = Vec::with_capacity(spec.fields.len());

        for field in spec.fields {
            if field.path.is_empty() {
                return Err(DocumentStoreError::compile("sort keys must be non-empty"));
            }

            if field.path.starts_with('$') {
                return Err(DocumentStoreError::compile(format!("unsupported sort key: {}", field.path)));
            }

            parts.push(SortPart {
                lookup: Lookup::for_sort(&field.path),
                path: field.path,
                ascending: field.ascending,
            });
        }

        Ok(Self { parts, key_filter: None })
    }

    /// Compiles a sort specification that only considers sort keys compatible with the
    /// equality, range and regex constraints `matcher` places on the first sort field.
    pub fn with_matcher(spec: impl Into<SortSpec>, matcher: &Matcher) -> DocumentStoreResult<Self> {
        let mut sorter = Self::new(spec)?;
        sorter.key_filter = sorter.build_key_filter(matcher)?;

        Ok(sorter)
    }

    fn build_key_filter(&self, matcher: &Matcher) -> DocumentStoreResult<Option<KeyFilter>> {
        let Some(first) = self.parts.first() else {
            return Ok(None);
        };

        let Selector::Document(selector) = matcher.selector() else {
            return Ok(None);
        };

        let mut constraints: HashMap<String, Vec<ElementMatcher>> = self
            .parts
            .iter()
            .map(|part| (part.path.clone(), Vec::new()))
            .collect();

        for (key, sub_selector) in selector {
            let Some(list) = constraints.get_mut(key) else {
                continue;
            };

            if let Bson::RegularExpression(regex) = sub_selector {
                let options = regex.options.as_str();

                if !(options.contains('i') || options.contains('m')) {
                    list.push(ElementMatcher::regex(sub_selector, None)?);
                }

                continue;
            }

            if is_operator_object(sub_selector, true)? {
                let Bson::Document(operators) = sub_selector else {
                    continue;
                };

                for (name, operand) in operators {
                    if let Some(op) = CompareOp::parse(name) {
                        list.push(ElementMatcher::range(op, operand));
                    }

                    if name == "$regex" && !is_truthy(operators.get("$options")) {
                        list.push(ElementMatcher::regex(operand, operators.get("$options"))?);
                    }
                }

                continue;
            }

            list.push(ElementMatcher::equality(sub_selector)?);
        }

        if constraints.get(&first.path).is_none_or(Vec::is_empty) {
            return Ok(None);
        }

        Ok(Some(KeyFilter { constraints }))
    }

    fn key_is_compatible(&self, key: &SortKey<'_>) -> DocumentStoreResult<bool> {
        let Some(filter) = &self.key_filter else {
            return Ok(true);
        };

        for (part, value) in self.parts.iter().zip(key.iter()) {
            for constraint in filter.constraints.get(&part.path).into_iter().flatten() {
                if !constraint.test(*value)? {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Generates every admissible sort key of `doc`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Evaluation`] when two sort fields branch over
    /// different array positions ("parallel arrays").
    pub fn generate_keys<'a>(&self, doc: &'a Document) -> DocumentStoreResult<Vec<SortKey<'a>>> {
        if self.parts.is_empty() {
            return Err(DocumentStoreError::evaluation("can't generate keys without a spec"));
        }

        let mut values_by_field: Vec<Vec<(String, Option<&'a Bson>)>> = Vec::with_capacity(self.parts.len());
        let mut known_paths: Option<Vec<String>> = None;

        for part in &self.parts {
            let mut branches = expand_arrays_in_branches(part.lookup.branches(doc), true);

            if branches.is_empty() {
                branches.push(Branch {
                    value: Some(&NULL),
                    array_indices: Vec::new(),
                    dont_iterate: false,
                });
            }

            let branch_count = branches.len();
            let mut values: Vec<(String, Option<&'a Bson>)> = Vec::with_capacity(branch_count);
            let mut used_paths = false;

            for branch in branches {
                if branch.array_indices.is_empty() {
                    if branch_count > 1 {
                        return Err(DocumentStoreError::evaluation("multiple branches but no array used?"));
                    }

                    values.push((String::new(), branch.value));
                    continue;
                }

                used_paths = true;

                let path: String = branch
                    .array_indices
                    .iter()
                    .map(|token| format!("{},", token))
                    .collect();

                if values.iter().any(|(known, _)| *known == path) {
                    return Err(DocumentStoreError::evaluation(format!("duplicate path: {}", path)));
                }

                if known_paths.as_ref().is_some_and(|known| !known.contains(&path)) {
                    return Err(DocumentStoreError::evaluation("cannot index parallel arrays"));
                }

                values.push((path, branch.value));
            }

            match &known_paths {
                Some(known) => {
                    let has_sole = values.iter().any(|(path, _)| path.is_empty());

                    if !has_sole && known.len() != values.len() {
                        return Err(DocumentStoreError::evaluation("cannot index parallel arrays!"));
                    }
                }
                None if used_paths => {
                    known_paths = Some(values.iter().map(|(path, _)| path.clone()).collect());
                }
                None => {}
            }

            values_by_field.push(values);
        }

        let lookup_value = |values: &[(String, Option<&'a Bson>)], path: &str| -> DocumentStoreResult<Option<&'a Bson>> {
            values
                .iter()
                .find(|(known, _)| known.is_empty())
                .or_else(|| values.iter().find(|(known, _)| known == path))
                .map(|(_, value)| *value)
                .ok_or_else(|| DocumentStoreError::evaluation("missing path?"))
        };

        match known_paths {
            None => {
                let key = values_by_field
                    .iter()
                    .map(|values| lookup_value(values, ""))
                    .collect::<DocumentStoreResult<SortKey<'a>>>()?;

                Ok(vec![key])
            }
            Some(paths) => paths
                .iter()
                .map(|path| {
                    values_by_field
                        .iter()
                        .map(|values| lookup_value(values, path))
                        .collect::<DocumentStoreResult<SortKey<'a>>>()
                })
                .collect(),
        }
    }

    /// The least admissible key of `doc` under this sort order.
    pub fn min_key<'a>(&self, doc: &'a Document) -> DocumentStoreResult<SortKey<'a>> {
        let mut min_key: Option<SortKey<'a>> = None;

        for key in self.generate_keys(doc)? {
            if !self.key_is_compatible(&key)? {
                continue;
            }

            let replace = match &min_key {
                None => true,
                Some(current) => self.compare_keys(&key, current)? == Ordering::Less,
            };

            if replace {
                min_key = Some(key);
            }
        }

        min_key.ok_or_else(|| DocumentStoreError::evaluation("sort selector found no keys in doc?"))
    }

    fn compare_keys(&self, a: &SortKey<'_>, b: &SortKey<'_>) -> DocumentStoreResult<Ordering> {
        for (i, part) in self.parts.iter().enumerate() {
            let ordering = compare(a[i], b[i])?;
            let ordering = if part.ascending { ordering } else { ordering.reverse() };

            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }

        Ok(Ordering::Equal)
    }

    /// Compares two documents by their minimum sort keys. An empty specification
    /// considers every pair equal.
    pub fn compare(&self, a: &Document, b: &Document) -> DocumentStoreResult<Ordering> {
        if self.parts.is_empty() {
            return Ok(Ordering::Equal);
        }

        let key_a = self.min_key(a)?;
        let key_b = self.min_key(b)?;

        self.compare_keys(&key_a, &key_b)
    }

    /// Returns a comparator, breaking ties by `$near` distance when `distances` is given.
    ///
    /// # Errors
    ///
    /// The comparator fails when a compared document has no entry in `distances`.
    pub fn comparator<'s>(
        &'s self,
        distances: Option<&'s Distances>,
    ) -> impl Fn(&Document, &Document) -> DocumentStoreResult<Ordering> + 's {
        move |a, b| {
            let ordering = self.compare(a, b)?;

            match distances {
                Some(distances) if ordering == Ordering::Equal => {
                    let da = distance_of(distances, a)?;
                    let db = distance_of(distances, b)?;

                    Ok(da.partial_cmp(&db).unwrap_or(Ordering::Equal))
                }
                _ => Ok(ordering),
            }
        }
    }
}

fn distance_of(distances: &Distances, doc: &Document) -> DocumentStoreResult<f64> {
    let id = doc.get("_id").unwrap_or(&NULL);

    distances
        .get(&IdKey::from(id))
        .copied()
        .ok_or_else(|| DocumentStoreError::evaluation(format!("Missing distance for {}", id)))
}


#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use proptest::prelude::*;

    fn sorted(sorter: &Sorter, docs: Vec<Document>) -> Vec<Document> {
        crate::value::try_sort_by(docs, |a, b| sorter.compare(a, b)).unwrap()
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().map(|d| d.get_str("_id").unwrap()).collect()
    }

    #[test]
    fn test_parse_forms() {
        let from_map = SortSpec::from(doc! { "a": 1, "b": -1 });
        assert_eq!(from_map, SortSpec::new().asc("a").desc("b"));

        let from_array = SortSpec::parse(&Bson::Array(vec![
            Bson::String("a".into()),
            Bson::Array(vec![Bson::String("b".into()), Bson::String("desc".into())]),
            Bson::Array(vec![Bson::String("c".into()), Bson::String("asc".into())]),
        ]))
        .unwrap();
        assert_eq!(from_array, SortSpec::new().asc("a").desc("b").asc("c"));

        assert!(SortSpec::parse(&Bson::Int32(1)).is_err());
        assert!(Sorter::new(SortSpec::new().asc("")).is_err());
        assert!(Sorter::new(SortSpec::new().asc("$natural")).is_err());
    }

    #[test]
    fn test_multi_field_sort() {
        let sorter = Sorter::new(SortSpec::new().asc("a").desc("b")).unwrap();
        let docs = vec![
            doc! { "_id": "x", "a": 2, "b": 1 },
            doc! { "_id": "y", "a": 1, "b": 1 },
            doc! { "_id": "z", "a": 1, "b": 5 },
        ];

        assert_eq!(ids(&sorted(&sorter, docs)), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_array_fields_use_min_or_max() {
        let docs = vec![doc! { "_id": "x", "a": [1, 10] }, doc! { "_id": "y", "a": [5] }];

        let ascending = Sorter::new(SortSpec::new().asc("a")).unwrap();
        assert_eq!(ids(&sorted(&ascending, docs.clone())), vec!["x", "y"]);

        let descending = Sorter::new(SortSpec::new().desc("a")).unwrap();
        assert_eq!(ids(&sorted(&descending, docs)), vec!["x", "y"]);
    }

    #[test]
    fn test_missing_fields_sort_first() {
        let sorter = Sorter::new(SortSpec::new().asc("a")).unwrap();
        let docs = vec![doc! { "_id": "x", "a": Bson::Null }, doc! { "_id": "y" }, doc! { "_id": "z", "a": 0 }];

        assert_eq!(ids(&sorted(&sorter, docs)), vec!["y", "x", "z"]);
    }

    #[test]
    fn test_parallel_arrays_are_rejected() {
        let sorter = Sorter::new(SortSpec::new().asc("a").asc("b")).unwrap();

        let aligned = doc! { "a": [1, 2], "b": [3, 4] };
        assert_eq!(sorter.generate_keys(&aligned).unwrap().len(), 2);

        let misaligned = doc! { "a": [1, 2], "b": [3] };
        assert!(matches!(sorter.generate_keys(&misaligned), Err(DocumentStoreError::Evaluation(_))));
    }

    #[test]
    fn test_keys_follow_paired_positions() {
        let sorter = Sorter::new(SortSpec::new().asc("a.x").asc("a.y")).unwrap();
        let doc = doc! { "a": [{ "x": 0, "y": 5 }, { "x": 1, "y": 3 }] };

        let key = sorter.min_key(&doc).unwrap();
        assert_eq!(key, vec![Some(&Bson::Int32(0)), Some(&Bson::Int32(5))]);
    }

    #[test]
    fn test_key_filter_from_matcher() {
        let matcher = Matcher::new(doc! { "a.x": { "$gt": 3 } }).unwrap();
        let sorter = Sorter::with_matcher(SortSpec::new().asc("a.x"), &matcher).unwrap();
        let docs = vec![
            doc! { "_id": "first", "a": [{ "x": 1 }, { "x": 10 }] },
            doc! { "_id": "second", "a": [{ "x": 5 }, { "x": 15 }] },
        ];

        assert_eq!(ids(&sorted(&sorter, docs.clone())), vec!["second", "first"]);

        let plain = Sorter::new(SortSpec::new().asc("a.x")).unwrap();
        assert_eq!(ids(&sorted(&plain, docs)), vec!["first", "second"]);
    }

    #[test]
    fn test_distance_tie_break() {
        let sorter = Sorter::new(SortSpec::new()).unwrap();
        let mut distances = Distances::new();
        distances.insert(IdKey::from(&Bson::String("far".into())), 10.0);
        distances.insert(IdKey::from(&Bson::String("near".into())), 1.0);

        let comparator = sorter.comparator(Some(&distances));
        let far = doc! { "_id": "far" };
        let near = doc! { "_id": "near" };
        assert_eq!(comparator(&far, &near).unwrap(), Ordering::Greater);

        let unknown = doc! { "_id": "unknown" };
        assert!(comparator(&far, &unknown).is_err());
    }

    proptest! {
        #[test]
        fn prop_descending_reverses_ascending(values in prop::collection::hash_set(-1000i32..1000, 0..12)) {
            let docs: Vec<Document> = values
                .iter()
                .map(|v| doc! { "_id": v.to_string(), "a": *v })
                .collect();

            let ascending = Sorter::new(SortSpec::new().asc("a")).unwrap();
            let descending = Sorter::new(SortSpec::new().desc("a")).unwrap();

            let mut up = sorted(&ascending, docs.clone());
            let down = sorted(&descending, up.clone());
            up.reverse();

            prop_assert_eq!(up, down);
        }
    }
}
