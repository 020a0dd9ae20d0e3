//! Dotted-path traversal producing branch values.
//!
//! A path such as `a.b.c` can resolve to several locations inside one document when arrays
//! are encountered along the way. Each location is a [`Branch`] carrying the value found and
//! the array indices taken to reach it. Selector operators, sort-key generation and the
//! positional update operator all consume branches.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use livelayer_core::lookup::Lookup;
//!
//! let doc = doc! { "a": [{ "x": 1 }, { "x": 2 }] };
//! let branches = Lookup::new("a.x").branches(&doc);
//!
//! // One branch per element, each tagged with the element's index.
//! assert_eq!(branches.len(), 2);
//! ```

use std::fmt;
use bson::{Bson, Document};

use crate::value::is_numeric_key;


/// One entry of a branch's array-index provenance.
///
/// An explicit numeric path segment on an array records `Index(i)` followed by `Explicit`;
/// implicit branching over array elements records only `Index(i)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexToken {
    Index(usize),
    Explicit,
}

impl IndexToken {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            IndexToken::Index(i) => Some(*i),
            IndexToken::Explicit => None,
        }
    }
}

impl fmt::Display for IndexToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexToken::Index(i) => write!(f, "{}", i),
            IndexToken::Explicit => write!(f, "x"),
        }
    }
}

/// A single location a path resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch<'a> {
    /// The value found, or `None` when the path does not exist along this branch.
    pub value: Option<&'a Bson>,
    /// Array indices taken to reach this location. Empty when no array was crossed.
    pub array_indices: Vec<IndexToken>,
    /// Set when the value is an array reached through an explicit index; it must not be
    /// expanded again.
    pub dont_iterate: bool,
}

impl<'a> Branch<'a> {
    /// A branch over a value with no provenance, as used by `$elemMatch` on single elements.
    pub fn leaf(value: &'a Bson) -> Self {
        Self {
            value: Some(value),
            array_indices: Vec::new(),
            dont_iterate: true,
        }
    }
}

/// A node a lookup can descend into.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Node<'a> {
    Document(&'a Document),
    Array(&'a [Bson]),
}

impl<'a> Node<'a> {
    pub(crate) fn from_bson(value: &'a Bson) -> Option<Self> {
        match value {
            Bson::Document(doc) => Some(Node::Document(doc)),
            Bson::Array(arr) => Some(Node::Array(arr)),
            _ => None,
        }
    }
}

/// A compiled dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    parts: Vec<String>,
    for_sort: bool,
}

impl Lookup {
    /// Compiles `path` for selector evaluation.
    pub fn new(path: &str) -> Self {
        Self {
            parts: path.split('.').map(str::to_string).collect(),
            for_sort: false,
        }
    }

    /// Compiles `path` for sort-key generation.
    ///
    /// When the segment after the first one is numeric, the first level does not branch
    /// into array elements, so the numeric segment always means positional indexing.
    pub fn for_sort(path: &str) -> Self {
        Self {
            for_sort: true,
            ..Self::new(path)
        }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Resolves the path against a document.
    pub fn branches<'a>(&self, doc: &'a Document) -> Vec<Branch<'a>> {
        self.branches_in(Node::Document(doc))
    }

    pub(crate) fn branches_in<'a>(&self, node: Node<'a>) -> Vec<Branch<'a>> {
        lookup(&self.parts, self.for_sort, node, Vec::new())
    }
}

fn lookup<'a>(
    parts: &[String],
    for_sort: bool,
    node: Node<'a>,
    mut indices: Vec<IndexToken>,
) -> Vec<Branch<'a>> {
    let Some((first, rest)) = parts.split_first() else {
        return Vec::new();
    };

    let first_level = match node {
        Node::Array(arr) => {
            let index = match first.parse::<usize>() {
                Ok(index) if is_numeric_key(first) && index < arr.len() => index,
                _ => return Vec::new(),
            };

            indices.push(IndexToken::Index(index));
            indices.push(IndexToken::Explicit);
            arr.get(index)
        }
        Node::Document(doc) => doc.get(first),
    };

    if rest.is_empty() {
        return vec![Branch {
            value: first_level,
            dont_iterate: matches!(node, Node::Array(_)) && matches!(first_level, Some(Bson::Array(_))),
            array_indices: indices,
        }];
    }

    let Some(next) = first_level.and_then(Node::from_bson) else {
        if matches!(node, Node::Array(_)) {
            return Vec::new();
        }

        return vec![Branch {
            value: None,
            array_indices: indices,
            dont_iterate: false,
        }];
    };

    let mut result = lookup(rest, false, next, indices.clone());
    let next_is_numeric = is_numeric_key(&rest[0]);

    if let Node::Array(elements) = next {
        if !(next_is_numeric && for_sort) {
            for (i, element) in elements.iter().enumerate() {
                if let Bson::Document(element) = element {
                    let mut element_indices = indices.clone();
                    element_indices.push(IndexToken::Index(i));
                    result.extend(lookup(rest, false, Node::Document(element), element_indices));
                }
            }
        }
    }

    result
}

/// Adds one branch per element of every array-valued branch that may be iterated.
///
/// With `skip_the_arrays` set, the whole-array branch itself is dropped unless it was
/// reached through an explicit index. Output branches never carry `dont_iterate`.
pub fn expand_arrays_in_branches<'a>(branches: Vec<Branch<'a>>, skip_the_arrays: bool) -> Vec<Branch<'a>> {
    let mut out = Vec::with_capacity(branches.len());

    for branch in branches {
        let iterable = match branch.value {
            Some(Bson::Array(arr)) if !branch.dont_iterate => Some(arr),
            _ => None,
        };

        if !(skip_the_arrays && iterable.is_some()) {
            out.push(Branch {
                value: branch.value,
                array_indices: branch.array_indices.clone(),
                dont_iterate: false,
            });
        }

        if let Some(arr) = iterable {
            for (i, leaf) in arr.iter().enumerate() {
                let mut array_indices = branch.array_indices.clone();
                array_indices.push(IndexToken::Index(i));

                out.push(Branch {
                    value: Some(leaf),
                    array_indices,
                    dont_iterate: false,
                });
            }
        }
    }

    out
}
