//! Selector compilation and document matching.
//!
//! A [`Selector`] is compiled once into a [`Matcher`], a pure predicate over documents. The
//! compiled form is a tree of tagged matcher nodes: document-level nodes combine logical
//! operators and field paths, and each field path owns a branched matcher that evaluates
//! the [`Branch`](crate::lookup::Branch) set its path resolves to.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use livelayer_core::matcher::Matcher;
//!
//! let matcher = Matcher::new(doc! { "a": { "$elemMatch": { "x": { "$gt": 5 } } } })?;
//! let result = matcher.document_matches(&doc! { "a": [{ "x": 1 }, { "x": 9 }] })?;
//!
//! assert!(result.result);
//! ```

mod geo;
mod operators;

use std::{collections::HashMap, fmt, sync::Arc};
use bson::{Bson, Document, oid::ObjectId};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    lookup::{IndexToken, Lookup, Node},
    value::{equals_opt, is_number, is_truthy},
};

pub(crate) use operators::{BranchedMatcher, CompareOp, ElementMatcher};


/// A predicate over whole documents, used for function selectors and `$where`.
pub type WherePredicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// A query selector.
#[derive(Clone)]
pub enum Selector {
    /// A `{path: value-selector}` document, possibly with logical operators.
    Document(Document),
    /// A bare value. Strings, numbers and ObjectIds select by `_id`; falsy values select
    /// nothing; anything else is rejected at compile time.
    Value(Bson),
    /// An arbitrary predicate.
    Predicate(WherePredicate),
}

impl Selector {
    /// Wraps a closure as a predicate selector.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        Selector::Predicate(Arc::new(f))
    }

    /// Returns the `_id` this selector targets, for `_id` scalars and `{_id: scalar}`.
    pub fn as_id(&self) -> Option<&Bson> {
        match self {
            Selector::Value(value) if selector_is_id(value) => Some(value),
            Selector::Document(doc) if doc.len() == 1 => doc.get("_id").filter(|id| selector_is_id(id)),
            _ => None,
        }
    }
}

impl Default for Selector {
    fn default() -> Self {
        Selector::Document(Document::new())
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Document(doc) => f.debug_tuple("Document").field(doc).finish(),
            Selector::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Selector::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<Document> for Selector {
    fn from(doc: Document) -> Self {
        Selector::Document(doc)
    }
}

impl From<Bson> for Selector {
    fn from(value: Bson) -> Self {
        match value {
            Bson::Document(doc) => Selector::Document(doc),
            other => Selector::Value(other),
        }
    }
}

impl From<&str> for Selector {
    fn from(id: &str) -> Self {
        Selector::Value(Bson::String(id.to_string()))
    }
}

impl From<String> for Selector {
    fn from(id: String) -> Self {
        Selector::Value(Bson::String(id))
    }
}

impl From<ObjectId> for Selector {
    fn from(id: ObjectId) -> Self {
        Selector::Value(Bson::ObjectId(id))
    }
}

impl From<i32> for Selector {
    fn from(id: i32) -> Self {
        Selector::Value(Bson::Int32(id))
    }
}

impl From<i64> for Selector {
    fn from(id: i64) -> Self {
        Selector::Value(Bson::Int64(id))
    }
}

pub(crate) fn selector_is_id(value: &Bson) -> bool {
    matches!(value, Bson::String(_) | Bson::ObjectId(_)) || is_number(value)
}

/// Named predicates resolvable from `$where` strings.
///
/// `{"$where": "isAdult"}` compiles to the predicate registered as `isAdult`.
#[derive(Clone, Default)]
pub struct WhereRegistry {
    predicates: HashMap<String, WherePredicate>,
}

impl WhereRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `name`, replacing any previous predicate with that name.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<&WherePredicate> {
        self.predicates.get(name)
    }
}

impl fmt::Debug for WhereRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.predicates.keys()).finish()
    }
}

/// Outcome of matching one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    /// Whether the document matched.
    pub result: bool,
    /// Distance computed by a `$near` clause, when one matched.
    pub distance: Option<f64>,
    /// Array indices of the branch that matched, used to bind the positional operator.
    pub array_indices: Option<Vec<IndexToken>>,
}

impl MatchResult {
    pub fn matched() -> Self {
        Self { result: true, ..Self::default() }
    }

    pub fn unmatched() -> Self {
        Self::default()
    }

    pub(crate) fn from_bool(result: bool) -> Self {
        Self { result, ..Self::default() }
    }
}

/// Flags and paths recorded while compiling a selector.
#[derive(Debug)]
pub(crate) struct CompileContext<'r> {
    is_simple: bool,
    has_geo_query: bool,
    has_where: bool,
    paths: Vec<String>,
    registry: Option<&'r WhereRegistry>,
}

impl<'r> CompileContext<'r> {
    fn new(registry: Option<&'r WhereRegistry>) -> Self {
        Self {
            is_simple: true,
            has_geo_query: false,
            has_where: false,
            paths: Vec::new(),
            registry,
        }
    }

    fn record_path(&mut self, path: &str) {
        if !self.paths.iter().any(|p| p == path) {
            self.paths.push(path.to_string());
        }
    }

    pub(crate) fn not_simple(&mut self) {
        self.is_simple = false;
    }

    pub(crate) fn geo_query(&mut self) {
        self.has_geo_query = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogicalOperator {
    And,
    Or,
    Nor,
    Where,
    Comment,
}

impl LogicalOperator {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "$and" => Some(LogicalOperator::And),
            "$or" => Some(LogicalOperator::Or),
            "$nor" => Some(LogicalOperator::Nor),
            "$where" => Some(LogicalOperator::Where),
            "$comment" => Some(LogicalOperator::Comment),
            _ => None,
        }
    }
}

/// Document-level matcher node.
#[derive(Clone)]
pub(crate) enum DocMatcher {
    Everything,
    Nothing,
    IdEquals(Bson),
    Predicate(WherePredicate),
    And(Vec<DocMatcher>),
    Or(Vec<DocMatcher>),
    Nor(Vec<DocMatcher>),
    Path { lookup: Lookup, matcher: BranchedMatcher },
}

impl fmt::Debug for DocMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocMatcher::Everything => f.write_str("Everything"),
            DocMatcher::Nothing => f.write_str("Nothing"),
            DocMatcher::IdEquals(id) => f.debug_tuple("IdEquals").field(id).finish(),
            DocMatcher::Predicate(_) => f.write_str("Predicate(..)"),
            DocMatcher::And(parts) => f.debug_tuple("And").field(parts).finish(),
            DocMatcher::Or(parts) => f.debug_tuple("Or").field(parts).finish(),
            DocMatcher::Nor(parts) => f.debug_tuple("Nor").field(parts).finish(),
            DocMatcher::Path { lookup, matcher } => f
                .debug_struct("Path")
                .field("lookup", lookup)
                .field("matcher", matcher)
                .finish(),
        }
    }
}

impl DocMatcher {
    pub(crate) fn matches(&self, node: Node<'_>) -> DocumentStoreResult<MatchResult> {
        match self {
            DocMatcher::Everything => Ok(MatchResult::matched()),
            DocMatcher::Nothing => Ok(MatchResult::unmatched()),
            DocMatcher::IdEquals(id) => {
                let result = match node {
                    Node::Document(doc) => equals_opt(doc.get("_id"), Some(id)),
                    Node::Array(_) => false,
                };

                Ok(MatchResult::from_bool(result))
            }
            DocMatcher::Predicate(predicate) => {
                let result = match node {
                    Node::Document(doc) => predicate(doc),
                    Node::Array(_) => false,
                };

                Ok(MatchResult::from_bool(result))
            }
            DocMatcher::And(parts) => and_matchers(parts, |part| part.matches(node)),
            DocMatcher::Or(parts) => {
                if let [only] = parts.as_slice() {
                    return only.matches(node);
                }

                for part in parts {
                    if part.matches(node)?.result {
                        return Ok(MatchResult::matched());
                    }
                }

                Ok(MatchResult::unmatched())
            }
            DocMatcher::Nor(parts) => {
                for part in parts {
                    if part.matches(node)?.result {
                        return Ok(MatchResult::unmatched());
                    }
                }

                Ok(MatchResult::matched())
            }
            DocMatcher::Path { lookup, matcher } => matcher.matches(&lookup.branches_in(node)),
        }
    }
}

/// AND-combines sub-results.
///
/// `distance` comes from the first part reporting one, `array_indices` from the last.
/// Both are dropped when the combination fails.
pub(crate) fn and_matchers<T, F>(parts: &[T], mut eval: F) -> DocumentStoreResult<MatchResult>
where
    F: FnMut(&T) -> DocumentStoreResult<MatchResult>,
{
    let mut ret = MatchResult::matched();

    for part in parts {
        let sub = eval(part)?;

        if !sub.result {
            return Ok(MatchResult::unmatched());
        }

        if sub.distance.is_some() && ret.distance.is_none() {
            ret.distance = sub.distance;
        }

        if sub.array_indices.is_some() {
            ret.array_indices = sub.array_indices;
        }
    }

    Ok(ret)
}

pub(crate) fn compile_document_selector(
    selector: &Document,
    ctx: &mut CompileContext<'_>,
    in_elem_match: bool,
    is_root: bool,
) -> DocumentStoreResult<DocMatcher> {
    let mut matchers = Vec::with_capacity(selector.len());

    for (key, sub_selector) in selector {
        if key.starts_with('$') {
            let Some(operator) = LogicalOperator::parse(key) else {
                return Err(DocumentStoreError::compile(format!("Unrecognized logical operator: {}", key)));
            };

            ctx.not_simple();
            matchers.push(compile_logical_operator(operator, sub_selector, ctx, in_elem_match)?);
        } else {
            if !in_elem_match {
                ctx.record_path(key);
            }

            matchers.push(DocMatcher::Path {
                lookup: Lookup::new(key),
                matcher: operators::compile_value_selector(sub_selector, ctx, is_root)?,
            });
        }
    }

    Ok(match matchers.len() {
        0 => DocMatcher::Everything,
        1 => matchers.remove(0),
        _ => DocMatcher::And(matchers),
    })
}

fn compile_logical_operator(
    operator: LogicalOperator,
    operand: &Bson,
    ctx: &mut CompileContext<'_>,
    in_elem_match: bool,
) -> DocumentStoreResult<DocMatcher> {
    match operator {
        LogicalOperator::And => Ok(DocMatcher::And(compile_selector_array(operand, ctx, in_elem_match)?)),
        LogicalOperator::Or => {
            let mut matchers = compile_selector_array(operand, ctx, in_elem_match)?;

            if matchers.len() == 1 {
                return Ok(matchers.remove(0));
            }

            Ok(DocMatcher::Or(matchers))
        }
        LogicalOperator::Nor => Ok(DocMatcher::Nor(compile_selector_array(operand, ctx, in_elem_match)?)),
        LogicalOperator::Where => {
            ctx.record_path("");
            ctx.has_where = true;

            let name = match operand {
                Bson::String(name) | Bson::JavaScriptCode(name) => name.trim(),
                _ => return Err(DocumentStoreError::compile("$where must name a registered predicate")),
            };

            ctx.registry
                .and_then(|registry| registry.get(name))
                .cloned()
                .map(DocMatcher::Predicate)
                .ok_or_else(|| DocumentStoreError::compile(format!("Unknown $where predicate: {}", name)))
        }
        LogicalOperator::Comment => Ok(DocMatcher::Everything),
    }
}

fn compile_selector_array(
    operand: &Bson,
    ctx: &mut CompileContext<'_>,
    in_elem_match: bool,
) -> DocumentStoreResult<Vec<DocMatcher>> {
    let selectors = match operand {
        Bson::Array(selectors) if !selectors.is_empty() => selectors,
        _ => return Err(DocumentStoreError::compile("$and/$or/$nor must be nonempty array")),
    };

    selectors
        .iter()
        .map(|selector| match selector {
            Bson::Document(selector) => compile_document_selector(selector, ctx, in_elem_match, false),
            _ => Err(DocumentStoreError::compile("$or/$and/$nor entries need to be full objects")),
        })
        .collect()
}

/// Compiles a value selector evaluated against standalone values rather than a path inside
/// a document, such as the `{$gt: 4}` operand of `$pull`.
pub(crate) fn compile_element_selector(selector: &Bson) -> DocumentStoreResult<BranchedMatcher> {
    let mut ctx = CompileContext::new(None);
    operators::compile_value_selector(selector, &mut ctx, false)
}

/// A compiled selector.
#[derive(Debug, Clone)]
pub struct Matcher {
    root: DocMatcher,
    selector: Selector,
    is_simple: bool,
    has_geo_query: bool,
    has_where: bool,
    paths: Vec<String>,
}

impl Matcher {
    /// Compiles a selector. `$where` clauses are rejected since no predicates are registered.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] for malformed selectors.
    pub fn new(selector: impl Into<Selector>) -> DocumentStoreResult<Self> {
        Self::compile(selector.into(), None)
    }

    /// Compiles a selector, resolving `$where` names through `registry`.
    pub fn with_registry(selector: impl Into<Selector>, registry: &WhereRegistry) -> DocumentStoreResult<Self> {
        Self::compile(selector.into(), Some(registry))
    }

    fn compile(selector: Selector, registry: Option<&WhereRegistry>) -> DocumentStoreResult<Self> {
        let mut ctx = CompileContext::new(registry);

        let (root, selector) = match selector {
            Selector::Predicate(predicate) => {
                ctx.not_simple();
                ctx.record_path("");
                (DocMatcher::Predicate(predicate.clone()), Selector::Predicate(predicate))
            }
            Selector::Value(value) if selector_is_id(&value) => {
                ctx.record_path("_id");
                let mut normalized = Document::new();
                normalized.insert("_id", value.clone());
                (DocMatcher::IdEquals(value), Selector::Document(normalized))
            }
            Selector::Value(Bson::Document(doc)) => return Self::compile(Selector::Document(doc), registry),
            Selector::Value(value) if !is_truthy(Some(&value)) => {
                ctx.not_simple();
                (DocMatcher::Nothing, Selector::Value(value))
            }
            Selector::Value(value) => {
                return Err(DocumentStoreError::compile(format!("Invalid selector: {}", value)));
            }
            Selector::Document(doc) if doc.contains_key("_id") && !is_truthy(doc.get("_id")) => {
                ctx.not_simple();
                (DocMatcher::Nothing, Selector::Document(doc))
            }
            Selector::Document(doc) => {
                let root = compile_document_selector(&doc, &mut ctx, false, true)?;
                (root, Selector::Document(doc))
            }
        };

        Ok(Self {
            root,
            selector,
            is_simple: ctx.is_simple,
            has_geo_query: ctx.has_geo_query,
            has_where: ctx.has_where,
            paths: ctx.paths,
        })
    }

    /// Matches a document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Evaluation`] when an operator compares values that
    /// cannot be ordered (for example a range operator against a regular expression).
    pub fn document_matches(&self, doc: &Document) -> DocumentStoreResult<MatchResult> {
        self.root.matches(Node::Document(doc))
    }

    /// Whether the selector only uses simple equality, numeric ranges and scalar `$in`.
    pub fn is_simple(&self) -> bool {
        self.is_simple
    }

    pub fn has_geo_query(&self) -> bool {
        self.has_geo_query
    }

    pub fn has_where(&self) -> bool {
        self.has_where
    }

    /// Top-level paths the selector reads, in first-use order. `""` means the whole document.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// The selector this matcher was compiled from, with `_id` scalars normalized to
    /// `{_id: value}`.
    pub fn selector(&self) -> &Selector {
        &self.selector
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use proptest::prelude::*;

    fn matches(selector: Document, doc: Document) -> bool {
        Matcher::new(selector).unwrap().document_matches(&doc).unwrap().result
    }

    #[test]
    fn test_id_selectors() {
        let doc = doc! { "_id": "a", "n": 1 };

        assert!(Matcher::new("a").unwrap().document_matches(&doc).unwrap().result);
        assert!(!Matcher::new("b").unwrap().document_matches(&doc).unwrap().result);
        assert_eq!(Matcher::new("a").unwrap().paths(), &["_id".to_string()]);
    }

    #[test]
    fn test_falsy_selectors_match_nothing() {
        let doc = doc! { "_id": "a" };

        assert!(!Matcher::new(Bson::Null).unwrap().document_matches(&doc).unwrap().result);
        assert!(!matches(doc! { "_id": Bson::Null }, doc.clone()));
        assert!(Matcher::new(Bson::Boolean(true)).is_err());
        assert!(Matcher::new(Bson::Array(vec![])).is_err());
    }

    #[test]
    fn test_equality_and_null() {
        assert!(matches(doc! { "a": 1 }, doc! { "a": 1 }));
        assert!(matches(doc! { "a": 1 }, doc! { "a": [5, 1] }));
        assert!(matches(doc! { "a": Bson::Null }, doc! { "b": 1 }));
        assert!(!matches(doc! { "a": { "b": 1 } }, doc! { "a": { "b": 1, "c": 2 } }));
        assert!(matches(doc! { "a.b": 2 }, doc! { "a": [{ "b": 1 }, { "b": 2 }] }));
    }

    #[test]
    fn test_logical_operators() {
        let doc = doc! { "a": 1, "b": 2 };

        assert!(matches(doc! { "$or": [{ "a": 2 }, { "b": 2 }] }, doc.clone()));
        assert!(!matches(doc! { "$and": [{ "a": 1 }, { "b": 3 }] }, doc.clone()));
        assert!(matches(doc! { "$nor": [{ "a": 2 }, { "b": 3 }] }, doc.clone()));
        assert!(matches(doc! { "$comment": "anything" }, doc.clone()));

        assert!(Matcher::new(doc! { "$or": [] }).is_err());
        assert!(Matcher::new(doc! { "$or": [1] }).is_err());
        assert!(Matcher::new(doc! { "$foo": 1 }).is_err());
    }

    #[test]
    fn test_simple_flag() {
        assert!(Matcher::new(doc! { "a": 1, "b": { "$gt": 2 } }).unwrap().is_simple());
        assert!(Matcher::new(doc! { "a": { "$in": [1, 2] } }).unwrap().is_simple());
        assert!(!Matcher::new(doc! { "a": { "$exists": true } }).unwrap().is_simple());
        assert!(!Matcher::new(doc! { "$or": [{ "a": 1 }] }).unwrap().is_simple());
    }

    #[test]
    fn test_elem_match_records_index() {
        let matcher = Matcher::new(doc! { "a": { "$elemMatch": { "x": { "$gt": 5 } } } }).unwrap();
        let result = matcher.document_matches(&doc! { "a": [{ "x": 1 }, { "x": 9 }] }).unwrap();

        assert!(result.result);
        assert_eq!(result.array_indices, Some(vec![IndexToken::Index(1)]));
    }

    #[test]
    fn test_and_keeps_last_array_indices_and_first_distance() {
        let matcher = Matcher::new(doc! { "a.x": 1, "b.y": 2 }).unwrap();
        let result = matcher
            .document_matches(&doc! { "a": [{ "x": 1 }], "b": [{ "y": 0 }, { "y": 2 }] })
            .unwrap();

        assert!(result.result);
        assert_eq!(result.array_indices, Some(vec![IndexToken::Index(1)]));
    }

    #[test]
    fn test_or_single_branch_keeps_indices() {
        let matcher = Matcher::new(doc! { "$or": [{ "a.x": 2 }] }).unwrap();
        let result = matcher.document_matches(&doc! { "a": [{ "x": 1 }, { "x": 2 }] }).unwrap();
        assert_eq!(result.array_indices, Some(vec![IndexToken::Index(1)]));

        let matcher = Matcher::new(doc! { "$or": [{ "a.x": 2 }, { "b": 1 }] }).unwrap();
        let result = matcher.document_matches(&doc! { "a": [{ "x": 1 }, { "x": 2 }] }).unwrap();
        assert!(result.result);
        assert_eq!(result.array_indices, None);
    }

    #[test]
    fn test_where_registry() {
        let mut registry = WhereRegistry::new();
        registry.register("big", |doc: &Document| doc.get_i32("n").is_ok_and(|n| n > 10));

        let matcher = Matcher::with_registry(doc! { "$where": "big" }, &registry).unwrap();
        assert!(matcher.has_where());
        assert!(matcher.document_matches(&doc! { "n": 11 }).unwrap().result);
        assert!(!matcher.document_matches(&doc! { "n": 1 }).unwrap().result);

        assert!(Matcher::new(doc! { "$where": "big" }).is_err());
    }

    #[test]
    fn test_predicate_selector() {
        let matcher = Matcher::new(Selector::predicate(|doc| doc.contains_key("x"))).unwrap();

        assert!(!matcher.is_simple());
        assert!(matcher.document_matches(&doc! { "x": 1 }).unwrap().result);
    }

    fn scalar() -> impl Strategy<Value = Bson> {
        prop_oneof![
            (-5i32..5).prop_map(Bson::Int32),
            "[a-c]{0,2}".prop_map(Bson::String),
            any::<bool>().prop_map(Bson::Boolean),
            Just(Bson::Null),
        ]
    }

    fn field_value() -> impl Strategy<Value = Bson> {
        prop_oneof![
            scalar(),
            prop::collection::vec(scalar(), 0..3).prop_map(Bson::Array),
        ]
    }

    proptest! {
        #[test]
        fn prop_not_inverts(operand in scalar(), value in field_value()) {
            let mut doc = Document::new();
            doc.insert("a", value);

            let plain = matches(doc! { "a": { "$gte": operand.clone() } }, doc.clone());
            let negated = matches(doc! { "a": { "$not": { "$gte": operand } } }, doc);
            prop_assert_eq!(plain, !negated);
        }

        #[test]
        fn prop_in_singleton_is_equality(operand in scalar(), value in field_value()) {
            let mut doc = Document::new();
            doc.insert("a", value);

            let equality = Matcher::new(doc! { "a": operand.clone() }).unwrap().document_matches(&doc).unwrap();
            let inclusion = Matcher::new(doc! { "a": { "$in": [operand] } }).unwrap().document_matches(&doc).unwrap();
            prop_assert_eq!(equality, inclusion);
        }
    }
}
