//! Value selectors and the field-level operator catalog.

use std::cmp::Ordering;
use bson::{Bson, Document};
use regex::{Regex, RegexBuilder};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    lookup::{Branch, IndexToken, Node, expand_arrays_in_branches},
    value::{BsonType, as_f64, compare, defined, equals, is_number, is_operator_object, is_truthy},
};

use super::{
    CompileContext, DocMatcher, MatchResult, and_matchers, compile_document_selector,
    geo::NearQuery,
};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
    In,
    Nin,
    Exists,
    Mod,
    Size,
    Type,
    Regex,
    Options,
    ElemMatch,
    All,
    Near,
    MaxDistance,
    Not,
}

impl Operator {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "$lt" => Operator::Lt,
            "$lte" => Operator::Lte,
            "$gt" => Operator::Gt,
            "$gte" => Operator::Gte,
            "$eq" => Operator::Eq,
            "$ne" => Operator::Ne,
            "$in" => Operator::In,
            "$nin" => Operator::Nin,
            "$exists" => Operator::Exists,
            "$mod" => Operator::Mod,
            "$size" => Operator::Size,
            "$type" => Operator::Type,
            "$regex" => Operator::Regex,
            "$options" => Operator::Options,
            "$elemMatch" => Operator::ElemMatch,
            "$all" => Operator::All,
            "$near" => Operator::Near,
            "$maxDistance" => Operator::MaxDistance,
            "$not" => Operator::Not,
            _ => return None,
        })
    }

    fn compare_op(self) -> Option<CompareOp> {
        match self {
            Operator::Lt => Some(CompareOp::Lt),
            Operator::Lte => Some(CompareOp::Lte),
            Operator::Gt => Some(CompareOp::Gt),
            Operator::Gte => Some(CompareOp::Gte),
            _ => None,
        }
    }
}

/// Range comparison used by `$lt`, `$lte`, `$gt` and `$gte`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        Operator::parse(name).and_then(Operator::compare_op)
    }

    fn test(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
        }
    }
}

/// A regular expression together with the source form it is compared by.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRegex {
    regex: Regex,
    pattern: String,
    flags: String,
}

impl CompiledRegex {
    pub(crate) fn new(pattern: &str, options: &str) -> DocumentStoreResult<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(options.contains('i'))
            .multi_line(options.contains('m'))
            .dot_matches_new_line(options.contains('s'))
            .ignore_whitespace(options.contains('x'))
            .build()
            .map_err(|err| DocumentStoreError::compile(format!("Invalid regular expression: {}", err)))?;

        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            flags: sorted_flags(options),
        })
    }

    pub(crate) fn from_bson(value: &Bson) -> DocumentStoreResult<Option<Self>> {
        match value {
            Bson::RegularExpression(regex) => {
                Self::new(regex.pattern.as_str(), regex.options.as_str()).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn matches(&self, value: &Bson) -> bool {
        match value {
            Bson::RegularExpression(other) => {
                other.pattern.as_str() == self.pattern && sorted_flags(other.options.as_str()) == self.flags
            }
            Bson::String(s) => self.regex.is_match(s),
            _ => false,
        }
    }
}

fn sorted_flags(options: &str) -> String {
    let mut flags: Vec<char> = options.chars().collect();
    flags.sort_unstable();
    flags.dedup();
    flags.into_iter().collect()
}

/// Outcome of an element matcher. `At(i)` is the "fake boolean" reported by `$elemMatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElementMatch {
    No,
    Yes,
    At(usize),
}

impl From<bool> for ElementMatch {
    fn from(matched: bool) -> Self {
        if matched { ElementMatch::Yes } else { ElementMatch::No }
    }
}

/// Predicate over a single (already expanded) value.
#[derive(Debug, Clone)]
pub(crate) enum ElementMatcher {
    Defined,
    Equal(Bson),
    Regex(CompiledRegex),
    /// `None` operand: array operands never satisfy a range.
    Compare(CompareOp, Option<Bson>),
    Mod { divisor: f64, remainder: f64 },
    In(Vec<ElementMatcher>),
    Size(f64),
    Type(f64),
    ElemMatch(Box<ElemMatchSelector>),
}

#[derive(Debug, Clone)]
pub(crate) enum ElemMatchSelector {
    Value(BranchedMatcher),
    Document(DocMatcher),
}

impl ElementMatcher {
    pub(crate) fn equality(operand: &Bson) -> DocumentStoreResult<Self> {
        if is_operator_object(operand, false)? {
            return Err(DocumentStoreError::compile("Can't create equality selector for operator object"));
        }

        Ok(ElementMatcher::Equal(operand.clone()))
    }

    pub(crate) fn range(op: CompareOp, operand: &Bson) -> Self {
        match operand {
            Bson::Array(_) => ElementMatcher::Compare(op, None),
            Bson::Undefined => ElementMatcher::Compare(op, Some(Bson::Null)),
            other => ElementMatcher::Compare(op, Some(other.clone())),
        }
    }

    pub(crate) fn regex(operand: &Bson, options: Option<&Bson>) -> DocumentStoreResult<Self> {
        let source = match operand {
            Bson::String(source) => source.as_str(),
            Bson::RegularExpression(regex) => regex.pattern.as_str(),
            _ => return Err(DocumentStoreError::compile("$regex has to be a string or RegExp")),
        };

        let compiled = match options {
            Some(options) => {
                let options = match options {
                    Bson::String(options) if options.chars().all(|c| matches!(c, 'g' | 'i' | 'm')) => options,
                    _ => {
                        return Err(DocumentStoreError::compile("Only the i, m, and g regexp options are supported"));
                    }
                };

                CompiledRegex::new(source, options)?
            }
            None => match operand {
                Bson::RegularExpression(regex) => CompiledRegex::new(source, regex.options.as_str())?,
                _ => CompiledRegex::new(source, "")?,
            },
        };

        Ok(ElementMatcher::Regex(compiled))
    }

    fn membership(operand: &Bson) -> DocumentStoreResult<Self> {
        let Bson::Array(options) = operand else {
            return Err(DocumentStoreError::compile("$in needs an array"));
        };

        let matchers = options
            .iter()
            .map(|option| {
                if let Some(regex) = CompiledRegex::from_bson(option)? {
                    Ok(ElementMatcher::Regex(regex))
                } else if is_operator_object(option, false)? {
                    Err(DocumentStoreError::compile("cannot nest $ under $in"))
                } else {
                    ElementMatcher::equality(option)
                }
            })
            .collect::<DocumentStoreResult<Vec<_>>>()?;

        Ok(ElementMatcher::In(matchers))
    }

    /// Plain boolean form of [`matches`](Self::matches).
    pub(crate) fn test(&self, value: Option<&Bson>) -> DocumentStoreResult<bool> {
        Ok(self.matches(value)? != ElementMatch::No)
    }

    pub(crate) fn matches(&self, value: Option<&Bson>) -> DocumentStoreResult<ElementMatch> {
        let value = defined(value);

        Ok(match self {
            ElementMatcher::Defined => value.is_some().into(),
            ElementMatcher::Equal(Bson::Null | Bson::Undefined) => {
                matches!(value, None | Some(Bson::Null)).into()
            }
            ElementMatcher::Equal(operand) => value.is_some_and(|v| equals(operand, v)).into(),
            ElementMatcher::Regex(regex) => value.is_some_and(|v| regex.matches(v)).into(),
            ElementMatcher::Compare(_, None) => ElementMatch::No,
            ElementMatcher::Compare(op, Some(operand)) => {
                let value = value.unwrap_or(&Bson::Null);

                if BsonType::of(value).code() != BsonType::of(operand).code() {
                    return Ok(ElementMatch::No);
                }

                op.test(compare(Some(value), Some(operand))?).into()
            }
            ElementMatcher::Mod { divisor, remainder } => value
                .and_then(as_f64)
                .is_some_and(|v| v % divisor == *remainder)
                .into(),
            ElementMatcher::In(options) => {
                let value = Some(value.unwrap_or(&Bson::Null));

                for option in options {
                    if option.matches(value)? != ElementMatch::No {
                        return Ok(ElementMatch::Yes);
                    }
                }

                ElementMatch::No
            }
            ElementMatcher::Size(size) => match value {
                Some(Bson::Array(arr)) => (arr.len() as f64 == *size).into(),
                _ => ElementMatch::No,
            },
            ElementMatcher::Type(code) => value
                .is_some_and(|v| BsonType::of(v).code() as f64 == *code)
                .into(),
            ElementMatcher::ElemMatch(selector) => {
                let Some(Bson::Array(elements)) = value else {
                    return Ok(ElementMatch::No);
                };

                for (i, element) in elements.iter().enumerate() {
                    let result = match selector.as_ref() {
                        ElemMatchSelector::Document(matcher) => {
                            let Some(node) = Node::from_bson(element) else {
                                return Ok(ElementMatch::No);
                            };

                            matcher.matches(node)?
                        }
                        ElemMatchSelector::Value(matcher) => matcher.matches(&[Branch::leaf(element)])?,
                    };

                    if result.result {
                        return Ok(ElementMatch::At(i));
                    }
                }

                ElementMatch::No
            }
        })
    }
}

/// How an element matcher is lifted over a branch set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Expansion {
    dont_expand_leaf_arrays: bool,
    dont_include_leaf_arrays: bool,
}

/// Matcher over the branch set a path resolves to.
#[derive(Debug, Clone)]
pub(crate) enum BranchedMatcher {
    Everything,
    Nothing,
    And(Vec<BranchedMatcher>),
    Invert(Box<BranchedMatcher>),
    Element(ElementMatcher, Expansion),
    Near(NearQuery),
}

impl BranchedMatcher {
    fn element(matcher: ElementMatcher) -> Self {
        BranchedMatcher::Element(matcher, Expansion::default())
    }

    fn invert(matcher: BranchedMatcher) -> Self {
        BranchedMatcher::Invert(Box::new(matcher))
    }

    pub(crate) fn matches(&self, branches: &[Branch<'_>]) -> DocumentStoreResult<MatchResult> {
        match self {
            BranchedMatcher::Everything => Ok(MatchResult::matched()),
            BranchedMatcher::Nothing => Ok(MatchResult::unmatched()),
            BranchedMatcher::And(parts) => and_matchers(parts, |part| part.matches(branches)),
            BranchedMatcher::Invert(inner) => Ok(MatchResult::from_bool(!inner.matches(branches)?.result)),
            BranchedMatcher::Element(matcher, expansion) => {
                let expanded = if expansion.dont_expand_leaf_arrays {
                    branches.to_vec()
                } else {
                    expand_arrays_in_branches(branches.to_vec(), expansion.dont_include_leaf_arrays)
                };

                for branch in expanded {
                    let array_indices = match matcher.matches(branch.value)? {
                        ElementMatch::No => continue,
                        ElementMatch::Yes => branch.array_indices,
                        ElementMatch::At(i) if branch.array_indices.is_empty() => vec![IndexToken::Index(i)],
                        ElementMatch::At(_) => branch.array_indices,
                    };

                    return Ok(MatchResult {
                        result: true,
                        distance: None,
                        array_indices: (!array_indices.is_empty()).then_some(array_indices),
                    });
                }

                Ok(MatchResult::unmatched())
            }
            BranchedMatcher::Near(query) => query.matches(branches),
        }
    }
}

fn is_plain_document(value: &Bson) -> bool {
    matches!(value, Bson::Document(_))
}

pub(crate) fn compile_value_selector(
    selector: &Bson,
    ctx: &mut CompileContext<'_>,
    is_root: bool,
) -> DocumentStoreResult<BranchedMatcher> {
    if let Some(regex) = CompiledRegex::from_bson(selector)? {
        ctx.not_simple();
        return Ok(BranchedMatcher::element(ElementMatcher::Regex(regex)));
    }

    if is_operator_object(selector, false)? {
        if let Bson::Document(operators) = selector {
            return compile_operators(operators, ctx, is_root);
        }
    }

    Ok(BranchedMatcher::element(ElementMatcher::equality(selector)?))
}

fn compile_operators(
    selector: &Document,
    ctx: &mut CompileContext<'_>,
    is_root: bool,
) -> DocumentStoreResult<BranchedMatcher> {
    let mut matchers = Vec::with_capacity(selector.len());

    for (name, operand) in selector {
        let Some(operator) = Operator::parse(name) else {
            return Err(DocumentStoreError::compile(format!("Unrecognized operator: {}", name)));
        };

        let simple_range = operator.compare_op().is_some() && is_number(operand);
        let simple_equality = operator == Operator::Ne && !is_plain_document(operand);
        let simple_inclusion = matches!(operator, Operator::In | Operator::Nin)
            && matches!(operand, Bson::Array(options) if !options.iter().any(is_plain_document));

        if !(operator == Operator::Eq || simple_range || simple_equality || simple_inclusion) {
            ctx.not_simple();
        }

        matchers.push(compile_operator(operator, operand, selector, ctx, is_root)?);
    }

    Ok(match matchers.len() {
        0 => BranchedMatcher::Everything,
        1 => matchers.remove(0),
        _ => BranchedMatcher::And(matchers),
    })
}

fn compile_operator(
    operator: Operator,
    operand: &Bson,
    selector: &Document,
    ctx: &mut CompileContext<'_>,
    is_root: bool,
) -> DocumentStoreResult<BranchedMatcher> {
    Ok(match operator {
        Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
            let Some(op) = operator.compare_op() else {
                return Err(DocumentStoreError::compile("Unrecognized operator"));
            };

            BranchedMatcher::element(ElementMatcher::range(op, operand))
        }
        Operator::Eq => BranchedMatcher::element(ElementMatcher::equality(operand)?),
        Operator::Ne => BranchedMatcher::invert(BranchedMatcher::element(ElementMatcher::equality(operand)?)),
        Operator::In => BranchedMatcher::element(ElementMatcher::membership(operand)?),
        Operator::Nin => BranchedMatcher::invert(BranchedMatcher::element(ElementMatcher::membership(operand)?)),
        Operator::Exists => {
            let exists = BranchedMatcher::element(ElementMatcher::Defined);

            if is_truthy(Some(operand)) {
                exists
            } else {
                BranchedMatcher::invert(exists)
            }
        }
        Operator::Mod => {
            let (divisor, remainder) = match operand {
                Bson::Array(pair) if pair.len() == 2 => match (as_f64(&pair[0]), as_f64(&pair[1])) {
                    (Some(divisor), Some(remainder)) => (divisor, remainder),
                    _ => return Err(DocumentStoreError::compile("argument to $mod must be an array of two numbers")),
                },
                _ => return Err(DocumentStoreError::compile("argument to $mod must be an array of two numbers")),
            };

            BranchedMatcher::element(ElementMatcher::Mod { divisor, remainder })
        }
        Operator::Size => {
            let size = match operand {
                Bson::String(_) => 0.0,
                other => as_f64(other).ok_or_else(|| DocumentStoreError::compile("$size needs a number"))?,
            };

            BranchedMatcher::Element(ElementMatcher::Size(size), Expansion { dont_expand_leaf_arrays: true, ..Expansion::default() })
        }
        Operator::Type => {
            let code = as_f64(operand).ok_or_else(|| DocumentStoreError::compile("$type needs a number"))?;

            BranchedMatcher::Element(ElementMatcher::Type(code), Expansion { dont_include_leaf_arrays: true, ..Expansion::default() })
        }
        Operator::Regex => BranchedMatcher::element(ElementMatcher::regex(operand, selector.get("$options"))?),
        Operator::Options => {
            if !selector.contains_key("$regex") {
                return Err(DocumentStoreError::compile("$options needs a $regex"));
            }

            BranchedMatcher::Everything
        }
        Operator::MaxDistance => {
            if !is_truthy(selector.get("$near")) {
                return Err(DocumentStoreError::compile("$maxDistance needs a $near"));
            }

            BranchedMatcher::Everything
        }
        Operator::ElemMatch => {
            let Bson::Document(sub_selector) = operand else {
                return Err(DocumentStoreError::compile("$elemMatch need an object"));
            };

            let selector = if is_operator_object(operand, true)? {
                ElemMatchSelector::Value(compile_value_selector(operand, ctx, false)?)
            } else {
                ElemMatchSelector::Document(compile_document_selector(sub_selector, ctx, true, false)?)
            };

            BranchedMatcher::Element(
                ElementMatcher::ElemMatch(Box::new(selector)),
                Expansion { dont_expand_leaf_arrays: true, ..Expansion::default() },
            )
        }
        Operator::All => {
            let Bson::Array(criteria) = operand else {
                return Err(DocumentStoreError::compile("$all requires array"));
            };

            if criteria.is_empty() {
                return Ok(BranchedMatcher::Nothing);
            }

            let mut matchers = Vec::with_capacity(criteria.len());

            for criterion in criteria {
                if is_operator_object(criterion, false)? {
                    return Err(DocumentStoreError::compile("no $ expressions in $all"));
                }

                matchers.push(compile_value_selector(criterion, ctx, false)?);
            }

            BranchedMatcher::And(matchers)
        }
        Operator::Near => {
            if !is_root {
                return Err(DocumentStoreError::compile("$near can't be inside another $ operator"));
            }

            ctx.geo_query();
            BranchedMatcher::Near(NearQuery::compile(operand, selector)?)
        }
        Operator::Not => BranchedMatcher::invert(compile_value_selector(operand, ctx, false)?),
    })
}


#[cfg(test)]
mod tests {
    use bson::{doc, Bson, Document};

    use crate::matcher::Matcher;

    fn matches(selector: Document, doc: Document) -> bool {
        Matcher::new(selector).unwrap().document_matches(&doc).unwrap().result
    }

    fn compile_error(selector: Document) -> String {
        match Matcher::new(selector) {
            Err(err) => err.to_string(),
            Ok(_) => panic!("selector compiled"),
        }
    }

    #[test]
    fn test_ranges() {
        assert!(matches(doc! { "a": { "$gt": 1, "$lt": 5 } }, doc! { "a": 3 }));
        assert!(!matches(doc! { "a": { "$gt": 1 } }, doc! { "a": "5" }));
        assert!(matches(doc! { "a": { "$gte": "b" } }, doc! { "a": ["a", "c"] }));
        assert!(!matches(doc! { "a": { "$gt": [1] } }, doc! { "a": [2] }));
        assert!(matches(doc! { "a": { "$lte": Bson::Null } }, doc! { "b": 1 }));
    }

    #[test]
    fn test_ne_and_nin() {
        assert!(matches(doc! { "a": { "$ne": 1 } }, doc! { "a": 2 }));
        assert!(!matches(doc! { "a": { "$ne": 1 } }, doc! { "a": [2, 1] }));
        assert!(matches(doc! { "a": { "$nin": [1, 2] } }, doc! { "a": 3 }));
        assert!(matches(doc! { "a": { "$nin": [1, 2] } }, doc! { "b": 3 }));
    }

    #[test]
    fn test_only_plain_documents_make_inequality_complex() {
        let simple = |selector: Document| Matcher::new(selector).unwrap().is_simple();

        assert!(simple(doc! { "a": { "$ne": [1, 2] } }));
        assert!(simple(doc! { "a": { "$ne": Bson::DateTime(bson::DateTime::from_millis(0)) } }));
        assert!(simple(doc! { "a": { "$in": [[1], "x"] } }));

        assert!(!simple(doc! { "a": { "$ne": { "b": 1 } } }));
        assert!(!simple(doc! { "a": { "$nin": [{ "b": 1 }] } }));
    }

    #[test]
    fn test_in_with_null_matches_missing() {
        assert!(matches(doc! { "a": { "$in": [Bson::Null, 5] } }, doc! { "b": 1 }));
        assert!(!matches(doc! { "a": { "$in": [4, 5] } }, doc! { "b": 1 }));
        assert!(compile_error(doc! { "a": { "$in": 5 } }).contains("$in needs an array"));
        assert!(compile_error(doc! { "a": { "$in": [{ "$gt": 1 }] } }).contains("cannot nest $ under $in"));
    }

    #[test]
    fn test_exists() {
        assert!(matches(doc! { "a": { "$exists": true } }, doc! { "a": Bson::Null }));
        assert!(matches(doc! { "a": { "$exists": false } }, doc! { "b": 1 }));
        assert!(!matches(doc! { "a": { "$exists": 0 } }, doc! { "a": 1 }));
    }

    #[test]
    fn test_mod_size_type() {
        assert!(matches(doc! { "a": { "$mod": [4, 1] } }, doc! { "a": 9 }));
        assert!(!matches(doc! { "a": { "$mod": [4, 1] } }, doc! { "a": "9" }));
        assert!(compile_error(doc! { "a": { "$mod": [4] } }).contains("$mod"));

        assert!(matches(doc! { "a": { "$size": 2 } }, doc! { "a": [1, 2] }));
        assert!(matches(doc! { "a": { "$size": 1 } }, doc! { "a": [[1, 2]] }));
        assert!(!matches(doc! { "a": { "$size": 2 } }, doc! { "a": [[1, 2]] }));
        assert!(compile_error(doc! { "a": { "$size": true } }).contains("$size needs a number"));

        assert!(matches(doc! { "a": { "$type": 2 } }, doc! { "a": "s" }));
        assert!(matches(doc! { "a": { "$type": 2 } }, doc! { "a": [1, "s"] }));
        assert!(!matches(doc! { "a": { "$type": 4 } }, doc! { "a": [1, 2] }));
        assert!(matches(doc! { "a": { "$type": 4 } }, doc! { "a": [[1], 2] }));
    }

    #[test]
    fn test_regex_operator() {
        assert!(matches(doc! { "a": { "$regex": "^ab" } }, doc! { "a": "abc" }));
        assert!(matches(doc! { "a": { "$regex": "^AB", "$options": "i" } }, doc! { "a": "abc" }));
        assert!(!matches(doc! { "a": { "$regex": "^ab" } }, doc! { "a": 5 }));
        assert!(compile_error(doc! { "a": { "$regex": "x", "$options": "s" } }).contains("Only the i, m, and g"));
        assert!(compile_error(doc! { "a": { "$options": "i" } }).contains("$options needs a $regex"));
        assert!(compile_error(doc! { "a": { "$regex": 5 } }).contains("$regex has to be a string"));
    }

    #[test]
    fn test_all() {
        assert!(matches(doc! { "a": { "$all": [1, 2] } }, doc! { "a": [2, 3, 1] }));
        assert!(!matches(doc! { "a": { "$all": [1, 4] } }, doc! { "a": [2, 3, 1] }));
        assert!(!matches(doc! { "a": { "$all": [] } }, doc! { "a": [] }));
        assert!(compile_error(doc! { "a": { "$all": [{ "$gt": 1 }] } }).contains("no $ expressions in $all"));
    }

    #[test]
    fn test_elem_match_forms() {
        assert!(matches(doc! { "a": { "$elemMatch": { "$gt": 2, "$lt": 4 } } }, doc! { "a": [1, 3] }));
        assert!(!matches(doc! { "a": { "$elemMatch": { "$gt": 2, "$lt": 4 } } }, doc! { "a": [1, 5] }));
        assert!(matches(doc! { "a": { "$elemMatch": { "b": 1, "c": 2 } } }, doc! { "a": [{ "b": 1, "c": 2 }] }));
        assert!(!matches(doc! { "a": { "$elemMatch": { "b": 1, "c": 2 } } }, doc! { "a": [{ "b": 1 }, { "c": 2 }] }));
        assert!(compile_error(doc! { "a": { "$elemMatch": 1 } }).contains("$elemMatch need an object"));
    }

    #[test]
    fn test_not() {
        assert!(matches(doc! { "a": { "$not": { "$gt": 5 } } }, doc! { "a": 3 }));
        assert!(!matches(doc! { "a": { "$not": 3 } }, doc! { "a": 3 }));
    }

    #[test]
    fn test_unknown_operator() {
        assert!(compile_error(doc! { "a": { "$foo": 1 } }).contains("Unrecognized operator: $foo"));
        assert!(compile_error(doc! { "a": { "$gt": 1, "b": 1 } }).contains("Inconsistent operator"));
    }
}
