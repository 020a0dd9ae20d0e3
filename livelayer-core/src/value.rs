//! Classification, ordering and equality of BSON values.
//!
//! Selectors, sort keys and modifiers all reason about values through the helpers in this
//! module instead of inspecting [`Bson`] variants ad hoc. A missing field is represented as
//! `None` ("undefined") and always sorts before any present value; a stored
//! [`Bson::Undefined`] is treated the same way.

use std::cmp::Ordering;
use bson::Bson;

use crate::error::{DocumentStoreError, DocumentStoreResult};


/// The type of a BSON value as seen by the query language.
///
/// [`code`](BsonType::code) is the numeric type code accepted by `$type`, and
/// [`order`](BsonType::order) is the rank used when two values of different types are
/// compared: `null < numbers < strings < objects < arrays < binary < ObjectId < booleans <
/// dates < regex < code`, with `MinKey`/`MaxKey` at the extremes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BsonType {
    Number,
    String,
    Object,
    Array,
    Binary,
    Undefined,
    ObjectId,
    Boolean,
    Date,
    Null,
    Regex,
    DbPointer,
    Code,
    Symbol,
    CodeWithScope,
    Timestamp,
    Decimal128,
    MinKey,
    MaxKey,
}

impl BsonType {
    /// Classifies a value.
    pub fn of(value: &Bson) -> Self {
        match value {
            Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) => BsonType::Number,
            Bson::String(_) => BsonType::String,
            Bson::Document(_) => BsonType::Object,
            Bson::Array(_) => BsonType::Array,
            Bson::Binary(_) => BsonType::Binary,
            Bson::Undefined => BsonType::Undefined,
            Bson::ObjectId(_) => BsonType::ObjectId,
            Bson::Boolean(_) => BsonType::Boolean,
            Bson::DateTime(_) => BsonType::Date,
            Bson::Null => BsonType::Null,
            Bson::RegularExpression(_) => BsonType::Regex,
            Bson::DbPointer(_) => BsonType::DbPointer,
            Bson::JavaScriptCode(_) => BsonType::Code,
            Bson::Symbol(_) => BsonType::Symbol,
            Bson::JavaScriptCodeWithScope(_) => BsonType::CodeWithScope,
            Bson::Timestamp(_) => BsonType::Timestamp,
            Bson::Decimal128(_) => BsonType::Decimal128,
            Bson::MinKey => BsonType::MinKey,
            Bson::MaxKey => BsonType::MaxKey,
        }
    }

    /// Numeric type code, as matched by the `$type` operator.
    pub fn code(self) -> i64 {
        match self {
            BsonType::Number => 1,
            BsonType::String => 2,
            BsonType::Object => 3,
            BsonType::Array => 4,
            BsonType::Binary => 5,
            BsonType::Undefined => 6,
            BsonType::ObjectId => 7,
            BsonType::Boolean => 8,
            BsonType::Date => 9,
            BsonType::Null => 10,
            BsonType::Regex => 11,
            BsonType::DbPointer => 12,
            BsonType::Code => 13,
            BsonType::Symbol => 14,
            BsonType::CodeWithScope => 15,
            BsonType::Timestamp => 17,
            BsonType::Decimal128 => 19,
            BsonType::MinKey => -1,
            BsonType::MaxKey => 127,
        }
    }

    /// Rank of the type in cross-type comparisons.
    pub fn order(self) -> i32 {
        match self {
            BsonType::MinKey => -1,
            BsonType::Null | BsonType::Undefined => 0,
            BsonType::Number | BsonType::Decimal128 => 1,
            BsonType::String | BsonType::Symbol => 2,
            BsonType::Object => 3,
            BsonType::Array => 4,
            BsonType::Binary => 5,
            BsonType::ObjectId => 6,
            BsonType::Boolean => 7,
            BsonType::Date | BsonType::Timestamp => 8,
            BsonType::Regex => 9,
            BsonType::DbPointer => 10,
            BsonType::Code | BsonType::CodeWithScope => 100,
            BsonType::MaxKey => 127,
        }
    }
}

/// Drops stored `undefined` values so callers only deal with `None`.
pub(crate) fn defined(value: Option<&Bson>) -> Option<&Bson> {
    match value {
        Some(Bson::Undefined) | None => None,
        other => other,
    }
}

/// Returns the value as `f64` if it is a number.
pub fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

pub fn is_number(value: &Bson) -> bool {
    matches!(value, Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_))
}

fn compare_numbers(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(a), Some(b)) = (as_i64(a), as_i64(b)) {
        return a.cmp(&b);
    }

    match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

fn flatten(doc: &bson::Document) -> Vec<Bson> {
    doc
        .iter()
        .flat_map(|(k, v)| [Bson::String(k.clone()), v.clone()])
        .collect()
}

fn compare_arrays(a: &[Bson], b: &[Bson]) -> DocumentStoreResult<Ordering> {
    for i in 0.. {
        match (a.get(i), b.get(i)) {
            (None, None) => return Ok(Ordering::Equal),
            (None, Some(_)) => return Ok(Ordering::Less),
            (Some(_), None) => return Ok(Ordering::Greater),
            (Some(x), Some(y)) => {
                let ordering = compare(Some(x), Some(y))?;

                if ordering != Ordering::Equal {
                    return Ok(ordering);
                }
            }
        }
    }

    Ok(Ordering::Equal)
}

/// Compares two values using the document-database ordering.
///
/// `None` (an absent field) is less than every present value. Values of different
/// types compare by [`BsonType::order`]; values of the same type compare structurally.
///
/// # Errors
///
/// Returns [`DocumentStoreError::Evaluation`] when either side is a regular expression or
/// JavaScript code, or when two types share an order but cannot be coerced into each other.
pub fn compare(a: Option<&Bson>, b: Option<&Bson>) -> DocumentStoreResult<Ordering> {
    let (a, b) = match (defined(a), defined(b)) {
        (None, None) => return Ok(Ordering::Equal),
        (None, Some(_)) => return Ok(Ordering::Less),
        (Some(_), None) => return Ok(Ordering::Greater),
        (Some(a), Some(b)) => (a, b),
    };

    let (ta, tb) = (BsonType::of(a), BsonType::of(b));

    if ta.order() != tb.order() {
        return Ok(ta.order().cmp(&tb.order()));
    }

    match (a, b) {
        (Bson::String(x) | Bson::Symbol(x), Bson::String(y) | Bson::Symbol(y)) => {
            return Ok(x.cmp(y));
        }
        _ if ta != tb => {
            return Err(DocumentStoreError::evaluation("Missing type coercion logic in compare"));
        }
        _ => {}
    }

    match (a, b) {
        (Bson::Null, Bson::Null) | (Bson::MinKey, Bson::MinKey) | (Bson::MaxKey, Bson::MaxKey) => {
            Ok(Ordering::Equal)
        }
        _ if ta == BsonType::Number => Ok(compare_numbers(a, b)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Ok(x.to_hex().cmp(&y.to_hex())),
        (Bson::DateTime(x), Bson::DateTime(y)) => Ok(x.timestamp_millis().cmp(&y.timestamp_millis())),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => Ok((x.time, x.increment).cmp(&(y.time, y.increment))),
        (Bson::Document(x), Bson::Document(y)) => compare_arrays(&flatten(x), &flatten(y)),
        (Bson::Array(x), Bson::Array(y)) => compare_arrays(x, y),
        (Bson::Binary(x), Bson::Binary(y)) => Ok(
            x.bytes
                .len()
                .cmp(&y.bytes.len())
                .then_with(|| x.bytes.cmp(&y.bytes))
        ),
        (Bson::Boolean(x), Bson::Boolean(y)) => Ok(x.cmp(y)),
        (Bson::RegularExpression(_), _) => {
            Err(DocumentStoreError::evaluation("Sorting not supported on regular expression"))
        }
        (Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_), _) => {
            Err(DocumentStoreError::evaluation("Sorting not supported on Javascript code"))
        }
        _ => Err(DocumentStoreError::evaluation("Unknown type to sort")),
    }
}

/// Deep, key-order-sensitive equality.
///
/// Numbers are equal by value regardless of their integer or floating-point encoding,
/// and `NaN` equals `NaN`.
pub fn equals(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        _ if is_number(a) && is_number(b) => {
            if let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) {
                return x == y;
            }

            match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
                _ => false,
            }
        }
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .zip(y.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && equals(va, vb))
        }
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(va, vb)| equals(va, vb))
        }
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes == y.bytes,
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => {
            x.pattern.as_str() == y.pattern.as_str() && x.options.as_str() == y.options.as_str()
        }
        _ => a == b,
    }
}

/// Equality over possibly-absent values; two absent values are equal.
pub fn equals_opt(a: Option<&Bson>, b: Option<&Bson>) -> bool {
    match (defined(a), defined(b)) {
        (None, None) => true,
        (Some(x), Some(y)) => equals(x, y),
        _ => false,
    }
}

/// Returns `true` if `value` is a document whose keys all start with `$`.
///
/// The empty document is not an operator object.
///
/// # Errors
///
/// Mixing `$`-prefixed and plain keys is a compile error unless `inconsistent_ok` is set,
/// in which case the value is simply not an operator object.
pub fn is_operator_object(value: &Bson, inconsistent_ok: bool) -> DocumentStoreResult<bool> {
    let Bson::Document(doc) = value else {
        return Ok(false);
    };

    let mut operators: Option<bool> = None;

    for key in doc.keys() {
        let this_is_operator = key.starts_with('$');

        match operators {
            None => operators = Some(this_is_operator),
            Some(seen) if seen != this_is_operator => {
                if !inconsistent_ok {
                    return Err(DocumentStoreError::compile(format!("Inconsistent operator: {}", doc)));
                }

                return Ok(false);
            }
            Some(_) => {}
        }
    }

    Ok(operators.unwrap_or(false))
}

/// Returns `true` for path segments made only of ASCII digits.
pub fn is_numeric_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

/// JavaScript-style truthiness, used by `$exists`, falsy selectors and sort flags.
pub fn is_truthy(value: Option<&Bson>) -> bool {
    match defined(value) {
        None | Some(Bson::Null) => false,
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::String(s)) => !s.is_empty(),
        Some(v) if is_number(v) => as_f64(v).is_some_and(|n| n != 0.0 && !n.is_nan()),
        Some(_) => true,
    }
}

/// Stable sort with a fallible comparator.
///
/// The first comparator error aborts the sort and is returned; the input is consumed
/// either way.
pub fn try_sort_by<T, F>(items: Vec<T>, mut cmp: F) -> DocumentStoreResult<Vec<T>>
where
    F: FnMut(&T, &T) -> DocumentStoreResult<Ordering>,
{
    let mut order: Vec<usize> = (0..items.len()).collect();

    {
        let mut by_index = |a: &usize, b: &usize| cmp(&items[*a], &items[*b]);
        merge_sort(&mut order, &mut by_index)?;
    }

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();

    Ok(
        order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect()
    )
}

fn merge_sort<F>(v: &mut [usize], cmp: &mut F) -> DocumentStoreResult<()>
where
    F: FnMut(&usize, &usize) -> DocumentStoreResult<Ordering>,
{
    if v.len() <= 1 {
        return Ok(());
    }

    let mid = v.len() / 2;
    merge_sort(&mut v[..mid], cmp)?;
    merge_sort(&mut v[mid..], cmp)?;

    let mut merged = Vec::with_capacity(v.len());
    let (mut i, mut j) = (0, mid);

    while i < mid && j < v.len() {
        if cmp(&v[j], &v[i])? == Ordering::Less {
            merged.push(v[j]);
            j += 1;
        } else {
            merged.push(v[i]);
            i += 1;
        }
    }

    merged.extend_from_slice(&v[i..mid]);
    merged.extend_from_slice(&v[j..]);
    v.copy_from_slice(&merged);

    Ok(())
}
