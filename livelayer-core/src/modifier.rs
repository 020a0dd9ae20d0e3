//! Update modifiers.
//!
//! A [`Modifier`] is either a full replacement document or a set of update operators
//! (`$set`, `$inc`, `$push`, ...) mapping dotted paths to operands. Modifiers are compiled
//! once and applied to clones, so a failed application never exposes a partially modified
//! document.
//!
//! # Example
//!
//! ```ignore
//! use bson::doc;
//! use livelayer_core::modifier::{ApplyOptions, Modifier};
//!
//! let modifier = Modifier::new(&doc! { "$inc": { "visits": 1 }, "$set": { "seen": true } })?;
//! let updated = modifier.apply(&doc! { "_id": "a", "visits": 1 }, &ApplyOptions::default())?;
//! ```

use std::fmt;
use bson::{Bson, Document};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    lookup::{Branch, IndexToken},
    matcher::{BranchedMatcher, Matcher, compile_element_selector},
    sorter::{SortSpec, Sorter},
    value::{as_f64, compare, equals, equals_opt, is_number, is_numeric_key, is_operator_object, is_truthy, try_sort_by},
};


/// An update operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifierOp {
    Inc,
    Set,
    SetOnInsert,
    Unset,
    Push,
    PushAll,
    AddToSet,
    Pop,
    Pull,
    PullAll,
    Rename,
    Bit,
}

impl ModifierOp {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "$inc" => ModifierOp::Inc,
            "$set" => ModifierOp::Set,
            "$setOnInsert" => ModifierOp::SetOnInsert,
            "$unset" => ModifierOp::Unset,
            "$push" => ModifierOp::Push,
            "$pushAll" => ModifierOp::PushAll,
            "$addToSet" => ModifierOp::AddToSet,
            "$pop" => ModifierOp::Pop,
            "$pull" => ModifierOp::Pull,
            "$pullAll" => ModifierOp::PullAll,
            "$rename" => ModifierOp::Rename,
            "$bit" => ModifierOp::Bit,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModifierOp::Inc => "$inc",
            ModifierOp::Set => "$set",
            ModifierOp::SetOnInsert => "$setOnInsert",
            ModifierOp::Unset => "$unset",
            ModifierOp::Push => "$push",
            ModifierOp::PushAll => "$pushAll",
            ModifierOp::AddToSet => "$addToSet",
            ModifierOp::Pop => "$pop",
            ModifierOp::Pull => "$pull",
            ModifierOp::PullAll => "$pullAll",
            ModifierOp::Rename => "$rename",
            ModifierOp::Bit => "$bit",
        }
    }

    /// Operators that never create missing intermediate paths.
    fn no_create(&self) -> bool {
        matches!(
            self,
            ModifierOp::Unset | ModifierOp::Pop | ModifierOp::Rename | ModifierOp::Pull | ModifierOp::PullAll
        )
    }
}

impl fmt::Display for ModifierOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options for a single modifier application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOptions {
    /// Array indices reported by the selector match; binds the positional `$` segment.
    pub array_indices: Option<Vec<IndexToken>>,
    /// Set when computing a document to insert. Enables `$setOnInsert`.
    pub is_insert: bool,
}

#[derive(Debug, Clone)]
enum PullCondition {
    Value(BranchedMatcher),
    Document(Matcher),
    Equals,
}

/// Ordering applied by `$push` with `$sort`.
#[derive(Debug, Clone)]
enum PushSort {
    /// `$sort: 1` or `$sort: -1` orders the elements themselves.
    Values { ascending: bool },
    /// A sort specification orders document elements by their fields.
    Documents(Sorter),
}

#[derive(Debug, Clone)]
struct FieldUpdate {
    path: String,
    parts: Vec<String>,
    arg: Bson,
    push_sort: Option<PushSort>,
    pull: Option<PullCondition>,
}

#[derive(Debug, Clone)]
enum ModifierKind {
    Replacement(Document),
    Operators(Vec<(ModifierOp, Vec<FieldUpdate>)>),
}

/// A compiled update modifier.
#[derive(Debug, Clone)]
pub struct Modifier {
    kind: ModifierKind,
}

impl Modifier {
    /// Compiles a modifier.
    ///
    /// A specification without `$`-prefixed keys is a replacement document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] for unknown operators, empty or `_id` paths,
    /// empty path segments, non-document operands, dotted replacement keys, and malformed
    /// `$pull` selectors or `$push` sort specifications.
    pub fn new(spec: &Document) -> DocumentStoreResult<Self> {
        let spec_value = Bson::Document(spec.clone());

        if !is_operator_object(&spec_value, false)? {
            if spec.keys().any(|key| key.contains('.')) {
                return Err(DocumentStoreError::compile("When replacing document, field name may not contain '.'"));
            }

            return Ok(Self { kind: ModifierKind::Replacement(spec.clone()) });
        }

        let mut operations = Vec::with_capacity(spec.len());

        for (name, operand) in spec {
            let Some(op) = ModifierOp::parse(name) else {
                return Err(DocumentStoreError::compile(format!("Invalid modifier specified {}", name)));
            };

            let Bson::Document(fields) = operand else {
                return Err(DocumentStoreError::compile(format!("Modifier {} needs an object operand", name)));
            };

            let mut updates = Vec::with_capacity(fields.len());

            for (path, arg) in fields {
                updates.push(compile_field_update(op, path, arg)?);
            }

            operations.push((op, updates));
        }

        Ok(Self { kind: ModifierKind::Operators(operations) })
    }

    /// Compiles a modifier given as an arbitrary value.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Compile`] unless `spec` is a document accepted by
    /// [`Modifier::new`].
    pub fn from_bson(spec: &Bson) -> DocumentStoreResult<Self> {
        match spec {
            Bson::Document(spec) => Self::new(spec),
            _ => Err(DocumentStoreError::compile("Modifier must be an object")),
        }
    }

    pub fn is_replacement(&self) -> bool {
        matches!(self.kind, ModifierKind::Replacement(_))
    }

    /// Applies the modifier to a clone of `doc`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::Modifier`] when a path cannot be traversed, the positional
    /// operator has no binding, an operand does not fit its target, or `$bit` is used. The
    /// input document is never modified.
    pub fn apply(&self, doc: &Document, options: &ApplyOptions) -> DocumentStoreResult<Document> {
        match &self.kind {
            ModifierKind::Replacement(replacement) => {
                if is_truthy(replacement.get("_id")) && !equals_opt(doc.get("_id"), replacement.get("_id")) {
                    return Err(DocumentStoreError::modifier("Cannot change the _id of a document"));
                }

                let mut new_doc = replacement.clone();

                match doc.get("_id") {
                    Some(id) => {
                        new_doc.insert("_id", id.clone());
                    }
                    None => {
                        new_doc.remove("_id");
                    }
                }

                Ok(new_doc)
            }
            ModifierKind::Operators(operations) => {
                let mut new_doc = doc.clone();

                for (op, updates) in operations {
                    let op = match op {
                        ModifierOp::SetOnInsert if !options.is_insert => continue,
                        ModifierOp::SetOnInsert => ModifierOp::Set,
                        other => *other,
                    };

                    for update in updates {
                        apply_update(&mut new_doc, op, update, options)?;
                    }
                }

                Ok(new_doc)
            }
        }
    }
}

fn compile_field_update(op: ModifierOp, path: &str, arg: &Bson) -> DocumentStoreResult<FieldUpdate> {
    if path.is_empty() {
        return Err(DocumentStoreError::compile("An empty update path is not valid."));
    }

    if path == "_id" {
        return Err(DocumentStoreError::compile("Mod on _id not allowed"));
    }

    let parts: Vec<String> = path.split('.').map(str::to_string).collect();

    if parts.iter().any(String::is_empty) {
        return Err(DocumentStoreError::compile(format!(
            "The update path '{}' contains an empty field name, which is not allowed.",
            path
        )));
    }

    let push_sort = match (op, arg) {
        (ModifierOp::Push, Bson::Document(push)) if is_truthy(push.get("$each")) && is_truthy(push.get("$sort")) => {
            match push.get("$sort") {
                Some(direction) if is_number(direction) => Some(PushSort::Values {
                    ascending: as_f64(direction).is_some_and(|n| n >= 0.0),
                }),
                Some(spec) => Some(PushSort::Documents(Sorter::new(SortSpec::parse(spec)?)?)),
                None => None,
            }
        }
        _ => None,
    };

    let pull = match (op, arg) {
        (ModifierOp::Pull, Bson::Document(selector)) => {
            if is_operator_object(arg, false)? {
                Some(PullCondition::Value(compile_element_selector(arg)?))
            } else {
                Some(PullCondition::Document(Matcher::new(selector.clone())?))
            }
        }
        (ModifierOp::Pull, _) => Some(PullCondition::Equals),
        _ => None,
    };

    Ok(FieldUpdate {
        path: path.to_string(),
        parts,
        arg: arg.clone(),
        push_sort,
        pull,
    })
}

/// A container a modifier writes into.
enum Container<'a> {
    Doc(&'a mut Document),
    Array(&'a mut Vec<Bson>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldKey {
    Name(String),
    Index(usize),
}

enum Target<'a> {
    Found(Container<'a>, FieldKey),
    Missing,
    ThroughArray,
}

#[derive(Debug, Clone, Copy)]
struct TargetOptions<'o> {
    no_create: bool,
    forbid_array: bool,
    array_indices: Option<&'o [IndexToken]>,
}

impl Container<'_> {
    fn get(&self, key: &FieldKey) -> Option<&Bson> {
        match (self, key) {
            (Container::Doc(doc), FieldKey::Name(name)) => doc.get(name),
            (Container::Array(arr), FieldKey::Index(index)) => arr.get(*index),
            _ => None,
        }
    }

    fn get_mut(&mut self, key: &FieldKey) -> Option<&mut Bson> {
        match (self, key) {
            (Container::Doc(doc), FieldKey::Name(name)) => doc.get_mut(name),
            (Container::Array(arr), FieldKey::Index(index)) => arr.get_mut(*index),
            _ => None,
        }
    }

    /// Writes a value. Array targets are padded to the index during target lookup, so an
    /// index equal to the length appends.
    fn set(&mut self, key: &FieldKey, value: Bson) {
        match (self, key) {
            (Container::Doc(doc), FieldKey::Name(name)) => {
                doc.insert(name.clone(), value);
            }
            (Container::Array(arr), FieldKey::Index(index)) => {
                while arr.len() <= *index {
                    arr.push(Bson::Null);
                }

                arr[*index] = value;
            }
            _ => {}
        }
    }

    fn unset(&mut self, key: &FieldKey) {
        match (self, key) {
            (Container::Doc(doc), FieldKey::Name(name)) => {
                doc.remove(name);
            }
            (Container::Array(arr), FieldKey::Index(index)) => {
                if let Some(slot) = arr.get_mut(*index) {
                    *slot = Bson::Null;
                }
            }
            _ => {}
        }
    }

    fn take(&mut self, key: &FieldKey) -> Option<Bson> {
        match (self, key) {
            (Container::Doc(doc), FieldKey::Name(name)) => doc.remove(name),
            (Container::Array(arr), FieldKey::Index(index)) => {
                arr.get_mut(*index).map(|slot| std::mem::replace(slot, Bson::Null))
            }
            _ => None,
        }
    }
}

/// Walks `parts`, creating intermediate documents as needed (unless `no_create`), and
/// returns the container holding the last segment.
fn find_mod_target<'a>(
    container: Container<'a>,
    parts: &[String],
    options: TargetOptions<'_>,
    used_positional: bool,
) -> DocumentStoreResult<Target<'a>> {
    let Some((part, rest)) = parts.split_first() else {
        return Ok(Target::Missing);
    };

    let last = rest.is_empty();

    match container {
        Container::Array(arr) => {
            if options.forbid_array {
                return Ok(Target::ThroughArray);
            }

            let (index, used_positional) = if part == "$" {
                if used_positional {
                    return Err(DocumentStoreError::modifier("Too many positional (i.e. '$') elements"));
                }

                let bound = options
                    .array_indices
                    .and_then(|indices| indices.first())
                    .and_then(IndexToken::as_index);

                match bound {
                    Some(index) => (index, true),
                    None => {
                        return Err(DocumentStoreError::modifier(
                            "The positional operator did not find the match needed from the query",
                        ));
                    }
                }
            } else if is_numeric_key(part) {
                match part.parse::<usize>() {
                    Ok(index) => (index, used_positional),
                    Err(_) => {
                        return Err(DocumentStoreError::modifier(format!("array index out of range: {}", part)));
                    }
                }
            } else {
                if options.no_create {
                    return Ok(Target::Missing);
                }

                return Err(DocumentStoreError::modifier(format!(
                    "can't append to array using string field name [{}]",
                    part
                )));
            };

            if options.no_create && index >= arr.len() {
                return Ok(Target::Missing);
            }

            while arr.len() < index {
                arr.push(Bson::Null);
            }

            if last {
                return Ok(Target::Found(Container::Array(arr), FieldKey::Index(index)));
            }

            if arr.len() == index {
                arr.push(Bson::Document(Document::new()));
            } else if !matches!(arr[index], Bson::Null | Bson::Document(_) | Bson::Array(_)) {
                return Err(DocumentStoreError::modifier(format!(
                    "can't modify field '{}' of list value {}",
                    rest[0], arr[index]
                )));
            }

            descend(&mut arr[index], rest, options, used_positional)
        }
        Container::Doc(doc) => {
            if part.starts_with('$') {
                return Err(DocumentStoreError::modifier(format!("can't set field named {}", part)));
            }

            if !doc.contains_key(part) {
                if options.no_create {
                    return Ok(Target::Missing);
                }

                if !last {
                    doc.insert(part.clone(), Document::new());
                }
            }

            if last {
                return Ok(Target::Found(Container::Doc(doc), FieldKey::Name(part.clone())));
            }

            match doc.get_mut(part) {
                Some(child) => descend(child, rest, options, used_positional),
                None => Ok(Target::Missing),
            }
        }
    }
}

fn descend<'a>(
    value: &'a mut Bson,
    rest: &[String],
    options: TargetOptions<'_>,
    used_positional: bool,
) -> DocumentStoreResult<Target<'a>> {
    match value {
        Bson::Document(doc) => find_mod_target(Container::Doc(doc), rest, options, used_positional),
        Bson::Array(arr) => find_mod_target(Container::Array(arr), rest, options, used_positional),
        other => {
            if options.no_create {
                return Ok(Target::Missing);
            }

            Err(DocumentStoreError::modifier(format!(
                "cannot use the part '{}' to traverse {}",
                rest[0], other
            )))
        }
    }
}

fn apply_update(
    doc: &mut Document,
    op: ModifierOp,
    update: &FieldUpdate,
    options: &ApplyOptions,
) -> DocumentStoreResult<()> {
    let target_options = TargetOptions {
        no_create: op.no_create(),
        forbid_array: op == ModifierOp::Rename,
        array_indices: options.array_indices.as_deref(),
    };

    if op == ModifierOp::Rename {
        return apply_rename(doc, update, target_options);
    }

    let (mut container, key) = match find_mod_target(Container::Doc(doc), &update.parts, target_options, false)? {
        Target::Found(container, key) => (container, key),
        Target::Missing | Target::ThroughArray => return Ok(()),
    };

    let arg = &update.arg;

    match op {
        ModifierOp::Inc => {
            if !is_number(arg) {
                return Err(DocumentStoreError::modifier("Modifier $inc allowed for numbers only"));
            }

            let value = match container.get(&key) {
                Some(current) if is_number(current) => add_numbers(current, arg),
                Some(_) => return Err(DocumentStoreError::modifier("Cannot apply $inc modifier to non-number")),
                None => arg.clone(),
            };

            container.set(&key, value);
        }
        ModifierOp::Set | ModifierOp::SetOnInsert => container.set(&key, arg.clone()),
        ModifierOp::Unset => container.unset(&key),
        ModifierOp::Push => {
            if container.get(&key).is_none() {
                container.set(&key, Bson::Array(Vec::new()));
            }

            let Some(Bson::Array(values)) = container.get_mut(&key) else {
                return Err(DocumentStoreError::modifier("Cannot apply $push modifier to non-array"));
            };

            push(values, arg, update.push_sort.as_ref())?;
        }
        ModifierOp::PushAll => {
            let Bson::Array(additions) = arg else {
                return Err(DocumentStoreError::modifier("Modifier $pushAll/pullAll allowed for arrays only"));
            };

            match container.get_mut(&key) {
                None => container.set(&key, arg.clone()),
                Some(Bson::Array(values)) => values.extend(additions.iter().cloned()),
                Some(_) => return Err(DocumentStoreError::modifier("Cannot apply $pushAll modifier to non-array")),
            }
        }
        ModifierOp::AddToSet => {
            let is_each = matches!(arg, Bson::Document(spec) if spec.keys().next().is_some_and(|k| k == "$each"));

            let additions = if is_each {
                match arg.as_document().and_then(|spec| spec.get("$each")) {
                    Some(Bson::Array(each)) => each.clone(),
                    _ => return Err(DocumentStoreError::modifier("$each must be an array")),
                }
            } else {
                vec![arg.clone()]
            };

            match container.get_mut(&key) {
                None => container.set(&key, Bson::Array(additions)),
                Some(Bson::Array(values)) => {
                    for addition in additions {
                        if !values.iter().any(|existing| equals(&addition, existing)) {
                            values.push(addition);
                        }
                    }
                }
                Some(_) => return Err(DocumentStoreError::modifier("Cannot apply $addToSet modifier to non-array")),
            }
        }
        ModifierOp::Pop => match container.get_mut(&key) {
            None => {}
            Some(Bson::Array(values)) => {
                if as_f64(arg).is_some_and(|n| n < 0.0) {
                    if !values.is_empty() {
                        values.remove(0);
                    }
                } else {
                    values.pop();
                }
            }
            Some(_) => return Err(DocumentStoreError::modifier("Cannot apply $pop modifier to non-array")),
        },
        ModifierOp::Pull => match container.get_mut(&key) {
            None => {}
            Some(Bson::Array(values)) => {
                let condition = update.pull.as_ref();
                let mut kept = Vec::with_capacity(values.len());

                for value in values.drain(..) {
                    if !pull_matches(condition, &value, arg)? {
                        kept.push(value);
                    }
                }

                *values = kept;
            }
            Some(_) => return Err(DocumentStoreError::modifier("Cannot apply $pull/pullAll modifier to non-array")),
        },
        ModifierOp::PullAll => {
            let Bson::Array(removals) = arg else {
                return Err(DocumentStoreError::modifier("Modifier $pushAll/pullAll allowed for arrays only"));
            };

            match container.get_mut(&key) {
                None => {}
                Some(Bson::Array(values)) => {
                    values.retain(|value| !removals.iter().any(|removal| equals(value, removal)));
                }
                Some(_) => {
                    return Err(DocumentStoreError::modifier("Cannot apply $pull/pullAll modifier to non-array"));
                }
            }
        }
        ModifierOp::Bit => return Err(DocumentStoreError::modifier("$bit is not supported")),
        ModifierOp::Rename => {}
    }

    Ok(())
}

fn apply_rename(doc: &mut Document, update: &FieldUpdate, options: TargetOptions<'_>) -> DocumentStoreResult<()> {
    let destination = match &update.arg {
        Bson::String(destination) if *destination == update.path => {
            return Err(DocumentStoreError::modifier("$rename source must differ from target"));
        }
        Bson::String(destination) => destination.clone(),
        _ => return Err(DocumentStoreError::modifier("$rename target must be a string")),
    };

    let value = match find_mod_target(Container::Doc(doc), &update.parts, options, false)? {
        Target::ThroughArray => return Err(DocumentStoreError::modifier("$rename source field invalid")),
        Target::Missing => return Ok(()),
        Target::Found(mut container, key) => container.take(&key),
    };

    let Some(value) = value else {
        return Ok(());
    };

    let parts: Vec<String> = destination.split('.').map(str::to_string).collect();
    let destination_options = TargetOptions { no_create: false, forbid_array: true, array_indices: None };

    match find_mod_target(Container::Doc(doc), &parts, destination_options, false)? {
        Target::Found(mut container, key) => {
            container.set(&key, value);
            Ok(())
        }
        Target::ThroughArray | Target::Missing => Err(DocumentStoreError::modifier("$rename target field invalid")),
    }
}

/// Adds two numbers, keeping integer encodings while the result fits.
fn add_numbers(current: &Bson, delta: &Bson) -> Bson {
    match (current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Bson::Int32(sum),
            None => Bson::Int64(*a as i64 + *b as i64),
        },
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let a = integer(current);
            let b = integer(delta);

            match a.checked_add(b) {
                Some(sum) => Bson::Int64(sum),
                None => Bson::Double(a as f64 + b as f64),
            }
        }
        _ => Bson::Double(as_f64(current).unwrap_or(0.0) + as_f64(delta).unwrap_or(0.0)),
    }
}

fn integer(value: &Bson) -> i64 {
    match value {
        Bson::Int32(v) => *v as i64,
        Bson::Int64(v) => *v,
        _ => 0,
    }
}

fn push(values: &mut Vec<Bson>, arg: &Bson, sort: Option<&PushSort>) -> DocumentStoreResult<()> {
    let spec = match arg {
        Bson::Document(spec) if is_truthy(spec.get("$each")) => spec,
        _ => {
            values.push(arg.clone());
            return Ok(());
        }
    };

    let Some(Bson::Array(each)) = spec.get("$each") else {
        return Err(DocumentStoreError::modifier("$each must be an array"));
    };

    let position = match spec.get("$position") {
        None => None,
        Some(position) => match as_f64(position) {
            None => return Err(DocumentStoreError::modifier("$position must be a numeric value")),
            Some(n) if n < 0.0 => {
                return Err(DocumentStoreError::modifier("$position in $push must be zero or positive"));
            }
            Some(n) => Some(n as usize),
        },
    };

    let slice = match spec.get("$slice") {
        None => None,
        Some(slice) => match as_f64(slice) {
            None => return Err(DocumentStoreError::modifier("$slice must be a numeric value")),
            Some(n) if n > 0.0 => return Err(DocumentStoreError::modifier("$slice in $push must be zero or negative")),
            Some(n) => Some(n as i64),
        },
    };

    if let Some(sort) = sort {
        if slice.is_none() {
            return Err(DocumentStoreError::modifier("$sort requires $slice to be present"));
        }

        if matches!(sort, PushSort::Documents(_)) && !each.iter().all(|value| matches!(value, Bson::Document(_))) {
            return Err(DocumentStoreError::modifier(
                "$push like modifiers using $sort require all elements to be objects",
            ));
        }
    }

    match position {
        None => values.extend(each.iter().cloned()),
        Some(position) => {
            let at = position.min(values.len());
            values.splice(at..at, each.iter().cloned());
        }
    }

    match sort {
        Some(PushSort::Values { ascending }) => {
            let current = std::mem::take(values);
            *values = try_sort_by(current, |a, b| {
                let ordering = compare(Some(a), Some(b))?;
                Ok(if *ascending { ordering } else { ordering.reverse() })
            })?;
        }
        Some(PushSort::Documents(sorter)) => {
            let empty = Document::new();
            let as_doc = |value: &Bson| -> Document {
                match value {
                    Bson::Document(doc) => doc.clone(),
                    _ => empty.clone(),
                }
            };

            let current = std::mem::take(values);
            *values = try_sort_by(current, |a, b| sorter.compare(&as_doc(a), &as_doc(b)))?;
        }
        None => {}
    }

    if let Some(slice) = slice {
        let keep = slice.unsigned_abs() as usize;

        if keep == 0 {
            values.clear();
        } else if values.len() > keep {
            values.drain(..values.len() - keep);
        }
    }

    Ok(())
}

fn pull_matches(condition: Option<&PullCondition>, value: &Bson, arg: &Bson) -> DocumentStoreResult<bool> {
    match condition {
        Some(PullCondition::Value(matcher)) => {
            let branch = Branch { value: Some(value), array_indices: Vec::new(), dont_iterate: false };
            Ok(matcher.matches(&[branch])?.result)
        }
        Some(PullCondition::Document(matcher)) => match value {
            Bson::Document(doc) => Ok(matcher.document_matches(doc)?.result),
            _ => Ok(matcher.document_matches(&Document::new())?.result),
        },
        Some(PullCondition::Equals) | None => Ok(equals(value, arg)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use proptest::prelude::*;

    fn apply(doc: Document, modifier: Document) -> DocumentStoreResult<Document> {
        Modifier::new(&modifier)?.apply(&doc, &ApplyOptions::default())
    }

    #[test]
    fn test_set_creates_intermediate_documents() {
        let updated = apply(doc! { "_id": 1 }, doc! { "$set": { "a.b.c": 5 } }).unwrap();
        assert_eq!(updated, doc! { "_id": 1, "a": { "b": { "c": 5 } } });
    }

    #[test]
    fn test_numeric_segments_pad_arrays() {
        let updated = apply(doc! { "a": [1] }, doc! { "$set": { "a.3": 4 } }).unwrap();
        assert_eq!(updated, doc! { "a": [1, Bson::Null, Bson::Null, 4] });

        let nested = apply(doc! { "a": [] }, doc! { "$set": { "a.0.b": 1 } }).unwrap();
        assert_eq!(nested, doc! { "a": [{ "b": 1 }] });

        let err = apply(doc! { "a": [] }, doc! { "$set": { "a.b": 1 } }).unwrap_err();
        assert!(matches!(err, DocumentStoreError::Modifier(_)));
    }

    #[test]
    fn test_traversing_scalar_fails() {
        let err = apply(doc! { "a": 5 }, doc! { "$set": { "a.b": 1 } }).unwrap_err();
        assert_eq!(err, DocumentStoreError::Modifier("cannot use the part 'b' to traverse 5".into()));
    }

    #[test]
    fn test_inc_keeps_integer_types() {
        let updated = apply(doc! { "n": 1 }, doc! { "$inc": { "n": 2, "m": 1.5 } }).unwrap();
        assert_eq!(updated, doc! { "n": 3, "m": 1.5 });

        let widened = apply(doc! { "n": i32::MAX }, doc! { "$inc": { "n": 1 } }).unwrap();
        assert_eq!(widened.get("n"), Some(&Bson::Int64(i32::MAX as i64 + 1)));

        assert!(apply(doc! { "n": "x" }, doc! { "$inc": { "n": 1 } }).is_err());
        assert!(apply(doc! { "n": 1 }, doc! { "$inc": { "n": "x" } }).is_err());
    }

    #[test]
    fn test_unset_nulls_array_elements() {
        let updated = apply(doc! { "a": [1, 2], "b": 1 }, doc! { "$unset": { "a.0": "", "b": "", "c.d": "" } }).unwrap();
        assert_eq!(updated, doc! { "a": [Bson::Null, 2] });
    }

    #[test]
    fn test_push_each_sort_slice() {
        let updated = apply(
            doc! { "_id": 1 },
            doc! { "$push": { "a": { "$each": [3, 1, 2], "$sort": 1, "$slice": -2 } } },
        )
        .unwrap();
        assert_eq!(updated, doc! { "_id": 1, "a": [2, 3] });

        let unsorted = apply(doc! { "a": [] }, doc! { "$push": { "a": { "$each": [3, 1, 2], "$slice": -2 } } }).unwrap();
        assert_eq!(unsorted, doc! { "a": [1, 2] });

        let sorted = apply(
            doc! { "_id": 1, "a": [{ "s": 5 }] },
            doc! { "$push": { "a": { "$each": [{ "s": 3 }, { "s": 1 }], "$sort": { "s": 1 }, "$slice": -2 } } },
        )
        .unwrap();
        assert_eq!(sorted, doc! { "_id": 1, "a": [{ "s": 3 }, { "s": 5 }] });

        let positioned = apply(doc! { "a": [1, 4] }, doc! { "$push": { "a": { "$each": [2, 3], "$position": 1 } } }).unwrap();
        assert_eq!(positioned, doc! { "a": [1, 2, 3, 4] });
    }

    #[test]
    fn test_push_argument_errors() {
        let cases = [
            doc! { "$push": { "a": { "$each": 5 } } },
            doc! { "$push": { "a": { "$each": [1], "$slice": 1 } } },
            doc! { "$push": { "a": { "$each": [1], "$position": -1 } } },
            doc! { "$push": { "a": { "$each": [{ "s": 1 }], "$sort": { "s": 1 } } } },
            doc! { "$push": { "a": { "$each": [1], "$sort": { "s": 1 }, "$slice": -1 } } },
        ];

        for modifier in cases {
            assert!(apply(doc! {}, modifier.clone()).is_err(), "{}", modifier);
        }

        assert!(apply(doc! { "a": 1 }, doc! { "$push": { "a": 2 } }).is_err());
    }

    #[test]
    fn test_add_to_set_deduplicates() {
        let updated = apply(doc! { "a": [1, 2] }, doc! { "$addToSet": { "a": { "$each": [2, 3, 3] } } }).unwrap();
        assert_eq!(updated, doc! { "a": [1, 2, 3] });

        let created = apply(doc! {}, doc! { "$addToSet": { "a": 1 } }).unwrap();
        assert_eq!(created, doc! { "a": [1] });
    }

    #[test]
    fn test_pop_and_push_all() {
        let front = apply(doc! { "a": [1, 2, 3] }, doc! { "$pop": { "a": -1 } }).unwrap();
        assert_eq!(front, doc! { "a": [2, 3] });

        let back = apply(doc! { "a": [1, 2, 3] }, doc! { "$pop": { "a": 1 } }).unwrap();
        assert_eq!(back, doc! { "a": [1, 2] });

        let appended = apply(doc! { "a": [1] }, doc! { "$pushAll": { "a": [2, 3] } }).unwrap();
        assert_eq!(appended, doc! { "a": [1, 2, 3] });
    }

    #[test]
    fn test_pull_forms() {
        let by_value = apply(doc! { "a": [1, 2, 1] }, doc! { "$pull": { "a": 1 } }).unwrap();
        assert_eq!(by_value, doc! { "a": [2] });

        let by_operator = apply(doc! { "a": [1, 5, 9] }, doc! { "$pull": { "a": { "$gt": 4 } } }).unwrap();
        assert_eq!(by_operator, doc! { "a": [1] });

        let by_selector = apply(
            doc! { "a": [{ "x": 1 }, { "x": 2 }, 3] },
            doc! { "$pull": { "a": { "x": 2 } } },
        )
        .unwrap();
        assert_eq!(by_selector, doc! { "a": [{ "x": 1 }, 3] });

        let all = apply(doc! { "a": [1, 2, 3, 2] }, doc! { "$pullAll": { "a": [2, 3] } }).unwrap();
        assert_eq!(all, doc! { "a": [1] });
    }

    #[test]
    fn test_pull_selector_treats_scalars_as_empty_documents() {
        let updated = apply(
            doc! { "a": [1, { "x": 1 }, { "y": 2 }] },
            doc! { "$pull": { "a": { "x": Bson::Null } } },
        )
        .unwrap();
        assert_eq!(updated, doc! { "a": [{ "x": 1 }] });
    }

    #[test]
    fn test_rename() {
        let updated = apply(doc! { "a": { "b": 1 }, "c": 2 }, doc! { "$rename": { "a.b": "d.e" } }).unwrap();
        assert_eq!(updated, doc! { "a": {}, "c": 2, "d": { "e": 1 } });

        assert!(apply(doc! { "a": 1 }, doc! { "$rename": { "a": "a" } }).is_err());
        assert!(apply(doc! { "a": [{ "b": 1 }] }, doc! { "$rename": { "a.0.b": "c" } }).is_err());
        assert_eq!(apply(doc! { "c": 1 }, doc! { "$rename": { "a": "b" } }).unwrap(), doc! { "c": 1 });
    }

    #[test]
    fn test_positional_operator() {
        let modifier = Modifier::new(&doc! { "$set": { "a.$.x": 0 } }).unwrap();
        let options = ApplyOptions {
            array_indices: Some(vec![IndexToken::Index(1)]),
            is_insert: false,
        };

        let updated = modifier.apply(&doc! { "a": [{ "x": 1 }, { "x": 9 }] }, &options).unwrap();
        assert_eq!(updated, doc! { "a": [{ "x": 1 }, { "x": 0 }] });

        let unbound = modifier.apply(&doc! { "a": [{ "x": 1 }] }, &ApplyOptions::default());
        assert!(unbound.is_err());

        let twice = Modifier::new(&doc! { "$set": { "a.$.b.$": 0 } })
            .unwrap()
            .apply(&doc! { "a": [{ "b": [1] }, { "b": [2] }] }, &options);
        assert_eq!(
            twice,
            Err(DocumentStoreError::Modifier("Too many positional (i.e. '$') elements".into()))
        );
    }

    #[test]
    fn test_set_on_insert() {
        let modifier = Modifier::new(&doc! { "$setOnInsert": { "a.b": 1 } }).unwrap();

        assert_eq!(modifier.apply(&doc! {}, &ApplyOptions::default()).unwrap(), doc! {});

        let insert = ApplyOptions { is_insert: true, ..Default::default() };
        assert_eq!(modifier.apply(&doc! {}, &insert).unwrap(), doc! { "a": { "b": 1 } });
    }

    #[test]
    fn test_replacement() {
        let modifier = Modifier::new(&doc! { "name": "new" }).unwrap();
        assert!(modifier.is_replacement());

        let replaced = modifier.apply(&doc! { "_id": 7, "name": "old", "x": 1 }, &ApplyOptions::default()).unwrap();
        assert_eq!(replaced, doc! { "name": "new", "_id": 7 });

        let changed_id = Modifier::new(&doc! { "_id": 8 }).unwrap().apply(&doc! { "_id": 7 }, &ApplyOptions::default());
        assert!(changed_id.is_err());

        assert!(Modifier::new(&doc! { "a.b": 1 }).is_err());
    }

    #[test]
    fn test_compile_errors() {
        let cases = [
            doc! { "$frobnicate": { "a": 1 } },
            doc! { "$set": { "": 1 } },
            doc! { "$set": { "_id": 1 } },
            doc! { "$set": { "a..b": 1 } },
            doc! { "$set": 5 },
            doc! { "$set": { "a": 1 }, "b": 2 },
        ];

        for modifier in cases {
            assert!(matches!(Modifier::new(&modifier), Err(DocumentStoreError::Compile(_))), "{}", modifier);
        }

        assert!(Modifier::from_bson(&Bson::Int32(1)).is_err());
    }

    #[test]
    fn test_bit_is_unsupported() {
        let err = apply(doc! { "a": 1 }, doc! { "$bit": { "a": { "and": 1 } } }).unwrap_err();
        assert_eq!(err, DocumentStoreError::Modifier("$bit is not supported".into()));
    }

    #[test]
    fn test_source_is_untouched_on_failure() {
        let source = doc! { "a": 1, "b": "x" };
        let modifier = Modifier::new(&doc! { "$set": { "a": 2 }, "$inc": { "b": 1 } }).unwrap();

        assert!(modifier.apply(&source, &ApplyOptions::default()).is_err());
        assert_eq!(source, doc! { "a": 1, "b": "x" });
    }

    proptest! {
        #[test]
        fn prop_set_then_unset_restores_document(
            field in "[a-z]{1,6}",
            value in any::<i64>(),
        ) {
            let original = doc! { "_id": "fixed", "existing": 1 };
            prop_assume!(field != "existing");

            let mut set = Document::new();
            set.insert(field.clone(), value);
            let mut unset = Document::new();
            unset.insert(field, "");

            let with_field = apply(original.clone(), doc! { "$set": set }).unwrap();
            let restored = apply(with_field, doc! { "$unset": unset }).unwrap();

            prop_assert_eq!(restored, original);
        }
    }
}
