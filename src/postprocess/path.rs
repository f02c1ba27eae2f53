//! Tagged field-path representation with array fan-out.
//!
//! Mapping paths are dot-delimited, with `[]` as a standalone segment that
//! fans the remainder of the path out over every element of an array, e.g.
//! `orders.[].consignee.postalCode`. Paths always end in a field name so a
//! visitor can reach the owning object and add, rewrite, or delete the key.

use serde_json::{Map, Value};

use crate::error::ProcessError;

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A named object field.
    Name(String),
    /// `[]` — apply the rest of the path to every element of an array.
    AnyElement,
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<FieldPath, ProcessError> {
        let bad = |reason: &str| ProcessError::BadPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        if path.trim().is_empty() {
            return Err(bad("empty path"));
        }
        let segments = path
            .split('.')
            .map(|seg| match seg.trim() {
                "" => Err(bad("empty segment")),
                "[]" => Ok(Segment::AnyElement),
                name => Ok(Segment::Name(name.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if matches!(segments.last(), Some(Segment::AnyElement)) {
            return Err(bad("must end in a field name"));
        }
        Ok(FieldPath { segments })
    }

    /// Visit `(owning object, final field name)` for every branch the path
    /// resolves to, fanning out across arrays. Branches that dead-end on a
    /// missing key or a non-object are skipped silently; the callback may
    /// read, rewrite, insert, or remove the named key.
    pub fn for_each_terminal<F>(&self, root: &mut Value, f: &mut F)
    where
        F: FnMut(&mut Map<String, Value>, &str),
    {
        visit(root, &self.segments, f);
    }

    /// Write `value` at the path, descending into the *first* element
    /// wherever the path crosses an array. Missing intermediate objects are
    /// created; a missing or empty intermediate array means nowhere to
    /// write, and the injection is dropped silently.
    pub fn inject_first(&self, root: &mut Value, value: Value) {
        inject(root, &self.segments, value);
    }
}

fn visit<F>(value: &mut Value, segments: &[Segment], f: &mut F)
where
    F: FnMut(&mut Map<String, Value>, &str),
{
    match segments {
        [] => {}
        [Segment::Name(name)] => {
            if let Value::Object(map) = value {
                f(map, name);
            }
        }
        [Segment::Name(name), rest @ ..] => {
            if let Value::Object(map) = value
                && let Some(child) = map.get_mut(name)
            {
                visit(child, rest, f);
            }
        }
        [Segment::AnyElement, rest @ ..] => {
            if let Value::Array(items) = value {
                for item in items {
                    visit(item, rest, f);
                }
            }
        }
    }
}

fn inject(value: &mut Value, segments: &[Segment], new_value: Value) {
    match segments {
        [] => {}
        [Segment::Name(name)] => {
            if let Value::Object(map) = value {
                map.insert(name.clone(), new_value);
            }
        }
        [Segment::Name(name), rest @ ..] => {
            if let Value::Object(map) = value {
                let child = map
                    .entry(name.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                inject(child, rest, new_value);
            }
        }
        [Segment::AnyElement, rest @ ..] => {
            if let Value::Array(items) = value
                && let Some(first) = items.first_mut()
            {
                inject(first, rest, new_value);
            }
        }
    }
}
