//! Single-or-batch values that keep the caller's arity

use serde::{Deserialize, Serialize};

/// Either one value or a list of values.
///
/// Task calls accept a single text or a list and answer in the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn is_many(&self) -> bool {
        matches!(self, OneOrMany::Many(_))
    }

    pub fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the items as a slice, one element for `One`
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }

    /// Flatten into a list
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }

    /// Put `results` back into the shape of `self`.
    ///
    /// `results` must hold exactly one element per input item.
    pub fn restore<U>(&self, mut results: Vec<U>) -> OneOrMany<U> {
        match self {
            OneOrMany::One(_) => match results.pop() {
                Some(item) if results.is_empty() => OneOrMany::One(item),
                Some(item) => {
                    results.push(item);
                    OneOrMany::Many(results)
                }
                None => OneOrMany::Many(results),
            },
            OneOrMany::Many(_) => OneOrMany::Many(results),
        }
    }

    /// Apply `f` to every item, keeping the shape
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> OneOrMany<U> {
        match self {
            OneOrMany::One(item) => OneOrMany::One(f(item)),
            OneOrMany::Many(items) => OneOrMany::Many(items.into_iter().map(f).collect()),
        }
    }

    /// The single value, if this is `One`
    pub fn into_one(self) -> Option<T> {
        match self {
            OneOrMany::One(item) => Some(item),
            OneOrMany::Many(_) => None,
        }
    }

    /// The list, if this is `Many`
    pub fn into_many(self) -> Option<Vec<T>> {
        match self {
            OneOrMany::One(_) => None,
            OneOrMany::Many(items) => Some(items),
        }
    }
}

impl From<&str> for OneOrMany<String> {
    fn from(text: &str) -> Self {
        OneOrMany::One(text.to_string())
    }
}

impl From<String> for OneOrMany<String> {
    fn from(text: String) -> Self {
        OneOrMany::One(text)
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(items: Vec<T>) -> Self {
        OneOrMany::Many(items)
    }
}

impl From<&[&str]> for OneOrMany<String> {
    fn from(items: &[&str]) -> Self {
        OneOrMany::Many(items.iter().map(|s| s.to_string()).collect())
    }
}
