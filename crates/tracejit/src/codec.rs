//! Flattening nested host structures into positional value lists and back.
//!
//! [`flatten`] walks a [`Nested`] depth-first, left to right, collecting leaves and recording
//! everything else in an [`IoDescriptor`]. [`unflatten`] rebuilds the same structure from a
//! list of leaves. Map entries are visited in key order.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ShapeMismatchError;

/// Non-value atom kept verbatim in the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StaticValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Host-side nesting of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested<T> {
    Leaf(T),
    Static(StaticValue),
    Tuple(Vec<Nested<T>>),
    List(Vec<Nested<T>>),
    Map(BTreeMap<String, Nested<T>>),
}

impl<T> Nested<T> {
    pub fn leaf(value: T) -> Self {
        Nested::Leaf(value)
    }

    pub fn tuple(items: impl IntoIterator<Item = Nested<T>>) -> Self {
        Nested::Tuple(items.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Nested<T>>) -> Self {
        Nested::List(items.into_iter().collect())
    }

    /// Number of leaves, counted without flattening.
    pub fn num_leaves(&self) -> usize {
        match self {
            Nested::Leaf(_) => 1,
            Nested::Static(_) => 0,
            Nested::Tuple(items) | Nested::List(items) => items.iter().map(Self::num_leaves).sum(),
            Nested::Map(entries) => entries.values().map(Self::num_leaves).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Layout {
    Leaf,
    Static(StaticValue),
    Tuple(Vec<Layout>),
    List(Vec<Layout>),
    Map(Vec<(String, Layout)>),
}

/// Immutable record of a flattened structure. Cheap to clone and share.
#[derive(Debug, Clone, PartialEq)]
pub struct IoDescriptor {
    layout: Arc<Layout>,
    num_leaves: usize,
}

impl IoDescriptor {
    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// Stable hash of the structure, usable as part of a cache key.
    pub fn fingerprint(&self) -> Option<u64> {
        crate::hashing::fingerprint(self.layout.as_ref())
    }
}

fn describe<T>(node: Nested<T>, leaves: &mut Vec<T>) -> Layout {
    match node {
        Nested::Leaf(value) => {
            leaves.push(value);
            Layout::Leaf
        }
        Nested::Static(value) => Layout::Static(value),
        Nested::Tuple(items) => {
            Layout::Tuple(items.into_iter().map(|item| describe(item, leaves)).collect())
        }
        Nested::List(items) => {
            Layout::List(items.into_iter().map(|item| describe(item, leaves)).collect())
        }
        Nested::Map(entries) => Layout::Map(
            entries
                .into_iter()
                .map(|(key, item)| (key, describe(item, leaves)))
                .collect(),
        ),
    }
}

pub fn flatten<T>(structure: Nested<T>) -> (Vec<T>, IoDescriptor) {
    let mut leaves = Vec::new();
    let layout = describe(structure, &mut leaves);
    let descriptor = IoDescriptor {
        layout: Arc::new(layout),
        num_leaves: leaves.len(),
    };
    (leaves, descriptor)
}

fn rebuild<T>(layout: &Layout, leaves: &mut impl Iterator<Item = T>) -> Option<Nested<T>> {
    Some(match layout {
        Layout::Leaf => Nested::Leaf(leaves.next()?),
        Layout::Static(value) => Nested::Static(value.clone()),
        Layout::Tuple(items) => Nested::Tuple(
            items
                .iter()
                .map(|item| rebuild(item, leaves))
                .collect::<Option<_>>()?,
        ),
        Layout::List(items) => Nested::List(
            items
                .iter()
                .map(|item| rebuild(item, leaves))
                .collect::<Option<_>>()?,
        ),
        Layout::Map(entries) => Nested::Map(
            entries
                .iter()
                .map(|(key, item)| rebuild(item, leaves).map(|value| (key.clone(), value)))
                .collect::<Option<_>>()?,
        ),
    })
}

pub fn unflatten<T>(values: Vec<T>, descriptor: &IoDescriptor) -> Result<Nested<T>, ShapeMismatchError> {
    let mismatch = ShapeMismatchError {
        expected: descriptor.num_leaves,
        actual: values.len(),
    };
    if values.len() != descriptor.num_leaves {
        return Err(mismatch);
    }
    let mut leaves = values.into_iter();
    rebuild(&descriptor.layout, &mut leaves).ok_or(mismatch)
}
