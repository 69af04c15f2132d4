//! First compile phase: flatten the component tree into leaves tagged with
//! the program unit they compile into.
//!
//! Isolated groups open a new unit; everything else, async children
//! included, compiles into the unit of its parent. Leaves are numbered in
//! pre-order, the same order the pass builder walks the tree.

use crate::component::{Blit, Component, Dispatch, Draw, Program, VendorFilter};
use crate::gpu::Gpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeafId(pub usize);

pub(crate) enum LeafNode<'a> {
    Dispatch(&'a Dispatch),
    Draw(&'a Draw),
    Blit(&'a Blit),
    Filter(&'a VendorFilter),
    Callback,
}

pub(crate) struct FlatLeaf<'a> {
    pub unit: UnitId,
    /// Slash-separated labels from the root, for diagnostics.
    pub path: String,
    pub node: LeafNode<'a>,
}

pub(crate) struct FlatUnit<'a> {
    pub label: String,
    pub library: &'a str,
}

pub(crate) struct Flattened<'a> {
    pub units: Vec<FlatUnit<'a>>,
    pub leaves: Vec<FlatLeaf<'a>>,
}

pub(crate) fn flatten<G: Gpu>(program: &Program<G>) -> Flattened<'_> {
    let mut flat = Flattened {
        units: vec![FlatUnit {
            label: "main".to_string(),
            library: &program.library,
        }],
        leaves: Vec::new(),
    };
    walk(&program.root, UnitId(0), "", &mut flat);
    flat
}

fn walk<'a, G: Gpu>(components: &'a [Component<G>], unit: UnitId, prefix: &str, flat: &mut Flattened<'a>) {
    for component in components {
        let path = if prefix.is_empty() {
            component.label().to_string()
        } else {
            format!("{prefix}/{}", component.label())
        };
        let node = match component {
            Component::Dispatch(d) => LeafNode::Dispatch(d),
            Component::Draw(d) => LeafNode::Draw(d),
            Component::Blit(b) => LeafNode::Blit(b),
            Component::VendorFilter(f) => LeafNode::Filter(f),
            Component::ManualCallback(_) => LeafNode::Callback,
            Component::Group(group) => {
                let child_unit = match &group.library {
                    Some(library) => {
                        flat.units.push(FlatUnit {
                            label: path.clone(),
                            library,
                        });
                        UnitId(flat.units.len() - 1)
                    }
                    None => unit,
                };
                walk(&group.children, child_unit, &path, flat);
                continue;
            }
            Component::AsyncGroup(group) => {
                walk(&group.children, unit, &path, flat);
                continue;
            }
        };
        flat.leaves.push(FlatLeaf { unit, path, node });
    }
}
