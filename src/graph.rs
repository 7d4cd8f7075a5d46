//! Cycle detection for the dependency graph.
//!
//! An edge `A -> B` means A depends on B. New edges are checked before they
//! are written with a DFS from the proposed target looking for a path back
//! to the source. Replicas can still merge two independently valid edges
//! into a cycle, so [`find_cycles`] scans the whole graph after pulls and
//! during validation. Cycles found that way are reported, not repaired.
//!
//! Both checks are O(V+E) and iterative, so deep chains cannot overflow the
//! stack.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::event::ItemId;

/// Item -> items it depends on
pub type Adjacency = BTreeMap<ItemId, BTreeSet<ItemId>>;

/// A closed walk through the graph; the first and last items are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cycle {
    pub path: Vec<ItemId>,
}

impl Cycle {
    /// Number of distinct items in the loop
    pub fn len(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &ItemId) -> bool {
        self.path.contains(item)
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.path.iter().map(ItemId::as_str).collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

/// Whether adding `from -> to` would close a cycle.
pub fn would_create_cycle(from: &ItemId, to: &ItemId, adjacency: &Adjacency) -> bool {
    cycle_on_add(from, to, adjacency).is_some()
}

/// The cycle that adding `from -> to` would close, starting and ending at `from`.
pub fn cycle_on_add<'a>(from: &'a ItemId, to: &'a ItemId, adjacency: &'a Adjacency) -> Option<Cycle> {
    if from == to {
        return Some(Cycle {
            path: vec![from.clone(), from.clone()],
        });
    }

    let mut visited: HashSet<&ItemId> = HashSet::from([to]);
    let mut parent: HashMap<&ItemId, &ItemId> = HashMap::new();
    let mut stack = vec![to];

    while let Some(current) = stack.pop() {
        for next in dependencies(adjacency, current) {
            if !visited.insert(next) {
                continue;
            }
            parent.insert(next, current);
            if next == from {
                return Some(Cycle {
                    path: walk_back(from, &parent),
                });
            }
            stack.push(next);
        }
    }
    None
}

/// `from, to, ..., from` from the DFS parent links.
fn walk_back<'a>(from: &'a ItemId, parent: &HashMap<&'a ItemId, &'a ItemId>) -> Vec<ItemId> {
    let mut chain = vec![from.clone()];
    let mut node = from;
    while let Some(&previous) = parent.get(node) {
        chain.push(previous.clone());
        node = previous;
    }
    chain.reverse();

    let mut path = Vec::with_capacity(chain.len() + 1);
    path.push(from.clone());
    path.extend(chain);
    path
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the current DFS path
    Gray,
    /// Fully explored
    Black,
}

type Neighbors<'a> = std::iter::Flatten<std::option::IntoIter<&'a BTreeSet<ItemId>>>;

fn dependencies<'a>(adjacency: &'a Adjacency, item: &ItemId) -> Neighbors<'a> {
    adjacency.get(item).into_iter().flatten()
}

/// Every cycle closed by a back edge, in deterministic order.
pub fn find_cycles(adjacency: &Adjacency) -> Vec<Cycle> {
    let mut color: HashMap<&ItemId, Color> = HashMap::new();
    let mut cycles = Vec::new();

    for root in adjacency.keys() {
        if color.contains_key(root) {
            continue;
        }

        color.insert(root, Color::Gray);
        let mut path: Vec<&ItemId> = vec![root];
        let mut frames: Vec<Neighbors<'_>> = vec![dependencies(adjacency, root)];

        while let Some(frame) = frames.last_mut() {
            match frame.next() {
                Some(next) => match color.get(next) {
                    None => {
                        color.insert(next, Color::Gray);
                        path.push(next);
                        frames.push(dependencies(adjacency, next));
                    }
                    Some(Color::Gray) => {
                        let start = path.iter().position(|node| *node == next).unwrap_or(0);
                        let mut cycle: Vec<ItemId> =
                            path[start..].iter().map(|node| (*node).clone()).collect();
                        cycle.push(next.clone());
                        cycles.push(Cycle { path: cycle });
                    }
                    Some(Color::Black) => {}
                },
                None => {
                    frames.pop();
                    if let Some(done) = path.pop() {
                        color.insert(done, Color::Black);
                    }
                }
            }
        }
    }

    cycles
}
