//! Lazy walk over the dependency forest.
//!
//! Top-level items (nothing needs them) are roots; each node's children are
//! the items it depends on. An item reachable along several paths is
//! emitted once per path, but only its first emission carries the full link
//! lists and is descended into, which keeps the walk finite on cycles.
//! Items only reachable through a cycle are emitted as extra roots at the end.

use std::collections::{BTreeSet, HashSet, VecDeque};

use serde::Serialize;

use crate::aggregate::{Aggregate, AggregateCache};
use crate::error::Result;
use crate::event::ItemId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullLinks {
    pub depends_on: Vec<ItemId>,
    pub provides_to: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub item: Aggregate,
    /// Parent in this walk; `None` for roots
    pub needed_by: Option<ItemId>,
    pub depth: usize,
    /// Present on the first emission of an item only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full: Option<FullLinks>,
}

#[derive(Debug)]
struct Frame {
    item: ItemId,
    needed_by: Option<ItemId>,
    depth: usize,
}

#[derive(Debug)]
pub struct TreeWalk<'a> {
    cache: &'a AggregateCache,
    requested: Vec<ItemId>,
    queue: Option<VecDeque<ItemId>>,
    stack: Vec<Frame>,
    emitted: HashSet<ItemId>,
}

impl<'a> TreeWalk<'a> {
    /// Walk from `roots`, or from every top-level item when empty.
    pub fn new(cache: &'a AggregateCache, roots: Vec<ItemId>) -> Self {
        Self {
            cache,
            requested: roots,
            queue: None,
            stack: Vec::new(),
            emitted: HashSet::new(),
        }
    }

    /// Start over; the next call to `next` yields the first root again.
    pub fn restart(&mut self) {
        self.queue = None;
        self.stack.clear();
        self.emitted.clear();
    }

    fn roots(&self) -> Result<VecDeque<ItemId>> {
        if !self.requested.is_empty() {
            return Ok(self.requested.iter().cloned().collect());
        }

        let items = self.cache.created_items()?;
        let needed: BTreeSet<ItemId> = self
            .cache
            .dependency_adjacency()?
            .into_values()
            .flatten()
            .collect();

        // Top-level items first, then everything again so that items only
        // reachable through a cycle still show up.
        let mut queue: VecDeque<ItemId> = items
            .iter()
            .filter(|item| !needed.contains(*item))
            .cloned()
            .collect();
        queue.extend(items);
        Ok(queue)
    }

    fn next_root(&mut self) -> Option<Frame> {
        let explicit = !self.requested.is_empty();
        let queue = self.queue.as_mut()?;
        while let Some(item) = queue.pop_front() {
            if explicit || !self.emitted.contains(&item) {
                return Some(Frame {
                    item,
                    needed_by: None,
                    depth: 0,
                });
            }
        }
        None
    }

    fn visit(&mut self, frame: Frame) -> Result<Option<TreeNode>> {
        let Some(item) = self.cache.load(&frame.item)? else {
            return Ok(None);
        };

        let first = self.emitted.insert(item.id.clone());
        let full = if first {
            for dependency in item.depends_on.iter().rev() {
                self.stack.push(Frame {
                    item: dependency.clone(),
                    needed_by: Some(item.id.clone()),
                    depth: frame.depth + 1,
                });
            }
            Some(FullLinks {
                depends_on: item.depends_on.iter().cloned().collect(),
                provides_to: item.provides_to.iter().cloned().collect(),
            })
        } else {
            None
        };

        Ok(Some(TreeNode {
            item,
            needed_by: frame.needed_by,
            depth: frame.depth,
            full,
        }))
    }
}

impl Iterator for TreeWalk<'_> {
    type Item = Result<TreeNode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.queue.is_none() {
            match self.roots() {
                Ok(queue) => self.queue = Some(queue),
                Err(err) => {
                    self.queue = Some(VecDeque::new());
                    return Some(Err(err));
                }
            }
        }

        loop {
            let frame = match self.stack.pop() {
                Some(frame) => frame,
                None => self.next_root()?,
            };
            match self.visit(frame) {
                Ok(Some(node)) => return Some(Ok(node)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
