use super::symbol::Symbol;
use super::tree::{AggTree, NodeId, ROOT};
use super::types::{compare_scalars, FastMap, Scalar};
use super::view_config::SortDirection;
use smallvec::SmallVec;
use std::cmp::Ordering;

/// Visible rows of a pivoted view: pre-order over expanded nodes, root first.
///
/// Each row keeps the depth it was laid out at, so the rows of a visible
/// subtree are the contiguous run after its root that sits deeper than it.
#[derive(Debug, Default)]
pub struct TreeTraversal {
    rows: Vec<(NodeId, usize)>,
    positions: FastMap<NodeId, usize>,
    walked: usize,
}

impl TreeTraversal {
    pub fn rebuild(&mut self, tree: &AggTree) {
        self.clear();
        self.walked = lay_out(tree, ROOT, &mut self.rows);
        self.reindex(0);
    }

    /// Re-linearize the visible subtrees rooted at `parents`, leaving every
    /// other row where it is. Hidden or pruned parents are skipped and a
    /// parent nested inside another one's subtree is covered by it.
    pub fn relayout(&mut self, tree: &AggTree, parents: impl IntoIterator<Item = NodeId>) {
        let mut spans: Vec<(usize, usize, NodeId)> = parents
            .into_iter()
            .filter(|id| tree.get(*id).is_some())
            .filter_map(|id| self.position(id).map(|start| (start, self.span_end(start), id)))
            .collect();
        spans.sort_unstable();

        let mut chosen: Vec<(usize, usize, NodeId)> = Vec::with_capacity(spans.len());
        for span in spans {
            if chosen.last().map_or(false, |last| span.0 < last.1) {
                continue;
            }
            chosen.push(span);
        }

        self.walked = 0;
        let Some(first) = chosen.first().map(|s| s.0) else {
            return;
        };
        let mut segment = Vec::new();
        for &(start, end, id) in chosen.iter().rev() {
            for (node, _) in &self.rows[start..end] {
                self.positions.remove(node);
            }
            segment.clear();
            self.walked += lay_out(tree, id, &mut segment);
            self.rows.splice(start..end, segment.drain(..));
        }
        self.reindex(first);
    }

    /// One past the last row of the subtree shown at `start`.
    fn span_end(&self, start: usize) -> usize {
        let depth = self.rows[start].1;
        self.rows[start + 1..]
            .iter()
            .position(|(_, d)| *d <= depth)
            .map_or(self.rows.len(), |offset| start + 1 + offset)
    }

    fn reindex(&mut self, from: usize) {
        for (i, (id, _)) in self.rows.iter().enumerate().skip(from) {
            self.positions.insert(*id, i);
        }
    }

    /// Nodes visited by the last rebuild or relayout.
    #[inline]
    pub fn last_walked(&self) -> usize {
        self.walked
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn node_at(&self, row: usize) -> Option<NodeId> {
        self.rows.get(row).map(|(id, _)| *id)
    }

    pub fn position(&self, node: NodeId) -> Option<usize> {
        self.positions.get(&node).copied()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.positions.clear();
        self.walked = 0;
    }
}

fn lay_out(tree: &AggTree, start: NodeId, out: &mut Vec<(NodeId, usize)>) -> usize {
    let before = out.len();
    tree.walk_from(start, |id, node| {
        out.push((id, node.depth));
        node.expanded
    });
    out.len() - before
}

pub type SortKey = SmallVec<[Scalar; 2]>;

#[derive(Clone, Debug)]
struct FlatEntry {
    key: Symbol,
    sort: SortKey,
    ordinal: u64,
}

/// Visible keys of an unpivoted configured view, kept sorted.
///
/// Entries order by the sort values (per-column direction) and then by the
/// master insertion ordinal. A changed key is removed with the sort key it was
/// inserted under and re-inserted at its binary-search position, so unchanged
/// keys are never re-sorted.
#[derive(Debug, Default)]
pub struct FlatTraversal {
    entries: Vec<FlatEntry>,
    index: FastMap<Symbol, (SortKey, u64)>,
    directions: SmallVec<[SortDirection; 2]>,
}

impl FlatTraversal {
    pub fn new(directions: impl IntoIterator<Item = SortDirection>) -> Self {
        Self {
            entries: Vec::new(),
            index: FastMap::default(),
            directions: directions.into_iter().collect(),
        }
    }

    fn compare(&self, a: (&SortKey, u64), b: (&SortKey, u64)) -> Ordering {
        for (i, dir) in self.directions.iter().enumerate() {
            let (x, y) = (a.0.get(i), b.0.get(i));
            let ord = match (x, y) {
                (Some(x), Some(y)) => compare_scalars(x, y),
                _ => Ordering::Equal,
            };
            let ord = match dir {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.1.cmp(&b.1)
    }

    fn search(&self, sort: &SortKey, ordinal: u64) -> usize {
        self.entries
            .partition_point(|e| self.compare((&e.sort, e.ordinal), (sort, ordinal)) == Ordering::Less)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key_at(&self, row: usize) -> Option<Symbol> {
        self.entries.get(row).map(|e| e.key)
    }

    pub fn position(&self, key: Symbol) -> Option<usize> {
        let (sort, ordinal) = self.index.get(&key)?;
        let pos = self.search(sort, *ordinal);
        match self.entries.get(pos) {
            Some(e) if e.key == key => Some(pos),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: Symbol) -> bool {
        let Some(pos) = self.position(key) else {
            return false;
        };
        self.entries.remove(pos);
        self.index.remove(&key);
        true
    }

    /// Insert or move `key` to the position its sort values call for.
    pub fn upsert(&mut self, key: Symbol, sort: SortKey, ordinal: u64) {
        self.remove(key);
        let pos = self.search(&sort, ordinal);
        self.index.insert(key, (sort.clone(), ordinal));
        self.entries.insert(pos, FlatEntry { key, sort, ordinal });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
