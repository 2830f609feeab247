//! Decisions taken while walking down the tree to remove a key.
//!
//! Removal never backtracks: before entering a child it makes sure the child
//! can lose a key, by borrowing from a sibling or by merging with one. The
//! choices here are pure functions of key counts, kept apart from the
//! copy-on-write mutation that carries them out.

/// What to do with one node on the removal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The key is in this leaf at `index`; drop it.
    LeafDelete(usize),
    /// The key is in this internal node at `index`.
    Separator(usize),
    /// The key can only be under child `index`.
    Descend(usize),
    /// The key is not in the tree.
    Missing,
}

/// Classify a node given the binary search result for the key.
#[must_use]
pub const fn classify(search: Result<usize, usize>, is_leaf: bool) -> Step {
    match (search, is_leaf) {
        (Ok(index), true) => Step::LeafDelete(index),
        (Ok(index), false) => Step::Separator(index),
        (Err(_), true) => Step::Missing,
        (Err(index), false) => Step::Descend(index),
    }
}

/// A rebalancing move around the separator between two adjacent children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixup {
    /// The left child's last key moves up, the separator moves down into the right child.
    RotateLeft,
    /// The right child's first key moves up, the separator moves down into the left child.
    RotateRight,
    /// The left child and the separator are folded into the front of the right child.
    MergeLeft,
    /// The separator and the right child are appended to the left child.
    MergeRight,
}

/// A fixup together with where it applies and where the walk goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub fixup: Fixup,
    /// Index of the separator key in the parent.
    pub separator: usize,
    /// Child index to continue into once the fixup is applied.
    pub next: usize,
}

/// The key was found as separator `index` of an internal node.
///
/// The key must first be pushed down into a child that can lose it: rotate
/// from whichever side has a spare key (left first), otherwise merge both
/// sides around it.
#[must_use]
pub const fn on_separator(index: usize, left_len: usize, right_len: usize, min_degree: usize) -> Plan {
    if left_len >= min_degree {
        Plan {
            fixup: Fixup::RotateLeft,
            separator: index,
            next: index + 1,
        }
    } else if right_len >= min_degree {
        Plan {
            fixup: Fixup::RotateRight,
            separator: index,
            next: index,
        }
    } else {
        Plan {
            fixup: Fixup::MergeLeft,
            separator: index,
            next: index,
        }
    }
}

/// The walk is about to enter child `index`, which holds `child_len` keys.
///
/// Returns `None` when the child already has a spare key. Otherwise prefers
/// borrowing from the left sibling, then the right, then merging with the
/// left sibling if there is one, else with the right.
#[must_use]
pub const fn on_descent(
    index: usize,
    child_len: usize,
    left_len: Option<usize>,
    right_len: Option<usize>,
    min_degree: usize,
) -> Option<Plan> {
    if child_len >= min_degree {
        return None;
    }
    if let Some(left) = left_len {
        if left >= min_degree {
            return Some(Plan {
                fixup: Fixup::RotateLeft,
                separator: index - 1,
                next: index,
            });
        }
    }
    if let Some(right) = right_len {
        if right >= min_degree {
            return Some(Plan {
                fixup: Fixup::RotateRight,
                separator: index,
                next: index,
            });
        }
    }
    if left_len.is_some() {
        return Some(Plan {
            fixup: Fixup::MergeLeft,
            separator: index - 1,
            next: index - 1,
        });
    }
    if right_len.is_some() {
        return Some(Plan {
            fixup: Fixup::MergeRight,
            separator: index,
            next: index,
        });
    }
    None
}
