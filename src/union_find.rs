use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{write_text, Result};

/// Disjoint sets over sparse `u64` indices with path compression.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: FxHashMap<u64, u64>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&mut self, x: u64) -> u64 {
        let mut root = x;
        while let Some(&p) = self.parent.get(&root) {
            if p == root {
                break;
            }
            root = p;
        }
        // compress
        let mut cur = x;
        while cur != root {
            let next = self.parent.get(&cur).copied().unwrap_or(root);
            self.parent.insert(cur, root);
            cur = next;
        }
        root
    }

    /// Merges the sets of `a` and `b`; the root of `b` becomes the root of
    /// both.
    pub fn union(&mut self, a: u64, b: u64) {
        let ra = self.find(a);
        let rb = self.find(b);
        self.parent.entry(rb).or_insert(rb);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }

    pub fn contains(&self, x: u64) -> bool {
        self.parent.contains_key(&x)
    }

    pub fn elements(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.parent.keys().copied().collect();
        out.sort_unstable();
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoMapStats {
    pub mapped: usize,
    pub unique_representatives: usize,
    /// Classes with at least one duplicate, counting the representative.
    pub classes: usize,
    pub min_class_size: usize,
    pub max_class_size: usize,
}

/// Fully resolved duplicate -> representative map. No key maps to itself
/// and no value is itself a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoMap {
    pub map: BTreeMap<u64, u64>,
}

impl IsoMap {
    /// Resolves chains of `(duplicate, representative)` proofs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut uf = UnionFind::new();
        for (dup, rep) in pairs {
            uf.union(dup, rep);
        }
        let mut map = BTreeMap::new();
        for x in uf.elements() {
            let root = uf.find(x);
            if root != x {
                map.insert(x, root);
            }
        }
        IsoMap { map }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn representative(&self, index: u64) -> u64 {
        self.map.get(&index).copied().unwrap_or(index)
    }

    pub fn stats(&self) -> IsoMapStats {
        let mut sizes: BTreeMap<u64, usize> = BTreeMap::new();
        for rep in self.map.values() {
            *sizes.entry(*rep).or_insert(1) += 1;
        }
        IsoMapStats {
            mapped: self.map.len(),
            unique_representatives: sizes.len(),
            classes: sizes.len(),
            min_class_size: sizes.values().copied().min().unwrap_or(0),
            max_class_size: sizes.values().copied().max().unwrap_or(0),
        }
    }

    /// `VAR := rec( ("dup") := rep, ... );`
    pub fn to_gap(&self, var: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{:} := rec(", var);
        let n = self.map.len();
        for (ix, (dup, rep)) in self.map.iter().enumerate() {
            let sep = if ix + 1 < n { "," } else { "" };
            let _ = writeln!(out, "  (\"{:}\") := {:}{:}", dup, rep, sep);
        }
        out.push_str(");\n");
        out
    }

    pub fn write_gap(&self, path: impl AsRef<Path>, var: &str, header: &[String]) -> Result<()> {
        let mut out = String::new();
        for line in header {
            let _ = writeln!(out, "# {:}", line);
        }
        out.push_str(&self.to_gap(var));
        write_text(path, &out)
    }
}
