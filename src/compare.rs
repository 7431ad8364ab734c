//! Cross-checking two independent dedup passes by how many representatives
//! each found per invariant signature.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::records::{GapValue, SubgroupRecord};

/// `[ order, derivedSize, nrCC, abelianInvariants ]` of a sigKey. The
/// derived length is left out because passes encode non-solvable groups
/// differently (-1 or 0).
pub fn match_key(sig: &GapValue) -> Option<String> {
    let parts = sig.as_list()?;
    if parts.len() < 5 {
        return None;
    }
    let key = GapValue::List(vec![
        parts[0].clone(),
        parts[1].clone(),
        parts[2].clone(),
        parts[4].clone(),
    ]);
    Some(key.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCount {
    pub key: String,
    pub a: usize,
    pub b: usize,
}

impl KeyCount {
    pub fn diff(&self) -> i64 {
        self.b as i64 - self.a as i64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigKeyComparison {
    pub label_a: String,
    pub label_b: String,
    pub total_a: usize,
    pub total_b: usize,
    pub matching_keys: usize,
    /// Keys both passes found, with different counts.
    pub discrepancies: Vec<KeyCount>,
    pub only_a: Vec<KeyCount>,
    pub only_b: Vec<KeyCount>,
    /// Representatives whose sigKey could not be read.
    pub unkeyed_a: Vec<u64>,
    pub unkeyed_b: Vec<u64>,
}

fn count_keys<'a, I>(reps: I) -> (BTreeMap<String, usize>, Vec<u64>)
where
    I: IntoIterator<Item = &'a SubgroupRecord>,
{
    let mut counts = BTreeMap::new();
    let mut unkeyed = Vec::new();
    for r in reps {
        match r.sig_key().and_then(match_key) {
            Some(key) => *counts.entry(key).or_insert(0) += 1,
            None => unkeyed.push(r.index().unwrap_or(0)),
        }
    }
    (counts, unkeyed)
}

impl SigKeyComparison {
    pub fn new<'a, A, B>(label_a: &str, a: A, label_b: &str, b: B) -> Self
    where
        A: IntoIterator<Item = &'a SubgroupRecord>,
        B: IntoIterator<Item = &'a SubgroupRecord>,
    {
        let (counts_a, unkeyed_a) = count_keys(a);
        let (counts_b, unkeyed_b) = count_keys(b);
        let mut out = SigKeyComparison {
            label_a: label_a.to_string(),
            label_b: label_b.to_string(),
            total_a: counts_a.values().sum::<usize>() + unkeyed_a.len(),
            total_b: counts_b.values().sum::<usize>() + unkeyed_b.len(),
            unkeyed_a,
            unkeyed_b,
            ..Default::default()
        };
        let mut keys: Vec<&String> = counts_a.keys().chain(counts_b.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            let row = KeyCount {
                key: key.clone(),
                a: counts_a.get(key).copied().unwrap_or(0),
                b: counts_b.get(key).copied().unwrap_or(0),
            };
            if row.a == row.b {
                out.matching_keys += 1;
            } else if row.b == 0 {
                out.only_a.push(row);
            } else if row.a == 0 {
                out.only_b.push(row);
            } else {
                out.discrepancies.push(row);
            }
        }
        out
    }

    pub fn agrees(&self) -> bool {
        self.discrepancies.is_empty()
            && self.only_a.is_empty()
            && self.only_b.is_empty()
            && self.total_a == self.total_b
    }

    /// Net difference `b - a` over every key.
    pub fn net_difference(&self) -> i64 {
        self.total_b as i64 - self.total_a as i64
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        crate::error::write_text(path, &serde_json::to_string_pretty(self)?)
    }

    pub fn print(&self) {
        let bar = "=".repeat(72);
        println!("{:}", bar);
        println!("sigKey comparison: {:} vs {:}", self.label_a, self.label_b);
        println!("{:}", bar);
        let table = |title: &str, rows: &[KeyCount]| {
            if rows.is_empty() {
                println!("\nNo {:}.", title);
                return;
            }
            println!("\n{:} ({:})", title.to_uppercase(), rows.len());
            println!("  {:<44} {:>8} {:>8} {:>6}", "[order, derived, classes, abelian]", "A", "B", "diff");
            for row in rows {
                println!("  {:<44} {:>8} {:>8} {:>+6}", row.key, row.a, row.b, row.diff());
            }
            let a: usize = rows.iter().map(|r| r.a).sum();
            let b: usize = rows.iter().map(|r| r.b).sum();
            println!("  {:<44} {:>8} {:>8} {:>+6}", "total", a, b, b as i64 - a as i64);
        };
        table("discrepancies", &self.discrepancies);
        table("keys only in A", &self.only_a);
        table("keys only in B", &self.only_b);
        println!("\n{:}", bar);
        println!("A ({:}): {:} representatives", self.label_a, self.total_a);
        println!("B ({:}): {:} representatives", self.label_b, self.total_b);
        println!("Matching keys: {:}", self.matching_keys);
        if !self.unkeyed_a.is_empty() || !self.unkeyed_b.is_empty() {
            println!(
                "Without a sigKey: {:} in A, {:} in B",
                self.unkeyed_a.len(),
                self.unkeyed_b.len()
            );
        }
        println!("Net difference (B - A): {:+}", self.net_difference());
        println!("{:}", if self.agrees() { "PASSES AGREE" } else { "PASSES DISAGREE" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::rec_blocks;

    fn parse(text: &str) -> Vec<SubgroupRecord> {
        rec_blocks(text).into_iter().map(|b| SubgroupRecord::parse(b).unwrap()).collect()
    }

    #[test]
    fn derived_length_is_ignored() {
        let solvable_flag = GapValue::parse("[ 60, 60, 5, -1, [ ] ]").unwrap();
        let zero_flag = GapValue::parse("[ 60, 60, 5, 0, [ ] ]").unwrap();
        assert_eq!(match_key(&solvable_flag), match_key(&zero_flag));
        assert_eq!(match_key(&solvable_flag).unwrap(), "[ 60, 60, 5, [  ] ]");
        assert_eq!(match_key(&GapValue::parse("[ 60 ]").unwrap()), None);
    }

    #[test]
    fn counts_per_key() {
        let a = parse(
            "rec( index := 1, sigKey := [ 60, 60, 5, -1, [ ] ] ),
             rec( index := 2, sigKey := [ 8, 2, 5, 2, [ 2, 2 ] ] ),
             rec( index := 3, sigKey := [ 8, 2, 5, 2, [ 2, 2 ] ] ),
             rec( index := 4, sigKey := [ 12, 4, 4, 2, [ 3 ] ] ),
             rec( index := 5 )",
        );
        let b = parse(
            "rec( index := 7, sigKey := [ 60, 60, 5, 0, [ ] ] ),
             rec( index := 8, sigKey := [ 8, 2, 5, 2, [ 2, 2 ] ] ),
             rec( index := 9, sigKey := [ 16, 2, 10, 2, [ 2, 4 ] ] )",
        );
        let cmp = SigKeyComparison::new("conjugacy", a.iter(), "isomorphism", b.iter());
        assert_eq!(cmp.total_a, 5);
        assert_eq!(cmp.total_b, 3);
        assert_eq!(cmp.matching_keys, 1);
        assert_eq!(cmp.discrepancies.len(), 1);
        assert_eq!(cmp.discrepancies[0].key, "[ 8, 2, 5, [ 2, 2 ] ]");
        assert_eq!(cmp.discrepancies[0].diff(), -1);
        assert_eq!(cmp.only_a[0].key, "[ 12, 4, 4, [ 3 ] ]");
        assert_eq!(cmp.only_b[0].b, 1);
        assert_eq!(cmp.unkeyed_a, vec![5]);
        assert_eq!(cmp.net_difference(), -2);
        assert!(!cmp.agrees());
        assert!(SigKeyComparison::new("x", a.iter(), "y", a.iter()).agrees());
    }
}
