//! Grouping records by invariant signature and routing the buckets to the
//! kind of worker that can deduplicate them.

use fxhash::FxHashSet;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::CensusConfig;
use crate::gap::DedupMethod;
use crate::records::{GapValue, SubgroupRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Every member is a direct product.
    DirectProduct,
    /// Order is one of the configured powers of two, needs ANUPQ.
    TwoGroup,
    /// Known to be all one class; only the first member is kept.
    Difficult,
    Regular,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: String,
    pub indices: Vec<u64>,
    pub order: Option<u64>,
    pub all_direct_product: bool,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn first_index(&self) -> Option<u64> {
        self.indices.iter().min().copied()
    }
}

/// Groups records by key, in order of first appearance. Conjugacy uses the
/// full `bucket_key`; the isomorphism tests use `isomorphism_key`, which
/// drops fixed points. A record with no usable key is put alone in a bucket
/// named after its index. Records are numbered by position when they carry
/// no `index`.
pub fn bucket_records(records: &[SubgroupRecord], method: DedupMethod) -> IndexMap<String, Bucket> {
    let mut buckets: IndexMap<String, Bucket> = IndexMap::new();
    for (pos, record) in records.iter().enumerate() {
        let index = record.index().unwrap_or(pos as u64 + 1);
        let key = match method {
            DedupMethod::Conjugacy => record.bucket_key(),
            DedupMethod::Isomorphism | DedupMethod::PGroup => record.isomorphism_key(),
        }
        .unwrap_or_else(|| format!("#{:}", index));
        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            key,
            indices: Vec::new(),
            order: record.order(),
            all_direct_product: true,
        });
        bucket.indices.push(index);
        bucket.all_direct_product &= record.is_direct_product();
    }
    buckets
}

/// Canonical form of a `sigKey|histogram` key typed by hand, so that
/// whitespace differences do not matter.
pub fn normalize_key(key: &str) -> String {
    key.split('|')
        .map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                return String::new();
            }
            GapValue::parse(trimmed)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| trimmed.to_string())
        })
        .collect::<Vec<_>>()
        .join("|")
}

#[derive(Debug, Clone, Default)]
pub struct CategoryRules {
    pub two_group_orders: FxHashSet<u64>,
    pub difficult_keys: FxHashSet<String>,
}

impl CategoryRules {
    pub fn from_config(conf: &CensusConfig) -> Self {
        CategoryRules {
            two_group_orders: conf.two_group_orders.iter().copied().collect(),
            difficult_keys: conf.difficult_keys.iter().map(|k| normalize_key(k)).collect(),
        }
    }

    pub fn category(&self, bucket: &Bucket) -> Category {
        if self.difficult_keys.contains(&bucket.key) {
            return Category::Difficult;
        }
        if bucket.all_direct_product {
            return Category::DirectProduct;
        }
        match bucket.order {
            Some(o) if o.is_power_of_two() && self.two_group_orders.contains(&o) => {
                Category::TwoGroup
            }
            _ => Category::Regular,
        }
    }
}

/// Buckets split by how they will be handled.
#[derive(Debug, Clone, Default)]
pub struct Categorized {
    /// Members of one-element buckets, automatically representatives.
    pub singletons: Vec<u64>,
    pub direct_product: Vec<Bucket>,
    pub two_group: Vec<Bucket>,
    pub difficult: Vec<Bucket>,
    pub regular: Vec<Bucket>,
}

impl Categorized {
    pub fn new(buckets: IndexMap<String, Bucket>, rules: &CategoryRules) -> Self {
        let mut out = Categorized::default();
        for (_, bucket) in buckets {
            if bucket.len() == 1 {
                out.singletons.extend(bucket.indices);
                continue;
            }
            match rules.category(&bucket) {
                Category::DirectProduct => out.direct_product.push(bucket),
                Category::TwoGroup => out.two_group.push(bucket),
                Category::Difficult => out.difficult.push(bucket),
                Category::Regular => out.regular.push(bucket),
            }
        }
        out
    }

    pub fn total_groups(&self) -> usize {
        self.singletons.len()
            + [
                &self.direct_product,
                &self.two_group,
                &self.difficult,
                &self.regular,
            ]
            .iter()
            .flat_map(|v| v.iter())
            .map(|b| b.len())
            .sum::<usize>()
    }

    pub fn print_summary(&self) {
        let line = |name: &str, buckets: &[Bucket]| {
            let groups: usize = buckets.iter().map(|b| b.len()).sum();
            println!("    {:<18} {:>6} buckets, {:>7} groups", name, buckets.len(), groups);
        };
        println!("  Category summary:");
        println!(
            "    {:<18} {:>6} groups (automatic representatives)",
            "Singletons:",
            self.singletons.len()
        );
        line("Direct product:", &self.direct_product);
        line("2-group:", &self.two_group);
        line("Regular:", &self.regular);
        line("Difficult (skip):", &self.difficult);
        println!("    {:<18} {:>7} groups", "Total:", self.total_groups());
    }
}
