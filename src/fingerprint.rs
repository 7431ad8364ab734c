//! Minimal fingerprints of the isomorphism types: for every large
//! representative, only the invariants needed to tell it from each other
//! representative of the same order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Write as _;

use fxhash::FxHashSet;

use crate::records::{GapValue, SubgroupRecord};

/// Invariants beyond the sigKey and histogram, compared in this order when
/// an invariants file carries them.
pub const EXTRA_FIELDS: &[&str] = &[
    "centerSize",
    "frattiniSize",
    "nilpotencyClass",
    "numNormalSubs",
    "derivedSeriesSizes",
    "classSizes",
    "autGroupOrder",
];

/// One invariant, cheapest first in the derived ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    DerivedSize,
    NrCC,
    DerivedLength,
    AbelianInvariants,
    MaxElementOrder,
    NrElementsOfOrder(i64),
    Extra(&'static str),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::DerivedSize => f.write_str("derivedSize"),
            Field::NrCC => f.write_str("nrCC"),
            Field::DerivedLength => f.write_str("derivedLength"),
            Field::AbelianInvariants => f.write_str("abelianInvariants"),
            Field::MaxElementOrder => f.write_str("maxElementOrder"),
            Field::NrElementsOfOrder(k) => write!(f, "nrElementsOfOrder{}", k),
            Field::Extra(name) => f.write_str(name),
        }
    }
}

/// The invariants of one large record that fingerprints are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invariants {
    pub index: u64,
    pub order: u64,
    pub derived_size: Option<i64>,
    pub nr_cc: Option<i64>,
    pub derived_length: Option<i64>,
    pub abelian: Option<GapValue>,
    /// Element order to number of elements of that order.
    pub histogram: BTreeMap<i64, i64>,
    pub extra: BTreeMap<&'static str, GapValue>,
}

impl Invariants {
    /// `None` for a record without an index or order.
    pub fn from_record(r: &SubgroupRecord) -> Option<Self> {
        let index = r.original_index().or_else(|| r.index())?;
        let sig = r.sig_key().and_then(GapValue::as_list).unwrap_or(&[]);
        let order = r
            .order()
            .or_else(|| sig.first().and_then(GapValue::as_int).and_then(|o| u64::try_from(o).ok()))?;
        let histogram = r
            .order_histogram()
            .and_then(|h| {
                h.as_list()?
                    .iter()
                    .map(|e| match e.as_list()? {
                        [o, c] => Some((o.as_int()?, c.as_int()?)),
                        _ => None,
                    })
                    .collect::<Option<BTreeMap<i64, i64>>>()
            })
            .unwrap_or_default();
        let extra = EXTRA_FIELDS
            .iter()
            .filter_map(|name| r.get(name).map(|v| (*name, v.clone())))
            .collect();
        Some(Invariants {
            index,
            order,
            derived_size: sig.get(1).and_then(GapValue::as_int),
            nr_cc: sig.get(2).and_then(GapValue::as_int),
            derived_length: sig.get(3).and_then(GapValue::as_int),
            abelian: sig.get(4).cloned(),
            histogram,
            extra,
        })
    }

    pub fn max_element_order(&self) -> Option<i64> {
        self.histogram.keys().next_back().copied()
    }

    pub fn value(&self, field: Field) -> Option<GapValue> {
        match field {
            Field::DerivedSize => self.derived_size.map(GapValue::Int),
            Field::NrCC => self.nr_cc.map(GapValue::Int),
            Field::DerivedLength => self.derived_length.map(GapValue::Int),
            Field::AbelianInvariants => self.abelian.clone(),
            Field::MaxElementOrder => self.max_element_order().map(GapValue::Int),
            Field::NrElementsOfOrder(_) if self.histogram.is_empty() => None,
            Field::NrElementsOfOrder(k) => Some(GapValue::Int(*self.histogram.get(&k).unwrap_or(&0))),
            Field::Extra(name) => self.extra.get(name).cloned(),
        }
    }
}

/// First invariant on which `a` and `b` differ, both values being known.
pub fn cheapest_distinguisher(a: &Invariants, b: &Invariants) -> Option<Field> {
    let differs = |field: Field| match (a.value(field), b.value(field)) {
        (Some(x), Some(y)) => x != y,
        _ => false,
    };
    let fixed = [
        Field::DerivedSize,
        Field::NrCC,
        Field::DerivedLength,
        Field::AbelianInvariants,
        Field::MaxElementOrder,
    ];
    if let Some(field) = fixed.into_iter().find(|f| differs(*f)) {
        return Some(field);
    }
    if !a.histogram.is_empty() && !b.histogram.is_empty() {
        let orders: BTreeSet<i64> = a.histogram.keys().chain(b.histogram.keys()).copied().collect();
        if let Some(k) = orders.into_iter().find(|k| differs(Field::NrElementsOfOrder(*k))) {
            return Some(Field::NrElementsOfOrder(k));
        }
    }
    EXTRA_FIELDS.iter().map(|name| Field::Extra(*name)).find(|f| differs(*f))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeEntry {
    pub invariants: Invariants,
    pub fields: BTreeSet<Field>,
    pub needs_additional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeInfo {
    pub idgroup_types: Vec<(u64, u64)>,
    pub large: Vec<TypeEntry>,
    pub same_order_pairs: usize,
    pub undistinguished: Vec<(u64, u64)>,
}

impl TypeInfo {
    /// Large records that are not proven duplicates become the large types,
    /// and the distinct `idGroup` values become the IdGroup types.
    pub fn build(records: &[SubgroupRecord], duplicates: &FxHashSet<u64>) -> Self {
        let mut ids: BTreeSet<(u64, u64)> = BTreeSet::new();
        let mut reps: Vec<Invariants> = Vec::new();
        for r in records {
            if let Some([o, i]) = r.get("idGroup").and_then(GapValue::as_u64_list).as_deref() {
                ids.insert((*o, *i));
                continue;
            }
            match Invariants::from_record(r) {
                Some(inv) if !duplicates.contains(&inv.index) => reps.push(inv),
                Some(_) => {}
                None => log::warn!("WARNING: skipping record without index or order: {:}", r),
            }
        }
        reps.sort_by_key(|inv| inv.index);

        let mut by_order: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (pos, inv) in reps.iter().enumerate() {
            by_order.entry(inv.order).or_default().push(pos);
        }
        let mut fields: Vec<BTreeSet<Field>> = vec![BTreeSet::new(); reps.len()];
        let mut needs = vec![false; reps.len()];
        let mut info = TypeInfo {
            idgroup_types: ids.into_iter().collect(),
            ..Default::default()
        };
        for members in by_order.values() {
            if let [only] = members[..] {
                fields[only].insert(Field::DerivedSize);
                fields[only].insert(Field::NrCC);
                continue;
            }
            for (ix, &a) in members.iter().enumerate() {
                for &b in members[ix + 1..].iter() {
                    info.same_order_pairs += 1;
                    match cheapest_distinguisher(&reps[a], &reps[b]) {
                        Some(field) => {
                            fields[a].insert(field);
                            fields[b].insert(field);
                        }
                        None => {
                            needs[a] = true;
                            needs[b] = true;
                            info.undistinguished.push((reps[a].index, reps[b].index));
                        }
                    }
                }
            }
        }
        info.large = reps
            .into_iter()
            .zip(fields)
            .zip(needs)
            .map(|((invariants, fields), needs_additional)| TypeEntry {
                invariants,
                fields,
                needs_additional,
            })
            .collect();
        info
    }

    pub fn total(&self) -> usize {
        self.idgroup_types.len() + self.large.len()
    }

    /// `var := [ rec(typeIndex, representative, order, idGroup, ...), ... ];`
    /// IdGroup types come first with `representative := 0`.
    pub fn to_gap(&self, var: &str, header: &[String]) -> String {
        let mut out = String::new();
        for line in header {
            let _ = writeln!(out, "# {:}", line);
        }
        let _ = writeln!(
            out,
            "# {:} IdGroup types + {:} large types = {:} total",
            self.idgroup_types.len(),
            self.large.len(),
            self.total()
        );
        let _ = writeln!(out, "# Each large type stores the fields that separate it from");
        let _ = writeln!(out, "# every other large type of the same order");
        let _ = writeln!(out, "{:} := [", var);
        let mut entries = Vec::with_capacity(self.total());
        for (ix, (o, i)) in self.idgroup_types.iter().enumerate() {
            entries.push(format!(
                "  rec(typeIndex := {:}, representative := 0, order := {:}, idGroup := [ {:}, {:} ])",
                ix + 1,
                o,
                o,
                i
            ));
        }
        let offset = self.idgroup_types.len();
        for (ix, entry) in self.large.iter().enumerate() {
            let inv = &entry.invariants;
            let mut line = format!(
                "  rec(typeIndex := {:}, representative := {:}, order := {:}, idGroup := fail",
                offset + ix + 1,
                inv.index,
                inv.order
            );
            for field in entry.fields.iter() {
                if let Some(value) = inv.value(*field) {
                    let _ = write!(line, ", {:} := {:}", field, value);
                }
            }
            if entry.needs_additional {
                line.push_str(", _NEEDS_ADDITIONAL := true");
            }
            line.push(')');
            entries.push(line);
        }
        out.push_str(&entries.join(",\n"));
        if !entries.is_empty() {
            out.push('\n');
        }
        out.push_str("];\n");
        out
    }
}
