use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::Path;

use indexmap::IndexMap;

use crate::checkpoint::COMPLETE_MARKER;
use crate::error::{read_text, write_text, CensusError, Result};

use super::value::{parse_assignments, write_field, GapValue};

/// One subgroup entry of a census data file: generators as permutation image
/// lists plus whatever invariants were computed for it. Field order is kept
/// so a record re-emits the way it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubgroupRecord {
    fields: IndexMap<String, GapValue>,
}

impl SubgroupRecord {
    pub fn new() -> Self {
        SubgroupRecord {
            fields: IndexMap::new(),
        }
    }

    /// Parses a single `rec( ... )` block.
    pub fn parse(block: &str) -> Result<Self> {
        match GapValue::parse(block)? {
            GapValue::Record(fields) => Ok(SubgroupRecord { fields }),
            other => Err(CensusError::parse(
                0,
                format!("expected a record, found {:}", other),
            )),
        }
    }

    pub fn fields(&self) -> &IndexMap<String, GapValue> {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&GapValue> {
        self.fields.get(name)
    }

    /// Replaces an existing field in place, or appends a new one.
    pub fn set(&mut self, name: &str, value: GapValue) {
        self.fields.insert(name.to_string(), value);
    }

    fn uint(&self, name: &str) -> Option<u64> {
        self.get(name)?.as_int().and_then(|i| u64::try_from(i).ok())
    }

    pub fn index(&self) -> Option<u64> {
        self.uint("index")
    }

    pub fn original_index(&self) -> Option<u64> {
        self.uint("originalIndex")
    }

    /// Generators as image lists, `[ [ 2, 1, 3 ], ... ]`.
    pub fn gens(&self) -> Option<Vec<Vec<u64>>> {
        self.get("gens")?
            .as_list()?
            .iter()
            .map(|g| g.as_u64_list())
            .collect()
    }

    pub fn inv(&self) -> Option<&GapValue> {
        self.get("inv")
    }

    pub fn sig_key(&self) -> Option<&GapValue> {
        self.get("sigKey")
    }

    pub fn histogram(&self) -> Option<&GapValue> {
        self.get("histogram")
    }

    pub fn source(&self) -> Option<&str> {
        self.get("source")?.as_str()
    }

    pub fn is_direct_product(&self) -> bool {
        self.get("isDirectProduct")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Group order, taken from an explicit `order` field or the first entry of
    /// the invariant signature.
    pub fn order(&self) -> Option<u64> {
        if let Some(order) = self.uint("order") {
            return Some(order);
        }
        let sig = self.sig_key().or_else(|| self.inv())?;
        sig.as_list()?
            .first()?
            .as_int()
            .and_then(|i| u64::try_from(i).ok())
    }

    /// Records with equal keys are candidates for being the same conjugacy
    /// class.
    pub fn bucket_key(&self) -> Option<String> {
        self.key_with(self.histogram().cloned())
    }

    /// Like `bucket_key`, but with the fixed-point counts dropped from the
    /// histogram. Fixed points depend on the embedding in S_n, so only this
    /// key is safe when grouping candidates for isomorphism.
    pub fn isomorphism_key(&self) -> Option<String> {
        self.key_with(self.order_histogram())
    }

    fn key_with(&self, hist: Option<GapValue>) -> Option<String> {
        if let Some(sig) = self.sig_key() {
            let hist = hist.map(|h| h.to_string()).unwrap_or_default();
            return Some(format!("{:}|{:}", sig, hist));
        }
        self.inv().map(|inv| inv.to_string())
    }

    /// Number of elements of each order as `[ [ order, count ], ... ]`,
    /// sorted by order. Accepts `[ [ order, fixed ], count ]` entries as well
    /// as plain `[ order, count ]` ones; any other shape is returned as is.
    pub fn order_histogram(&self) -> Option<GapValue> {
        let hist = self.histogram()?;
        Some(collapse_histogram(hist).unwrap_or_else(|| hist.clone()))
    }
}

fn collapse_histogram(hist: &GapValue) -> Option<GapValue> {
    let mut by_order: BTreeMap<i64, i64> = BTreeMap::new();
    for entry in hist.as_list()? {
        let [key, count] = entry.as_list()? else {
            return None;
        };
        let order = match key {
            GapValue::Int(o) => *o,
            GapValue::List(parts) => parts.first()?.as_int()?,
            _ => return None,
        };
        *by_order.entry(order).or_insert(0) += count.as_int()?;
    }
    Some(GapValue::List(
        by_order
            .into_iter()
            .map(|(o, c)| GapValue::List(vec![GapValue::Int(o), GapValue::Int(c)]))
            .collect(),
    ))
}

impl Default for SubgroupRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubgroupRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // same printing as a record value, without cloning the map
        f.write_str("rec( ")?;
        for (ix, (name, value)) in self.fields.iter().enumerate() {
            if ix > 0 {
                f.write_str(", ")?;
            }
            write_field(f, name, value)?;
        }
        f.write_str(" )")
    }
}

/// How a list of records is bound when the file is read back into GAP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListTarget {
    /// `return [ ... ];`, for files consumed with `ReadAsFunction`.
    Return,
    /// `NAME := [ ... ];`
    Variable(String),
}

/// Writes records one per line as a GAP list. `header` lines are emitted as
/// `#` comments; `trailer` becomes a `# Complete: ...` marker.
pub fn write_record_list<'a>(
    path: impl AsRef<Path>,
    target: &ListTarget,
    header: &[String],
    records: impl IntoIterator<Item = &'a SubgroupRecord>,
    trailer: Option<&str>,
) -> Result<usize> {
    let mut out = String::new();
    for line in header {
        let _ = writeln!(out, "# {:}", line);
    }
    match target {
        ListTarget::Return => out.push_str("return [\n"),
        ListTarget::Variable(name) => {
            let _ = writeln!(out, "{:} := [", name);
        }
    }
    let mut count = 0;
    for record in records {
        if count > 0 {
            out.push_str(",\n");
        }
        let _ = write!(out, "{:}", record);
        count += 1;
    }
    if count > 0 {
        out.push('\n');
    }
    out.push_str("];\n");
    if let Some(trailer) = trailer {
        let _ = writeln!(out, "{:} {:}", COMPLETE_MARKER, trailer);
    }
    write_text(path, &out)?;
    Ok(count)
}

/// `BUCKET_ASSIGNMENTS := [ rec(key := "...", indices := [...]), ... ];`
pub fn write_bucket_assignments<'a>(
    path: impl AsRef<Path>,
    header: &[String],
    buckets: impl IntoIterator<Item = (&'a str, &'a [u64])>,
) -> Result<usize> {
    let mut out = String::new();
    for line in header {
        let _ = writeln!(out, "# {:}", line);
    }
    out.push_str("BUCKET_ASSIGNMENTS := [\n");
    let mut count = 0;
    for (key, indices) in buckets {
        if count > 0 {
            out.push_str(",\n");
        }
        let _ = write!(
            out,
            "rec(key := {:}, indices := {:})",
            GapValue::Str(key.to_string()),
            GapValue::int_list(indices.iter().copied())
        );
        count += 1;
    }
    if count > 0 {
        out.push('\n');
    }
    out.push_str("];\n");
    write_text(path, &out)?;
    Ok(count)
}

/// Index lists of a bucket file, in bucket order.
pub fn read_bucket_indices(path: impl AsRef<Path>) -> Result<Vec<Vec<u64>>> {
    let path = path.as_ref();
    let parsed = parse_assignments(&read_text(path)?)?;
    let buckets = parsed
        .get("BUCKET_ASSIGNMENTS")
        .and_then(GapValue::as_list)
        .ok_or_else(|| CensusError::Missing(format!("{:} has no BUCKET_ASSIGNMENTS", path.display())))?;
    buckets
        .iter()
        .map(|b| {
            b.as_record()
                .and_then(|r| r.get("indices"))
                .and_then(GapValue::as_u64_list)
                .ok_or_else(|| CensusError::Missing(format!("bucket without indices in {:}", path.display())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{parse_assignments, rec_blocks};

    fn scratch_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("census_records_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bucket_key_prefers_sig_key() {
        let with_sig = SubgroupRecord::parse(
            "rec( index := 7, sigKey := [ 8, 1, 5, 2, [ 2, 4 ] ], histogram := [ [ 2, 0, 3 ] ], inv := [ 8 ] )",
        )
        .unwrap();
        assert_eq!(
            with_sig.bucket_key().unwrap(),
            "[ 8, 1, 5, 2, [ 2, 4 ] ]|[ [ 2, 0, 3 ] ]"
        );
        assert_eq!(with_sig.order(), Some(8));

        let with_inv = SubgroupRecord::parse("rec( inv := [ 6, 3, 3, 2, [ 2 ] ] )").unwrap();
        assert_eq!(with_inv.bucket_key().unwrap(), "[ 6, 3, 3, 2, [ 2 ] ]");

        let bare = SubgroupRecord::parse("rec( index := 1 )").unwrap();
        assert_eq!(bare.bucket_key(), None);
    }

    #[test]
    fn isomorphism_key_ignores_fixed_points() {
        let a = SubgroupRecord::parse(
            "rec( index := 1, sigKey := [ 2, 1, 2, 1, [ 2 ] ], histogram := [ [ [ 1, 4 ], 1 ], [ [ 2, 2 ], 1 ] ] )",
        )
        .unwrap();
        let b = SubgroupRecord::parse(
            "rec( index := 2, sigKey := [ 2, 1, 2, 1, [ 2 ] ], histogram := [ [ [ 1, 4 ], 1 ], [ [ 2, 0 ], 1 ] ] )",
        )
        .unwrap();
        assert_ne!(a.bucket_key(), b.bucket_key());
        assert_eq!(a.isomorphism_key(), b.isomorphism_key());
        assert_eq!(
            a.isomorphism_key().unwrap(),
            "[ 2, 1, 2, 1, [ 2 ] ]|[ [ 1, 1 ], [ 2, 1 ] ]"
        );

        let mixed = SubgroupRecord::parse(
            "rec( sigKey := [ 4 ], histogram := [ [ [ 2, 2 ], 2 ], [ [ 1, 4 ], 1 ], [ [ 2, 0 ], 1 ] ] )",
        )
        .unwrap();
        assert_eq!(
            mixed.order_histogram().unwrap().to_string(),
            "[ [ 1, 1 ], [ 2, 3 ] ]"
        );
        let odd = SubgroupRecord::parse("rec( sigKey := [ 4 ], histogram := [ 3 ] )").unwrap();
        assert_eq!(odd.isomorphism_key().unwrap(), "[ 4 ]|[ 3 ]");
    }

    #[test]
    fn accessors() {
        let r = SubgroupRecord::parse(
            "rec( index := 3, originalIndex := 40, gens := [ [ 2, 3, 1 ], [ 2, 1, 3 ] ], source := \"leaf_12\", isDirectProduct := true, order := 6 )",
        )
        .unwrap();
        assert_eq!(r.index(), Some(3));
        assert_eq!(r.original_index(), Some(40));
        assert_eq!(r.gens().unwrap(), vec![vec![2, 3, 1], vec![2, 1, 3]]);
        assert_eq!(r.source(), Some("leaf_12"));
        assert!(r.is_direct_product());
        assert_eq!(r.order(), Some(6));
    }

    #[test]
    fn numeric_field_names_are_quoted() {
        let mut r = SubgroupRecord::parse("rec( index := 4 )").unwrap();
        r.set("12", GapValue::Int(3));
        let text = r.to_string();
        assert_eq!(text, "rec( index := 4, (\"12\") := 3 )");
        assert_eq!(SubgroupRecord::parse(&text).unwrap(), r);
    }

    #[test]
    fn written_list_reads_back() {
        let dir = scratch_dir();
        let path = dir.join("out.g");
        let mut a = SubgroupRecord::new();
        a.set("index", GapValue::Int(1));
        a.set("gens", GapValue::List(vec![GapValue::int_list([2, 1])]));
        let b = SubgroupRecord::parse("rec( index := 2, gens := [  ] )").unwrap();
        let n = write_record_list(
            &path,
            &ListTarget::Variable("COMBINED".to_string()),
            &["combined from 2 files".to_string()],
            [&a, &b],
            Some("2 subgroups"),
        )
        .unwrap();
        assert_eq!(n, 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# combined from 2 files\nCOMBINED := [\n"));
        assert!(text.ends_with("];\n# Complete: 2 subgroups\n"));
        let blocks = rec_blocks(&text);
        assert_eq!(SubgroupRecord::parse(blocks[0]).unwrap(), a);
        assert_eq!(SubgroupRecord::parse(blocks[1]).unwrap(), b);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn bucket_file_format() {
        let dir = scratch_dir();
        let path = dir.join("buckets.g");
        let first = [3_u64, 5];
        let second = [9_u64];
        write_bucket_assignments(&path, &[], [("[ 8 ]|", &first[..]), ("x", &second[..])]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("rec(key := \"[ 8 ]|\", indices := [ 3, 5 ])"));
        let parsed = parse_assignments(&text).unwrap();
        assert_eq!(parsed["BUCKET_ASSIGNMENTS"].as_list().unwrap().len(), 2);
        assert_eq!(read_bucket_indices(&path).unwrap(), vec![vec![3, 5], vec![9]]);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
