//! GAP source generation. Every script is plain text with paths and
//! parameters interpolated; all group theory happens inside GAP.

use std::fmt::Write as _;

use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{sanitize_label, BucketCheckpoint};
use crate::records::GapValue;

/// GAP helpers shared by every generated script. `CensusSanitizeLabel` must
/// agree with `checkpoint::sanitize_label`.
pub const PRELUDE: &str = r##"
CensusOpenOutput := function(path, append)
    local out;
    out := OutputTextFile(path, append);
    SetPrintFormattingStatus(out, false);
    return out;
end;

CensusAppend := function(path, parts...)
    local out;
    out := CensusOpenOutput(path, true);
    CallFuncList(AppendTo, Concatenation([out], parts));
    CloseStream(out);
end;

CensusSanitizeLabel := function(s)
    local result, ch;
    result := "L";
    for ch in s do
        if ch in "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_" then
            Add(result, ch);
        else
            Add(result, '_');
        fi;
    od;
    return result;
end;

CensusInvariantKey := function(H)
    local dl;
    if IsSolvableGroup(H) then
        dl := DerivedLength(H);
    else
        dl := -1;
    fi;
    return [ Size(H), Size(DerivedSubgroup(H)), NrConjugacyClasses(H), dl,
             AbelianInvariants(H) ];
end;

CENSUS_ELEMENT_LIMIT := 5000;

# [ [ order, fixed points ], count ] entries; large groups go class by class
CensusHistogram := function(H, n)
    local counts, c, r, key, pos;
    if Size(H) <= CENSUS_ELEMENT_LIMIT then
        return Collected(List(AsList(H), x -> [ Order(x), n - NrMovedPoints(x) ]));
    fi;
    counts := [];
    for c in ConjugacyClasses(H) do
        r := Representative(c);
        key := [ Order(r), n - NrMovedPoints(r) ];
        pos := PositionProperty(counts, e -> e[1] = key);
        if pos = fail then
            Add(counts, [ key, Size(c) ]);
        else
            counts[pos][2] := counts[pos][2] + Size(c);
        fi;
    od;
    Sort(counts);
    return counts;
end;

CensusGroupFromImages := function(images)
    if Length(images) = 0 then
        return Group(());
    fi;
    return Group(List(images, PermList));
end;

CensusImages := function(H, n)
    return List(GeneratorsOfGroup(H), g -> ListPerm(g, n));
end;
"##;

pub fn string_literal(s: &str) -> String {
    GapValue::Str(s.to_string()).to_string()
}

/// Pairwise test used inside a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupMethod {
    /// `RepresentativeAction` in S_n, for conjugacy classes.
    Conjugacy,
    /// `IsomorphismGroups`, for isomorphism types.
    Isomorphism,
    /// ANUPQ `IsIsomorphicPGroup` on pc presentations, for 2-groups.
    PGroup,
}

impl DedupMethod {
    pub fn gap_name(&self) -> &'static str {
        match self {
            DedupMethod::Conjugacy => "conjugacy",
            DedupMethod::Isomorphism => "isomorphism",
            DedupMethod::PGroup => "pgroup",
        }
    }
}

const DEDUP_FUNCTIONS: &str = r##"
CensusSameClass := function(H, K, Sn, method)
    if Size(H) <> Size(K) then
        return false;
    fi;
    if method = "conjugacy" then
        return RepresentativeAction(Sn, H, K) <> fail;
    elif method = "pgroup" then
        return IsIsomorphicPGroup(Image(IsomorphismPcGroup(H)),
                                  Image(IsomorphismPcGroup(K)));
    fi;
    return IsomorphismGroups(H, K) <> fail;
end;

CensusDedupBucket := function(indices, byIndex, n, method)
    local Sn, reps, repGroups, idx, H, found, K;
    Sn := SymmetricGroup(n);
    reps := [];
    repGroups := [];
    for idx in indices do
        H := CensusGroupFromImages(byIndex[idx].gens);
        found := false;
        for K in repGroups do
            if CensusSameClass(H, K, Sn, method) then
                found := true;
                break;
            fi;
        od;
        if not found then
            Add(reps, idx);
            Add(repGroups, H);
        fi;
    od;
    return reps;
end;
"##;

/// Everything a bucket deduplication worker needs. Paths are as GAP sees
/// them (already translated for Cygwin/WSL).
#[derive(Debug, Clone)]
pub struct DedupWorkerParams<'a> {
    pub worker_name: &'a str,
    pub n: u32,
    pub method: DedupMethod,
    pub data_file: String,
    pub data_var: &'a str,
    pub bucket_file: String,
    pub checkpoint_file: String,
    pub result_file: String,
    pub result_var: String,
    /// Buckets finished by a previous run, replayed instead of recomputed.
    pub resume: &'a [BucketCheckpoint],
}

pub fn dedup_worker_script(p: &DedupWorkerParams) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "# Census dedup worker {:}", p.worker_name);
    let _ = writeln!(s, "# Method: {:}", p.method.gap_name());
    s.push_str("\nSetInfoLevel(InfoWarning, 0);;\n");
    if p.method == DedupMethod::PGroup {
        s.push_str("Print(\"Loading ANUPQ package...\\n\");\nLoadPackage(\"anupq\");;\n");
    }
    s.push_str(PRELUDE);
    s.push_str(DEDUP_FUNCTIONS);
    let _ = write!(
        s,
        r##"
CENSUS_N := {n};;
CHECKPOINT_FILE := {checkpoint};;
RESULT_FILE := {result};;

Print("Loading group data...\n");
Read({data});
DATA := {data_var};;
Print("Loading bucket assignments...\n");
Read({buckets});

DATA_BY_INDEX := [];;
for r in DATA do
    DATA_BY_INDEX[r.index] := r;
od;
Print("Built index lookup for ", Length(DATA), " records\n");

DONE_BUCKETS := [];;
"##,
        n = p.n,
        checkpoint = string_literal(&p.checkpoint_file),
        result = string_literal(&p.result_file),
        data = string_literal(&p.data_file),
        data_var = p.data_var,
        buckets = string_literal(&p.bucket_file),
    );
    for cp in p.resume {
        let _ = writeln!(
            s,
            "DONE_BUCKETS[{:}] := {:};;",
            cp.bucket,
            GapValue::int_list(cp.reps.iter().copied())
        );
    }
    if p.resume.is_empty() {
        let _ = writeln!(
            s,
            "CensusAppend(CHECKPOINT_FILE, \"# Worker {:} checkpoint file\\n\\n\");",
            p.worker_name
        );
    } else {
        let _ = writeln!(
            s,
            "Print(\"Resuming: {:} buckets already done\\n\");",
            p.resume.len()
        );
    }
    let _ = write!(
        s,
        r##"
totalReps := [];;
totalGroups := 0;;
startTime := Runtime();;
Print("Processing ", Length(BUCKET_ASSIGNMENTS), " buckets\n");

for bucketNum in [1..Length(BUCKET_ASSIGNMENTS)] do
    bucket := BUCKET_ASSIGNMENTS[bucketNum];
    totalGroups := totalGroups + Length(bucket.indices);
    if IsBound(DONE_BUCKETS[bucketNum]) then
        Append(totalReps, DONE_BUCKETS[bucketNum]);
        continue;
    fi;
    Print("Bucket ", bucketNum, "/", Length(BUCKET_ASSIGNMENTS), ": ",
          Length(bucket.indices), " groups\n");
    reps := CensusDedupBucket(bucket.indices, DATA_BY_INDEX, CENSUS_N, "{method}");
    Append(totalReps, reps);
    Print("  Bucket ", bucketNum, " complete: ", Length(bucket.indices),
          " -> ", Length(reps), " reps\n");
    CensusAppend(CHECKPOINT_FILE, "# Bucket ", bucketNum, ": ",
                 Length(bucket.indices), " -> ", Length(reps), " reps: ", reps, "\n");
od;

elapsed := Runtime() - startTime;;
out := CensusOpenOutput(RESULT_FILE, false);;
AppendTo(out, "# Worker {name} results\n",
         "# Elapsed: ", elapsed, "ms\n",
         "# Total representatives: ", Length(totalReps), "\n\n",
         "{var} := ", totalReps, ";\n",
         "# Complete: ", Length(totalReps), " reps from ", totalGroups,
         " groups in ", Length(BUCKET_ASSIGNMENTS), " buckets\n");
CloseStream(out);
Print("=== COMPLETE === Worker {name}: ", Length(totalReps),
      " representatives from ", totalGroups, " groups\n");
QUIT;
"##,
        method = p.method.gap_name(),
        name = p.worker_name,
        var = p.result_var,
    );
    s
}

#[derive(Debug, Clone)]
pub struct LeafWorkerParams<'a> {
    pub worker_id: usize,
    pub n: u32,
    /// File defining `leaf_batch := [ rec(label, order, genImages), ... ];`
    pub batch_file: String,
    pub result_file: String,
    pub completed: &'a FxHashSet<String>,
}

pub fn leaf_worker_script(p: &LeafWorkerParams) -> String {
    let resume = !p.completed.is_empty();
    let mut s = String::new();
    let _ = writeln!(s, "# Census leaf worker {:}", p.worker_id);
    s.push_str(PRELUDE);
    let _ = write!(
        s,
        r##"
n := {n};;
resumeMode := {resume};;
outputFile := {result};;
Print("=== Leaf Worker {id} started ===\n");
startTime := Runtime();;
Read({batch});
if not IsBound(leaf_batch) then
    Print("ERROR: No leaf_batch found!\n");
    QUIT_GAP(1);
fi;
Print("Loaded ", Length(leaf_batch), " leaves\n");

completedLeaves := rec();;
"##,
        n = p.n,
        resume = resume,
        result = string_literal(&p.result_file),
        id = p.worker_id,
        batch = string_literal(&p.batch_file),
    );
    // sorted so the script is stable across runs
    let mut labels: Vec<&String> = p.completed.iter().collect();
    labels.sort();
    for label in labels {
        let _ = writeln!(s, "completedLeaves.{:} := true;;", sanitize_label(label));
    }
    let _ = write!(
        s,
        r##"
if not resumeMode then
    out := CensusOpenOutput(outputFile, false);
    AppendTo(out, "# Leaf worker {id} results (S", n, ")\n",
             "maxsub_results := [\n");
    CloseStream(out);
fi;

totalCount := 0;;
skipped := 0;;
for i in [1..Length(leaf_batch)] do
    entry := leaf_batch[i];
    if IsBound(completedLeaves.(CensusSanitizeLabel(entry.label))) then
        skipped := skipped + 1;
        continue;
    fi;
    Print("--- Leaf ", i, "/", Length(leaf_batch), ": ", entry.label,
          " (order ", entry.order, ") ---\n");
    leafStart := Runtime();
    G := CensusGroupFromImages(entry.genImages);
    reps := List(ConjugacyClassesSubgroups(G), Representative);
    for H in reps do
        if totalCount > 0 or resumeMode then
            CensusAppend(outputFile, ",\n");
        fi;
        CensusAppend(outputFile, "  rec(gens := ", CensusImages(H, n),
                     ", inv := ", CensusInvariantKey(H),
                     ", source := \"", entry.label, "\")");
        totalCount := totalCount + 1;
    od;
    leafElapsed := Int((Runtime() - leafStart) / 1000);
    Print("  Leaf complete: ", Length(reps), " subgroups in ", leafElapsed, "s\n");
    CensusAppend(outputFile, "\n# Leaf complete: ", entry.label, " (",
                 Length(reps), " subgroups in ", leafElapsed, "s)\n");
    GASMAN("collect");
od;

elapsed := Int((Runtime() - startTime) / 1000);;
CensusAppend(outputFile, "\n];\n# Complete: ", totalCount, " subgroups from ",
             Length(leaf_batch) - skipped, " leaves in ", elapsed, " seconds\n");
Print("=== Leaf Worker {id} complete: ", totalCount, " subgroups, ",
      skipped, " leaves skipped ===\n");
QUIT;
"##,
        id = p.worker_id,
    );
    s
}

#[derive(Debug, Clone)]
pub struct PrecomputeParams {
    pub n: u32,
    /// `return [ gens, ... ];` cache of class representatives.
    pub cache_file: String,
    /// `CENSUS_INVARIANTS := [ rec(...), ... ];`
    pub invariants_file: String,
    /// Reuse an existing cache instead of recomputing the classes.
    pub skip_conjugacy: bool,
    pub skip_invariants: bool,
}

pub const INVARIANTS_VAR: &str = "CENSUS_INVARIANTS";

pub fn precompute_script(p: &PrecomputeParams) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "# Census precompute for S{:}", p.n);
    s.push_str(PRELUDE);
    let _ = write!(
        s,
        r##"
n := {n};;
cacheFile := {cache};;
startTime := Runtime();;
"##,
        n = p.n,
        cache = string_literal(&p.cache_file),
    );
    if p.skip_conjugacy {
        s.push_str(
            r##"Print("Reading cached classes from ", cacheFile, "\n");
allGens := ReadAsFunction(cacheFile)();;
"##,
        );
    } else {
        s.push_str(
            r##"Print("Computing conjugacy classes of subgroups of S", n, "...\n");
allGens := List(ConjugacyClassesSubgroups(SymmetricGroup(n)),
                c -> CensusImages(Representative(c), n));;
Print("Found ", Length(allGens), " classes in ", Int((Runtime() - startTime) / 1000), "s\n");
out := CensusOpenOutput(cacheFile, false);;
AppendTo(out, "# Conjugacy class representatives for S", n, "\n",
         "# ", Length(allGens), " subgroups\n", "return [\n");
for i in [1..Length(allGens)] do
    AppendTo(out, "  ", allGens[i]);
    if i < Length(allGens) then
        AppendTo(out, ",");
    fi;
    AppendTo(out, "\n");
od;
AppendTo(out, "];\n");
CloseStream(out);
"##,
        );
    }
    if !p.skip_invariants {
        let _ = write!(
            s,
            r##"
invFile := {inv};;
out := CensusOpenOutput(invFile, false);;
AppendTo(out, "# Invariants for S", n, "\n{var} := [\n");
for i in [1..Length(allGens)] do
    H := CensusGroupFromImages(allGens[i]);
    AppendTo(out, "rec( index := ", i,
             ", order := ", Size(H),
             ", gens := ", allGens[i],
             ", sigKey := ", CensusInvariantKey(H),
             ", histogram := ", CensusHistogram(H, n),
             ", isDirectProduct := ", Length(DirectFactorsOfGroup(H)) > 1);
    if IdGroupsAvailable(Size(H)) then
        AppendTo(out, ", idGroup := ", IdGroup(H));
    fi;
    AppendTo(out, " )");
    if i < Length(allGens) then
        AppendTo(out, ",");
    fi;
    AppendTo(out, "\n");
    if i mod 1000 = 0 then
        Print("  Invariants ", i, "/", Length(allGens), "\n");
    fi;
od;
AppendTo(out, "];\n# Complete: ", Length(allGens), " records\n");
CloseStream(out);
"##,
            inv = string_literal(&p.invariants_file),
            var = INVARIANTS_VAR,
        );
    }
    s.push_str("Print(\"Done.\\n\");\nQUIT;\n");
    s
}

/// One slice of a proof verification run. Worker `k` of `m` checks the
/// proofs at positions congruent to `k` modulo `m`.
#[derive(Debug, Clone)]
pub struct VerifyProofsParams<'a> {
    pub worker_id: usize,
    pub num_workers: usize,
    pub n: u32,
    pub data_file: String,
    pub data_var: &'a str,
    /// File binding `proof_var := [ rec(duplicate, representative, gens, images), ... ];`
    pub proof_file: String,
    pub proof_var: &'a str,
    pub result_file: String,
}

pub fn verify_proofs_script(p: &VerifyProofsParams) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "# Census proof verification worker {:} of {:}", p.worker_id, p.num_workers);
    s.push_str(PRELUDE);
    let _ = write!(
        s,
        r##"
WORKER_ID := {id};;
NUM_WORKERS := {workers};;
CENSUS_N := {n};;
RESULT_FILE := {result};;

Print("Worker {id}: loading group data...\n");
Read({data});
DATA := {data_var};;
DATA_BY_INDEX := [];;
for r in DATA do
    DATA_BY_INDEX[r.index] := r;
od;
Print("Worker {id}: loading proofs...\n");
Read({proofs});
PROOFS := {proof_var};;

# fail, or the reason the proof does not hold
CensusCheckProof := function(proof)
    local G, H, gens, imgs, hom;
    if not IsBound(proof.gens) or not IsBound(proof.images) then
        return "proof has no gens and images";
    fi;
    if not IsBound(DATA_BY_INDEX[proof.duplicate]) then
        return "duplicate not in data";
    fi;
    if not IsBound(DATA_BY_INDEX[proof.representative]) then
        return "representative not in data";
    fi;
    G := CensusGroupFromImages(DATA_BY_INDEX[proof.duplicate].gens);
    H := CensusGroupFromImages(DATA_BY_INDEX[proof.representative].gens);
    if Size(G) <> Size(H) then
        return "orders differ";
    fi;
    gens := List(proof.gens, PermList);
    imgs := List(proof.images, PermList);
    if Length(gens) <> Length(imgs) then
        return "gens and images differ in length";
    fi;
    if ForAny(gens, g -> g = fail or not g in G) then
        return "gens not in duplicate";
    fi;
    if ForAny(imgs, g -> g = fail or not g in H) then
        return "images not in representative";
    fi;
    if Size(Group(Concatenation(gens, [ () ]))) <> Size(G) then
        return "gens do not generate duplicate";
    fi;
    hom := GroupHomomorphismByImages(G, H, gens, imgs);
    if hom = fail then
        return "map is not a homomorphism";
    fi;
    if Size(Image(hom)) <> Size(H) then
        return "map is not surjective";
    fi;
    return fail;
end;

passed := 0;;
failures := [];;
startTime := Runtime();;
for i in [1..Length(PROOFS)] do
    if (i - 1) mod NUM_WORKERS + 1 <> WORKER_ID then
        continue;
    fi;
    reason := CensusCheckProof(PROOFS[i]);
    if reason = fail then
        passed := passed + 1;
    else
        Add(failures, [ i, PROOFS[i].duplicate, reason ]);
        Print("FAIL proof ", i, " (dup=", PROOFS[i].duplicate, "): ", reason, "\n");
    fi;
    if (passed + Length(failures)) mod 500 = 0 then
        Print("Worker {id}: ", passed + Length(failures), " proofs checked\n");
    fi;
od;

out := CensusOpenOutput(RESULT_FILE, false);;
AppendTo(out, "# Proof verification worker {id} of {workers}\n",
         "Passed: ", passed, "\n",
         "Failed: ", Length(failures), "\n");
for f in failures do
    AppendTo(out, "FAIL proof ", f[1], " (dup=", f[2], "): ", f[3], "\n");
od;
AppendTo(out, "# Complete: ", passed + Length(failures), " proofs in ",
         Int((Runtime() - startTime) / 1000), "s\n");
CloseStream(out);
if Length(failures) = 0 then
    Print("Worker {id}: ALL ", passed, " PROOFS VERIFIED\n");
else
    Print("Worker {id}: ", Length(failures), " proofs FAILED\n");
fi;
QUIT;
"##,
        id = p.worker_id,
        workers = p.num_workers,
        n = p.n,
        result = string_literal(&p.result_file),
        data = string_literal(&p.data_file),
        data_var = p.data_var,
        proofs = string_literal(&p.proof_file),
        proof_var = p.proof_var,
    );
    s
}

/// GAP-side regression scripts shipped with `selftest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKind {
    /// Label sanitizing, invariant keys and both histogram paths.
    Prelude,
    /// Conjugacy against isomorphism on hand-picked buckets.
    Buckets,
    /// Dedup of every subgroup class of S_4 with extra conjugates.
    Integration,
    /// ANUPQ p-group isomorphism.
    AnuPq,
}

const TEST_HARNESS: &str = r##"
CENSUS_TEST := rec( pass := 0, fail := 0, errors := 0 );

CensusCheck := function(name, ok)
    if ok = true then
        CENSUS_TEST.pass := CENSUS_TEST.pass + 1;
        Print("  PASS: ", name, "\n");
    elif ok = false then
        CENSUS_TEST.fail := CENSUS_TEST.fail + 1;
        Print("  FAIL: ", name, "\n");
    else
        CENSUS_TEST.errors := CENSUS_TEST.errors + 1;
        Print("  ERROR: ", name, " returned ", ok, "\n");
    fi;
end;

CensusImagesGroup := function(lists)
    return CensusGroupFromImages(lists);
end;
"##;

const PRELUDE_TESTS: &str = r##"
Print("Prelude helper tests\n");
CensusCheck("sanitize label", CensusSanitizeLabel("15:2(3)") = "L15_2_3_");
CensusCheck("sanitize empty label", CensusSanitizeLabel("") = "L");
CensusCheck("invariant key of S3",
            CensusInvariantKey(SymmetricGroup(3)) = [ 6, 3, 3, 2, [ 2 ] ]);
CensusCheck("invariant key of A5", CensusInvariantKey(AlternatingGroup(5))[4] = -1);
G := Group((1,2,3), (1,2));;
CensusCheck("images round trip", CensusGroupFromImages(CensusImages(G, 5)) = G);
CensusCheck("trivial group from no images", Size(CensusGroupFromImages([])) = 1);
small := CensusHistogram(G, 5);;
CensusCheck("small histogram", small = [ [ [ 1, 5 ], 1 ], [ [ 2, 3 ], 3 ], [ [ 3, 2 ], 2 ] ]);
big := SymmetricGroup(7);;
CensusCheck("large group takes the class path", Size(big) > CENSUS_ELEMENT_LIMIT);
CensusCheck("class histogram matches elements",
            CensusHistogram(big, 8) =
            Collected(List(AsList(big), x -> [ Order(x), 8 - NrMovedPoints(x) ])));
"##;

const BUCKET_TESTS: &str = r##"
Print("Bucket regression tests\n");
S4DATA := [];;
S4DATA[1] := rec( index := 1, gens := [ [ 2, 1, 3, 4 ] ] );;
S4DATA[2] := rec( index := 2, gens := [ [ 2, 1, 4, 3 ] ] );;
S4DATA[3] := rec( index := 3, gens := [ [ 2, 1, 3, 4 ], [ 1, 2, 4, 3 ] ] );;
S4DATA[4] := rec( index := 4, gens := [ [ 3, 2, 1, 4 ], [ 1, 4, 3, 2 ] ] );;
CensusCheck("C2 embeddings are not conjugate",
            CensusDedupBucket([ 1, 2 ], S4DATA, 4, "conjugacy") = [ 1, 2 ]);
CensusCheck("C2 embeddings are isomorphic",
            CensusDedupBucket([ 1, 2 ], S4DATA, 4, "isomorphism") = [ 1 ]);
CensusCheck("conjugate V4s collapse",
            CensusDedupBucket([ 3, 4 ], S4DATA, 4, "conjugacy") = [ 3 ]);
CensusCheck("orders differ",
            CensusSameClass(CensusImagesGroup(S4DATA[1].gens),
                            CensusImagesGroup(S4DATA[3].gens),
                            SymmetricGroup(4), "isomorphism") = false);
"##;

const INTEGRATION_TESTS: &str = r##"
Print("Deduplication integration tests\n");
S4 := SymmetricGroup(4);;
classes := List(ConjugacyClassesSubgroups(S4), Representative);;
data := [];;
idx := 0;;
for H in classes do
    idx := idx + 1;
    data[idx] := rec( index := idx, gens := CensusImages(H, 4) );
    idx := idx + 1;
    data[idx] := rec( index := idx, gens := CensusImages(H ^ (1,2,3,4), 4) );
od;
CensusCheck("class count of S4", Length(classes) = 11);
CensusCheck("conjugacy dedup keeps one per class",
            Length(CensusDedupBucket([ 1 .. idx ], data, 4, "conjugacy")) = 11);
CensusCheck("isomorphism dedup gives the type count",
            Length(CensusDedupBucket([ 1 .. idx ], data, 4, "isomorphism")) = 9);
"##;

const ANUPQ_TESTS: &str = r##"
Print("ANUPQ tests\n");
D8a := Group((1,2,3,4), (1,3));;
D8b := Group((5,6,7,8), (5,7));;
C4C2 := Group((1,2,3,4), (5,6));;
S8 := SymmetricGroup(8);;
CensusCheck("dihedral copies are isomorphic", CensusSameClass(D8a, D8b, S8, "pgroup"));
CensusCheck("D8 is not C4 x C2", not CensusSameClass(D8a, C4C2, S8, "pgroup"));
CensusCheck("Q8 is not D8",
            not CensusSameClass(D8a, Image(IsomorphismPermGroup(QuaternionGroup(8))), S8, "pgroup"));
"##;

/// A standalone GAP test script. Results go to `result_file` as
/// `rec( passCount := .., failCount := .., errorCount := .. )`.
pub fn test_script(kind: TestKind, result_file: &str) -> String {
    let mut s = String::new();
    let (title, body) = match kind {
        TestKind::Prelude => ("prelude helpers", PRELUDE_TESTS),
        TestKind::Buckets => ("bucket regression", BUCKET_TESTS),
        TestKind::Integration => ("deduplication integration", INTEGRATION_TESTS),
        TestKind::AnuPq => ("ANUPQ p-groups", ANUPQ_TESTS),
    };
    let _ = writeln!(s, "# Census self test: {:}", title);
    s.push_str("\nSetInfoLevel(InfoWarning, 0);;\n");
    if kind == TestKind::AnuPq {
        s.push_str("LoadPackage(\"anupq\");;\n");
    }
    s.push_str(PRELUDE);
    s.push_str(DEDUP_FUNCTIONS);
    s.push_str(TEST_HARNESS);
    s.push_str(body);
    let _ = write!(
        s,
        r##"
out := CensusOpenOutput({result}, false);;
AppendTo(out, "rec(\n  passCount := ", CENSUS_TEST.pass,
         ",\n  failCount := ", CENSUS_TEST.fail,
         ",\n  errorCount := ", CENSUS_TEST.errors, " )\n");
CloseStream(out);
Print("Passed: ", CENSUS_TEST.pass, "  Failed: ", CENSUS_TEST.fail,
      "  Errors: ", CENSUS_TEST.errors, "\n");
QUIT;
"##,
        result = string_literal(result_file),
    );
    s
}

/// Names every GAP function a complete worker script must define.
pub const REQUIRED_FUNCTIONS: &[&str] = &[
    "CensusOpenOutput",
    "CensusAppend",
    "CensusSanitizeLabel",
    "CensusInvariantKey",
    "CensusGroupFromImages",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selftest::unbalanced_at;

    fn balanced(script: &str) -> bool {
        unbalanced_at(script).is_none()
    }

    #[test]
    fn literals() {
        assert_eq!(string_literal("C:/x \"y\""), "\"C:/x \\\"y\\\"\"");
    }

    #[test]
    fn dedup_script_embeds_resume_state() {
        let resume = vec![BucketCheckpoint {
            bucket: 2,
            size: 4,
            num_reps: 2,
            reps: vec![10, 12],
        }];
        let script = dedup_worker_script(&DedupWorkerParams {
            worker_name: "regular_3",
            n: 14,
            method: DedupMethod::Isomorphism,
            data_file: "/cygdrive/c/w/s14_invariants.g".to_string(),
            data_var: INVARIANTS_VAR,
            bucket_file: "/cygdrive/c/w/buckets/buckets_regular_3.g".to_string(),
            checkpoint_file: "/cygdrive/c/w/checkpoints/checkpoint_regular_3.g".to_string(),
            result_file: "/cygdrive/c/w/results/result_regular_3.g".to_string(),
            result_var: "RESULT_REPS_REGULAR_3".to_string(),
            resume: &resume,
        });
        assert!(script.contains("DONE_BUCKETS[2] := [ 10, 12 ];;"));
        assert!(script.contains("Resuming: 1 buckets already done"));
        assert!(script.contains("\"RESULT_REPS_REGULAR_3 := \", totalReps"));
        assert!(script.contains("\"isomorphism\""));
        assert!(!script.contains("anupq"));
        for f in REQUIRED_FUNCTIONS {
            assert!(script.contains(&format!("{:} := function", f)));
        }
        assert!(balanced(&script));
    }

    #[test]
    fn pgroup_worker_loads_anupq() {
        let script = dedup_worker_script(&DedupWorkerParams {
            worker_name: "2groups",
            n: 14,
            method: DedupMethod::PGroup,
            data_file: "d.g".to_string(),
            data_var: INVARIANTS_VAR,
            bucket_file: "b.g".to_string(),
            checkpoint_file: "c.g".to_string(),
            result_file: "r.g".to_string(),
            result_var: "RESULT_REPS_2GROUPS".to_string(),
            resume: &[],
        });
        assert!(script.contains("LoadPackage(\"anupq\")"));
        assert!(script.contains("checkpoint file"));
        assert!(balanced(&script));
    }

    #[test]
    fn leaf_script_skips_completed_labels() {
        let mut done = FxHashSet::default();
        done.insert("15:2".to_string());
        let script = leaf_worker_script(&LeafWorkerParams {
            worker_id: 2,
            n: 15,
            batch_file: "/cygdrive/c/w/leaf_batch_2.g".to_string(),
            result_file: "/cygdrive/c/w/leaf_results_2.g".to_string(),
            completed: &done,
        });
        assert!(script.contains("completedLeaves.L15_2 := true;;"));
        assert!(script.contains("resumeMode := true;;"));
        assert!(script.contains("# Leaf complete: "));
        assert!(balanced(&script));
    }

    #[test]
    fn precompute_variants() {
        let full = precompute_script(&PrecomputeParams {
            n: 13,
            cache_file: "s13_subgroups.g".to_string(),
            invariants_file: "s13_invariants.g".to_string(),
            skip_conjugacy: false,
            skip_invariants: false,
        });
        assert!(full.contains("ConjugacyClassesSubgroups(SymmetricGroup(n))"));
        assert!(full.contains("CENSUS_INVARIANTS := [\\n"));
        assert!(full.contains("CENSUS_ELEMENT_LIMIT := 5000;"));
        assert!(full.contains("if Size(H) <= CENSUS_ELEMENT_LIMIT then"));
        assert!(full.contains("for c in ConjugacyClasses(H) do"));
        assert!(balanced(&full));

        let cached = precompute_script(&PrecomputeParams {
            n: 13,
            cache_file: "s13_subgroups.g".to_string(),
            invariants_file: "s13_invariants.g".to_string(),
            skip_conjugacy: true,
            skip_invariants: true,
        });
        assert!(cached.contains("ReadAsFunction(cacheFile)()"));
        assert!(!cached.contains("ConjugacyClassesSubgroups"));
        assert!(!cached.contains("CENSUS_INVARIANTS"));
        assert!(balanced(&cached));
    }

    #[test]
    fn verify_script_slices_proofs() {
        let script = verify_proofs_script(&VerifyProofsParams {
            worker_id: 3,
            num_workers: 8,
            n: 15,
            data_file: "/mnt/c/w/s15_invariants.g".to_string(),
            data_var: INVARIANTS_VAR,
            proof_file: "/mnt/c/w/proofs.g".to_string(),
            proof_var: "S15_PROOFS",
            result_file: "/mnt/c/w/verify/verify_worker_3_results.txt".to_string(),
        });
        assert!(script.contains("WORKER_ID := 3;;"));
        assert!(script.contains("NUM_WORKERS := 8;;"));
        assert!(script.contains("PROOFS := S15_PROOFS;;"));
        assert!(script.contains("Read(\"/mnt/c/w/proofs.g\");"));
        assert!(script.contains("\"Passed: \", passed"));
        assert!(script.contains("\"FAIL proof \", f[1], \" (dup=\""));
        assert!(script.contains("\"# Complete: \""));
        assert!(script.contains("return \"map is not surjective\";"));
        assert!(balanced(&script));
    }

    #[test]
    fn test_scripts_report_counts() {
        for kind in [
            TestKind::Prelude,
            TestKind::Buckets,
            TestKind::Integration,
            TestKind::AnuPq,
        ] {
            let script = test_script(kind, "/tmp/out/test_result.g");
            assert!(script.contains("CensusCheck := function(name, ok)"));
            assert!(script.contains("passCount := "));
            assert!(script.contains("errorCount := "));
            assert!(script.contains("CensusOpenOutput(\"/tmp/out/test_result.g\", false)"));
            assert_eq!(script.contains("LoadPackage(\"anupq\")"), kind == TestKind::AnuPq);
            assert!(balanced(&script), "{:?} is unbalanced", kind);
        }
        let prelude = test_script(TestKind::Prelude, "r.g");
        assert!(prelude.contains("CensusHistogram(big, 8)"));
        let integration = test_script(TestKind::Integration, "r.g");
        assert!(integration.contains("\"isomorphism\")) = 9);"));
    }
}
