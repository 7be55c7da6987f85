//! End-to-end scenarios across the public API: a full working-copy
//! lifecycle (commit, branch, merge, patch transport), repository
//! reconstruction, and randomized round-trip properties for the delta
//! codec and the blob store.

use std::fs;
use std::str::FromStr;

use quickcheck::quickcheck;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use chert::checkout::{self, add_file, commit, update_to};
use chert::manifest::{parse_artifact, ArtifactKind, ControlArtifact};
use chert::merge::{merge, MergeOptions};
use chert::patch::{patch_create, patch_apply, PatchApplyOptions, PatchFile};
use chert::graph::{Graph, GraphFlags, GR_MAX_RAIL};
use chert::{branch, delta, rebuild, store, Repository};

fn workspace() -> (Repository, TempDir) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = TempDir::new().unwrap();
    let mut repo = Repository::create_in_memory("alice").unwrap();
    repo.set_local_root(dir.path());
    (repo, dir)
}

/// The full lifecycle: init, commit, branch, cross-branch merge with a
/// rename, patch transport into a second workspace, and a final rebuild
/// that leaves the derived state intact.
#[test]
fn full_lifecycle() {
    let (mut repo, dir) = workspace();

    // S1: first commit and a branch off it.
    fs::write(dir.path().join("README.md"), "hello\n").unwrap();
    add_file(&mut repo, "README.md").unwrap();
    let m1 = commit(&mut repo, "initial").unwrap();
    let m2 = branch::branch_new(&mut repo, "feat", m1, None, false).unwrap();
    let branch_manifest = parse_artifact(&mut repo, m2).unwrap();
    assert_eq!(branch_manifest.kind(), ArtifactKind::Manifest);
    assert!(branch_manifest
        .tags
        .iter()
        .any(|t| t.prefix == '*' && t.name == "branch" && t.value.as_deref() == Some("feat")));
    assert!(branch_manifest
        .tags
        .iter()
        .any(|t| t.prefix == '-' && t.name == "sym-trunk"));

    // S2: rename on feat, edit on trunk, merge trunk into feat.
    update_to(&mut repo, m2).unwrap();
    checkout::mv_file(&mut repo, "README.md", "docs/readme.md").unwrap();
    let f2 = commit(&mut repo, "move readme").unwrap();
    update_to(&mut repo, m1).unwrap();
    fs::write(dir.path().join("README.md"), "hi\n").unwrap();
    let trunk_tip = commit(&mut repo, "tweak greeting").unwrap();
    update_to(&mut repo, f2).unwrap();
    let stats = merge(&mut repo, trunk_tip, &MergeOptions::default()).unwrap();
    assert_eq!(stats.conflicts, 0, "warnings: {:?}", stats.warnings);
    assert_eq!(
        fs::read_to_string(dir.path().join("docs/readme.md")).unwrap(),
        "hi\n"
    );
    let merged = commit(&mut repo, "merge trunk").unwrap();
    let mm = parse_artifact(&mut repo, merged).unwrap();
    assert_eq!(mm.parents.len(), 2);
    assert_eq!(mm.parents[1], repo.uuid_for_rid(trunk_tip).unwrap());

    // S4: carry an edit through a patch bundle into a fresh workspace.
    fs::write(dir.path().join("docs/readme.md"), "hi there\n").unwrap();
    let bundle = patch_create(&mut repo, None).unwrap();
    checkout::revert(&mut repo, None).unwrap();
    let dir_b = TempDir::new().unwrap();
    repo.set_local_root(dir_b.path());
    checkout::open_checkout(&mut repo, merged).unwrap();
    let patch = PatchFile::from_bytes(&bundle).unwrap();
    patch_apply(&mut repo, &patch, &PatchApplyOptions::default()).unwrap();
    assert_eq!(
        fs::read_to_string(dir_b.path().join("docs/readme.md")).unwrap(),
        "hi there\n"
    );

    // Rebuild from the artifacts; the store must stay self-consistent.
    rebuild::rebuild(&mut repo, true).unwrap();
    assert!(store::integrity_check(&mut repo).unwrap().is_empty());
    assert_eq!(
        chert::tag::branch_of_rid(&repo, merged).unwrap().as_deref(),
        Some("feat")
    );
}

/// Reconstruction from an exported tree reproduces every artifact in a
/// brand-new repository.
#[test]
fn reconstruct_from_export() {
    let (mut repo, dir) = workspace();
    fs::write(dir.path().join("src.rs"), "fn main() {}\n").unwrap();
    add_file(&mut repo, "src.rs").unwrap();
    let v1 = commit(&mut repo, "one").unwrap();
    fs::write(dir.path().join("src.rs"), "fn main() { println!(); }\n").unwrap();
    let v2 = commit(&mut repo, "two").unwrap();

    let export = TempDir::new().unwrap();
    rebuild::deconstruct(&mut repo, export.path(), true, false).unwrap();

    let mut repo2 = Repository::create_in_memory("bob").unwrap();
    rebuild::reconstruct(&mut repo2, export.path()).unwrap();
    for rid in [v1, v2] {
        let uuid = repo.uuid_for_rid(rid).unwrap();
        let other = repo2.rid_for_uuid(&uuid).unwrap().unwrap();
        assert_eq!(
            store::get(&mut repo, rid).unwrap(),
            store::get(&mut repo2, other).unwrap()
        );
    }
    assert!(store::integrity_check(&mut repo2).unwrap().is_empty());
}

/// A manifest round-trips through text parse unchanged in meaning after
/// being stored and fetched.
#[test]
fn manifest_survives_storage() {
    let (mut repo, dir) = workspace();
    fs::write(dir.path().join("a.txt"), "data\n").unwrap();
    add_file(&mut repo, "a.txt").unwrap();
    let v1 = commit(&mut repo, "with \"quotes\" and spaces").unwrap();
    let raw = store::get(&mut repo, v1).unwrap();
    let reparsed = ControlArtifact::from_str(std::str::from_utf8(&raw).unwrap()).unwrap();
    assert_eq!(reparsed.kind(), ArtifactKind::Manifest);
    assert_eq!(
        reparsed.comment.as_deref(),
        Some("with \"quotes\" and spaces")
    );
    assert_eq!(reparsed.user.as_deref(), Some("alice"));
}

/// S6 at the API level: a synthetic history with more concurrent branches
/// than rails overflows deterministically.
#[test]
fn graph_overflow_is_deterministic() {
    let run = || {
        let mut g = Graph::new();
        for i in 0..80i64 {
            g.add_row(1000 + i, vec![2000 + i], 0, &format!("b{i}"), None, true);
        }
        for i in 0..80i64 {
            g.add_row(2000 + i, vec![], 0, &format!("b{i}"), None, false);
        }
        g.finish(None, GraphFlags::default());
        let rails: Vec<i32> = g.rows().iter().map(|r| r.i_rail).collect();
        (g.b_overfull, g.mx_rail, rails)
    };
    let (overfull, mx, rails) = run();
    assert!(overfull);
    assert_eq!(mx, GR_MAX_RAIL as i32);
    assert_eq!(run(), (overfull, mx, rails));
}

quickcheck! {
    /// Delta round-trip over arbitrary byte vectors.
    fn prop_delta_round_trip(src: Vec<u8>, dst: Vec<u8>) -> bool {
        let d = delta::create(&src, &dst);
        let size_ok = matches!(delta::output_size(&d), Ok(n) if n == dst.len());
        size_ok && delta::apply(&src, &d).map(|out| out == dst).unwrap_or(false)
    }
}

/// Store round-trip under a randomized workload of puts and deltifies.
#[test]
fn randomized_store_workload() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut repo = Repository::create_in_memory("alice").unwrap();
    let mut expected: Vec<(i64, Vec<u8>)> = Vec::new();
    let mut base = vec![b'x'; 600];
    for i in 0..40 {
        // Mutate a few bytes so versions stay similar but distinct.
        for _ in 0..3 {
            let at = rng.gen_range(0..base.len());
            base[at] = rng.gen_range(b'a'..=b'z');
        }
        base.extend_from_slice(format!("round {i}\n").as_bytes());
        let rid = store::put(&mut repo, &base, false).unwrap();
        expected.push((rid, base.clone()));
        if expected.len() > 1 && rng.gen_bool(0.5) {
            let prev = expected[expected.len() - 2].0;
            store::deltify(&mut repo, prev, &[rid], false).unwrap();
        }
    }
    repo.clear_caches();
    for (rid, content) in &expected {
        assert_eq!(&store::get(&mut repo, *rid).unwrap(), content);
    }
    assert!(store::integrity_check(&mut repo).unwrap().is_empty());
}
