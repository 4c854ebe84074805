//! End-to-end session scenarios: selective recompilation, caching,
//! aliasing, cleanup. Every compiled result is cross-checked against the
//! reference interpreter.

mod common;

use nbjit::{new_session, read_program, CellClass, NbError, PureOutcome};

const CELL_V1: &str = "x = 10\n@hole y = 5\nz = x + y\nreturn z";
const CELL_V2_HOLE_EDIT: &str = "x = 10\n@hole y = 20\nz = x + y\nreturn z";
const CELL_V3_MAIN_EDIT: &str = "x = 100\n@hole y = 20\nz = x + y\nreturn z";

#[test]
fn cold_submit_compiles_everything() {
    let mut session = new_session();
    let ast = read_program(CELL_V1).unwrap();
    let result = session.run_cell(&ast, "c1").unwrap();

    assert_eq!(result.value, 15);
    assert_eq!(result.value, common::interp_i64(CELL_V1));
    assert_eq!(result.class, CellClass::FullRebuild);
    assert!(result.main_rebuilt);
    assert_eq!(result.recompiled_holes, vec![1]);
    assert!(result.main_object.is_some());

    session.cleanup_session();
}

#[test]
fn identical_resubmission_is_an_alias_hit() {
    let mut session = new_session();
    let ast = read_program(CELL_V1).unwrap();
    let first = session.run_cell(&ast, "c1").unwrap();
    let second = session.run_cell(&ast, "c1").unwrap();

    assert_eq!(first.value, second.value);
    assert_eq!(second.class, CellClass::AliasHit);
    assert!(!second.main_rebuilt);
    assert!(second.recompiled_holes.is_empty());

    session.cleanup_session();
}

#[test]
fn hole_edit_recompiles_only_the_hole() {
    let mut session = new_session();
    session
        .run_cell(&read_program(CELL_V1).unwrap(), "c1")
        .unwrap();
    let (main_before, holes_before) = session.artifact_paths("c1").unwrap();

    let result = session
        .run_cell(&read_program(CELL_V2_HOLE_EDIT).unwrap(), "c1")
        .unwrap();
    assert_eq!(result.value, 30);
    assert_eq!(result.value, common::interp_i64(CELL_V2_HOLE_EDIT));
    assert_eq!(result.class, CellClass::HoleUpdate);
    assert!(!result.main_rebuilt);
    assert_eq!(result.recompiled_holes, vec![1]);

    let (main_after, holes_after) = session.artifact_paths("c1").unwrap();
    // Main is untouched on disk; the hole object is a new file.
    assert_eq!(main_before, main_after);
    assert!(main_after.exists());
    assert_ne!(holes_before[0], holes_after[0]);
    assert!(holes_after[0].exists());
    assert!(!holes_before[0].exists());

    session.cleanup_session();
}

#[test]
fn structure_edit_forces_full_rebuild() {
    let mut session = new_session();
    session
        .run_cell(&read_program(CELL_V2_HOLE_EDIT).unwrap(), "c1")
        .unwrap();
    let (main_before, _) = session.artifact_paths("c1").unwrap();

    let result = session
        .run_cell(&read_program(CELL_V3_MAIN_EDIT).unwrap(), "c1")
        .unwrap();
    assert_eq!(result.value, 120);
    assert_eq!(result.value, common::interp_i64(CELL_V3_MAIN_EDIT));
    assert_eq!(result.class, CellClass::FullRebuild);
    assert!(result.main_rebuilt);
    assert_eq!(result.recompiled_holes, vec![1]);

    let (main_after, _) = session.artifact_paths("c1").unwrap();
    assert_ne!(main_before, main_after);

    session.cleanup_session();
}

#[test]
fn second_of_two_holes_recompiles_alone() {
    let mut session = new_session();
    let v1 = "x = 10\n@hole a = 5\n@hole b = 3\nreturn x + a + b";
    let v2 = "x = 10\n@hole a = 5\n@hole b = 7\nreturn x + a + b";

    let first = session.run_cell(&read_program(v1).unwrap(), "c1").unwrap();
    assert_eq!(first.value, 18);
    assert_eq!(first.recompiled_holes, vec![1, 2]);
    let (_, holes_before) = session.artifact_paths("c1").unwrap();

    let second = session.run_cell(&read_program(v2).unwrap(), "c1").unwrap();
    assert_eq!(second.value, 22);
    assert_eq!(second.value, common::interp_i64(v2));
    assert_eq!(second.class, CellClass::HoleUpdate);
    assert!(!second.main_rebuilt);
    assert_eq!(second.recompiled_holes, vec![2]);

    let (_, holes_after) = session.artifact_paths("c1").unwrap();
    assert_eq!(holes_before[0], holes_after[0]);
    assert_ne!(holes_before[1], holes_after[1]);

    session.cleanup_session();
}

#[test]
fn pure_cells_cache_by_fingerprint() {
    let mut session = new_session();
    let src = "a = 1\nb = 2\nreturn a + b";
    let ast = read_program(src).unwrap();

    let first = session.run_cell(&ast, "p1").unwrap();
    assert_eq!(first.class, CellClass::PureCompiled);
    assert_eq!(first.value, 3);

    let second = session.run_cell(&ast, "p1").unwrap();
    assert_eq!(second.class, CellClass::PureCached);
    assert!(!second.main_rebuilt);

    // The counter only moves on real invocations.
    assert_eq!(session.execution_count("p1"), 1);

    // Whitespace-only edits hit the cache too: fingerprints strip
    // positions.
    let respaced = read_program("a = 1\n\n\nb = 2\nreturn a + b").unwrap();
    match session.run_pure_cell(&respaced, "p1").unwrap() {
        PureOutcome::Cached => {}
        other => panic!("expected cached, got {:?}", other),
    }

    session.cleanup_session();
}

#[test]
fn same_source_under_new_id_aliases_without_recompiling() {
    let mut session = new_session();
    let ast = read_program(CELL_V1).unwrap();
    session.run_cell(&ast, "a").unwrap();
    let (main_a, holes_a) = session.artifact_paths("a").unwrap();

    let result = session.run_cell(&ast, "b").unwrap();
    assert_eq!(result.class, CellClass::ContentHit);
    assert_eq!(result.value, 15);
    assert!(result.recompiled_holes.is_empty());

    // Both ids resolve to the same artifacts: one compilation total.
    let (main_b, holes_b) = session.artifact_paths("b").unwrap();
    assert_eq!(main_a, main_b);
    assert_eq!(holes_a, holes_b);

    // Alias stability: repeated submissions stay alias hits and the
    // dereference keeps working.
    for _ in 0..3 {
        let again = session.run_cell(&ast, "b").unwrap();
        assert_eq!(again.class, CellClass::AliasHit);
    }

    session.cleanup_session();
}

#[test]
fn edited_hole_under_new_id_clones_and_patches() {
    let mut session = new_session();
    session
        .run_cell(&read_program(CELL_V1).unwrap(), "a")
        .unwrap();

    let result = session
        .run_cell(&read_program(CELL_V2_HOLE_EDIT).unwrap(), "b")
        .unwrap();
    assert_eq!(result.class, CellClass::CloneAndPatch);
    assert_eq!(result.value, 30);
    assert_eq!(result.recompiled_holes, vec![1]);

    // The canonical record is untouched and still runs.
    let original = session
        .run_cell(&read_program(CELL_V1).unwrap(), "a")
        .unwrap();
    assert_eq!(original.class, CellClass::AliasHit);
    assert_eq!(original.value, 15);

    // The two records own distinct artifacts.
    let (main_a, _) = session.artifact_paths("a").unwrap();
    let (main_b, _) = session.artifact_paths("b").unwrap();
    assert_ne!(main_a, main_b);

    session.cleanup_session();
}

#[test]
fn clone_and_patch_copies_unchanged_holes() {
    let mut session = new_session();
    let v1 = "x = 10\n@hole a = 5\n@hole b = 3\nreturn x + a + b";
    let v2 = "x = 10\n@hole a = 5\n@hole b = 7\nreturn x + a + b";
    session.run_cell(&read_program(v1).unwrap(), "a").unwrap();

    let result = session.run_cell(&read_program(v2).unwrap(), "b").unwrap();
    assert_eq!(result.class, CellClass::CloneAndPatch);
    assert_eq!(result.value, 22);
    // Only the edited hole was recompiled; the first was duplicated.
    assert_eq!(result.recompiled_holes, vec![2]);

    let (_, holes_a) = session.artifact_paths("a").unwrap();
    let (_, holes_b) = session.artifact_paths("b").unwrap();
    assert_ne!(holes_a[0], holes_b[0]);
    let bytes_a = std::fs::read(&holes_a[0]).unwrap();
    let bytes_b = std::fs::read(&holes_b[0]).unwrap();
    assert_eq!(bytes_a, bytes_b, "unchanged hole object is a byte copy");

    session.cleanup_session();
}

#[test]
fn editing_a_cloned_shared_hole_escalates_to_full_rebuild() {
    let mut session = new_session();
    let v1 = "x = 1\n@hole y = 5\nreturn x + y";
    let v2 = "x = 1\n@hole y = 6\nreturn x + y";
    let v3 = "x = 1\n@hole y = 7\nreturn x + y";
    session.run_cell(&read_program(v1).unwrap(), "a").unwrap();

    let cloned = session.run_cell(&read_program(v2).unwrap(), "b").unwrap();
    assert_eq!(cloned.class, CellClass::CloneAndPatch);
    assert_eq!(cloned.value, 7);

    // "b" recompiled its hole fresh, so a further edit swaps in place...
    let updated = session.run_cell(&read_program(v3).unwrap(), "b").unwrap();
    assert_eq!(updated.class, CellClass::HoleUpdate);
    assert_eq!(updated.value, 8);

    // ...while a two-hole clone would have copied an unchanged hole under
    // a shared symbol; editing that one forces a full rebuild.
    let w1 = "x = 1\n@hole p = 1\n@hole q = 2\nreturn x + p + q";
    let w2 = "x = 1\n@hole p = 1\n@hole q = 9\nreturn x + p + q";
    let w3 = "x = 1\n@hole p = 4\n@hole q = 9\nreturn x + p + q";
    session.run_cell(&read_program(w1).unwrap(), "c").unwrap();
    let cloned = session.run_cell(&read_program(w2).unwrap(), "d").unwrap();
    assert_eq!(cloned.class, CellClass::CloneAndPatch);
    assert_eq!(cloned.value, 11);

    // p in "d" is a shared-symbol copy from "c".
    let escalated = session.run_cell(&read_program(w3).unwrap(), "d").unwrap();
    assert_eq!(escalated.class, CellClass::FullRebuild);
    assert_eq!(escalated.value, 14);

    session.cleanup_session();
}

#[test]
fn failed_submission_preserves_previous_record() {
    let mut session = new_session();
    let good = read_program(CELL_V1).unwrap();
    session.run_cell(&good, "c1").unwrap();
    let paths_before = session.artifact_paths("c1").unwrap();

    // A main-structure edit that references an undefined name fails in
    // the IR builder.
    let bad = read_program("x = 10\n@hole y = 5\nz = x + q\nreturn z").unwrap();
    let err = session.run_cell(&bad, "c1").unwrap_err();
    assert!(matches!(err, NbError::IrBuild { .. }));

    // The previous record is intact and still an alias hit.
    assert_eq!(session.artifact_paths("c1").unwrap(), paths_before);
    let again = session.run_cell(&good, "c1").unwrap();
    assert_eq!(again.class, CellClass::AliasHit);
    assert_eq!(again.value, 15);

    session.cleanup_session();
}

#[test]
fn hole_reading_guard_values_compiles_against_them() {
    let mut session = new_session();
    let src = "x = 10\n@hole y = x + 5\nreturn y";
    let result = session
        .run_cell(&read_program(src).unwrap(), "c1")
        .unwrap();
    assert_eq!(result.value, 15);
    assert_eq!(result.value, common::interp_i64(src));
    session.cleanup_session();
}

#[test]
fn expression_hole_runs_as_a_statement() {
    let mut session = new_session();
    let src = "x = 2\n@hole x * 3\nreturn x";
    let result = session
        .run_cell(&read_program(src).unwrap(), "c1")
        .unwrap();
    assert_eq!(result.value, 2);
    assert_eq!(result.value, common::interp_i64(src));
    session.cleanup_session();
}

#[test]
fn multi_statement_hole_body_compiles() {
    let mut session = new_session();
    // The hole's call site binds the target of the body's first
    // assignment, so the name main needs comes first.
    let src = "x = 3\n@hole begin\n y = x * 2\n y = y + 1\nend\nreturn y";
    let result = session
        .run_cell(&read_program(src).unwrap(), "c1")
        .unwrap();
    assert_eq!(result.value, 7);
    assert_eq!(result.value, common::interp_i64(src));
    session.cleanup_session();
}

#[test]
fn execution_counter_tracks_invocations() {
    let mut session = new_session();
    let ast = read_program(CELL_V1).unwrap();
    assert_eq!(session.execution_count("c1"), 0);
    session.run_cell(&ast, "c1").unwrap();
    session.run_cell(&ast, "c1").unwrap();
    session.run_cell(&ast, "c1").unwrap();
    assert_eq!(session.execution_count("c1"), 3);
    session.cleanup_session();
}

#[test]
fn cleanup_removes_every_artifact() {
    let mut session = new_session();
    session
        .run_cell(&read_program(CELL_V1).unwrap(), "c1")
        .unwrap();
    session
        .run_cell(
            &read_program("x = 10\n@hole a = 5\n@hole b = 3\nreturn x + a + b").unwrap(),
            "c2",
        )
        .unwrap();

    let (main1, holes1) = session.artifact_paths("c1").unwrap();
    let (main2, holes2) = session.artifact_paths("c2").unwrap();
    for p in [&main1, &main2]
        .into_iter()
        .chain(holes1.iter())
        .chain(holes2.iter())
    {
        assert!(p.exists(), "{} should exist before cleanup", p.display());
    }

    session.cleanup_session();
    assert_eq!(session.cell_count(), 0);
    for p in [&main1, &main2]
        .into_iter()
        .chain(holes1.iter())
        .chain(holes2.iter())
    {
        assert!(!p.exists(), "{} should be gone after cleanup", p.display());
    }
}

#[test]
fn cleanup_cell_releases_only_that_cell() {
    let mut session = new_session();
    session
        .run_cell(&read_program(CELL_V1).unwrap(), "keep")
        .unwrap();
    session
        .run_cell(&read_program(CELL_V3_MAIN_EDIT).unwrap(), "drop")
        .unwrap();
    let (main_keep, _) = session.artifact_paths("keep").unwrap();
    let (main_drop, _) = session.artifact_paths("drop").unwrap();

    session.cleanup_cell("drop");
    assert!(main_keep.exists());
    assert!(!main_drop.exists());
    assert!(session.artifact_paths("drop").is_none());

    session.cleanup_session();
}

#[test]
fn cleanup_of_canonical_drops_its_aliases() {
    let mut session = new_session();
    let ast = read_program(CELL_V1).unwrap();
    session.run_cell(&ast, "a").unwrap();
    let aliased = session.run_cell(&ast, "b").unwrap();
    assert_eq!(aliased.class, CellClass::ContentHit);

    session.cleanup_cell("a");
    // The alias died with its canonical record; the next submission of
    // "b" is a fresh compile.
    let fresh = session.run_cell(&ast, "b").unwrap();
    assert_eq!(fresh.class, CellClass::FullRebuild);
    assert_eq!(fresh.value, 15);

    session.cleanup_session();
}

#[test]
fn run_pure_cell_rejects_holes() {
    let mut session = new_session();
    let ast = read_program(CELL_V1).unwrap();
    let err = session.run_pure_cell(&ast, "c1").unwrap_err();
    assert!(matches!(err, NbError::InvalidAst { .. }));
}
