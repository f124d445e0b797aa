use rand::rngs::StdRng;
use rand::SeedableRng;
use rtree_index::disk_rtree::rtree_storage::PageFile;
use rtree_index::disk_rtree::{ChildRef, LeafEntry, Node, TREE_FILE_NAME};
use rtree_index::{
    Bounds, IndexError, ManagerError, MemoryElementMapper, OpenFailure, RTree, ReferenceSystem,
    StorageError,
};
use rtree_index_int_test::test_util::{
    cleanup, create_test_context, envelope, random_envelopes, run_test, small_tree_config,
    TestContext, TestResult,
};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Flip one byte inside the body of `page_id`, past the frame's checksum and
/// length prefix.
fn corrupt_page(path: &Path, page_size: u64, page_id: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let offset = page_id * page_size + 40;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut byte)?;
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()
}

/// Replace the root page of a closed tree with whatever `rewrite` returns,
/// framed with a valid checksum.
fn rewrite_root(path: &Path, rewrite: impl FnOnce(u64, u32) -> Node) -> TestResult {
    let (file, header) = PageFile::open(path)?;
    let node = rewrite(header.root_page, header.height);
    file.write_node(header.root_page, &node)?;
    file.sync()?;
    Ok(())
}

/// Search, insert and remove must all refuse to work on the damaged tree.
fn assert_operations_fail(ctx: &TestContext, name: &str, existing: &str) -> TestResult {
    let tree = ctx.tree(name)?;

    let results: Vec<_> = tree.search(Bounds::everything(2))?.iter().collect();
    let failure = results.iter().find_map(|r| r.as_ref().err());
    assert!(
        matches!(failure, Some(IndexError::CorruptTree(_))),
        "search: {:?}",
        failure
    );

    let inserted = tree.insert(&envelope("late", [1.0, 1.0], [2.0, 2.0]));
    assert!(matches!(inserted, Err(IndexError::CorruptTree(_))), "insert: {:?}", inserted);
    assert!(!tree.contains("late")?);

    let removed = tree.remove(existing);
    assert!(matches!(removed, Err(IndexError::CorruptTree(_))), "remove: {:?}", removed);
    Ok(())
}

#[test]
fn test_overfull_node_is_corruption() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("overfull");
            {
                let tree = ctx.tree("overfull")?;
                for i in 0..3 {
                    let x = i as f64 * 10.0;
                    tree.insert(&envelope(&format!("o-{}", i), [x, x], [x + 1.0, x + 1.0]))?;
                }
                assert_eq!(tree.height(), 1);
                ctx.registry().release(&location, ctx.owner())?;
            }

            let fanout = small_tree_config().fanout();
            rewrite_root(&location.join(TREE_FILE_NAME), |_, _| Node::Leaf {
                entries: (0..=fanout)
                    .map(|i| {
                        let x = i as f64;
                        LeafEntry::from_envelope(&envelope(
                            &format!("o-{}", i),
                            [x, x],
                            [x + 1.0, x + 1.0],
                        ))
                    })
                    .collect(),
            })?;

            assert_operations_fail(&ctx, "overfull", "o-1")
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_self_referencing_branch_is_corruption() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("cyclic");
            {
                let tree = ctx.tree("cyclic")?;
                let mut rng = StdRng::seed_from_u64(29);
                for envelope in random_envelopes(&mut rng, "y", 12) {
                    tree.insert(&envelope)?;
                }
                assert!(tree.height() >= 2);
                ctx.registry().release(&location, ctx.owner())?;
            }

            rewrite_root(&location.join(TREE_FILE_NAME), |root, height| Node::Branch {
                children: vec![ChildRef {
                    bounds: Bounds::new(vec![-1.0e6, -1.0e6], vec![1.0e6, 1.0e6])
                        .expect("valid bounds"),
                    page_id: root,
                }],
                level: height - 1,
            })?;

            assert_operations_fail(&ctx, "cyclic", "y-0")
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_root_on_wrong_level_is_corruption() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("sunken");
            {
                let tree = ctx.tree("sunken")?;
                let mut rng = StdRng::seed_from_u64(31);
                for envelope in random_envelopes(&mut rng, "s", 12) {
                    tree.insert(&envelope)?;
                }
                assert!(tree.height() >= 2);
                ctx.registry().release(&location, ctx.owner())?;
            }

            // The header still records a multi-level tree, but the root is now a leaf.
            rewrite_root(&location.join(TREE_FILE_NAME), |_, _| Node::empty_leaf())?;

            assert_operations_fail(&ctx, "sunken", "s-0")
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_corrupt_page_fails_search() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("corrupt");
            {
                let tree = ctx.tree("corrupt")?;
                let mut rng = StdRng::seed_from_u64(3);
                for envelope in random_envelopes(&mut rng, "c", 60) {
                    tree.insert(&envelope)?;
                }
                ctx.registry().release(&location, ctx.owner())?;
            }

            let page_size = small_tree_config().page_size() as u64;
            corrupt_page(&location.join(TREE_FILE_NAME), page_size, 1)?;

            let tree = ctx.tree("corrupt")?;
            let results: Vec<_> = tree.search(Bounds::everything(2))?.iter().collect();
            let failure = results.iter().find_map(|r| r.as_ref().err());
            assert!(
                matches!(failure, Some(IndexError::CorruptTree(_))),
                "expected a corrupt tree error, got {:?}",
                failure
            );
            assert!(failure.is_some_and(|e| e.is_fatal()));
            assert!(results.last().is_some_and(|r| r.is_err()));

            let report = tree.check_integrity()?;
            assert!(!report.is_valid);
            assert_eq!(report.corrupted_pages, vec![1]);
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_reopen_with_other_shape_is_incompatible() {
    run_test(
        || create_test_context(),
        |ctx| {
            let path = ctx.path().join(TREE_FILE_NAME);
            let config = small_tree_config();
            let tree = RTree::create(&path, &config, Arc::new(MemoryElementMapper::new()))?;
            tree.close()?;

            for other in [config.clone().with_dimensions(3), config.clone().with_page_size(2048)] {
                let reopened = RTree::open(&path, &other, Arc::new(MemoryElementMapper::new()));
                assert!(matches!(
                    reopened,
                    Err(IndexError::Storage(StorageError::IncompatibleFormat(_)))
                ));
            }

            let location = ctx.location("shaped");
            ctx.tree("shaped")?;
            ctx.registry().release(&location, ctx.owner())?;
            let wider = small_tree_config().with_dimensions(3);
            let result = ctx.registry().get_or_open_with(&location, ctx.owner(), &wider);
            assert!(matches!(
                result,
                Err(ManagerError::Open {
                    source: OpenFailure::Storage(StorageError::IncompatibleFormat(_)),
                    ..
                })
            ));
            assert!(!ctx.registry().is_open(&location));

            RTree::open(&path, &config, Arc::new(MemoryElementMapper::new()))?.close()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_reopen_with_other_reference_system_is_rejected() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("geodetic");
            {
                let tree = ctx.tree("geodetic")?;
                tree.insert(&envelope("a", [0.0, 0.0], [1.0, 1.0]))?;
                ctx.registry().close_all()?;
            }

            let projected =
                small_tree_config().with_reference_system(ReferenceSystem::new("EPSG:3857"));
            let result = ctx.registry().get_or_open_with(&location, ctx.owner(), &projected);
            assert!(matches!(
                result,
                Err(ManagerError::Open {
                    source: OpenFailure::Storage(StorageError::IncompatibleFormat(_)),
                    ..
                })
            ));
            assert!(!ctx.registry().is_open(&location));

            // The stored tag is what search and the element records both report.
            let tree = ctx.tree("geodetic")?;
            let found: Vec<_> = tree
                .search(Bounds::everything(2))?
                .iter()
                .collect::<Result<_, _>>()?;
            assert_eq!(found.len(), 1);
            let record = tree.get("a")?.expect("record for a");
            assert_eq!(found[0].reference_system(), record.reference_system());
            assert_eq!(record.reference_system().code(), "EPSG:4326");
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_freed_pages_are_reused() {
    run_test(
        || create_test_context(),
        |ctx| {
            let tree = ctx.tree("reuse")?;
            let mut rng = StdRng::seed_from_u64(17);
            let envelopes = random_envelopes(&mut rng, "f", 300);
            for envelope in &envelopes {
                tree.insert(envelope)?;
            }
            for envelope in envelopes.iter().take(280) {
                assert!(tree.remove(envelope.identifier())?);
            }

            let shrunk = tree.stats();
            assert!(shrunk.free_pages > 0, "{:?}", shrunk);

            for envelope in random_envelopes(&mut rng, "g", 100) {
                tree.insert(&envelope)?;
            }
            let regrown = tree.stats();
            assert!(regrown.free_pages < shrunk.free_pages);
            // Inserts never free pages, so the file grows only once the list is drained.
            assert!(regrown.page_count == shrunk.page_count || regrown.free_pages == 0);

            let report = tree.check_integrity()?;
            assert!(report.is_valid, "{:?}", report.errors);
            assert!(report.orphaned_pages.is_empty());
            assert_eq!(report.free_pages.len() as u64, regrown.free_pages);
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}
