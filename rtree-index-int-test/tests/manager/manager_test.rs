use rtree_index::{Bounds, ManagerError, OwnerId, ReferenceSystem};
use rtree_index_int_test::test_util::{
    cleanup, collect_ids, create_test_context, envelope, run_test, small_tree_config,
};
use std::fs;

#[test]
fn test_owners_share_one_tree() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("shared");
            let map_view = OwnerId::from("map-view");
            let exporter = OwnerId::from("exporter");
            let registry = ctx.registry();

            let a = registry.get_or_open(&location, &map_view)?;
            let b = registry.get_or_open(&location, &exporter)?;
            assert!(a.ptr_eq(&b));
            assert_eq!(registry.owners(&location), vec![map_view.clone(), exporter.clone()]);

            a.insert(&envelope("fresh", [1.0, 1.0], [2.0, 2.0]))?;
            let seen = collect_ids(&b.search(Bounds::new(vec![0.0, 0.0], vec![3.0, 3.0])?)?)?;
            assert!(seen.contains("fresh"));

            assert!(registry.release(&location, &map_view)?);
            assert!(registry.is_open(&location));
            assert!(!b.is_closed());
            assert!(!registry.release(&location, &map_view)?);

            assert!(registry.release(&location, &exporter)?);
            assert!(!registry.is_open(&location));
            assert!(b.is_closed());
            assert!(registry.open_locations().is_empty());
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_incompatible_request_is_rejected() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("typed");
            let tree = ctx.tree("typed")?;
            let other = OwnerId::from("other");

            let requests = [
                small_tree_config().with_dimensions(3),
                small_tree_config().with_page_size(2048),
                small_tree_config().with_reference_system(ReferenceSystem::new("EPSG:3857")),
            ];
            for config in requests {
                let result = ctx.registry().get_or_open_with(&location, &other, &config);
                assert!(matches!(
                    result,
                    Err(ManagerError::AlreadyOpenElsewhereIncompatibly { .. })
                ));
            }

            assert_eq!(ctx.registry().owners(&location), vec![ctx.owner().clone()]);
            assert!(!tree.is_closed());
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_failed_open_leaves_no_entry() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("broken");
            fs::create_dir_all(&location)?;
            fs::write(location.join("tree.rtree"), b"definitely not a tree header")?;

            let result = ctx.tree("broken");
            assert!(matches!(result, Err(ManagerError::Open { .. })));
            assert!(!ctx.registry().is_open(&location));
            assert!(ctx.registry().owners(&location).is_empty());
            assert!(ctx.registry().open_locations().is_empty());

            // The unreadable file is left for the caller to inspect.
            assert!(location.join("tree.rtree").exists());

            ctx.registry().remove(&location)?;
            let tree = ctx.tree("broken")?;
            assert!(tree.is_empty());
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_reset_clears_in_place() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("resettable");
            let tree = ctx.tree("resettable")?;
            for i in 0..40 {
                let x = i as f64;
                tree.insert(&envelope(&format!("r-{}", i), [x, x], [x + 1.0, x + 1.0]))?;
            }

            ctx.registry().reset(&location, &tree, ctx.owner())?;
            assert!(tree.is_empty());
            assert_eq!(tree.height(), 1);
            assert!(tree.get("r-1")?.is_none());
            assert!(ctx.registry().is_open(&location));

            tree.insert(&envelope("r-1", [0.0, 0.0], [1.0, 1.0]))?;
            assert_eq!(tree.len(), 1);
            assert!(tree.check_integrity()?.is_valid);
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_remove_deletes_storage() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("doomed");
            let tree = ctx.tree("doomed")?;
            tree.insert(&envelope("gone", [0.0, 0.0], [1.0, 1.0]))?;

            ctx.registry().remove(&location)?;
            assert!(tree.is_closed());
            assert!(!location.exists());
            assert!(!ctx.registry().is_open(&location));

            // Removing again is not an error.
            ctx.registry().remove(&location)?;

            let reborn = ctx.tree("doomed")?;
            assert!(!reborn.ptr_eq(&tree));
            assert!(reborn.is_empty());
            assert!(!reborn.contains("gone")?);
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_close_all_closes_every_tree() {
    run_test(
        || create_test_context(),
        |ctx| {
            let trees = ["one", "two", "three"]
                .iter()
                .map(|name| ctx.tree(name))
                .collect::<Result<Vec<_>, _>>()?;
            assert_eq!(ctx.registry().open_locations().len(), 3);

            ctx.registry().close_all()?;
            assert!(trees.iter().all(|t| t.is_closed()));
            assert!(ctx.registry().open_locations().is_empty());

            let again = ctx.tree("two")?;
            assert!(!again.is_closed());
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}
