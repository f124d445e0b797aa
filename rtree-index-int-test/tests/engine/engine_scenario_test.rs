use rand::rngs::StdRng;
use rand::SeedableRng;
use rtree_index::{Bounds, IndexError, ManagerConfig, NamedEnvelope, ReferenceSystem, TreeRegistry};
use rtree_index_int_test::test_util::{
    cleanup, collect_ids, create_test_context, envelope, random_envelopes, run_test,
    small_tree_config,
};
use std::collections::{BTreeMap, BTreeSet};

fn ids(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_overlapping_boxes_scenario() {
    run_test(
        || create_test_context(),
        |ctx| {
            let tree = ctx.tree("abc")?;
            assert_eq!(tree.config().fanout(), 4);

            tree.insert(&envelope("A", [0.0, 0.0], [10.0, 10.0]))?;
            tree.insert(&envelope("B", [5.0, 5.0], [15.0, 15.0]))?;
            tree.insert(&envelope("C", [20.0, 20.0], [30.0, 30.0]))?;

            let query = Bounds::new(vec![0.0, 0.0], vec![12.0, 12.0])?;
            assert_eq!(collect_ids(&tree.search(&query)?)?, ids(&["A", "B"]));

            assert!(tree.remove("A")?);
            assert_eq!(collect_ids(&tree.search(&query)?)?, ids(&["B"]));
            assert_eq!(tree.len(), 2);
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_tree_survives_reopen() {
    run_test(
        || create_test_context(),
        |ctx| {
            let location = ctx.location("persistent");
            let mut rng = StdRng::seed_from_u64(42);
            let envelopes = random_envelopes(&mut rng, "p", 250);

            {
                let tree = ctx.tree("persistent")?;
                for envelope in &envelopes {
                    tree.insert(envelope)?;
                }
                assert!(tree.remove("p-3")?);
                assert!(ctx.registry().release(&location, ctx.owner())?);
            }

            let registry =
                TreeRegistry::new(ManagerConfig::new().with_tree_defaults(small_tree_config()));
            let tree = registry.get_or_open(&location, ctx.owner())?;
            assert_eq!(tree.len(), 249);

            let stored: BTreeMap<String, NamedEnvelope> = tree
                .search(Bounds::everything(2))?
                .iter()
                .map(|e| e.map(|e| (e.identifier().to_string(), e)))
                .collect::<Result<_, _>>()?;
            assert_eq!(stored.len(), 249);
            for original in envelopes.iter().filter(|e| e.identifier() != "p-3") {
                let found = &stored[original.identifier()];
                assert_eq!(found.bounds(), original.bounds());
                let record = tree.get(original.identifier())?;
                assert!(record.is_some_and(|r| r.same_as(original)));
            }
            assert!(tree.get("p-3")?.is_none());
            assert!(tree.check_integrity()?.is_valid);

            registry.close_all()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_search_within_excludes_partial_overlaps() {
    run_test(
        || create_test_context(),
        |ctx| {
            let tree = ctx.tree("within")?;
            for i in 0..20 {
                let x = i as f64 * 5.0;
                tree.insert(&envelope(&format!("strip-{}", i), [x, 0.0], [x + 4.0, 4.0]))?;
            }

            let query = Bounds::new(vec![10.0, -1.0], vec![32.0, 5.0])?;
            let overlapping = collect_ids(&tree.search(&query)?)?;
            let inside = collect_ids(&tree.search_within(&query)?)?;

            assert_eq!(inside, ids(&["strip-2", "strip-3", "strip-4", "strip-5"]));
            assert!(overlapping.is_superset(&inside));
            assert!(overlapping.contains("strip-6"));
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_rejected_inserts_leave_tree_untouched() {
    run_test(
        || create_test_context(),
        |ctx| {
            let tree = ctx.tree("rejects")?;
            tree.insert(&envelope("one", [0.0, 0.0], [1.0, 1.0]))?;

            let duplicate = tree.insert(&envelope("one", [5.0, 5.0], [6.0, 6.0]));
            assert!(matches!(duplicate, Err(IndexError::DuplicateIdentifier(_))));

            let three_d = NamedEnvelope::new(
                "cube",
                Bounds::new(vec![0.0; 3], vec![1.0; 3])?,
                ReferenceSystem::default(),
            );
            assert!(matches!(
                tree.insert(&three_d),
                Err(IndexError::DimensionMismatch { expected: 2, actual: 3 })
            ));

            let projected = NamedEnvelope::new(
                "projected",
                Bounds::new(vec![0.0, 0.0], vec![1.0, 1.0])?,
                ReferenceSystem::new("EPSG:3857"),
            );
            assert!(matches!(
                tree.insert(&projected),
                Err(IndexError::ReferenceSystemMismatch { .. })
            ));

            assert_eq!(tree.len(), 1);
            let stored = tree.get("one")?;
            assert_eq!(
                stored.map(|e| e.bounds().clone()),
                Some(Bounds::new(vec![0.0, 0.0], vec![1.0, 1.0])?)
            );
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_emptied_tree_accepts_new_entries() {
    run_test(
        || create_test_context(),
        |ctx| {
            let tree = ctx.tree("refill")?;
            let mut rng = StdRng::seed_from_u64(8);
            let first = random_envelopes(&mut rng, "first", 120);
            for envelope in &first {
                tree.insert(envelope)?;
            }
            let grown = tree.height();
            for envelope in &first {
                assert!(tree.remove(envelope.identifier())?);
            }
            assert!(tree.is_empty());
            assert!(tree.height() < grown);
            assert_eq!(tree.search(Bounds::everything(2))?.iter().count(), 0);

            let second = random_envelopes(&mut rng, "second", 60);
            for envelope in &second {
                tree.insert(envelope)?;
            }
            assert_eq!(collect_ids(&tree.search(Bounds::everything(2))?)?.len(), 60);
            assert!(tree.check_integrity()?.is_valid);
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}
