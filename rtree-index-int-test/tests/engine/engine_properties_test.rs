use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtree_index::disk_rtree::{Node, NodeStore, PageId, TREE_FILE_NAME};
use rtree_index::{
    Bounds, LinearSplit, ManagerConfig, QuadraticSplit, RTree, SplitKind, SplitStrategy,
    TreeConfig,
};
use rtree_index_int_test::test_util::{
    cleanup, collect_ids, create_test_context, envelope, expected_ids, random_envelopes, run_test,
    small_tree_config, TestResult,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Depth of every leaf plus the entry count of every non-root node, read from
/// a second handle on the flushed file.
fn walk_tree(path: &Path, config: &TreeConfig) -> TestResult<(BTreeSet<u32>, Vec<usize>)> {
    let store = NodeStore::open(path, config)?;
    let mut depths = BTreeSet::new();
    let mut fills = Vec::new();
    let mut stack: Vec<(PageId, u32)> = vec![(store.root_page(), 0)];

    while let Some((page_id, depth)) = stack.pop() {
        let node = store.read_node(page_id)?;
        if depth > 0 {
            fills.push(node.len());
        }
        match node {
            Node::Leaf { .. } => {
                depths.insert(depth);
            }
            Node::Branch { children, .. } => {
                for child in children {
                    stack.push((child.page_id, depth + 1));
                }
            }
        }
    }
    Ok((depths, fills))
}

#[test]
fn test_inserts_keep_leaves_at_one_depth() {
    for split in [SplitKind::Linear, SplitKind::Quadratic] {
        run_test(
            || create_test_context(),
            move |ctx| {
                let config = small_tree_config().with_split(split);
                let location = ctx.location("balanced");
                let tree = ctx.registry().get_or_open_with(&location, ctx.owner(), &config)?;

                let mut rng = StdRng::seed_from_u64(11);
                for envelope in random_envelopes(&mut rng, "bal", 400) {
                    tree.insert(&envelope)?;
                }
                tree.flush()?;

                let (depths, fills) = walk_tree(&location.join(TREE_FILE_NAME), &config)?;
                assert_eq!(depths.len(), 1, "leaves at depths {:?}", depths);
                assert_eq!(*depths.iter().next().unwrap_or(&0), tree.height() - 1);

                for fill in fills {
                    assert!(
                        (config.min_fill()..=config.fanout()).contains(&fill),
                        "node holds {} entries",
                        fill
                    );
                }
                assert!(tree.check_integrity()?.is_valid);
                Ok(())
            },
            |ctx| cleanup(ctx),
        );
    }
}

#[test]
fn test_search_with_union_returns_every_identifier() {
    run_test(
        || create_test_context(),
        |ctx| {
            let fanout = small_tree_config().fanout();
            for n in [0, 1, 2, fanout, fanout + 1, 10 * fanout] {
                let tree = ctx.tree(&format!("round-trip-{}", n))?;
                let mut rng = StdRng::seed_from_u64(n as u64);
                let envelopes = random_envelopes(&mut rng, "rt", n);
                for envelope in &envelopes {
                    tree.insert(envelope)?;
                }

                let union = Bounds::union_of(2, envelopes.iter().map(|e| e.bounds()));
                let found = collect_ids(&tree.search(&union)?)?;
                let expected: BTreeSet<String> =
                    envelopes.iter().map(|e| e.identifier().to_string()).collect();
                assert_eq!(found, expected, "round trip of {} envelopes", n);
                assert_eq!(tree.len(), n as u64);
            }
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_remove_twice() {
    run_test(
        || create_test_context(),
        |ctx| {
            let tree = ctx.tree("remove-twice")?;
            let mut rng = StdRng::seed_from_u64(5);
            for envelope in random_envelopes(&mut rng, "rm", 30) {
                tree.insert(&envelope)?;
            }

            assert!(tree.remove("rm-17")?);
            assert_eq!(tree.len(), 29);
            assert!(!tree.remove("rm-17")?);
            assert_eq!(tree.len(), 29);
            assert!(tree.get("rm-17")?.is_none());
            assert!(tree.check_integrity()?.is_valid);
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_split_groups_cover_every_entry() {
    let mut rng = StdRng::seed_from_u64(99);
    let strategies: [&dyn SplitStrategy; 2] = [&LinearSplit, &QuadraticSplit];
    let (m, big_m) = (2, 4);

    for strategy in strategies {
        for _ in 0..200 {
            let boxes: Vec<Bounds> = (0..=big_m)
                .map(|_| {
                    let x = rng.gen_range(-50.0..50.0);
                    let y = rng.gen_range(-50.0..50.0);
                    let size = rng.gen_range(0.0..10.0);
                    Bounds::new(vec![x, y], vec![x + size, y + size]).unwrap()
                })
                .collect();

            let (left, right) = strategy.split(&boxes, m);
            for group in [&left, &right] {
                assert!(
                    (m..=big_m - 1).contains(&group.len()),
                    "{} produced a group of {}",
                    strategy.name(),
                    group.len()
                );
            }

            let mut seen: Vec<usize> = left.iter().chain(right.iter()).copied().collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..=big_m).collect::<Vec<_>>());
        }
    }
}

#[test]
fn test_integrity_after_random_workload() {
    for split in [SplitKind::Linear, SplitKind::Quadratic] {
        run_test(
            || create_test_context(),
            move |ctx| {
                let config = small_tree_config().with_split(split);
                let tree = ctx
                    .registry()
                    .get_or_open_with(ctx.location("workload"), ctx.owner(), &config)?;

                let mut rng = StdRng::seed_from_u64(2024);
                let mut live = BTreeMap::new();
                for step in 0..1500 {
                    if live.is_empty() || rng.gen_bool(0.6) {
                        let x = rng.gen_range(0.0..500.0);
                        let y = rng.gen_range(0.0..500.0);
                        let e = envelope(&format!("w-{}", step), [x, y], [x + 3.0, y + 3.0]);
                        tree.insert(&e)?;
                        live.insert(e.identifier().to_string(), e);
                    } else {
                        let index = rng.gen_range(0..live.len());
                        let id = live.keys().nth(index).cloned().unwrap_or_default();
                        assert!(tree.remove(&id)?);
                        live.remove(&id);
                    }

                    if step % 250 == 0 {
                        let report = tree.check_integrity()?;
                        assert!(report.is_valid, "step {}: {:?}", step, report.errors);
                    }
                }

                let report = tree.check_integrity()?;
                assert!(report.is_valid, "{:?}", report.errors);
                assert_eq!(report.entries_found, live.len() as u64);

                let query = Bounds::new(vec![100.0, 100.0], vec![300.0, 250.0])?;
                assert_eq!(
                    collect_ids(&tree.search(&query)?)?,
                    expected_ids(live.values(), &query)
                );
                Ok(())
            },
            |ctx| cleanup(ctx),
        );
    }
}

#[test]
fn test_default_fanout_applies_to_new_trees() {
    run_test(
        || create_test_context(),
        |ctx| {
            let defaults = TreeConfig::new()
                .with_page_size(4096)
                .with_fanout(8)
                .with_min_fill(3);
            let config = ManagerConfig::new().with_tree_defaults(defaults);
            config.set_default_fanout(12)?;
            let registry = rtree_index::TreeRegistry::new(config);

            let tree: RTree = registry.get_or_open(ctx.location("fanout"), ctx.owner())?;
            assert_eq!(tree.config().fanout(), 12);
            assert_eq!(tree.config().min_fill(), 3);
            registry.close_all()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}

#[test]
fn test_default_fanout_on_stock_defaults() {
    run_test(
        || create_test_context(),
        |ctx| {
            for fanout in [8, 16] {
                let config = ManagerConfig::new();
                config.set_default_fanout(fanout)?;
                let registry = rtree_index::TreeRegistry::new(config);

                let location = ctx.location(&format!("stock-{}", fanout));
                let tree: RTree = registry.get_or_open(&location, ctx.owner())?;
                assert_eq!(tree.config().fanout(), fanout);

                let mut rng = StdRng::seed_from_u64(fanout as u64);
                let envelopes = random_envelopes(&mut rng, "d", fanout * 10);
                for envelope in &envelopes {
                    tree.insert(envelope)?;
                }
                assert!(tree.height() >= 2);
                let everything = Bounds::everything(2);
                assert_eq!(
                    collect_ids(&tree.search(&everything)?)?,
                    expected_ids(&envelopes, &everything)
                );
                assert!(tree.check_integrity()?.is_valid);
                registry.close_all()?;
            }
            Ok(())
        },
        |ctx| cleanup(ctx),
    );
}
