use rand::rngs::StdRng;
use rand::SeedableRng;
use rtree_index::{Bounds, IndexError};
use rtree_index_int_test::test_util::{cleanup, create_test_context, random_envelopes, TestResult};

fn main() -> TestResult {
    colog::init();
    println!("Starting stress test...");
    let ctx = create_test_context()?;
    let tree = ctx.tree("stress")?;

    let count = 200_000;
    let mut rng = StdRng::seed_from_u64(uuid::Uuid::new_v4().as_u128() as u64);
    let envelopes = random_envelopes(&mut rng, "stress", count);

    let start = std::time::Instant::now();
    for envelope in &envelopes {
        tree.insert(envelope)?;
    }
    println!(
        "Inserted {} envelopes in {:?} (height {})",
        count,
        start.elapsed(),
        tree.height()
    );

    let start = std::time::Instant::now();
    let mut hits = 0;
    for i in 0..1000 {
        let x = (i % 40) as f64 * 25.0;
        let y = (i / 40) as f64 * 40.0;
        let query = Bounds::new(vec![x, y], vec![x + 50.0, y + 50.0])?;
        hits += tree.search(&query)?.iter().count();
    }
    println!("Ran 1000 window queries ({} hits) in {:?}", hits, start.elapsed());

    let start = std::time::Instant::now();
    for envelope in envelopes.iter().step_by(2) {
        tree.remove(envelope.identifier())?;
    }
    println!("Removed {} envelopes in {:?}", count / 2, start.elapsed());

    let start = std::time::Instant::now();
    let report = tree.check_integrity()?;
    println!(
        "Checked {} pages in {:?}: {}",
        report.pages_checked,
        start.elapsed(),
        if report.is_valid { "valid" } else { "INVALID" }
    );
    if !report.is_valid {
        return Err(IndexError::CorruptTree(report.errors.join("; ")).into());
    }

    println!("{:?}", tree.stats());
    cleanup(ctx)?;
    Ok(())
}
