use rand::rngs::StdRng;
use rand::Rng;
use rtree_index::{
    Bounds, ManagerConfig, ManagerError, NamedEnvelope, OwnerId, RTree, ReferenceSystem, Search,
    SqlConnectionPool, SqlDatasource, SqlDialectKind, TreeConfig, TreeRegistry,
};
use std::backtrace::Backtrace;
use std::collections::BTreeSet;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use std::{env, fs, thread};

pub type TestResult<T = ()> = Result<T, Box<dyn Error + Send + Sync>>;

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread to avoid thread exhaustion when running many tests in parallel.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> TestResult + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> TestResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> TestResult + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => match after(ctx) {
                        Ok(_) => Ok(()),
                        Err(e) => Err((format!("After run failed: {:?}", e), backtrace.to_string())),
                    },
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                last_error = Some(e.clone());
                last_backtrace = Some(bt);
                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Error: {}", e);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    format!("Unknown panic: {:?}", panic_err.type_id())
                };
                let message = format!("Panic: {}", err_msg);
                last_backtrace = Some(Backtrace::capture().to_string());

                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Panicked (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("{}", message);
                    eprintln!("Retrying in {}ms...\n", 100 * attempt);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
                last_error = Some(message);
            }
        }
    }

    // All retries exhausted - print full details
    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

/// A scratch directory plus a registry rooted in it.
#[derive(Clone)]
pub struct TestContext {
    path: PathBuf,
    registry: TreeRegistry,
    owner: OwnerId,
}

impl TestContext {
    pub fn new(path: PathBuf, registry: TreeRegistry) -> Self {
        Self {
            path,
            registry,
            owner: OwnerId::from("int-test"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> TreeRegistry {
        self.registry.clone()
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Storage location of the tree named `name` inside the scratch directory.
    pub fn location(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Opens (or creates) the tree named `name` for the default owner.
    pub fn tree(&self, name: &str) -> Result<RTree, ManagerError> {
        self.registry.get_or_open(self.location(name), &self.owner)
    }
}

pub fn random_path() -> PathBuf {
    let id = uuid::Uuid::new_v4();
    env::temp_dir().join(id.to_string())
}

/// A tree configuration small enough that a few dozen entries build a
/// multi-level tree: fanout 4, minimum fill 2, 1 KiB pages.
pub fn small_tree_config() -> TreeConfig {
    TreeConfig::new()
        .with_page_size(1024)
        .with_fanout(4)
        .with_min_fill(2)
        .with_cache_pages(16)
}

fn create_context_with(make_config: impl Fn(&Path) -> TestResult<ManagerConfig>) -> TestResult<TestContext> {
    const MAX_ATTEMPTS: u32 = 3;
    let mut last_error: Option<Box<dyn Error + Send + Sync>> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        let path = random_path();

        // Ensure the path doesn't already exist (unlikely with UUID but be safe)
        if path.exists() {
            let _ = fs::remove_dir_all(&path);
            thread::sleep(Duration::from_millis(10));
        }

        let created = fs::create_dir_all(&path)
            .map_err(|e| e.into())
            .and_then(|_| make_config(&path));

        match created {
            Ok(config) => return Ok(TestContext::new(path, TreeRegistry::new(config))),
            Err(e) => {
                let _ = fs::remove_dir_all(&path);
                if attempt < MAX_ATTEMPTS {
                    eprintln!(
                        "Warning: Failed to create test context (attempt {}/{}): {:?}",
                        attempt, MAX_ATTEMPTS, e
                    );
                    thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| "Failed to create test context".into()))
}

/// Registry backed by the embedded element store, using [`small_tree_config`].
pub fn create_test_context() -> TestResult<TestContext> {
    create_context_with(|_| Ok(ManagerConfig::new().with_tree_defaults(small_tree_config())))
}

/// Registry whose trees keep their records in an SQLite file under the
/// scratch directory, using the given dialect.
pub fn create_sql_test_context(dialect: SqlDialectKind) -> TestResult<TestContext> {
    create_context_with(move |path| {
        let pool = SqlConnectionPool::open(&path.join("elements.db"), 4)?;
        Ok(ManagerConfig::new()
            .with_tree_defaults(small_tree_config())
            .with_datasource(SqlDatasource::new(pool, dialect)))
    })
}

pub fn cleanup(ctx: TestContext) -> TestResult {
    let close_result = ctx.registry.close_all();

    let mut retries = 0;
    while ctx.path.exists() {
        match fs::remove_dir_all(&ctx.path) {
            Ok(_) => break,
            Err(e) if retries < 3 => {
                retries += 1;
                log::warn!("Retrying cleanup of {:?}: {}", ctx.path, e);
                thread::sleep(Duration::from_millis(50 * retries));
            }
            Err(e) => return Err(e.into()),
        }
    }

    close_result.map_err(|e| e.into())
}

pub fn envelope(id: &str, lower: [f64; 2], upper: [f64; 2]) -> NamedEnvelope {
    NamedEnvelope::new(
        id,
        Bounds::new(lower.to_vec(), upper.to_vec()).expect("valid test bounds"),
        ReferenceSystem::default(),
    )
}

/// `count` random boxes inside [0, 1000]², named `{prefix}-{i}`.
pub fn random_envelopes(rng: &mut StdRng, prefix: &str, count: usize) -> Vec<NamedEnvelope> {
    (0..count)
        .map(|i| {
            let x = rng.gen_range(0.0..1000.0);
            let y = rng.gen_range(0.0..1000.0);
            let w = rng.gen_range(0.0..25.0);
            let h = rng.gen_range(0.0..25.0);
            envelope(&format!("{}-{}", prefix, i), [x, y], [x + w, y + h])
        })
        .collect()
}

/// Identifiers yielded by one traversal of `search`.
pub fn collect_ids(search: &Search) -> TestResult<BTreeSet<String>> {
    let mut ids = BTreeSet::new();
    for envelope in search.iter() {
        ids.insert(envelope?.identifier().to_string());
    }
    Ok(ids)
}

/// Identifiers in `envelopes` whose bounds intersect `query`.
pub fn expected_ids<'a>(
    envelopes: impl IntoIterator<Item = &'a NamedEnvelope>,
    query: &Bounds,
) -> BTreeSet<String> {
    envelopes
        .into_iter()
        .filter(|e| e.bounds().intersects(query))
        .map(|e| e.identifier().to_string())
        .collect()
}
