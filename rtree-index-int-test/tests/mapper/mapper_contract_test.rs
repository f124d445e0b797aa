use rtree_index::{
    Bounds, ElementMapper, FileElementMapper, MapperError, MemoryElementMapper, NamedEnvelope,
    ReferenceSystem, SqlConnectionPool, SqlDialectKind, SqlElementMapper,
};
use rtree_index_int_test::test_util::random_path;
use std::fs;

const DIALECTS: [SqlDialectKind; 3] = [
    SqlDialectKind::Simple,
    SqlDialectKind::Postgres,
    SqlDialectKind::Embedded,
];

fn record(id: &str, x: f64) -> NamedEnvelope {
    NamedEnvelope::new(
        id,
        Bounds::new(vec![x, -1.0, 0.5], vec![x + 2.0, 1.0, 0.75]).unwrap(),
        ReferenceSystem::new("EPSG:4979"),
    )
    .with_duplicate_count(3)
}

fn check_contract(name: &str, mapper: &dyn ElementMapper) {
    assert!(mapper.is_empty().unwrap(), "{} starts empty", name);

    let first = record("river-1", 4.0);
    mapper.put(&first).unwrap();
    let stored = mapper.get("river-1").unwrap().unwrap();
    assert!(stored.same_as(&first), "{} keeps every field", name);
    assert_eq!(stored.duplicate_count(), 3);
    assert_eq!(stored.reference_system().code(), "EPSG:4979");

    let moved = record("river-1", -12.25);
    mapper.put(&moved).unwrap();
    assert!(mapper.get("river-1").unwrap().unwrap().same_as(&moved));
    assert_eq!(mapper.len().unwrap(), 1);

    for i in 0..25 {
        mapper.put(&record(&format!("lake-{}", i), i as f64)).unwrap();
    }
    assert_eq!(mapper.len().unwrap(), 26);
    assert!(mapper.contains("lake-24").unwrap());
    assert!(!mapper.contains("lake-25").unwrap());

    assert!(mapper.remove("lake-3").unwrap());
    assert!(!mapper.remove("lake-3").unwrap());
    assert!(mapper.get("lake-3").unwrap().is_none());
    assert!(matches!(mapper.fetch("lake-3"), Err(MapperError::NotFound(id)) if id == "lake-3"));
    assert_eq!(mapper.len().unwrap(), 25);
    mapper.flush().unwrap();

    mapper.clear().unwrap();
    assert!(mapper.is_empty().unwrap());

    mapper.put(&record("late", 1.0)).unwrap();
    mapper.close().unwrap();
    mapper.close().unwrap();
    assert!(mapper.is_closed());
    assert!(matches!(mapper.get("late"), Err(MapperError::Closed)));
    assert!(matches!(mapper.put(&record("x", 0.0)), Err(MapperError::Closed)));
    assert!(matches!(mapper.clear(), Err(MapperError::Closed)));
}

#[test]
fn test_memory_mapper_contract() {
    check_contract("memory", &MemoryElementMapper::new());
}

#[test]
fn test_file_mapper_contract() {
    let path = random_path();
    let mapper = FileElementMapper::open(&path).unwrap();
    check_contract("fjall", &mapper);
    drop(mapper);
    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_file_mapper_keeps_records_across_reopen() {
    let path = random_path();
    {
        let mapper = FileElementMapper::open(&path).unwrap();
        mapper.put(&record("kept", 9.0)).unwrap();
        mapper.put(&record("dropped", 1.0)).unwrap();
        mapper.remove("dropped").unwrap();
        mapper.close().unwrap();
    }

    let mapper = FileElementMapper::open(&path).unwrap();
    assert!(mapper.get("kept").unwrap().unwrap().same_as(&record("kept", 9.0)));
    assert!(mapper.get("dropped").unwrap().is_none());
    assert_eq!(mapper.len().unwrap(), 1);
    mapper.close().unwrap();
    fs::remove_dir_all(&path).unwrap();
}

#[test]
fn test_sql_dialect_contracts() {
    let dir = random_path();
    fs::create_dir_all(&dir).unwrap();
    let pool = SqlConnectionPool::open(&dir.join("contract.db"), 2).unwrap();

    for kind in DIALECTS {
        let table = format!("contract_{:?}", kind).to_lowercase();
        let mapper = SqlElementMapper::open(pool.clone(), kind, &table).unwrap();
        assert_eq!(mapper.table(), table);
        check_contract(&table, &mapper);
    }
    assert_eq!(pool.idle(), pool.size());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_sql_tables_are_independent() {
    let pool = SqlConnectionPool::open_shared_memory("independent_tables", 2).unwrap();
    let roads = SqlElementMapper::open(pool.clone(), SqlDialectKind::Postgres, "roads").unwrap();
    let rails = SqlElementMapper::open(pool.clone(), SqlDialectKind::Postgres, "rails").unwrap();

    roads.put(&record("shared-id", 1.0)).unwrap();
    assert!(rails.get("shared-id").unwrap().is_none());

    rails.put(&record("shared-id", 5.0)).unwrap();
    roads.clear().unwrap();
    assert!(rails.get("shared-id").unwrap().unwrap().same_as(&record("shared-id", 5.0)));

    SqlElementMapper::drop_table(&pool, SqlDialectKind::Postgres, "roads").unwrap();
    let recreated = SqlElementMapper::open(pool.clone(), SqlDialectKind::Postgres, "roads").unwrap();
    assert!(recreated.is_empty().unwrap());
}
