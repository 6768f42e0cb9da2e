use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use chainset_storage::{
    error::StorageError,
    memory_impl::{MemoryBackend, MemoryTable},
    registry::{ResourceRegistry, SharedRegistry},
    value::{BindOutcome, ColumnSlot, DataType, TypeInfo, Value},
    BackendConfig, RecordSource,
};
use pretty_assertions::assert_eq;

use super::Chain;
use crate::{
    test::init_test_logger, ChainConfig, ChainError, CountOverflow, DeclaredCount, LoadOutcome,
    ResolveError, SyncMode,
};

/// Stores one partition per `(location, n)`, each with `n` records whose
/// `id` column holds the global entry number.
fn backend(partitions: &[(&str, usize)]) -> Rc<MemoryBackend> {
    let backend = Rc::new(MemoryBackend::new());
    let mut next = 0;
    for &(location, n) in partitions {
        let rows = (next..next + n as i64)
            .map(|id| vec![Value::Int(id), Value::String(format!("{location}:{id}"))])
            .collect();
        backend.insert(
            location,
            "events",
            MemoryTable::new([
                ("id", TypeInfo::scalar(DataType::Int64)),
                ("tag", TypeInfo::scalar(DataType::String)),
            ])
            .with_rows(rows),
        );
        next += n as i64;
    }
    backend
}

fn chain(backend: &Rc<MemoryBackend>, partitions: &[(&str, DeclaredCount)]) -> Chain {
    let mut chain = Chain::new("events", backend.clone())
        .with_registry(Arc::new(SharedRegistry::new()));
    for &(location, count) in partitions {
        chain.append_partition(location, count, None).unwrap();
    }
    chain
}

#[test]
fn configuration_errors_leave_chain_unchanged() {
    let backend = backend(&[("a", 1)]);
    let mut chain = chain(&backend, &[]);
    assert_eq!(
        chain.append_partition(" ", DeclaredCount::Unknown, None),
        Err(ChainError::EmptyLocation)
    );
    assert_eq!(chain.add("", DeclaredCount::Unknown), Err(ChainError::EmptyLocation));
    assert_eq!(
        chain.bind("", ColumnSlot::new(), TypeInfo::scalar(DataType::Bool)),
        Err(ChainError::EmptyColumnName)
    );
    assert_eq!(chain.set_enabled("", true), Err(ChainError::EmptyColumnName));
    assert_eq!(
        chain.remove_friend("nobody"),
        Err(ChainError::UnknownFriend("nobody".into()))
    );
    assert!(matches!(
        chain.append_partition("missing", DeclaredCount::Probe, None),
        Err(ChainError::Storage(StorageError::NotFound(_)))
    ));
    assert!(chain.is_empty());
    assert_eq!(chain.resolve(0), Err(ResolveError::EmptyChain));
    assert_eq!(chain.offsets(), [Some(0)]);
}

#[test]
fn probe_reads_count_on_append() {
    init_test_logger();
    let backend = backend(&[("a", 3), ("empty", 0)]);
    let mut chain = chain(&backend, &[]);
    chain.append_partition("a", DeclaredCount::Probe, None).unwrap();
    chain.append_partition("empty", DeclaredCount::Probe, None).unwrap();
    assert_eq!(chain.offsets(), [Some(0), Some(3), Some(3)]);
    assert_eq!(backend.counters().live(), 0);

    let config = ChainConfig {
        probe_on_append: true,
        ..ChainConfig::default()
    };
    let mut probing = Chain::with_config("events", backend.clone(), config);
    probing.append_partition("a", DeclaredCount::Unknown, None).unwrap();
    assert_eq!(probing.entries_fast(), Some(3));
}

#[test]
fn add_parses_locations() {
    let backend = backend(&[("a.json", 2)]);
    backend.insert(
        "b.json",
        "hits",
        MemoryTable::new([("id", TypeInfo::scalar(DataType::Int64))]),
    );
    let mut chain = chain(&backend, &[]);
    chain.add("a.json", DeclaredCount::Unknown).unwrap();
    chain.add("b.json/hits", DeclaredCount::Unknown).unwrap();
    chain.add("b.json?#hits", DeclaredCount::Unknown).unwrap();
    let tables: Vec<(&str, &str)> = chain
        .partitions()
        .map(|p| (p.location(), p.table_name()))
        .collect();
    assert_eq!(
        tables,
        [("a.json", "events"), ("b.json", "hits"), ("b.json", "hits")]
    );
    assert_eq!(chain.total_record_count(), 2);
}

#[test]
fn get_entry_and_entry_numbers() {
    let backend = backend(&[("a", 2), ("b", 3)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Unknown), ("b", DeclaredCount::Unknown)],
    );
    let id = ColumnSlot::new();
    assert_eq!(
        chain.bind("id", id.clone(), TypeInfo::scalar(DataType::Int64)),
        Ok(BindOutcome::NoCheck)
    );
    assert_eq!(chain.get_entry(3), Ok(1));
    assert_eq!(id.get(), Some(Value::Int(3)));
    assert_eq!(chain.read_entry(), Some(3));
    assert_eq!(chain.active_partition(), Some(1));
    assert_eq!(chain.chain_entry_number(0), Some(2));
    assert_eq!(chain.chain_entry_number(3), None);

    assert_eq!(
        chain.get_entry(5),
        Err(ChainError::Resolve(ResolveError::OutOfRange { entry: 5, total: 5 }))
    );
    assert_eq!(chain.read_entry(), None);
    assert_eq!(chain.read_current(), Err(StorageError::NotPositioned));
}

#[test]
fn bind_on_open_partition_checks_type() {
    let backend = backend(&[("a", 2)]);
    let mut chain = chain(&backend, &[("a", DeclaredCount::Exact(2))]);
    chain.resolve(0).unwrap();

    let tag = ColumnSlot::new();
    assert_eq!(
        chain.bind("tag", tag.clone(), TypeInfo::scalar(DataType::Float64)),
        Ok(BindOutcome::Decomposed)
    );
    assert!(chain.column_binding("tag").unwrap().is_decomposed());
    assert_eq!(
        chain.bind("nope", ColumnSlot::new(), TypeInfo::scalar(DataType::Bool)),
        Ok(BindOutcome::MissingColumn)
    );
    let link = chain.column_binding("tag").unwrap().link();
    assert_eq!(link.get().unwrap().source_type, TypeInfo::scalar(DataType::String));

    chain.get_entry(1).unwrap();
    assert_eq!(tag.get(), Some(Value::String("a:1".into())));

    assert!(chain.reset_binding("tag"));
    assert_eq!(tag.get(), None);
    chain.get_entry(0).unwrap();
    assert_eq!(tag.get(), None);
}

#[test]
fn statuses_survive_switches() {
    let backend = backend(&[("a", 1), ("b", 1)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Unknown), ("b", DeclaredCount::Unknown)],
    );
    let id = ColumnSlot::new();
    let tag = ColumnSlot::new();
    chain.bind("id", id.clone(), TypeInfo::scalar(DataType::Int64)).unwrap();
    chain.bind("tag", tag.clone(), TypeInfo::scalar(DataType::String)).unwrap();
    chain.set_enabled("*", false).unwrap();
    chain.set_enabled("tag", true).unwrap();

    assert_eq!(chain.get_entry(0), Ok(1));
    assert_eq!(chain.get_entry(1), Ok(1));
    assert_eq!(id.get(), None);
    assert_eq!(tag.get(), Some(Value::String("b:1".into())));

    chain.reset_bindings();
    assert_eq!(chain.get_entry(1), Ok(0));
    assert_eq!(tag.get(), None);
}

#[test]
fn notify_runs_on_every_switch() {
    let backend = backend(&[("a", 0), ("b", 2)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Unknown), ("b", DeclaredCount::Unknown)],
    );
    let switches = Rc::new(RefCell::new(Vec::new()));
    let seen = switches.clone();
    chain.set_notify(move |partition, descriptor| {
        seen.borrow_mut()
            .push((partition, descriptor.record_count()));
        true
    });

    // Partition "a" turns out to be empty, so entry 0 is in "b".
    assert_eq!(chain.resolve(0), Ok(0));
    assert_eq!(*switches.borrow(), [(0, Some(0)), (1, Some(2))]);
    chain.resolve(1).unwrap();
    assert_eq!(switches.borrow().len(), 2);

    chain.set_notify(|_, _| false);
    chain.invalidate_active();
    assert_eq!(
        chain.resolve(1).map_err(|e| e.code()),
        Err(ResolveError::NOTIFY_FAILED)
    );
    chain.clear_notify();
    assert_eq!(chain.resolve(1), Ok(1));
}

#[test]
fn failed_partition_counts_as_empty() {
    init_test_logger();
    let backend = backend(&[("b", 2)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Unknown), ("b", DeclaredCount::Unknown)],
    );
    assert!(matches!(
        chain.resolve(0),
        Err(ResolveError::OpenFailed { partition: 0, .. })
    ));
    assert_eq!(chain.partition(0).unwrap().last_outcome(), Some(LoadOutcome::OpenFailed));
    assert_eq!(chain.partition(0).unwrap().record_count(), None);
    assert_eq!(chain.resolve(0), Ok(0));
    assert_eq!(chain.total_record_count(), 2);
}

#[test]
fn missing_table_is_reported() {
    let backend = backend(&[("a", 2)]);
    let mut chain = chain(&backend, &[]);
    chain
        .append_partition("a", DeclaredCount::Exact(2), Some("hits"))
        .unwrap();
    let error = chain.resolve(1).unwrap_err();
    assert_eq!(error.code(), ResolveError::TABLE_MISSING);
    assert_eq!(
        chain.partition(0).unwrap().last_outcome(),
        Some(LoadOutcome::TableMissing)
    );
    assert_eq!(chain.active_partition(), None);
}

#[test]
fn invalidated_resource_is_reopened() {
    let backend = backend(&[("a", 2)]);
    let registry = Arc::new(SharedRegistry::new());
    let mut chain = Chain::new("events", backend.clone()).with_registry(registry.clone());
    chain.append_partition("a", DeclaredCount::Unknown, None).unwrap();

    chain.resolve(0).unwrap();
    chain.resolve(1).unwrap();
    assert_eq!(backend.counters().opened(), 1);
    assert_eq!(registry.len(), 1);

    assert_eq!(registry.invalidate("a"), 1);
    chain.resolve(1).unwrap();
    assert_eq!(backend.counters().opened(), 2);
    assert_eq!(backend.counters().live(), 1);
    assert_eq!(registry.len(), 1);
}

#[test]
fn unregistered_chain_ignores_registry() {
    let backend = backend(&[("a", 2)]);
    let registry = Arc::new(SharedRegistry::new());
    let config = ChainConfig {
        global_registration: false,
        ..ChainConfig::default()
    };
    let mut chain = Chain::with_config("events", backend.clone(), config)
        .with_registry(registry.clone());
    chain.append_partition("a", DeclaredCount::Unknown, None).unwrap();
    chain.resolve(0).unwrap();
    assert!(registry.is_empty());
}

#[test]
fn cache_moves_between_partitions() {
    let backend = backend(&[("a", 2), ("b", 2)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Exact(2)), ("b", DeclaredCount::Exact(2))],
    );
    assert_eq!(chain.cache_stats(), None);
    chain.set_cache_size(1024);
    chain.resolve(0).unwrap();
    chain.resolve(1).unwrap();
    chain.resolve(2).unwrap();
    let stats = chain.cache_stats().unwrap();
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);

    chain.set_cache_size(0);
    assert_eq!(chain.cache_stats(), None);
}

#[test]
fn lookup_resolves_and_removes() {
    let backend = backend(&[("a", 1), ("b", 1)]);
    backend.redirect("staged/b", "b");
    let mut chain = chain(
        &backend,
        &[
            ("a", DeclaredCount::Unknown),
            ("gone", DeclaredCount::Exact(4)),
            ("staged/b", DeclaredCount::Unknown),
        ],
    );
    assert_eq!(chain.lookup(false), Ok(1));
    assert_eq!(chain.len(), 2);
    let b = chain.partition(1).unwrap();
    assert!(b.looked_up());
    assert_eq!(b.resolved_location(), Some("b"));
    assert_eq!(b.resource(), "b");
    assert_eq!(chain.lookup(false), Ok(0));

    chain.get_entry(1).unwrap();
    assert_eq!(chain.active_partition(), Some(1));
}

#[test]
fn append_chain_copies_discovered_counts() {
    let backend = backend(&[("a", 2), ("b", 3)]);
    let mut other = chain(
        &backend,
        &[("a", DeclaredCount::Unknown), ("b", DeclaredCount::Unknown)],
    );
    let mut chain = chain(&backend, &[("b", DeclaredCount::Exact(3))]);
    assert_eq!(chain.append_chain(&mut other), Ok(2));
    assert_eq!(chain.entries_fast(), Some(8));
    // Offsets are now [0, 3, 5, 8].
    assert_eq!(chain.resolve(4), Ok(1));
    assert_eq!(chain.active_partition(), Some(1));
}

#[test]
fn append_chain_skips_partitions_that_failed_to_open() {
    let backend = backend(&[("p1", 2)]);
    let mut other = chain(
        &backend,
        &[("missing", DeclaredCount::Unknown), ("p1", DeclaredCount::Unknown)],
    );
    let mut chain = chain(&backend, &[]);
    assert_eq!(chain.append_chain(&mut other), Ok(2));
    assert_eq!(chain.offsets(), [Some(0), Some(0), Some(2)]);
    assert_eq!(chain.entries_fast(), Some(2));
    assert_eq!(chain.partition(0).unwrap().record_count(), Some(0));
    assert_eq!(chain.resolve(0), Ok(0));
    assert_eq!(chain.active_partition(), Some(1));
}

#[test]
fn overflowing_append_is_rejected() {
    let backend = backend(&[]);
    let mut other = chain(&backend, &[("b", DeclaredCount::Exact(1))]);
    let mut chain = chain(&backend, &[("a", DeclaredCount::Exact(u64::MAX))]);
    assert_eq!(
        chain.append_partition("b", DeclaredCount::Exact(1), None),
        Err(ChainError::CountOverflow(CountOverflow))
    );
    assert_eq!(chain.len(), 1);
    assert_eq!(chain.offsets(), [Some(0), Some(u64::MAX)]);

    assert_eq!(
        chain.append_chain(&mut other),
        Err(ChainError::CountOverflow(CountOverflow))
    );
    assert_eq!(chain.len(), 1);
}

#[test]
fn overflowing_discovered_count_is_internal() {
    let backend = backend(&[("a", 2)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Unknown), ("b", DeclaredCount::Exact(u64::MAX))],
    );
    let error = chain.resolve(0).unwrap_err();
    assert_eq!(error.code(), ResolveError::INTERNAL);
    assert_eq!(chain.offsets(), [Some(0), None, None]);
    assert_eq!(chain.active_partition(), None);
    assert_eq!(chain.partition(0).unwrap().last_outcome(), Some(LoadOutcome::Other));
    assert_eq!(backend.counters().live(), 0);
}

#[test]
fn reset_keeps_friends() {
    let backend = backend(&[("a", 2)]);
    let mut chain = chain(&backend, &[("a", DeclaredCount::Exact(2))]);
    let friend = Rc::new(RefCell::new(Chain::new("events", backend.clone())));
    friend
        .borrow_mut()
        .append_partition("a", DeclaredCount::Unknown, None)
        .unwrap();
    chain.add_friend("f", friend, SyncMode::Lockstep).unwrap();
    chain.bind("id", ColumnSlot::new(), TypeInfo::scalar(DataType::Int64)).unwrap();
    chain.resolve(1).unwrap();

    chain.reset();
    assert!(chain.is_empty());
    assert_eq!(chain.active_partition(), None);
    assert!(chain.column_binding("id").is_none());
    assert_eq!(chain.friend_count(), 1);
    assert_eq!(backend.counters().live(), 1);
}

#[test]
fn friend_columns_are_forwarded() {
    init_test_logger();
    let backend = backend(&[("a", 3)]);
    let mut chain = chain(&backend, &[("a", DeclaredCount::Unknown)]);
    let friend = Rc::new(RefCell::new(chain_with(&backend, "a")));
    let report = chain
        .add_friend("f", friend.clone(), SyncMode::Lockstep)
        .unwrap();
    assert!(!report.shorter);

    let tag = ColumnSlot::new();
    chain
        .bind("f.tag", tag.clone(), TypeInfo::scalar(DataType::String))
        .unwrap();
    assert!(chain.column_binding("f.tag").is_none());
    assert!(friend.borrow().column_binding("tag").is_some());

    assert_eq!(chain.get_entry(2), Ok(1));
    assert_eq!(tag.get(), Some(Value::String("a:2".into())));
    assert_eq!(chain.friend_entry("f"), Some(2));

    assert!(chain.reset_binding("f.tag"));
    assert!(friend.borrow().column_binding("tag").unwrap().slot().is_none());
}

#[test]
fn busy_friend_refuses_bindings() {
    let backend = backend(&[("a", 3)]);
    let mut chain = chain(&backend, &[("a", DeclaredCount::Unknown)]);
    let friend = Rc::new(RefCell::new(chain_with(&backend, "a")));
    chain.add_friend("f", friend.clone(), SyncMode::Lockstep).unwrap();

    let _reading = friend.borrow();
    let string = TypeInfo::scalar(DataType::String);
    assert_eq!(
        chain.bind("f.tag", ColumnSlot::new(), string.clone()),
        Err(ChainError::FriendBusy("f".into()))
    );
    assert!(chain.column_binding("f.tag").is_none());
    assert_eq!(
        chain.rebind_column("f.tag", Some(ColumnSlot::new()), &string),
        BindOutcome::MissingColumn
    );
    assert!(chain.column_binding("f.tag").is_none());
}

fn chain_with(backend: &Rc<MemoryBackend>, location: &str) -> Chain {
    chain(backend, &[(location, DeclaredCount::Unknown)])
}

#[test]
fn shorter_friend_is_reported() {
    let backend = backend(&[("a", 3), ("short", 1)]);
    let mut chain = chain(&backend, &[("a", DeclaredCount::Unknown)]);
    let friend = Rc::new(RefCell::new(chain_with(&backend, "short")));
    let report = chain.add_friend("s", friend, SyncMode::Lockstep).unwrap();
    assert!(report.shorter);
    assert_eq!(report.friend_records, 1);
    assert_eq!(report.primary_records, 3);

    assert_eq!(chain.resolve(0), Ok(0));
    assert_eq!(chain.friend_entry("s"), Some(0));
    assert_eq!(chain.resolve(2), Ok(2));
    assert_eq!(chain.friend_entry("s"), None);
}

#[test]
fn failing_friend_is_fatal() {
    let backend = backend(&[("a", 2), ("b", 3)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Exact(2)), ("b", DeclaredCount::Exact(3))],
    );
    let mut broken = chain_with(&backend, "a");
    broken
        .append_partition("gone", DeclaredCount::Exact(5), None)
        .unwrap();
    chain
        .add_friend("broken", Rc::new(RefCell::new(broken)), SyncMode::Lockstep)
        .unwrap();

    assert_eq!(chain.resolve(1), Ok(1));
    let error = chain.resolve(3).unwrap_err();
    assert_eq!(error.code(), ResolveError::NOTIFY_FAILED);
    assert_eq!(chain.read_entry(), None);
    assert_eq!(chain.resolve(1), Ok(1));
}

#[test]
fn friendship_cycles_are_cut() {
    let backend = backend(&[("a", 2)]);
    let a = Rc::new(RefCell::new(chain_with(&backend, "a")));
    let b = Rc::new(RefCell::new(chain_with(&backend, "a")));
    a.borrow_mut()
        .add_friend("b", b.clone(), SyncMode::Lockstep)
        .unwrap();
    b.borrow_mut()
        .add_friend("a", a.clone(), SyncMode::Lockstep)
        .unwrap();

    assert_eq!(a.borrow_mut().resolve(1), Ok(1));
    assert_eq!(a.borrow().friend_entry("b"), Some(1));
    assert_eq!(b.borrow().read_entry(), Some(1));
    assert_eq!(b.borrow().friend_entry("a"), None);
}

#[test]
fn chain_from_backend_config() {
    let shared = MemoryBackend::default_for_thread();
    shared.insert(
        "chain-from-config",
        "events",
        MemoryTable::new([("id", TypeInfo::scalar(DataType::Int64))])
            .with_rows(vec![vec![Value::Int(0)]]),
    );
    let mut chain = Chain::from_config("events", &BackendConfig::Memory, ChainConfig::default())
        .unwrap()
        .with_registry(Arc::new(SharedRegistry::new()));
    chain
        .append_partition("chain-from-config", DeclaredCount::Unknown, None)
        .unwrap();
    assert_eq!(chain.total_record_count(), 1);
    assert_eq!(chain.config().table_name, "events");
}

#[test]
fn display_lists_partitions() {
    let backend = backend(&[("a", 2)]);
    let mut chain = chain(
        &backend,
        &[("a", DeclaredCount::Unknown), ("gone", DeclaredCount::Unknown)],
    );
    chain.set_packet_size(100);
    assert_eq!(chain.partition(1).unwrap().packet_size(), 100);
    assert_eq!(
        chain.to_string(),
        "chain \"events\": 2 partition(s), at least 0 entries\n \
         [0] events @ a: unknown, not loaded\n \
         [1] events @ gone: unknown, not loaded\n"
    );
    chain.resolve(0).unwrap();
    assert_eq!(
        chain.to_string(),
        "chain \"events\": 2 partition(s), at least 2 entries\n\
         *[0] events @ a: 2 record(s), ok\n \
         [1] events @ gone: unknown, not loaded\n"
    );
}
