//! Column bindings that outlive any single partition.
//!
//! A chain cannot attach a caller's [`ColumnSlot`] to a column once and for
//! all: every partition switch opens a new handle with its own columns.  The
//! registry remembers what the caller asked for (slot, declared type, enable
//! status) in the order it was asked, and replays it onto each handle.

use std::cell::RefCell;
use std::rc::Rc;

use chainset_storage::{
    column_matches,
    value::{BindOutcome, ColumnSlot, TypeInfo},
    PartitionHandle,
};
use indexmap::IndexMap;
use tracing::warn;

/// Whether a column is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnStatus {
    Process,
    Skip,
    /// Left as the partition has it.
    Unset,
}

/// The column a binding is attached to in the open partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkedColumn {
    pub partition: usize,
    pub location: String,
    pub source_type: TypeInfo,
}

/// Shared view of the column a binding is currently attached to.
///
/// Updated on every partition switch; empty while no partition is open or
/// when the open partition lacks the column.
#[derive(Clone, Debug, Default)]
pub struct ColumnLink(Rc<RefCell<Option<LinkedColumn>>>);

impl ColumnLink {
    pub fn get(&self) -> Option<LinkedColumn> {
        self.0.borrow().clone()
    }

    fn set(&self, column: LinkedColumn) {
        *self.0.borrow_mut() = Some(column);
    }

    fn clear(&self) {
        *self.0.borrow_mut() = None;
    }
}

#[derive(Clone, Debug)]
pub struct ColumnBinding {
    name: String,
    slot: Option<ColumnSlot>,
    type_info: Option<TypeInfo>,
    status: ColumnStatus,
    link: ColumnLink,
    checked_type: bool,
    decomposed: bool,
    last_outcome: Option<BindOutcome>,
}

impl ColumnBinding {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            slot: None,
            type_info: None,
            status: ColumnStatus::Unset,
            link: ColumnLink::default(),
            checked_type: false,
            decomposed: false,
            last_outcome: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> Option<&ColumnSlot> {
        self.slot.as_ref()
    }

    pub fn type_info(&self) -> Option<&TypeInfo> {
        self.type_info.as_ref()
    }

    pub fn status(&self) -> ColumnStatus {
        self.status
    }

    pub fn link(&self) -> ColumnLink {
        self.link.clone()
    }

    /// True if the declared type differs from the stored one and values are
    /// delivered member-wise.
    pub fn is_decomposed(&self) -> bool {
        self.decomposed
    }

    /// Outcome of the last attach, or `None` if never attached.
    pub fn last_outcome(&self) -> Option<BindOutcome> {
        self.last_outcome
    }

    fn attach(&mut self, handle: &mut dyn PartitionHandle, partition: usize) -> BindOutcome {
        let (Some(slot), Some(declared)) = (&self.slot, &self.type_info) else {
            return BindOutcome::NoCheck;
        };
        let outcome = handle.rebind_column(&self.name, Some(slot.clone()), declared);
        let source_type = handle.column_type(&self.name);
        match (outcome, source_type) {
            (BindOutcome::MissingColumn, _) | (_, None) => {
                warn!(
                    "column {:?} not found in partition {partition} ({})",
                    self.name,
                    handle.location()
                );
                self.link.clear();
            }
            (outcome, Some(source_type)) => {
                if outcome == BindOutcome::Decomposed && !self.checked_type {
                    warn!(
                        "column {:?} is stored as {source_type} but bound as {declared}, \
                         delivering it member-wise",
                        self.name
                    );
                }
                self.checked_type = true;
                self.decomposed = outcome == BindOutcome::Decomposed;
                self.link.set(LinkedColumn {
                    partition,
                    location: handle.location().to_owned(),
                    source_type,
                });
            }
        }
        self.last_outcome = Some(outcome);
        outcome
    }

    fn apply_status(&self, handle: &mut dyn PartitionHandle) {
        match self.status {
            ColumnStatus::Process => {
                handle.set_column_status(&self.name, true);
            }
            ColumnStatus::Skip => {
                handle.set_column_status(&self.name, false);
            }
            ColumnStatus::Unset => (),
        }
    }
}

/// Bindings and statuses by column name, in the order they were last set.
#[derive(Debug, Default)]
pub(crate) struct ColumnBindingRegistry {
    entries: IndexMap<String, ColumnBinding>,
}

impl ColumnBindingRegistry {
    pub(crate) fn get(&self, name: &str) -> Option<&ColumnBinding> {
        self.entries.get(name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ColumnBinding> {
        self.entries.values()
    }

    /// Records that `slot` receives column `name`, declared as `type_info`,
    /// and attaches it to `handle` if a partition is open.
    pub(crate) fn bind(
        &mut self,
        name: &str,
        slot: ColumnSlot,
        type_info: TypeInfo,
        active: Option<(&mut (dyn PartitionHandle + '_), usize)>,
    ) -> BindOutcome {
        let binding = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(|| ColumnBinding::new(name));
        if binding.type_info.as_ref() != Some(&type_info) {
            binding.checked_type = false;
            binding.decomposed = false;
        }
        binding.slot = Some(slot);
        binding.type_info = Some(type_info);
        match active {
            Some((handle, partition)) => binding.attach(handle, partition),
            None => BindOutcome::NoCheck,
        }
    }

    /// Records the status of the columns selected by `pattern`.  The entry
    /// moves to the end so that it overrides earlier, broader ones.
    pub(crate) fn set_status(&mut self, pattern: &str, enabled: bool) {
        let mut binding = self
            .entries
            .shift_remove(pattern)
            .unwrap_or_else(|| ColumnBinding::new(pattern));
        binding.status = if enabled {
            ColumnStatus::Process
        } else {
            ColumnStatus::Skip
        };
        self.entries.insert(pattern.to_owned(), binding);
    }

    /// Replays statuses and bindings onto a newly opened partition.
    pub(crate) fn apply(&mut self, handle: &mut dyn PartitionHandle, partition: usize) {
        for binding in self.entries.values() {
            binding.apply_status(handle);
        }
        for binding in self.entries.values_mut() {
            binding.attach(handle, partition);
        }
    }

    /// Detaches every binding from the partition being closed.
    pub(crate) fn detach_all(&mut self) {
        for binding in self.entries.values() {
            binding.link.clear();
        }
    }

    /// Clears the slot bound to `name` and forgets it.  Returns false if
    /// nothing was bound.
    pub(crate) fn reset(
        &mut self,
        name: &str,
        handle: Option<&mut (dyn PartitionHandle + '_)>,
    ) -> bool {
        let Some(binding) = self.entries.get_mut(name) else {
            return false;
        };
        reset_binding(binding, handle)
    }

    pub(crate) fn reset_all(&mut self, mut handle: Option<&mut (dyn PartitionHandle + '_)>) {
        for binding in self.entries.values_mut() {
            reset_binding(binding, handle.as_deref_mut());
        }
    }

    pub(crate) fn clear(&mut self) {
        self.detach_all();
        self.entries.clear();
    }

    /// Columns the read-ahead cache should fetch: those bound and not
    /// skipped.
    pub(crate) fn cache_columns(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|binding| binding.slot.is_some() && !self.is_skipped(&binding.name))
            .map(|binding| binding.name.clone())
            .collect()
    }

    /// Status of column `name` after applying every entry in order.
    fn is_skipped(&self, name: &str) -> bool {
        self.entries
            .values()
            .filter(|binding| column_matches(&binding.name, name))
            .fold(false, |skipped, binding| match binding.status {
                ColumnStatus::Process => false,
                ColumnStatus::Skip => true,
                ColumnStatus::Unset => skipped,
            })
    }
}

fn reset_binding(
    binding: &mut ColumnBinding,
    handle: Option<&mut (dyn PartitionHandle + '_)>,
) -> bool {
    let Some(slot) = binding.slot.take() else {
        return false;
    };
    slot.clear();
    if let (Some(handle), Some(declared)) = (handle, &binding.type_info) {
        handle.rebind_column(&binding.name, None, declared);
    }
    binding.link.clear();
    binding.last_outcome = None;
    true
}

#[cfg(test)]
mod tests {
    use chainset_storage::{
        memory_impl::{MemoryBackend, MemoryTable},
        value::{BindOutcome, ColumnSlot, DataType, TypeInfo, Value},
        PartitionBackend, RecordSource,
    };
    use pretty_assertions::assert_eq;

    use super::{ColumnBindingRegistry, ColumnStatus};

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.insert(
            "a",
            "t",
            MemoryTable::new([
                ("x", TypeInfo::scalar(DataType::Int64)),
                ("y", TypeInfo::scalar(DataType::String)),
            ])
            .with_rows(vec![vec![Value::Int(1), Value::String("one".into())]]),
        );
        backend
    }

    #[test]
    fn bindings_replay_on_new_handle() {
        let backend = backend();
        let mut registry = ColumnBindingRegistry::default();
        let x = ColumnSlot::new();
        let y = ColumnSlot::new();
        let z = ColumnSlot::new();
        assert_eq!(
            registry.bind("x", x.clone(), TypeInfo::scalar(DataType::Int64), None),
            BindOutcome::NoCheck
        );
        registry.bind("y", y.clone(), TypeInfo::scalar(DataType::Float64), None);
        registry.bind("z", z.clone(), TypeInfo::scalar(DataType::Bool), None);

        let mut handle = backend.open("a", "t").unwrap();
        registry.apply(handle.as_mut(), 0);
        assert_eq!(registry.get("x").unwrap().last_outcome(), Some(BindOutcome::Match));
        assert!(registry.get("y").unwrap().is_decomposed());
        assert_eq!(
            registry.get("z").unwrap().last_outcome(),
            Some(BindOutcome::MissingColumn)
        );
        assert_eq!(registry.get("z").unwrap().link().get(), None);
        assert_eq!(registry.get("x").unwrap().link().get().unwrap().partition, 0);

        handle.position_at(0).unwrap();
        assert_eq!(handle.read_current().unwrap(), 2);
        assert_eq!(x.get(), Some(Value::Int(1)));
        assert_eq!(y.get(), Some(Value::String("one".into())));

        assert!(registry.reset("x", Some(handle.as_mut())));
        assert!(!registry.reset("x", Some(handle.as_mut())));
        assert_eq!(x.get(), None);
        assert_eq!(handle.read_current().unwrap(), 1);
    }

    #[test]
    fn statuses_apply_in_order() {
        let backend = backend();
        let mut registry = ColumnBindingRegistry::default();
        let x = ColumnSlot::new();
        let y = ColumnSlot::new();
        registry.bind("x", x.clone(), TypeInfo::scalar(DataType::Int64), None);
        registry.bind("y", y.clone(), TypeInfo::scalar(DataType::String), None);
        registry.set_status("x", true);
        registry.set_status("*", false);
        assert_eq!(registry.cache_columns(), Vec::<String>::new());

        // Setting "x" again moves it after "*".
        registry.set_status("x", true);
        assert_eq!(registry.get("x").unwrap().status(), ColumnStatus::Process);
        assert_eq!(registry.cache_columns(), vec!["x".to_string()]);

        let mut handle = backend.open("a", "t").unwrap();
        registry.apply(handle.as_mut(), 0);
        handle.position_at(0).unwrap();
        assert_eq!(handle.read_current().unwrap(), 1);
        assert_eq!(x.get(), Some(Value::Int(1)));
        assert_eq!(y.get(), None);
    }
}
