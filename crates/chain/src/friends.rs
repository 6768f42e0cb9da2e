//! Auxiliary record sources kept positioned on the primary chain's entry.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::rc::Rc;

use chainset_storage::{
    error::StorageError,
    value::{BindOutcome, ColumnSlot, TypeInfo},
    RecordSource,
};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ChainError, ResolveError};

/// Maps an entry of the primary chain to the entry of a friend holding the
/// matching record.
pub trait EntryCorrespondence {
    /// Returns `None` if the friend has no matching record.
    fn friend_entry(&self, entry: u64) -> Option<u64>;
}

impl EntryCorrespondence for BTreeMap<u64, u64> {
    fn friend_entry(&self, entry: u64) -> Option<u64> {
        self.get(&entry).copied()
    }
}

impl EntryCorrespondence for Vec<u64> {
    fn friend_entry(&self, entry: u64) -> Option<u64> {
        self.get(usize::try_from(entry).ok()?).copied()
    }
}

/// How a friend follows the primary chain.
#[derive(Clone)]
pub enum SyncMode {
    /// The friend is positioned on the same entry number.
    Lockstep,

    /// The friend is positioned on the entry given by a correspondence
    /// table.
    IndexLookup(Rc<dyn EntryCorrespondence>),
}

impl Debug for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Lockstep => f.write_str("Lockstep"),
            SyncMode::IndexLookup(_) => f.write_str("IndexLookup"),
        }
    }
}

/// What [`Chain::add_friend`](crate::Chain::add_friend) found out about a new
/// friend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FriendReport {
    pub alias: String,
    pub friend_records: u64,
    pub primary_records: u64,
    /// The friend is in lockstep and has fewer records than the primary, so
    /// the trailing entries of the primary have no partner.
    pub shorter: bool,
}

pub(crate) struct Friend {
    alias: String,
    source: Rc<RefCell<dyn RecordSource>>,
    mode: SyncMode,
    /// Entry the friend is positioned on.
    cursor: Option<u64>,
    /// Columns bound through the primary chain, by friend column name.
    forwarded: IndexMap<String, (ColumnSlot, TypeInfo)>,
}

impl Friend {
    pub(crate) fn new(alias: &str, source: Rc<RefCell<dyn RecordSource>>, mode: SyncMode) -> Self {
        Self {
            alias: alias.to_owned(),
            source,
            mode,
            cursor: None,
            forwarded: IndexMap::new(),
        }
    }

    /// Moves the columns bound through `replaced` over to this friend.
    fn take_bindings(&mut self, replaced: Friend) {
        if let Ok(mut old) = replaced.source.try_borrow_mut() {
            for (column, (_, declared)) in &replaced.forwarded {
                old.rebind_column(column, None, declared);
            }
        }
        let mut new = self.source.try_borrow_mut().ok();
        if new.is_none() && !replaced.forwarded.is_empty() {
            warn!(
                "friend {:?} is busy, {} column(s) not bound",
                self.alias,
                replaced.forwarded.len()
            );
        }
        for (column, (slot, declared)) in replaced.forwarded {
            if let Some(new) = new.as_mut() {
                let outcome = new.rebind_column(&column, Some(slot.clone()), &declared);
                if outcome == BindOutcome::MissingColumn {
                    warn!("friend {:?} has no column {column:?}", self.alias);
                }
            }
            self.forwarded.insert(column, (slot, declared));
        }
    }

    fn target(&self, entry: u64) -> Option<u64> {
        match &self.mode {
            SyncMode::Lockstep => Some(entry),
            SyncMode::IndexLookup(correspondence) => correspondence.friend_entry(entry),
        }
    }
}

#[derive(Default)]
pub(crate) struct FriendSet {
    friends: Vec<Friend>,
}

impl FriendSet {
    pub(crate) fn len(&self) -> usize {
        self.friends.len()
    }

    pub(crate) fn aliases(&self) -> impl Iterator<Item = &str> {
        self.friends.iter().map(|friend| friend.alias.as_str())
    }

    /// Entry friend `alias` is positioned on.
    pub(crate) fn cursor(&self, alias: &str) -> Option<u64> {
        self.find(alias).and_then(|friend| friend.cursor)
    }

    fn find(&self, alias: &str) -> Option<&Friend> {
        self.friends.iter().find(|friend| friend.alias == alias)
    }

    /// Splits `alias.column` into the friend named `alias` and the column.
    fn route<'a>(&mut self, name: &'a str) -> Option<(&mut Friend, &'a str)> {
        let (alias, column) = name.split_once('.')?;
        let friend = self.friends.iter_mut().find(|friend| friend.alias == alias)?;
        Some((friend, column))
    }

    /// Adds `friend`, replacing any friend with the same alias.  Columns
    /// bound through the replaced friend stay bound, on the new source.
    pub(crate) fn add(&mut self, mut friend: Friend) {
        if let Some(i) = self.friends.iter().position(|f| f.alias == friend.alias) {
            debug!("replacing friend {:?}", friend.alias);
            let replaced = self.friends.remove(i);
            friend.take_bindings(replaced);
        }
        self.friends.push(friend);
    }

    pub(crate) fn remove(&mut self, alias: &str) -> bool {
        let before = self.friends.len();
        self.friends.retain(|friend| friend.alias != alias);
        self.friends.len() != before
    }

    /// Positions every friend on the record matching `entry` of the primary.
    ///
    /// A friend without a matching record (index lookup miss, or shorter
    /// than the primary) is left unpositioned: partial joins are allowed.
    /// A friend that is already being positioned further up the call stack
    /// (friendship cycle) is skipped.
    pub(crate) fn align(&mut self, entry: u64) -> Result<(), ResolveError> {
        for friend in &mut self.friends {
            let target = friend.target(entry);
            let Ok(mut source) = friend.source.try_borrow_mut() else {
                debug!("friend {:?} is busy, not aligning it", friend.alias);
                continue;
            };
            friend.cursor = None;
            let Some(target) = target else {
                debug!("friend {:?} has no entry matching {entry}", friend.alias);
                continue;
            };
            match source.position_at(target) {
                Ok(_) => friend.cursor = Some(target),
                Err(StorageError::PositionOutOfRange { .. }) => {
                    debug!("friend {:?} has no entry {target}", friend.alias);
                }
                Err(error) => {
                    return Err(ResolveError::NotifyFailed(format!(
                        "friend {:?} cannot be positioned on entry {target}: {error}",
                        friend.alias
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reads the current record of every positioned friend.  Returns the
    /// number of values delivered.
    pub(crate) fn read_current(&mut self) -> Result<usize, StorageError> {
        let mut delivered = 0;
        for friend in &self.friends {
            if friend.cursor.is_none() {
                continue;
            }
            if let Ok(mut source) = friend.source.try_borrow_mut() {
                delivered += source.read_current()?;
            }
        }
        Ok(delivered)
    }

    /// Binds `slot` to `alias.column` on friend `alias`.  Returns `None` if
    /// `name` does not start with the alias of a friend, and an error if the
    /// friend is busy.
    pub(crate) fn bind(
        &mut self,
        name: &str,
        slot: ColumnSlot,
        declared: &TypeInfo,
    ) -> Option<Result<BindOutcome, ChainError>> {
        let (friend, column) = self.route(name)?;
        let Ok(mut source) = friend.source.try_borrow_mut() else {
            return Some(Err(ChainError::FriendBusy(friend.alias.clone())));
        };
        let outcome = source.rebind_column(column, Some(slot.clone()), declared);
        friend
            .forwarded
            .insert(column.to_owned(), (slot, declared.clone()));
        Some(Ok(outcome))
    }

    /// Undoes [`bind`](Self::bind) for `alias.column`.  Returns false if
    /// nothing was bound under that name.
    pub(crate) fn reset(&mut self, name: &str) -> bool {
        let Some((friend, column)) = self.route(name) else {
            return false;
        };
        let Some((slot, declared)) = friend.forwarded.shift_remove(column) else {
            return false;
        };
        slot.clear();
        if let Ok(mut source) = friend.source.try_borrow_mut() {
            source.rebind_column(column, None, &declared);
        }
        true
    }

    pub(crate) fn reset_all(&mut self) {
        for friend in &mut self.friends {
            let forwarded = std::mem::take(&mut friend.forwarded);
            let mut source = friend.source.try_borrow_mut().ok();
            for (column, (slot, declared)) in forwarded {
                slot.clear();
                if let Some(source) = source.as_mut() {
                    source.rebind_column(&column, None, &declared);
                }
            }
        }
    }

    /// Record count of `source`.  Fails if `source` is busy.
    pub(crate) fn record_count(source: &RefCell<dyn RecordSource>) -> Result<u64, StorageError> {
        source
            .try_borrow_mut()
            .map_err(|_| StorageError::SourceFailed("record source is busy".into()))?
            .record_count()
    }
}
