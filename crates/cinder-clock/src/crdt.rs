//! Operations over the event DAG.

use cinder_blockstore::{BlockFetcher, Transaction};
use cinder_core::{Block, Hash};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ClockError, Result};
use crate::event::{Event, EventData, Operation, ValueBlock};
use crate::index::{self, IndexEntry, IndexMap};

/// A document write or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub del: bool,
}

impl DocUpdate {
    pub fn put(id: impl Into<String>, value: Value) -> Self {
        DocUpdate {
            id: id.into(),
            value: Some(value),
            del: false,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        DocUpdate {
            id: id.into(),
            value: None,
            del: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangesOptions {
    /// Stop after this many distinct keys.
    pub limit: Option<usize>,
    /// Skip unreadable events instead of failing.
    pub dirty: bool,
}

/// Result of applying a bulk update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkResult {
    pub head: Vec<Hash>,
    pub event: Hash,
}

/// Merged indexes for multi-head clocks, keyed by the sorted head.
#[derive(Default)]
pub struct IndexCache {
    merged: RwLock<HashMap<Vec<Hash>, Arc<IndexMap>>>,
}

impl IndexCache {
    pub fn get(&self, head: &[Hash]) -> Option<Arc<IndexMap>> {
        self.merged.read().get(head).cloned()
    }

    pub fn insert(&self, head: Vec<Hash>, index: Arc<IndexMap>) {
        self.merged.write().insert(head, index);
    }

    pub fn len(&self) -> usize {
        self.merged.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted(head: &[Hash]) -> Vec<Hash> {
    let mut out = head.to_vec();
    out.sort();
    out.dedup();
    out
}

/// The document CRDT of one ledger.
#[derive(Default)]
pub struct Crdt {
    cache: IndexCache,
}

impl Crdt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    /// Index of a multi-head clock. Starts from the index of the newest
    /// event every tip descends from and replays the events above it in
    /// causal order, so a write always beats the writes it descends from.
    /// Concurrent events are replayed in address order. Without a single
    /// shared base the whole history is replayed.
    async fn merged_index(&self, fetcher: &dyn BlockFetcher, head: &[Hash]) -> Result<Arc<IndexMap>> {
        let head = sorted(head);
        if let Some(hit) = self.cache.get(&head) {
            return Ok(hit);
        }
        let events = load_events(fetcher, &head, &HashSet::new(), false).await?;
        let mut common: Option<HashSet<Hash>> = None;
        for tip in &head {
            let reach = reachable(&events, tip);
            common = Some(match common {
                None => reach,
                Some(shared) => shared.intersection(&reach).copied().collect(),
            });
        }
        let common = common.unwrap_or_default();
        let below: HashSet<Hash> = common
            .iter()
            .filter_map(|address| events.get(address))
            .flat_map(|event| event.parents.iter().copied())
            .collect();
        let frontier: Vec<Hash> = common.iter().filter(|a| !below.contains(*a)).copied().collect();

        let (mut out, replay) = match frontier.as_slice() {
            [base] => {
                let event = events.get(base).ok_or(ClockError::MissingBlock(*base))?;
                let index = index::load_all(fetcher, &event.index).await?;
                let replay: HashMap<Hash, Event> = events
                    .into_iter()
                    .filter(|(address, _)| !common.contains(address))
                    .collect();
                (index, replay)
            }
            _ => (IndexMap::new(), events),
        };

        let mut from_ops = HashSet::new();
        for address in causal_order(&replay) {
            let Some(event) = replay.get(&address) else {
                continue;
            };
            for op in event.data.ops_newest_first().into_iter().rev() {
                out.insert(op.key.clone(), entry_for(op, false));
                from_ops.insert(op.key.clone());
            }
        }
        let merged = Arc::new(resolve_tombstones(fetcher, out, &from_ops).await?);
        debug!(heads = head.len(), replayed = replay.len(), keys = merged.len(), "merged index");
        self.cache.insert(head, merged.clone());
        Ok(merged)
    }

    async fn lookup(
        &self,
        fetcher: &dyn BlockFetcher,
        head: &[Hash],
        key: &str,
    ) -> Result<Option<IndexEntry>> {
        match head {
            [] => Ok(None),
            [single] => {
                let event = Event::load(fetcher, single).await?;
                index::lookup(fetcher, &event.index, key).await
            }
            _ => Ok(self.merged_index(fetcher, head).await?.get(key).cloned()),
        }
    }

    async fn full_index(&self, fetcher: &dyn BlockFetcher, head: &[Hash]) -> Result<Arc<IndexMap>> {
        match head {
            [] => Ok(Arc::new(IndexMap::new())),
            [single] => {
                let event = Event::load(fetcher, single).await?;
                Ok(Arc::new(index::load_all(fetcher, &event.index).await?))
            }
            _ => self.merged_index(fetcher, head).await,
        }
    }

    /// Record `updates` as one event on top of `head`, writing every new
    /// block into `tx`. One update becomes a single put event; several
    /// become one batch event.
    pub async fn apply_bulk_update(
        &self,
        fetcher: &dyn BlockFetcher,
        tx: &Transaction,
        head: &[Hash],
        updates: &[DocUpdate],
    ) -> Result<BulkResult> {
        if updates.is_empty() {
            return Err(ClockError::EmptyBatch);
        }
        let mut ops = Vec::with_capacity(updates.len());
        let mut changes = Vec::with_capacity(updates.len());
        for update in updates {
            let value = if update.del {
                ValueBlock::tombstone()
            } else {
                match &update.value {
                    Some(doc) => ValueBlock::doc(doc.clone()),
                    None => return Err(ClockError::MissingValue(update.id.clone())),
                }
            };
            let block = Block::encode(&value)?;
            let op = Operation {
                key: update.id.clone(),
                value: *block.address(),
            };
            changes.push((op.key.clone(), entry_for(&op, update.del)));
            ops.push(op);
            tx.put(block);
        }

        let base = match head {
            [] => None,
            [single] => Some(Event::load(fetcher, single).await?.index),
            _ => {
                let merged = self.merged_index(fetcher, head).await?;
                Some(index::build(tx, &merged)?)
            }
        };
        let index = index::update(fetcher, tx, base.as_ref(), &changes).await?;

        let data = if ops.len() == 1 {
            EventData::Put(ops.remove(0))
        } else {
            EventData::Batch { ops }
        };
        let event = Event {
            parents: head.to_vec(),
            data,
            index,
        };
        let block = event.to_block()?;
        let address = *block.address();
        tx.put(block);
        debug!(event = %address.short(), ops = updates.len(), "applied bulk update");
        Ok(BulkResult {
            head: vec![address],
            event: address,
        })
    }

    /// Current document for `key`.
    pub async fn get_value(&self, fetcher: &dyn BlockFetcher, head: &[Hash], key: &str) -> Result<Value> {
        let entry = self
            .lookup(fetcher, head, key)
            .await?
            .ok_or_else(|| ClockError::NotFound(key.to_string()))?;
        if entry.del {
            return Err(ClockError::NotFound(key.to_string()));
        }
        let value: ValueBlock = fetcher.require(&entry.value).await?.decode()?;
        value.doc.ok_or_else(|| ClockError::NotFound(key.to_string()))
    }

    /// Latest update per key for every event reachable from `head` but not
    /// from `since`, oldest first.
    pub async fn changes_since(
        &self,
        fetcher: &dyn BlockFetcher,
        head: &[Hash],
        since: &[Hash],
        opts: ChangesOptions,
    ) -> Result<Vec<DocUpdate>> {
        let stop = self.ancestors(fetcher, since, opts.dirty).await?;
        let events = load_events(fetcher, head, &stop, opts.dirty).await?;
        let limit = opts.limit.unwrap_or(usize::MAX);
        let mut keys = HashSet::new();
        let mut updates = Vec::new();

        'walk: for address in causal_order(&events).iter().rev() {
            let Some(event) = events.get(address) else {
                continue;
            };
            for op in event.data.ops_newest_first() {
                if updates.len() >= limit {
                    break 'walk;
                }
                if !keys.insert(op.key.clone()) {
                    continue;
                }
                let value: ValueBlock = match fetcher.require(&op.value).await {
                    Ok(block) => block.decode()?,
                    Err(e) if opts.dirty => {
                        warn!(key = %op.key, error = %e, "skipping unreadable value");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                updates.push(DocUpdate {
                    id: op.key.clone(),
                    del: value.del,
                    value: value.doc,
                });
            }
        }
        updates.reverse();
        Ok(updates)
    }

    /// Every event reachable from `from`, inclusive.
    async fn ancestors(&self, fetcher: &dyn BlockFetcher, from: &[Hash], dirty: bool) -> Result<HashSet<Hash>> {
        let events = load_events(fetcher, from, &HashSet::new(), dirty).await?;
        Ok(events.into_keys().collect())
    }

    /// Every live document, sorted by key.
    pub async fn all_entries(&self, fetcher: &dyn BlockFetcher, head: &[Hash]) -> Result<Vec<(String, Value)>> {
        let index = self.full_index(fetcher, head).await?;
        let mut out = Vec::with_capacity(index.len());
        for (key, entry) in index.iter() {
            if entry.del {
                continue;
            }
            let value: ValueBlock = fetcher.require(&entry.value).await?.decode()?;
            if let Some(doc) = value.doc {
                out.push((key.clone(), doc));
            }
        }
        Ok(out)
    }

    /// One line per reachable event, newest first.
    pub async fn clock_vis(&self, fetcher: &dyn BlockFetcher, head: &[Hash]) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<Hash> = head.iter().copied().collect();
        while let Some(address) = queue.pop_front() {
            if !visited.insert(address) {
                continue;
            }
            let event = Event::load(fetcher, &address).await?;
            let parents: Vec<String> = event.parents.iter().map(Hash::short).collect();
            let summary = match &event.data {
                EventData::Put(op) => format!("put {}", op.key),
                EventData::Batch { ops } => format!("batch({})", ops.len()),
            };
            lines.push(format!("{} <- [{}] {}", address.short(), parents.join(", "), summary));
            queue.extend(event.parents);
        }
        Ok(lines)
    }

    /// Fold an event into `head`. Tips the event descends from are
    /// replaced; an event already reachable from `head` changes nothing.
    pub async fn advance(&self, fetcher: &dyn BlockFetcher, head: &[Hash], event: &Hash) -> Result<Vec<Hash>> {
        if head.contains(event) {
            return Ok(head.to_vec());
        }
        let known = self.ancestors(fetcher, head, false).await?;
        if known.contains(event) {
            return Ok(head.to_vec());
        }
        let below = self.ancestors(fetcher, std::slice::from_ref(event), false).await?;
        let mut next: Vec<Hash> = head.iter().filter(|h| !below.contains(*h)).copied().collect();
        next.push(*event);
        Ok(next)
    }
}

/// Load every event reachable from `from` without crossing `stop`.
/// In dirty mode unreadable events are left out.
async fn load_events(
    fetcher: &dyn BlockFetcher,
    from: &[Hash],
    stop: &HashSet<Hash>,
    dirty: bool,
) -> Result<HashMap<Hash, Event>> {
    let mut events = HashMap::new();
    let mut missing = HashSet::new();
    let mut queue: VecDeque<Hash> = from.iter().copied().collect();
    while let Some(address) = queue.pop_front() {
        if stop.contains(&address) || events.contains_key(&address) || missing.contains(&address) {
            continue;
        }
        match Event::load(fetcher, &address).await {
            Ok(event) => {
                queue.extend(event.parents.iter().copied());
                events.insert(address, event);
            }
            Err(ClockError::MissingBlock(gone)) if dirty => {
                warn!(event = %gone.short(), "skipping unreadable event");
                missing.insert(address);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(events)
}

fn reachable(events: &HashMap<Hash, Event>, tip: &Hash) -> HashSet<Hash> {
    let mut seen = HashSet::new();
    let mut stack = vec![*tip];
    while let Some(address) = stack.pop() {
        if !seen.insert(address) {
            continue;
        }
        if let Some(event) = events.get(&address) {
            stack.extend(event.parents.iter().copied());
        }
    }
    seen
}

/// Parents before children; events with no order between them go by
/// address.
fn causal_order(events: &HashMap<Hash, Event>) -> Vec<Hash> {
    let mut pending: HashMap<Hash, usize> = HashMap::with_capacity(events.len());
    let mut children: HashMap<Hash, Vec<Hash>> = HashMap::new();
    for (address, event) in events {
        let mut waiting = 0;
        for parent in event.parents.iter().filter(|p| events.contains_key(*p)) {
            children.entry(*parent).or_default().push(*address);
            waiting += 1;
        }
        pending.insert(*address, waiting);
    }
    let mut ready: BTreeSet<Hash> = pending
        .iter()
        .filter(|(_, waiting)| **waiting == 0)
        .map(|(address, _)| *address)
        .collect();
    let mut order = Vec::with_capacity(events.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for child in children.get(&next).into_iter().flatten() {
            if let Some(waiting) = pending.get_mut(child) {
                *waiting -= 1;
                if *waiting == 0 {
                    ready.insert(*child);
                }
            }
        }
    }
    order
}

/// Entries collected from raw operations do not know whether they point at
/// a tombstone; read those value blocks once.
async fn resolve_tombstones(
    fetcher: &dyn BlockFetcher,
    mut map: IndexMap,
    from_ops: &HashSet<String>,
) -> Result<IndexMap> {
    for key in from_ops {
        if let Some(entry) = map.get_mut(key) {
            let value: ValueBlock = fetcher.require(&entry.value).await?.decode()?;
            entry.del = value.del;
        }
    }
    Ok(map)
}

fn entry_for(op: &Operation, del: bool) -> IndexEntry {
    IndexEntry {
        value: op.value,
        del,
    }
}
