//! Decides what object state goes to which connection, and applies what
//! arrives.
//!
//! Every replicated field carries a monotonic version stamped by the
//! authority. Each connection remembers, per object, the highest version of
//! each field the peer has acknowledged; the per-tick scan sends only fields
//! ahead of that cursor (or everything, when incremental replication is
//! off). Updates travel unreliably: a lost datagram is never resent
//! verbatim, the fields simply stay ahead of the cursor and go out again
//! with their current values.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::NetError;
use crate::connection::HostId;
use crate::message::{FieldUpdate, HEADER_SIZE, MAX_DATAGRAM_SIZE, Message};
use crate::value::{NetValue, NetValueKind};

/// Process-unique identifier for a replicated object, assigned by the
/// authority and never reused while the object is alive.
pub type NetId = u32;

pub const INVALID_NET_ID: NetId = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetObjectFlags: u8 {
        /// Object participates in replication at all.
        const REPLICATE = 1 << 0;
        /// Send every field this tick regardless of dirt or rate class.
        const FORCE_REPLICATE = 1 << 1;
    }
}

/// How often an object is considered for replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    EveryTick,
    /// Considered once every `n` ticks.
    Throttled(u32),
}

#[derive(Debug, Clone)]
pub struct ReplicatedField {
    pub kind: NetValueKind,
    pub value: NetValue,
    pub version: u32,
}

/// A networked game object: identity, ownership and its declared fields.
#[derive(Debug)]
pub struct NetObject {
    pub net_id: NetId,
    pub class: String,
    pub owner: HostId,
    pub rate: RateClass,
    pub flags: NetObjectFlags,
    fields: Vec<ReplicatedField>,
}

impl NetObject {
    pub fn new(net_id: NetId, class: impl Into<String>, owner: HostId) -> Self {
        Self {
            net_id,
            class: class.into(),
            owner,
            rate: RateClass::EveryTick,
            flags: NetObjectFlags::REPLICATE,
            fields: Vec::new(),
        }
    }

    /// Declare a replicated field; returns its wire index.
    pub fn declare_field(&mut self, kind: NetValueKind) -> u8 {
        let index = self.fields.len() as u8;
        self.fields.push(ReplicatedField {
            kind,
            value: kind.default_value(),
            version: 0,
        });
        index
    }

    /// Store a new value, bumping the version only when it actually changed.
    /// Returns true if the field became dirty.
    pub fn set_field(&mut self, index: usize, value: NetValue) -> Result<bool, NetError> {
        let field = self
            .fields
            .get_mut(index)
            .ok_or(NetError::BadField(self.net_id, index))?;
        if field.kind != value.kind() {
            return Err(NetError::Codec(crate::message::CodecError::KindMismatch {
                expected: field.kind,
                got: value.kind(),
            }));
        }
        if field.value == value {
            return Ok(false);
        }
        field.value = value;
        field.version = field.version.wrapping_add(1);
        Ok(true)
    }

    pub fn field(&self, index: usize) -> Option<&NetValue> {
        self.fields.get(index).map(|f| &f.value)
    }

    pub fn field_version(&self, index: usize) -> Option<u32> {
        self.fields.get(index).map(|f| f.version)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn replicates(&self) -> bool {
        self.flags.contains(NetObjectFlags::REPLICATE) && !self.fields.is_empty()
    }
}

/// Which (field, version) pairs one outbound datagram carried for one
/// object; acking the datagram advances the cursor to these versions.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateManifest {
    pub net_id: NetId,
    pub fields: Vec<(u8, u32)>,
}

#[derive(Debug)]
struct ObjectCursor {
    acked: Vec<u32>,
    last_sent_tick: u64,
}

/// Per-connection replication progress: the last acknowledged version of
/// every field of every object, plus send-recency for priority aging.
#[derive(Debug, Default)]
pub struct ReplicationCursor {
    objects: HashMap<NetId, ObjectCursor>,
}

impl ReplicationCursor {
    fn ensure(&mut self, net_id: NetId, field_count: usize) -> &mut ObjectCursor {
        let entry = self.objects.entry(net_id).or_insert_with(|| ObjectCursor {
            acked: vec![0; field_count],
            last_sent_tick: 0,
        });
        if entry.acked.len() < field_count {
            entry.acked.resize(field_count, 0);
        }
        entry
    }

    pub fn mark_acked(&mut self, manifest: &UpdateManifest) {
        let entry = self.ensure(manifest.net_id, 0);
        for &(index, version) in &manifest.fields {
            let index = index as usize;
            if entry.acked.len() <= index {
                entry.acked.resize(index + 1, 0);
            }
            if version > entry.acked[index] {
                entry.acked[index] = version;
            }
        }
    }

    pub fn forget(&mut self, net_id: NetId) {
        self.objects.remove(&net_id);
    }

    pub fn acked_version(&self, net_id: NetId, index: usize) -> u32 {
        self.objects
            .get(&net_id)
            .and_then(|c| c.acked.get(index))
            .copied()
            .unwrap_or(0)
    }
}

/// Declares the fields (and rate/flags) of a freshly spawned object shell.
pub type ObjectFactory = Box<dyn Fn(&mut NetObject)>;

struct Candidate {
    net_id: NetId,
    force: bool,
    rate_rank: u8,
    age: u64,
    fields: Vec<(u8, u32, NetValue)>,
}

pub struct ReplicationEngine {
    objects: HashMap<NetId, NetObject>,
    factories: HashMap<String, ObjectFactory>,
    next_net_id: NetId,
    incremental: bool,
}

impl ReplicationEngine {
    pub fn new(incremental: bool) -> Self {
        Self {
            objects: HashMap::new(),
            factories: HashMap::new(),
            next_net_id: 1,
            incremental,
        }
    }

    pub fn incremental(&self) -> bool {
        self.incremental
    }

    /// Register the factory that declares fields for a class of objects.
    /// Both sides must register the same classes; the class name in a Spawn
    /// message is resolved through this registry.
    pub fn register_class(&mut self, name: impl Into<String>, factory: ObjectFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Authority path: create an object and assign it a fresh NetId.
    pub fn spawn(&mut self, class: &str, owner: HostId) -> Result<NetId, NetError> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| NetError::UnknownClass(class.to_string()))?;

        let net_id = self.next_net_id;
        self.next_net_id = self.next_net_id.wrapping_add(1);

        let mut object = NetObject::new(net_id, class, owner);
        factory(&mut object);
        self.objects.insert(net_id, object);
        Ok(net_id)
    }

    /// Remote path: materialize an object announced by the authority.
    pub fn insert_remote(
        &mut self,
        net_id: NetId,
        class: &str,
        owner: HostId,
    ) -> Result<(), NetError> {
        if self.objects.contains_key(&net_id) {
            log::debug!("spawn for existing object {net_id}, ignoring");
            return Ok(());
        }
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| NetError::UnknownClass(class.to_string()))?;

        let mut object = NetObject::new(net_id, class, owner);
        factory(&mut object);
        self.objects.insert(net_id, object);
        Ok(())
    }

    pub fn destroy(&mut self, net_id: NetId) -> bool {
        self.objects.remove(&net_id).is_some()
    }

    pub fn get(&self, net_id: NetId) -> Option<&NetObject> {
        self.objects.get(&net_id)
    }

    pub fn get_mut(&mut self, net_id: NetId) -> Option<&mut NetObject> {
        self.objects.get_mut(&net_id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &NetObject> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn set_field(
        &mut self,
        net_id: NetId,
        index: usize,
        value: NetValue,
    ) -> Result<bool, NetError> {
        self.objects
            .get_mut(&net_id)
            .ok_or(NetError::UnknownObject(net_id))?
            .set_field(index, value)
    }

    /// Apply an inbound update. The whole message is validated before any
    /// field is touched; a kind mismatch drops it entirely. Returns how many
    /// fields were applied (stale fields are skipped, not errors).
    pub fn apply_update(
        &mut self,
        net_id: NetId,
        updates: &[FieldUpdate],
    ) -> Result<usize, NetError> {
        let object = self
            .objects
            .get_mut(&net_id)
            .ok_or(NetError::UnknownObject(net_id))?;

        for update in updates {
            let field = object
                .fields
                .get(update.index as usize)
                .ok_or(NetError::BadField(net_id, update.index as usize))?;
            if field.kind != update.value.kind() {
                return Err(NetError::Codec(crate::message::CodecError::KindMismatch {
                    expected: field.kind,
                    got: update.value.kind(),
                }));
            }
        }

        let mut applied = 0;
        for update in updates {
            let field = &mut object.fields[update.index as usize];
            // Full-state replication is authoritative by definition; only
            // incremental streams can interleave stale per-field writes.
            if self.incremental && update.version <= field.version {
                log::trace!(
                    "stale update for object {net_id} field {} (v{} <= v{})",
                    update.index,
                    update.version,
                    field.version
                );
                continue;
            }
            field.value = update.value.clone();
            field.version = field.version.max(update.version);
            applied += 1;
        }
        Ok(applied)
    }

    /// Build this tick's update messages for one connection, newest state
    /// only, within `budget` bytes.
    ///
    /// Candidates are ordered by force flag, then rate class, then ticks
    /// since the connection last got the object, so anything deferred by
    /// the budget ages until it outranks the steady traffic and starvation
    /// cannot happen. At least one message always goes out when anything is
    /// pending, even if it alone exceeds the budget.
    pub fn build_updates(
        &self,
        cursor: &mut ReplicationCursor,
        tick: u64,
        budget: usize,
    ) -> Vec<(Message, UpdateManifest)> {
        let overhead = HEADER_SIZE + 4 + 1; // kind is part of HEADER_SIZE
        let mut candidates = Vec::new();

        for object in self.objects.values() {
            if !object.replicates() {
                continue;
            }
            let entry = cursor.ensure(object.net_id, object.fields.len());
            let age = tick.saturating_sub(entry.last_sent_tick);
            let force = object.flags.contains(NetObjectFlags::FORCE_REPLICATE);

            let due = force
                || match object.rate {
                    RateClass::EveryTick => true,
                    RateClass::Throttled(n) => age >= n as u64,
                };
            if !due {
                continue;
            }

            let any_dirty = object
                .fields
                .iter()
                .enumerate()
                .any(|(i, f)| f.version > entry.acked[i]);
            if !any_dirty && !force {
                continue;
            }

            let mut fields = Vec::new();
            for (i, field) in object.fields.iter().enumerate() {
                let include = force || !self.incremental || field.version > entry.acked[i];
                if include {
                    fields.push((i as u8, field.version, field.value.clone()));
                }
            }
            if fields.is_empty() {
                continue;
            }

            candidates.push(Candidate {
                net_id: object.net_id,
                force,
                rate_rank: match object.rate {
                    RateClass::EveryTick => 0,
                    RateClass::Throttled(_) => 1,
                },
                age,
                fields,
            });
        }

        candidates.sort_by(|a, b| {
            b.force
                .cmp(&a.force)
                .then(a.rate_rank.cmp(&b.rate_rank))
                .then(b.age.cmp(&a.age))
                .then(a.net_id.cmp(&b.net_id))
        });

        let mut out: Vec<(Message, UpdateManifest)> = Vec::new();
        let mut spent = 0usize;

        'candidates: for candidate in candidates {
            let mut sent_any = false;
            let mut chunk: Vec<FieldUpdate> = Vec::new();
            let mut chunk_manifest: Vec<(u8, u32)> = Vec::new();
            let mut chunk_size = overhead;

            let mut field_iter = candidate.fields.into_iter().peekable();
            while let Some((index, version, value)) = field_iter.next() {
                let field_size = 1 + 4 + value.encoded_len();
                if overhead + field_size > MAX_DATAGRAM_SIZE {
                    log::warn!(
                        "field {index} of object {} too large for a datagram, skipping",
                        candidate.net_id
                    );
                    continue;
                }
                chunk.push(FieldUpdate {
                    index,
                    version,
                    value,
                });
                chunk_manifest.push((index, version));
                chunk_size += field_size;

                let flush = match field_iter.peek() {
                    None => true,
                    Some((_, _, next)) => {
                        chunk_size + 1 + 4 + next.encoded_len() > MAX_DATAGRAM_SIZE
                            || chunk.len() == u8::MAX as usize
                    }
                };

                if flush {
                    if spent > 0 && spent + chunk_size > budget {
                        // Over budget: defer this object (and everything
                        // below it) to the next tick.
                        break 'candidates;
                    }
                    spent += chunk_size;
                    out.push((
                        Message::Update {
                            net_id: candidate.net_id,
                            fields: std::mem::take(&mut chunk),
                        },
                        UpdateManifest {
                            net_id: candidate.net_id,
                            fields: std::mem::take(&mut chunk_manifest),
                        },
                    ));
                    sent_any = true;
                    chunk_size = overhead;
                }
            }

            if sent_any {
                cursor.ensure(candidate.net_id, 0).last_sent_tick = tick;
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_player(incremental: bool) -> (ReplicationEngine, NetId) {
        let mut engine = ReplicationEngine::new(incremental);
        engine.register_class(
            "player",
            Box::new(|obj| {
                obj.declare_field(NetValueKind::Vec3); // position
                obj.declare_field(NetValueKind::I32); // health
                obj.declare_field(NetValueKind::String); // name
            }),
        );
        let net_id = engine.spawn("player", 0).unwrap();
        (engine, net_id)
    }

    #[test]
    fn test_net_ids_monotonic() {
        let (mut engine, first) = engine_with_player(true);
        let second = engine.spawn("player", 0).unwrap();
        assert!(second > first);

        engine.destroy(first);
        let third = engine.spawn("player", 0).unwrap();
        assert!(third > second, "net id reused after destroy");
    }

    #[test]
    fn test_set_field_bumps_version_on_change_only() {
        let (mut engine, id) = engine_with_player(true);

        assert!(engine.set_field(id, 1, NetValue::I32(100)).unwrap());
        let v1 = engine.get(id).unwrap().field_version(1).unwrap();

        assert!(!engine.set_field(id, 1, NetValue::I32(100)).unwrap());
        assert_eq!(engine.get(id).unwrap().field_version(1).unwrap(), v1);

        assert!(engine.set_field(id, 1, NetValue::I32(99)).unwrap());
        assert!(engine.get(id).unwrap().field_version(1).unwrap() > v1);
    }

    #[test]
    fn test_set_field_kind_checked() {
        let (mut engine, id) = engine_with_player(true);
        assert!(engine.set_field(id, 1, NetValue::F32(1.0)).is_err());
        assert!(engine.set_field(id, 9, NetValue::I32(1)).is_err());
    }

    #[test]
    fn test_stale_update_rejected() {
        let (mut engine, id) = engine_with_player(true);

        engine
            .apply_update(
                id,
                &[FieldUpdate {
                    index: 1,
                    version: 5,
                    value: NetValue::I32(50),
                }],
            )
            .unwrap();

        // An older write arriving late must not clobber the newer state.
        let applied = engine
            .apply_update(
                id,
                &[FieldUpdate {
                    index: 1,
                    version: 3,
                    value: NetValue::I32(80),
                }],
            )
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(engine.get(id).unwrap().field(1), Some(&NetValue::I32(50)));
    }

    #[test]
    fn test_full_replication_is_authoritative() {
        let (mut engine, id) = engine_with_player(false);

        engine
            .apply_update(
                id,
                &[FieldUpdate {
                    index: 1,
                    version: 5,
                    value: NetValue::I32(50),
                }],
            )
            .unwrap();
        let applied = engine
            .apply_update(
                id,
                &[FieldUpdate {
                    index: 1,
                    version: 3,
                    value: NetValue::I32(80),
                }],
            )
            .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(engine.get(id).unwrap().field(1), Some(&NetValue::I32(80)));
    }

    #[test]
    fn test_kind_mismatch_drops_whole_update() {
        let (mut engine, id) = engine_with_player(true);

        let result = engine.apply_update(
            id,
            &[
                FieldUpdate {
                    index: 1,
                    version: 1,
                    value: NetValue::I32(10),
                },
                FieldUpdate {
                    index: 0,
                    version: 1,
                    value: NetValue::Bool(true),
                },
            ],
        );
        assert!(result.is_err());
        // First field untouched even though it was valid.
        assert_eq!(engine.get(id).unwrap().field(1), Some(&NetValue::I32(0)));
    }

    #[test]
    fn test_delta_scan_sends_only_dirty_then_stops_after_ack() {
        let (mut engine, id) = engine_with_player(true);
        let mut cursor = ReplicationCursor::default();

        engine.set_field(id, 1, NetValue::I32(75)).unwrap();

        let batch = engine.build_updates(&mut cursor, 1, 4096);
        assert_eq!(batch.len(), 1);
        match &batch[0].0 {
            Message::Update { net_id, fields } => {
                assert_eq!(*net_id, id);
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].index, 1);
            }
            other => panic!("expected Update, got {other:?}"),
        }

        // Unacked: the same field goes out again next tick.
        assert_eq!(engine.build_updates(&mut cursor, 2, 4096).len(), 1);

        cursor.mark_acked(&batch[0].1);
        assert!(engine.build_updates(&mut cursor, 3, 4096).is_empty());
    }

    #[test]
    fn test_throttled_rate_class_gates_sends() {
        let (mut engine, id) = engine_with_player(true);
        engine.get_mut(id).unwrap().rate = RateClass::Throttled(10);
        let mut cursor = ReplicationCursor::default();

        engine.set_field(id, 1, NetValue::I32(1)).unwrap();

        // Aged enough on the first tick (never sent), then gated.
        let batch = engine.build_updates(&mut cursor, 10, 4096);
        assert_eq!(batch.len(), 1);
        assert!(engine.build_updates(&mut cursor, 12, 4096).is_empty());
        assert_eq!(engine.build_updates(&mut cursor, 20, 4096).len(), 1);
    }

    #[test]
    fn test_force_replicate_sends_clean_fields() {
        let (mut engine, id) = engine_with_player(true);
        engine.get_mut(id).unwrap().flags |= NetObjectFlags::FORCE_REPLICATE;
        let mut cursor = ReplicationCursor::default();

        let batch = engine.build_updates(&mut cursor, 1, 4096);
        assert_eq!(batch.len(), 1);
        match &batch[0].0 {
            Message::Update { fields, .. } => assert_eq!(fields.len(), 3),
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_budget_defers_but_never_starves() {
        let mut engine = ReplicationEngine::new(true);
        engine.register_class(
            "blob",
            Box::new(|obj| {
                obj.declare_field(NetValueKind::String);
            }),
        );

        let mut ids = Vec::new();
        for i in 0..8 {
            let id = engine.spawn("blob", 0).unwrap();
            engine
                .set_field(id, 0, NetValue::String(format!("payload-{i}-{}", "x".repeat(100))))
                .unwrap();
            ids.push(id);
        }

        // Budget fits roughly two objects per tick; everything must still
        // arrive within a bounded number of ticks.
        let mut cursor = ReplicationCursor::default();
        let mut delivered = std::collections::HashSet::new();
        for tick in 1..=8u64 {
            for (_, manifest) in engine.build_updates(&mut cursor, tick, 300) {
                delivered.insert(manifest.net_id);
                cursor.mark_acked(&manifest);
            }
        }
        for id in &ids {
            assert!(delivered.contains(id), "object {id} starved");
        }
    }

    #[test]
    fn test_large_object_chunked_across_datagrams() {
        let mut engine = ReplicationEngine::new(true);
        engine.register_class(
            "wall",
            Box::new(|obj| {
                for _ in 0..4 {
                    obj.declare_field(NetValueKind::String);
                }
            }),
        );
        let id = engine.spawn("wall", 0).unwrap();
        for i in 0..4 {
            engine
                .set_field(id, i, NetValue::String("y".repeat(500)))
                .unwrap();
        }

        let mut cursor = ReplicationCursor::default();
        let batch = engine.build_updates(&mut cursor, 1, usize::MAX);
        assert!(batch.len() >= 2, "2000+ bytes of fields must split");
        for (message, _) in &batch {
            if let Message::Update { fields, .. } = message {
                let size: usize = fields
                    .iter()
                    .map(|f| 5 + f.value.encoded_len())
                    .sum();
                assert!(size + HEADER_SIZE + 5 <= MAX_DATAGRAM_SIZE);
            }
        }
    }

    #[test]
    fn test_remote_spawn_and_unknown_class() {
        let (mut engine, _) = engine_with_player(true);
        assert!(engine.insert_remote(50, "player", 2).is_ok());
        assert_eq!(engine.get(50).unwrap().owner, 2);
        assert!(engine.insert_remote(51, "dragon", 0).is_err());
    }
}
