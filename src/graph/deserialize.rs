use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};

use super::GraphWarning;
use crate::codec::{CodecRegistry, DeferredField, FieldKind, RecordStream, Resolution, Slot};
use crate::error::{GraphError, GraphResult, ObjectFailure};
use crate::host::{ObjectHandle, ObjectHost};
use crate::id::ObjectId;
use crate::identity::IdentityRegistry;

/// How loaded objects are registered with the identity registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Binding {
    /// Objects take their stream ids.
    #[default]
    Persistent,
    /// Objects get fresh process-local ids; stream ids are only reported.
    Ephemeral,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub binding: Binding,
    /// Already allocated objects to decode into, keyed by stream id.
    pub hydrate: HashMap<ObjectId, ObjectHandle>,
}

impl LoadOptions {
    pub fn persistent() -> Self {
        Self::default()
    }

    pub fn ephemeral() -> Self {
        Self {
            binding: Binding::Ephemeral,
            ..Self::default()
        }
    }

    pub fn with_hydrate(mut self, hydrate: HashMap<ObjectId, ObjectHandle>) -> Self {
        self.hydrate = hydrate;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadProgress {
    Pending { loaded: usize, total: usize },
    Complete,
}

/// Outcome of a completed load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Stream id and live handle of every materialized entry, in stream order.
    pub objects: Vec<(ObjectId, ObjectHandle)>,
    pub roots: Vec<(ObjectId, ObjectHandle)>,
    /// References left null because their target never materialized.
    pub dangling: Vec<GraphWarning>,
    pub failures: Vec<ObjectFailure>,
}

impl LoadReport {
    pub fn handle(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.objects
            .iter()
            .find(|(candidate, _)| *candidate == id)
            .map(|(_, handle)| *handle)
    }

    /// First root, if any.
    pub fn root(&self) -> Option<ObjectHandle> {
        self.roots.first().map(|(_, handle)| *handle)
    }

    pub fn is_clean(&self) -> bool {
        self.dangling.is_empty() && self.failures.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Empty,
    Filled(ObjectHandle),
    Failed,
}

#[derive(Debug)]
struct Waiter {
    owner: ObjectHandle,
    owner_id: ObjectId,
    field: DeferredField,
    remaining: usize,
}

/// Resumable, single forward pass over a record stream.
///
/// Each [`step`](Self::step) materializes one entry; the host may interleave
/// other work between steps. A loader that is dropped half way must be
/// [`abandon`](Self::abandon)ed to undo its bindings and allocations.
#[derive(Debug)]
pub struct GraphLoader<'s> {
    stream: &'s RecordStream,
    options: LoadOptions,
    positions: HashMap<ObjectId, usize>,
    slots: Vec<SlotState>,
    waiters: Vec<Waiter>,
    waiting_on: HashMap<usize, Vec<usize>>,
    cursor: usize,
    created: Vec<ObjectHandle>,
    bound: Vec<ObjectHandle>,
    report: LoadReport,
}

impl<'s> GraphLoader<'s> {
    pub fn new(stream: &'s RecordStream, options: LoadOptions) -> Self {
        Self {
            stream,
            options,
            positions: stream.positions(),
            slots: vec![SlotState::Empty; stream.len()],
            waiters: Vec::new(),
            waiting_on: HashMap::new(),
            cursor: 0,
            created: Vec::new(),
            bound: Vec::new(),
            report: LoadReport::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.stream.len()
    }

    /// Materializes the next entry.
    ///
    /// Per-object failures are recorded and the load continues; failures on a
    /// root entry and identity violations are returned.
    pub fn step(
        &mut self,
        host: &mut dyn ObjectHost,
        codecs: &CodecRegistry,
        identity: &mut IdentityRegistry,
    ) -> GraphResult<LoadProgress> {
        let stream = self.stream;
        let Some(entry) = stream.entries.get(self.cursor) else {
            return Ok(LoadProgress::Complete);
        };
        let position = self.cursor;
        self.cursor += 1;

        if self.positions.get(&entry.id) != Some(&position) {
            warn!(id = %entry.id, position, "duplicate stream entry ignored");
            self.report
                .dangling
                .push(GraphWarning::DuplicateEntry { id: entry.id });
            return Ok(self.progress());
        }

        match self.materialize(position, host, codecs, identity) {
            Ok(handle) => self.report.objects.push((entry.id, handle)),
            Err(error) if error.is_fatal() || stream.is_root(entry.id) => return Err(error),
            Err(error) => {
                warn!(id = %entry.id, %error, "object failed to load");
                let handle = self.discard(position, host, identity);
                self.slots[position] = SlotState::Failed;
                self.report.failures.push(ObjectFailure {
                    id: Some(entry.id),
                    handle,
                    error,
                });
            }
        }
        self.release(position, host, codecs, identity);
        Ok(self.progress())
    }

    /// Runs the remaining steps and closes the pass.
    ///
    /// On error every binding and allocation made by this loader is undone.
    pub fn finish(
        mut self,
        host: &mut dyn ObjectHost,
        codecs: &CodecRegistry,
        identity: &mut IdentityRegistry,
    ) -> GraphResult<LoadReport> {
        loop {
            match self.step(host, codecs, identity) {
                Ok(LoadProgress::Complete) => break,
                Ok(LoadProgress::Pending { .. }) => {}
                Err(error) => {
                    self.abandon(host, identity);
                    return Err(error);
                }
            }
        }
        for index in 0..self.waiters.len() {
            if self.waiters[index].remaining > 0 {
                self.waiters[index].remaining = 0;
                self.patch(index, host, codecs, identity);
            }
        }
        let stream = self.stream;
        for root in &stream.roots {
            match self.lookup(*root, identity) {
                Some(handle) => self.report.roots.push((*root, handle)),
                None => {
                    let error = GraphError::DanglingReference { id: *root };
                    self.abandon(host, identity);
                    return Err(error);
                }
            }
        }
        debug!(
            objects = self.report.objects.len(),
            roots = self.report.roots.len(),
            dangling = self.report.dangling.len(),
            failures = self.report.failures.len(),
            "loaded object graph"
        );
        Ok(self.report)
    }

    /// Undoes every identity binding and destroys every object this loader
    /// constructed. Hydrated objects are left alive.
    pub fn abandon(self, host: &mut dyn ObjectHost, identity: &mut IdentityRegistry) {
        for handle in self.bound.iter().rev() {
            identity.unbind(*handle);
        }
        for handle in self.created.iter().rev() {
            host.destroy(*handle);
        }
        debug!(
            unbound = self.bound.len(),
            destroyed = self.created.len(),
            "abandoned graph load"
        );
    }

    fn progress(&self) -> LoadProgress {
        if self.is_complete() {
            LoadProgress::Complete
        } else {
            LoadProgress::Pending {
                loaded: self.cursor,
                total: self.stream.len(),
            }
        }
    }

    fn materialize(
        &mut self,
        position: usize,
        host: &mut dyn ObjectHost,
        codecs: &CodecRegistry,
        identity: &mut IdentityRegistry,
    ) -> GraphResult<ObjectHandle> {
        let stream = self.stream;
        let entry = &stream.entries[position];
        let handle = match self.options.hydrate.get(&entry.id) {
            Some(handle) => *handle,
            None => {
                let descriptor = codecs.descriptor(&entry.record.type_name)?;
                let handle = host.construct(descriptor)?;
                self.created.push(handle);
                handle
            }
        };
        self.slots[position] = SlotState::Filled(handle);

        match self.options.binding {
            Binding::Persistent => {
                if identity.resolve(entry.id) != Some(handle) {
                    identity.bind(entry.id, handle)?;
                    self.bound.push(handle);
                }
            }
            Binding::Ephemeral => {
                if identity.id_of(handle).is_none() {
                    identity.assign_ephemeral(handle);
                    self.bound.push(handle);
                }
            }
        }

        let positions = &self.positions;
        let slots = &self.slots;
        let registry = &*identity;
        let mut resolver = |target: ObjectId| match positions.get(&target) {
            Some(index) => match slots[*index] {
                SlotState::Filled(handle) => Resolution::Ready(handle),
                SlotState::Empty => Resolution::Pending,
                SlotState::Failed => Resolution::Dangling,
            },
            None => registry
                .resolve(target)
                .map_or(Resolution::Dangling, Resolution::Ready),
        };
        let outcome = codecs.decode(host, handle, &entry.record, &mut resolver)?;

        for (field, target) in outcome.dangling {
            self.report.dangling.push(GraphWarning::Dangling {
                owner: entry.id,
                field,
                target,
            });
        }
        for field in outcome.deferred {
            let pending: BTreeSet<usize> = field
                .targets
                .iter()
                .filter_map(|target| self.positions.get(target).copied())
                .filter(|index| self.slots[*index] == SlotState::Empty)
                .collect();
            let index = self.waiters.len();
            for target in &pending {
                self.waiting_on.entry(*target).or_default().push(index);
            }
            self.waiters.push(Waiter {
                owner: handle,
                owner_id: entry.id,
                field,
                remaining: pending.len(),
            });
        }
        Ok(handle)
    }

    /// Drops the partially loaded object at `position`, if this loader made it.
    fn discard(
        &mut self,
        position: usize,
        host: &mut dyn ObjectHost,
        identity: &mut IdentityRegistry,
    ) -> Option<ObjectHandle> {
        let SlotState::Filled(handle) = self.slots[position] else {
            return None;
        };
        if let Some(index) = self.bound.iter().position(|bound| *bound == handle) {
            self.bound.remove(index);
            identity.unbind(handle);
        }
        if let Some(index) = self.created.iter().position(|created| *created == handle) {
            self.created.remove(index);
            host.destroy(handle);
        }
        Some(handle)
    }

    /// Back-patches the fields that were waiting on `position`.
    fn release(
        &mut self,
        position: usize,
        host: &mut dyn ObjectHost,
        codecs: &CodecRegistry,
        identity: &IdentityRegistry,
    ) {
        let Some(indices) = self.waiting_on.remove(&position) else {
            return;
        };
        for index in indices {
            let waiter = &mut self.waiters[index];
            waiter.remaining = waiter.remaining.saturating_sub(1);
            if waiter.remaining == 0 {
                self.patch(index, host, codecs, identity);
            }
        }
    }

    fn patch(
        &mut self,
        index: usize,
        host: &mut dyn ObjectHost,
        codecs: &CodecRegistry,
        identity: &IdentityRegistry,
    ) {
        let waiter = &self.waiters[index];
        let mut handles = Vec::with_capacity(waiter.field.targets.len());
        for target in &waiter.field.targets {
            match self.lookup(*target, identity) {
                Some(handle) => handles.push(handle),
                None => self.report.dangling.push(GraphWarning::Dangling {
                    owner: waiter.owner_id,
                    field: waiter.field.field,
                    target: *target,
                }),
            }
        }
        let slot = match waiter.field.kind {
            FieldKind::Reference => Slot::Ref(handles.first().copied()),
            FieldKind::ReferenceList | FieldKind::Value => Slot::Refs(handles),
        };
        if let Err(error) = codecs.patch(host, waiter.owner, waiter.field.field, slot) {
            warn!(id = %waiter.owner_id, %error, "failed to back-patch reference");
            self.report.failures.push(ObjectFailure {
                id: Some(waiter.owner_id),
                handle: Some(waiter.owner),
                error,
            });
        }
    }

    fn lookup(&self, id: ObjectId, identity: &IdentityRegistry) -> Option<ObjectHandle> {
        match self.positions.get(&id) {
            Some(index) => match self.slots[*index] {
                SlotState::Filled(handle) => Some(handle),
                SlotState::Empty | SlotState::Failed => None,
            },
            None => identity.resolve(id),
        }
    }
}
