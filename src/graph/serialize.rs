use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use super::{GraphWarning, SerializedGraph, Visit, WalkPolicy};
use crate::codec::{CodecRegistry, FieldData, References};
use crate::error::{GraphError, GraphResult, ObjectFailure};
use crate::host::{HostError, ObjectHandle, ObjectHost};
use crate::id::ObjectId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mark {
    InProgress(ObjectId),
    Done(ObjectId),
    External(ObjectId),
    Skipped,
    Failed,
}

impl Mark {
    fn id(self) -> Option<ObjectId> {
        match self {
            Mark::InProgress(id) | Mark::Done(id) | Mark::External(id) => Some(id),
            Mark::Skipped | Mark::Failed => None,
        }
    }
}

struct Frame<'a> {
    handle: ObjectHandle,
    id: ObjectId,
    references: References<'a>,
}

struct Walk<'a, 'p> {
    host: &'a dyn ObjectHost,
    codecs: &'a CodecRegistry,
    policy: &'p mut dyn WalkPolicy,
    roots: HashSet<ObjectHandle>,
    marks: HashMap<ObjectHandle, Mark>,
    stack: Vec<Frame<'a>>,
    failed: BTreeSet<ObjectId>,
    out: SerializedGraph,
}

/// Serializes the graph reachable from `roots` under a custom walk policy.
///
/// The walk is an iterative post-order depth-first search: an object's
/// record is emitted once all of its references have been emitted or are
/// on the current path (cycle). Failures on non-root objects are collected
/// in [`SerializedGraph::failures`]; any failure on a root fails the call.
pub fn serialize_with(
    host: &dyn ObjectHost,
    codecs: &CodecRegistry,
    roots: &[ObjectHandle],
    policy: &mut dyn WalkPolicy,
) -> GraphResult<SerializedGraph> {
    let mut walk = Walk {
        host,
        codecs,
        policy,
        roots: roots.iter().copied().collect(),
        marks: HashMap::new(),
        stack: Vec::new(),
        failed: BTreeSet::new(),
        out: SerializedGraph::default(),
    };
    for &root in roots {
        walk.run_root(root)?;
    }
    walk.scrub_failed();
    let out = walk.out;
    debug!(
        entries = out.stream.len(),
        roots = out.stream.roots.len(),
        externals = out.externals.len(),
        warnings = out.warnings.len(),
        failures = out.failures.len(),
        "serialized object graph"
    );
    Ok(out)
}

impl<'a> Walk<'a, '_> {
    fn run_root(&mut self, root: ObjectHandle) -> GraphResult<()> {
        if let Some(mark) = self.marks.get(&root).copied() {
            if let Some(id) = mark.id() {
                if !self.out.stream.roots.contains(&id) {
                    self.out.stream.roots.push(id);
                }
            }
            return Ok(());
        }
        let id = match self.policy.classify(self.host, root) {
            Visit::Descend(id) => id,
            Visit::Leaf(_) | Visit::Exclude(_) => {
                return Err(HostError::Refused(format!("root {root} cannot be serialized")).into())
            }
        };
        let references = self.codecs.enumerate(self.host, root)?;
        self.marks.insert(root, Mark::InProgress(id));
        self.stack.push(Frame {
            handle: root,
            id,
            references,
        });
        self.drain()?;
        self.out.stream.roots.push(id);
        Ok(())
    }

    fn drain(&mut self) -> GraphResult<()> {
        loop {
            let next = match self.stack.last_mut() {
                Some(frame) => frame.references.next(),
                None => return Ok(()),
            };
            match next {
                Some(Ok((_, child))) => self.reach(child)?,
                Some(Err(source)) => {
                    if let Some(frame) = self.stack.pop() {
                        let type_name = self
                            .host
                            .object(frame.handle)
                            .map(|object| object.type_name())
                            .unwrap_or("?");
                        self.fail(frame.handle, frame.id, GraphError::codec(type_name, source))?;
                    }
                }
                None => {
                    if let Some(frame) = self.stack.pop() {
                        self.emit(frame)?;
                    }
                }
            }
        }
    }

    fn reach(&mut self, child: ObjectHandle) -> GraphResult<()> {
        if self.marks.contains_key(&child) {
            return Ok(());
        }
        match self.policy.classify(self.host, child) {
            Visit::Descend(id) => match self.codecs.enumerate(self.host, child) {
                Ok(references) => {
                    self.marks.insert(child, Mark::InProgress(id));
                    self.stack.push(Frame {
                        handle: child,
                        id,
                        references,
                    });
                }
                Err(GraphError::MissingCodec(type_name)) if !self.roots.contains(&child) => {
                    warn!(object = %child, type_name = %type_name, "no codec; reference written as null");
                    self.marks.insert(child, Mark::Skipped);
                    self.out.warnings.push(GraphWarning::MissingCodec {
                        handle: child,
                        type_name,
                    });
                }
                Err(err) => self.fail(child, id, err)?,
            },
            Visit::Leaf(id) => {
                self.marks.insert(child, Mark::External(id));
                self.out.externals.insert(id);
            }
            Visit::Exclude(reason) => {
                debug!(object = %child, %reason, "object excluded from walk");
                self.marks.insert(child, Mark::Skipped);
                self.out.warnings.push(GraphWarning::Excluded {
                    handle: child,
                    reason,
                });
            }
        }
        Ok(())
    }

    fn emit(&mut self, frame: Frame<'a>) -> GraphResult<()> {
        let marks = &self.marks;
        let mut resolver = |target: ObjectHandle| marks.get(&target).and_then(|mark| mark.id());
        match self.codecs.encode(self.host, frame.handle, &mut resolver) {
            Ok(encoded) => {
                for (_, target) in encoded.unresolved {
                    if !self.marks.contains_key(&target) {
                        self.out.warnings.push(GraphWarning::Excluded {
                            handle: target,
                            reason: "not reached by the walk".to_string(),
                        });
                    }
                }
                self.marks.insert(frame.handle, Mark::Done(frame.id));
                self.out.stream.push(frame.id, encoded.record);
                self.out.handles.push(frame.handle);
                Ok(())
            }
            Err(err) => self.fail(frame.handle, frame.id, err),
        }
    }

    fn fail(&mut self, handle: ObjectHandle, id: ObjectId, error: GraphError) -> GraphResult<()> {
        if self.roots.contains(&handle) {
            return Err(error);
        }
        warn!(object = %handle, %id, %error, "object dropped from graph");
        self.marks.insert(handle, Mark::Failed);
        self.failed.insert(id);
        self.out.failures.push(ObjectFailure {
            id: Some(id),
            handle: Some(handle),
            error,
        });
        Ok(())
    }

    /// Nulls back-references to objects that failed after being referenced.
    fn scrub_failed(&mut self) {
        if self.failed.is_empty() {
            return;
        }
        for entry in &mut self.out.stream.entries {
            for data in entry.record.fields.values_mut() {
                match data {
                    FieldData::Ref(target) if target.is_some_and(|id| self.failed.contains(&id)) => {
                        *target = None;
                    }
                    FieldData::Refs(targets) => targets.retain(|id| !self.failed.contains(id)),
                    _ => {}
                }
            }
        }
    }
}
