//! The audio link graph.
//!
//! A bipartite graph of sources (hardware inputs, loopback outputs,
//! renderers) and sinks (hardware outputs, capturers) connected by typed
//! links. Objects and links live in an arena addressed by
//! generation-checked handles; links hold handles, never owning references,
//! to both endpoints, and all mutation happens under one graph-wide lock.

mod bookkeeping;

pub use bookkeeping::CaptureBookkeeping;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::RingBufferFeed;
use crate::format::StreamType;

/// Role of an object in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Hardware input device (ring-buffer source).
    Input,
    /// Hardware output device; a source only in loopback.
    Output,
    /// Client renderer (packet source).
    Renderer,
    /// Client capturer (sink).
    Capturer,
}

/// How a link's source delivers audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// Continuous circular hardware buffer with a clock-to-position
    /// mapping.
    RingBuffer,
    /// Discrete timestamped buffers from a renderer.
    Packet,
}

/// Generation-checked handle to a graph object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

/// Generation-checked handle to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    index: u32,
    generation: u32,
}

/// Candidate link details handed to the initialization hook.
#[derive(Debug, Clone)]
pub struct LinkCandidate {
    /// Kind of the source endpoint.
    pub source_kind: ObjectKind,
    /// Kind of the destination endpoint.
    pub dest_kind: ObjectKind,
    /// Delivery type implied by the source's kind.
    pub source_type: SourceType,
    /// Format of the source's ring, when it has one.
    pub source_stream_type: Option<StreamType>,
}

/// Outcome of a link initialization hook.
pub enum LinkInit {
    /// Refuse the link; `link_objects` returns `None`.
    Reject,
    /// Accept with no per-link bookkeeping.
    Accept,
    /// Accept and attach capture bookkeeping to the link.
    AcceptWithBookkeeping(CaptureBookkeeping),
}

/// Snapshot of one of a capturer's source links, taken under the graph
/// lock and consumed by the mix loop outside it.
pub struct CaptureSourceSnapshot {
    /// The link this snapshot was taken from.
    pub link: LinkId,
    /// Delivery type of the source.
    pub source_type: SourceType,
    /// The source's ring feed, when it has one.
    pub ring: Option<Arc<RingBufferFeed>>,
    /// The source is the silence-sentinel device.
    pub silence_sentinel: bool,
    /// Shared handle to the link's bookkeeping.
    pub bookkeeping: Option<Arc<Mutex<CaptureBookkeeping>>>,
}

struct ObjectEntry {
    kind: ObjectKind,
    accepts_new_links: bool,
    ring: Option<Arc<RingBufferFeed>>,
    silence_sentinel: bool,
    /// Links where this object is the destination.
    source_links: HashSet<LinkId>,
    /// Links where this object is the source.
    dest_links: HashSet<LinkId>,
}

struct LinkEntry {
    source: ObjectId,
    dest: ObjectId,
    source_type: SourceType,
    valid: bool,
    bookkeeping: Option<Arc<Mutex<CaptureBookkeeping>>>,
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, entry: T) -> (u32, u32) {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            (index, slot.generation)
        } else {
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            ((self.slots.len() - 1) as u32, 0)
        }
    }

    fn get(&self, index: u32, generation: u32) -> Option<&T> {
        let slot = self.slots.get(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(entry)
    }
}

struct Inner {
    objects: Arena<ObjectEntry>,
    links: Arena<LinkEntry>,
}

/// The graph of audio objects and links.
///
/// Shared between device management, streams, and the mix loop; every
/// operation takes the single interior lock for a bounded time.
pub struct LinkGraph {
    inner: Mutex<Inner>,
}

impl Default for LinkGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: Arena::new(),
                links: Arena::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_object(
        &self,
        kind: ObjectKind,
        ring: Option<Arc<RingBufferFeed>>,
        silence_sentinel: bool,
    ) -> ObjectId {
        let mut inner = self.lock();
        let (index, generation) = inner.objects.insert(ObjectEntry {
            kind,
            accepts_new_links: true,
            ring,
            silence_sentinel,
            source_links: HashSet::new(),
            dest_links: HashSet::new(),
        });
        ObjectId { index, generation }
    }

    /// Adds a hardware input device backed by a driver ring feed.
    pub fn add_input(&self, ring: Arc<RingBufferFeed>) -> ObjectId {
        self.add_object(ObjectKind::Input, Some(ring), false)
    }

    /// Adds a hardware output device; with a ring feed it can serve as a
    /// loopback capture source.
    pub fn add_output(&self, ring: Option<Arc<RingBufferFeed>>) -> ObjectId {
        self.add_object(ObjectKind::Output, ring, false)
    }

    /// Adds the silence-sentinel output that paces renderers with no real
    /// device. It must never feed a capture.
    pub fn add_silence_output(&self) -> ObjectId {
        self.add_object(ObjectKind::Output, None, true)
    }

    /// Adds a renderer (packet source).
    pub fn add_renderer(&self) -> ObjectId {
        self.add_object(ObjectKind::Renderer, None, false)
    }

    /// Adds a capturer (sink).
    pub fn add_capturer(&self) -> ObjectId {
        self.add_object(ObjectKind::Capturer, None, false)
    }

    /// Kind of an object, if it still exists.
    pub fn object_kind(&self, object: ObjectId) -> Option<ObjectKind> {
        self.lock()
            .objects
            .get(object.index, object.generation)
            .map(|entry| entry.kind)
    }

    fn roles_compatible(source: ObjectKind, dest: ObjectKind) -> bool {
        match (source, dest) {
            // Renderers feed outputs, and may link to capturers as packet
            // sources (skipped by the capture mix).
            (ObjectKind::Renderer, ObjectKind::Output | ObjectKind::Capturer) => true,
            // Hardware feeds capturers only; outputs never source other
            // outputs and inputs never source further sinks.
            (ObjectKind::Input | ObjectKind::Output, ObjectKind::Capturer) => true,
            _ => false,
        }
    }

    /// Links `source` to `dest`.
    ///
    /// Validates role compatibility, runs `init` to let the endpoints veto
    /// or parameterize the link, then inserts it into both endpoints' link
    /// sets — but only if both still accept new links, re-checked after
    /// `init` to close the race with concurrent teardown. On race loss the
    /// link is discarded even though initialization succeeded.
    ///
    /// Returns `None` when no route is available; callers treat this as a
    /// normal outcome, not an error.
    pub fn link_objects(
        &self,
        source: ObjectId,
        dest: ObjectId,
        init: impl FnOnce(&LinkCandidate) -> LinkInit,
    ) -> Option<LinkId> {
        let candidate = {
            let inner = self.lock();
            let source_entry = inner.objects.get(source.index, source.generation)?;
            let dest_entry = inner.objects.get(dest.index, dest.generation)?;
            if !Self::roles_compatible(source_entry.kind, dest_entry.kind) {
                tracing::debug!(
                    source = ?source_entry.kind,
                    dest = ?dest_entry.kind,
                    "rejecting incompatible link roles"
                );
                return None;
            }
            if !source_entry.accepts_new_links || !dest_entry.accepts_new_links {
                return None;
            }
            LinkCandidate {
                source_kind: source_entry.kind,
                dest_kind: dest_entry.kind,
                source_type: if source_entry.kind == ObjectKind::Renderer {
                    SourceType::Packet
                } else {
                    SourceType::RingBuffer
                },
                source_stream_type: source_entry.ring.as_ref().map(|r| r.stream_type()),
            }
        };

        // Initialization runs without the lock; either endpoint may veto.
        let bookkeeping = match init(&candidate) {
            LinkInit::Reject => return None,
            LinkInit::Accept => None,
            LinkInit::AcceptWithBookkeeping(bk) => Some(Arc::new(Mutex::new(bk))),
        };

        let mut inner = self.lock();
        // Re-check: teardown may have frozen either endpoint while init ran.
        let still_open = |entry: Option<&ObjectEntry>| {
            entry.map(|e| e.accepts_new_links).unwrap_or(false)
        };
        if !still_open(inner.objects.get(source.index, source.generation))
            || !still_open(inner.objects.get(dest.index, dest.generation))
        {
            tracing::debug!("link lost race with teardown; discarding");
            return None;
        }

        let (index, generation) = inner.links.insert(LinkEntry {
            source,
            dest,
            source_type: candidate.source_type,
            valid: true,
            bookkeeping,
        });
        let link = LinkId { index, generation };
        if let Some(entry) = inner.objects.get_mut(source.index, source.generation) {
            entry.dest_links.insert(link);
        }
        if let Some(entry) = inner.objects.get_mut(dest.index, dest.generation) {
            entry.source_links.insert(link);
        }
        Some(link)
    }

    /// Removes a link: marks it invalid, then detaches it from the source
    /// and destination sets independently. Idempotent — each side may
    /// already be gone.
    pub fn remove_link(&self, link: LinkId) {
        let mut inner = self.lock();
        let Some(entry) = inner.links.get_mut(link.index, link.generation) else {
            return;
        };
        entry.valid = false;
        let (source, dest) = (entry.source, entry.dest);
        if let Some(object) = inner.objects.get_mut(source.index, source.generation) {
            object.dest_links.remove(&link);
        }
        if let Some(object) = inner.objects.get_mut(dest.index, dest.generation) {
            object.source_links.remove(&link);
        }
        inner.links.remove(link.index, link.generation);
    }

    /// Detaches every link feeding `object`.
    ///
    /// The set is swapped out under the lock and each link removed in a
    /// separate acquisition, so a simultaneous unlink from the far endpoint
    /// cannot deadlock.
    pub fn unlink_sources(&self, object: ObjectId) {
        let links: Vec<LinkId> = {
            let mut inner = self.lock();
            match inner.objects.get_mut(object.index, object.generation) {
                Some(entry) => std::mem::take(&mut entry.source_links).into_iter().collect(),
                None => return,
            }
        };
        for link in links {
            self.remove_link(link);
        }
    }

    /// Detaches every link this object feeds.
    pub fn unlink_destinations(&self, object: ObjectId) {
        let links: Vec<LinkId> = {
            let mut inner = self.lock();
            match inner.objects.get_mut(object.index, object.generation) {
                Some(entry) => std::mem::take(&mut entry.dest_links).into_iter().collect(),
                None => return,
            }
        };
        for link in links {
            self.remove_link(link);
        }
    }

    /// Freezes the object against new links, then detaches everything on
    /// both sides.
    pub fn unlink(&self, object: ObjectId) {
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.objects.get_mut(object.index, object.generation) {
                entry.accepts_new_links = false;
            } else {
                return;
            }
        }
        self.unlink_sources(object);
        self.unlink_destinations(object);
    }

    /// Removes an object from the arena. Call only after [`unlink`]
    /// (both link sets must be empty).
    ///
    /// [`unlink`]: Self::unlink
    pub fn remove_object(&self, object: ObjectId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.objects.get(object.index, object.generation) {
            debug_assert!(entry.source_links.is_empty() && entry.dest_links.is_empty());
        }
        inner.objects.remove(object.index, object.generation);
    }

    /// Number of links currently feeding `object` (0 when gone).
    pub fn source_link_count(&self, object: ObjectId) -> usize {
        self.lock()
            .objects
            .get(object.index, object.generation)
            .map(|entry| entry.source_links.len())
            .unwrap_or(0)
    }

    /// Snapshots a capturer's source links for one mix cycle.
    pub fn capture_sources(&self, capturer: ObjectId) -> Vec<CaptureSourceSnapshot> {
        let inner = self.lock();
        let Some(entry) = inner.objects.get(capturer.index, capturer.generation) else {
            return Vec::new();
        };
        let mut snapshots = Vec::with_capacity(entry.source_links.len());
        for &link in &entry.source_links {
            let Some(link_entry) = inner.links.get(link.index, link.generation) else {
                continue;
            };
            if !link_entry.valid {
                continue;
            }
            let source = link_entry.source;
            let (ring, silence_sentinel) =
                match inner.objects.get(source.index, source.generation) {
                    Some(object) => (object.ring.clone(), object.silence_sentinel),
                    None => (None, false),
                };
            snapshots.push(CaptureSourceSnapshot {
                link,
                source_type: link_entry.source_type,
                ring,
                silence_sentinel,
                bookkeeping: link_entry.bookkeeping.clone(),
            });
        }
        snapshots
    }
}
