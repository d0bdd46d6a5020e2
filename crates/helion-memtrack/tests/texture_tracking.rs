//! End-to-end tracking flows through the public API, with a fake texture
//! cache standing in for the GPU side and a recording page table standing in
//! for the OS protection primitive.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

use helion_memtrack::{
    AccessFlags, CategoryId, MemoryProtection, MemoryRange, MemoryTracker, TrackedObject,
    TrackedObjectFactory, TrackedObjectHandle, TrackedObjectInfo, TrackerError,
};
use pretty_assertions::assert_eq;

const TEXTURES: CategoryId = 0;
const RENDER_TARGETS: CategoryId = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TextureInfo {
    base: u64,
    size: u64,
    format: u32,
}

impl TextureInfo {
    fn new(base: u64, size: u64, format: u32) -> Arc<Self> {
        Arc::new(Self { base, size, format })
    }
}

impl TrackedObjectInfo for TextureInfo {
    fn range(&self) -> MemoryRange {
        MemoryRange::with_len(self.base, self.size)
    }

    fn identity_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn identity_equals(&self, other: &dyn TrackedObjectInfo) -> bool {
        other
            .as_any()
            .downcast_ref::<TextureInfo>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Cached GPU copy of a guest texture. Writes by the guest must trap so the
/// copy can be re-uploaded; `on_unprotect` models flushing dirty state back
/// before raw guest access resumes.
struct GuestTexture {
    info: Arc<TextureInfo>,
    requires: AccessFlags,
    flushes: Cell<u32>,
    removed: Cell<bool>,
}

impl TrackedObject for GuestTexture {
    fn info(&self) -> &dyn TrackedObjectInfo {
        self.info.as_ref()
    }

    fn requires_protection(&self) -> AccessFlags {
        self.requires
    }

    fn on_unprotect(&self) {
        self.flushes.set(self.flushes.get() + 1);
    }

    fn on_remove(&self) {
        self.removed.set(true);
    }
}

/// Builds textures and keeps the flush counters observable after the tracker
/// lets go of the objects.
struct TextureFactory {
    requires: AccessFlags,
    built: RefCell<Vec<std::sync::Weak<GuestTexture>>>,
}

impl TextureFactory {
    fn new(requires: AccessFlags) -> Rc<Self> {
        Rc::new(Self {
            requires,
            built: RefCell::new(Vec::new()),
        })
    }

    fn built_count(&self) -> usize {
        self.built.borrow().len()
    }

    fn built(&self, index: usize) -> Arc<GuestTexture> {
        self.built.borrow()[index]
            .upgrade()
            .expect("texture was dropped")
    }
}

/// Local newtype so the foreign `TrackedObjectFactory` trait can be
/// implemented here (orphan rule forbids `impl … for Rc<TextureFactory>`).
#[derive(Clone)]
struct SharedTextureFactory(Rc<TextureFactory>);

impl TrackedObjectFactory for SharedTextureFactory {
    fn build(&self, info: Arc<dyn TrackedObjectInfo>) -> TrackedObjectHandle {
        let info = info
            .as_any()
            .downcast_ref::<TextureInfo>()
            .expect("texture factory fed a foreign info")
            .clone();
        let texture = Arc::new(GuestTexture {
            info: Arc::new(info),
            requires: self.0.requires,
            flushes: Cell::new(0),
            removed: Cell::new(false),
        });
        self.0.built.borrow_mut().push(Arc::downgrade(&texture));
        texture
    }
}

/// Stand-in for the OS page table: records every protection change.
#[derive(Default, Clone)]
struct FakePageTable {
    calls: Rc<RefCell<Vec<(MemoryRange, AccessFlags)>>>,
}

impl FakePageTable {
    fn calls(&self) -> Vec<(MemoryRange, AccessFlags)> {
        self.calls.borrow().clone()
    }
}

impl MemoryProtection for FakePageTable {
    fn set_memory_access(&mut self, range: MemoryRange, access: AccessFlags) {
        self.calls.borrow_mut().push((range, access));
    }
}

fn write_tracking_setup() -> (MemoryTracker<FakePageTable>, Rc<TextureFactory>, FakePageTable) {
    let pages = FakePageTable::default();
    let mut tracker = MemoryTracker::new(pages.clone());
    let factory = TextureFactory::new(AccessFlags::WRITE);
    tracker.register_factory(TEXTURES, Box::new(SharedTextureFactory(factory.clone())));
    (tracker, factory, pages)
}

#[test]
fn disjoint_textures_fault_independently() {
    let (mut tracker, factory, pages) = write_tracking_setup();

    let _x = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0, 0x1000, 1))
        .unwrap();
    let _y = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0x2000, 0x1000, 1))
        .unwrap();

    assert_eq!(
        tracker.top_level_ranges(),
        vec![MemoryRange::new(0, 0x1000), MemoryRange::new(0x2000, 0x3000)]
    );

    assert_eq!(tracker.protect_all(), 2);
    assert_eq!(
        pages.calls(),
        vec![
            (MemoryRange::new(0, 0x1000), !AccessFlags::WRITE),
            (MemoryRange::new(0x2000, 0x3000), !AccessFlags::WRITE),
        ]
    );

    // Guest write inside the first texture.
    assert!(tracker.handle_access_violation(0x500));
    assert_eq!(
        pages.calls().last().copied(),
        Some((MemoryRange::new(0, 0x1000), AccessFlags::ALL))
    );
    assert_eq!(factory.built(0).flushes.get(), 1);
    assert_eq!(factory.built(1).flushes.get(), 0);

    // The gap between the textures is not ours.
    assert!(!tracker.handle_access_violation(0x1500));
}

#[test]
fn overlapping_texture_grows_the_region() {
    let (mut tracker, _factory, _pages) = write_tracking_setup();

    let _x = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0, 0x1000, 1))
        .unwrap();
    let _z = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0x500, 0x1000, 2))
        .unwrap();

    assert_eq!(tracker.top_level_ranges(), vec![MemoryRange::new(0, 0x1500)]);

    // One fault anywhere in the grown span resolves both textures.
    assert!(tracker.handle_access_violation(0x1400));
    assert!(!tracker.handle_access_violation(0x1500));
}

#[test]
fn identity_cache_returns_the_live_texture() {
    let (mut tracker, factory, _pages) = write_tracking_setup();

    let first = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0x4000, 0x1000, 7))
        .unwrap();
    let second = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0x4000, 0x1000, 7))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.built_count(), 1);

    // A different format is a different identity.
    let _third = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0x4000, 0x1000, 8))
        .unwrap();
    assert_eq!(factory.built_count(), 2);
}

#[test]
fn unregistered_category_fails_fast() {
    let (mut tracker, _factory, _pages) = write_tracking_setup();

    let err = tracker
        .get_or_create(RENDER_TARGETS, TextureInfo::new(0, 0x1000, 1))
        .err()
        .unwrap();
    assert!(matches!(
        err,
        TrackerError::MissingFactory {
            category: RENDER_TARGETS
        }
    ));
}

#[test]
fn flush_and_rearm_cycle() {
    let (mut tracker, factory, pages) = write_tracking_setup();

    let _tex = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0x8000, 0x2000, 1))
        .unwrap();

    for expected_flushes in 1..=3u32 {
        assert_eq!(tracker.protect_all(), 1);
        assert!(tracker.handle_access_violation(0x8800));
        assert_eq!(factory.built(0).flushes.get(), expected_flushes);
    }

    // Arm, fault, re-arm: three protects and three unprotects in total.
    let protects = pages
        .calls()
        .iter()
        .filter(|(_, access)| *access != AccessFlags::ALL)
        .count();
    assert_eq!(protects, 3);
    assert_eq!(tracker.stats().unprotect_calls, 3);
}

#[test]
fn teardown_notifies_live_textures() {
    let (mut tracker, factory, _pages) = write_tracking_setup();

    let kept = tracker
        .get_or_create(TEXTURES, TextureInfo::new(0, 0x1000, 1))
        .unwrap();
    drop(tracker);
    assert!(factory.built(0).removed.get());
    drop(kept);
}
