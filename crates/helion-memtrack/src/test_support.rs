//! Shared fakes for unit tests: a content-identified info, a tracked object
//! with hook counters, a counting factory, and a recording protection
//! capability.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::access::AccessFlags;
use crate::object::{
    TrackedObject, TrackedObjectFactory, TrackedObjectHandle, TrackedObjectInfo,
};
use crate::range::MemoryRange;
use crate::tracker::MemoryProtection;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TestInfo {
    pub range: MemoryRange,
    pub tag: u32,
}

impl TestInfo {
    pub fn new(begin: u64, end: u64, tag: u32) -> Arc<Self> {
        Arc::new(Self {
            range: MemoryRange::new(begin, end),
            tag,
        })
    }
}

impl TrackedObjectInfo for TestInfo {
    fn range(&self) -> MemoryRange {
        self.range
    }

    fn identity_hash(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn identity_equals(&self, other: &dyn TrackedObjectInfo) -> bool {
        other
            .as_any()
            .downcast_ref::<TestInfo>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hook counters, held separately from the object so they stay observable
/// after the object dies.
#[derive(Default)]
pub(crate) struct HookCounters {
    init: Cell<u32>,
    remove: Cell<u32>,
    unprotect: Cell<u32>,
}

impl HookCounters {
    pub fn init_count(&self) -> u32 {
        self.init.get()
    }

    pub fn remove_count(&self) -> u32 {
        self.remove.get()
    }

    pub fn unprotect_count(&self) -> u32 {
        self.unprotect.get()
    }
}

pub(crate) struct TestObject {
    info: Arc<TestInfo>,
    requires: Cell<AccessFlags>,
    counters: Rc<HookCounters>,
}

impl TestObject {
    pub fn build(begin: u64, end: u64, requires: AccessFlags) -> Arc<Self> {
        Self::from_info(TestInfo::new(begin, end, 0), requires)
    }

    pub fn from_info(info: Arc<TestInfo>, requires: AccessFlags) -> Arc<Self> {
        Arc::new(Self {
            info,
            requires: Cell::new(requires),
            counters: Rc::new(HookCounters::default()),
        })
    }

    pub fn as_dyn(self: &Arc<Self>) -> TrackedObjectHandle {
        Arc::clone(self) as TrackedObjectHandle
    }

    pub fn set_requires(&self, flags: AccessFlags) {
        self.requires.set(flags);
    }

    pub fn counters(&self) -> Rc<HookCounters> {
        self.counters.clone()
    }

    pub fn init_count(&self) -> u32 {
        self.counters.init_count()
    }

    pub fn remove_count(&self) -> u32 {
        self.counters.remove_count()
    }

    pub fn unprotect_count(&self) -> u32 {
        self.counters.unprotect_count()
    }
}

impl TrackedObject for TestObject {
    fn info(&self) -> &dyn TrackedObjectInfo {
        self.info.as_ref()
    }

    fn requires_protection(&self) -> AccessFlags {
        self.requires.get()
    }

    fn on_init(&self) {
        self.counters.init.set(self.counters.init.get() + 1);
    }

    fn on_remove(&self) {
        self.counters.remove.set(self.counters.remove.get() + 1);
    }

    fn on_unprotect(&self) {
        self.counters.unprotect.set(self.counters.unprotect.get() + 1);
    }
}

/// Factory counting its builds. It keeps only the counters of what it built,
/// never a strong object reference, so weak-cache eviction stays observable.
pub(crate) struct TestFactory {
    requires: AccessFlags,
    built: RefCell<Vec<Rc<HookCounters>>>,
}

impl TestFactory {
    pub fn with_requires(requires: AccessFlags) -> Self {
        Self {
            requires,
            built: RefCell::new(Vec::new()),
        }
    }

    pub fn built_count(&self) -> usize {
        self.built.borrow().len()
    }

    pub fn counters(&self, index: usize) -> Rc<HookCounters> {
        self.built.borrow()[index].clone()
    }
}

impl TrackedObjectFactory for Rc<TestFactory> {
    fn build(&self, info: Arc<dyn TrackedObjectInfo>) -> TrackedObjectHandle {
        let info = info
            .as_any()
            .downcast_ref::<TestInfo>()
            .expect("test factory fed a foreign info")
            .clone();
        let object = TestObject::from_info(Arc::new(info), self.requires);
        self.built.borrow_mut().push(object.counters());
        object
    }
}

/// Protection capability that records every call; clones share the log.
#[derive(Default, Clone)]
pub(crate) struct RecordingProtection {
    calls: Rc<RefCell<Vec<(MemoryRange, AccessFlags)>>>,
}

impl RecordingProtection {
    pub fn calls(&self) -> Vec<(MemoryRange, AccessFlags)> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl MemoryProtection for RecordingProtection {
    fn set_memory_access(&mut self, range: MemoryRange, access: AccessFlags) {
        self.calls.borrow_mut().push((range, access));
    }
}
