use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use crate::{
    control::ControlLoop,
    dispatch::{WorkerPool, WorkerPoolConfiguration},
    handle::{NativePtr, ResourceKind},
    host::HostRef,
    native::NativeLibrary,
    registry::ObjectRegistry,
};

/// A release call observed by [`MockLibrary`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NativeEvent {
    CloseDataset(NativePtr),
    ReleaseResultSet { dataset: NativePtr, layer: NativePtr },
    Destroy(ResourceKind, NativePtr),
}

/// A native library that records every release call made against it.
#[derive(Default)]
pub struct MockLibrary {
    events: Mutex<Vec<NativeEvent>>,
}

impl MockLibrary {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NativeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn closed_count(&self, dataset: NativePtr) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == NativeEvent::CloseDataset(dataset))
            .count()
    }

    fn record(&self, event: NativeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl NativeLibrary for MockLibrary {
    fn close_dataset(&self, dataset: NativePtr) {
        self.record(NativeEvent::CloseDataset(dataset));
    }

    fn release_result_set(&self, dataset: NativePtr, layer: NativePtr) {
        self.record(NativeEvent::ReleaseResultSet { dataset, layer });
    }

    fn destroy(&self, kind: ResourceKind, ptr: NativePtr) {
        self.record(NativeEvent::Destroy(kind, ptr));
    }
}

pub fn ptr(addr: usize) -> NativePtr {
    NativePtr::from_addr(addr)
}

/// Creates a bare host value, standing in for a wrapper object.
pub fn host_value() -> HostRef {
    Arc::new(()) as Arc<dyn Any + Send + Sync>
}

/// Creates a control loop over a recording library, with a worker pool of the given size, or no pool at all.
pub fn control_loop(worker_threads: Option<usize>) -> (ControlLoop, Arc<MockLibrary>) {
    let library = MockLibrary::new();
    let registry = ObjectRegistry::new(library.clone());
    let pool = worker_threads.map(|worker_threads| {
        WorkerPool::new(&WorkerPoolConfiguration::new(worker_threads).with_thread_name("test-worker")).unwrap()
    });

    (ControlLoop::new(registry, pool), library)
}
