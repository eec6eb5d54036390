// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The contract between a rotating resource and the binding objects handed out
for it.

A [`Bindable`] answers two questions: what should the GPU bind *right now*,
and what is the compact argument-buffer representation for indirect binding.
Resolution is lazy; a deferred operation recorded before a rotation may be
encoded after it, and must see whichever backing allocation is current at
encode time.

Bindings and their owning resource have independent lifetimes. The resource
keeps a *non-owning* registry entry per binding (relation and lookup, never
ownership); the binding keeps the resource's shared state alive through its
resolver closures and deregisters itself on drop. Either side may be
destroyed first.
*/

use crate::imp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// What the GPU should bind right now.
#[derive(Clone, Debug)]
pub enum BindingRef {
    Buffer { buffer: imp::Buffer, offset: u64 },
    Texture(imp::TextureView),
}

impl BindingRef {
    pub fn buffer(&self) -> Option<&imp::Buffer> {
        match self {
            BindingRef::Buffer { buffer, .. } => Some(buffer),
            BindingRef::Texture(_) => None,
        }
    }

    pub fn texture(&self) -> Option<&imp::TextureView> {
        match self {
            BindingRef::Texture(view) => Some(view),
            BindingRef::Buffer { .. } => None,
        }
    }

    /// Identity of the underlying allocation (buffer id or view id).
    pub fn resource_id(&self) -> u64 {
        match self {
            BindingRef::Buffer { buffer, .. } => buffer.id(),
            BindingRef::Texture(view) => view.id(),
        }
    }
}

/// The compact representation written into argument buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentData {
    pub handle: u64,
}

pub trait Bindable: Send + Sync {
    /**
    Resolves the current binding. `coherent_seq` is the queue's coherent
    sequence at resolution time; implementations that track contention may
    use it, rotation-backed bindings ignore it.
    */
    fn binding(&self, coherent_seq: u64) -> BindingRef;

    fn argument_data(&self) -> ArgumentData;
}

type ResolveFn = Box<dyn Fn(u64) -> BindingRef + Send + Sync>;
type ArgumentFn = Box<dyn Fn() -> ArgumentData + Send + Sync>;
type RotateFn = Box<dyn Fn(&imp::Buffer) + Send + Sync>;

/**
A binding object for a rotating resource.

Created through `DynamicBuffer::bindable` or a shader resource view's
`bindable`; registered with the owning resource for rotation notifications
until dropped.
*/
pub struct DynamicBinding {
    id: u64,
    registry: Arc<ObserverRegistry>,
    resolve: ResolveFn,
    argument: ArgumentFn,
    on_rotate: RotateFn,
}

impl DynamicBinding {
    pub(crate) fn new(
        id: u64,
        registry: Arc<ObserverRegistry>,
        resolve: ResolveFn,
        argument: ArgumentFn,
        on_rotate: RotateFn,
    ) -> Self {
        DynamicBinding {
            id,
            registry,
            resolve,
            argument,
            on_rotate,
        }
    }

    pub(crate) fn notify(&self, buffer: &imp::Buffer) {
        (self.on_rotate)(buffer);
    }
}

impl Bindable for DynamicBinding {
    fn binding(&self, coherent_seq: u64) -> BindingRef {
        (self.resolve)(coherent_seq)
    }

    fn argument_data(&self) -> ArgumentData {
        (self.argument)()
    }
}

impl Drop for DynamicBinding {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl std::fmt::Debug for DynamicBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBinding").field("id", &self.id).finish()
    }
}

/**
The observer list a rotating resource pushes notifications through.

Set semantics: a binding is registered at most once and removed exactly once;
both are asserted rather than silently tolerated. Entries are `Weak`, so a
binding destroyed concurrently with a rotation is simply skipped.
*/
#[derive(Debug)]
pub(crate) struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<HashMap<u64, Weak<DynamicBinding>>>,
}

impl ObserverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ObserverRegistry {
            next_id: AtomicU64::new(1),
            observers: Mutex::new(HashMap::new()),
        })
    }

    /// Builds a binding and registers it, returning the shared handle.
    pub fn register(
        self: &Arc<Self>,
        make: impl FnOnce(u64, Arc<ObserverRegistry>) -> DynamicBinding,
    ) -> Arc<DynamicBinding> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let binding = Arc::new(make(id, self.clone()));
        let prior = self
            .observers
            .lock()
            .unwrap()
            .insert(id, Arc::downgrade(&binding));
        assert!(prior.is_none(), "observer {id} registered twice");
        binding
    }

    pub fn remove(&self, id: u64) {
        let removed = self.observers.lock().unwrap().remove(&id);
        assert!(removed.is_some(), "observer {id} removed twice");
    }

    /**
    Pushes a rotation notification to every live observer.

    Upgrades are collected under the lock, the callbacks run outside it, so a
    binding may be dropped (and deregister) while a notification is in
    flight without deadlocking.
    */
    pub fn notify_all(&self, buffer: &imp::Buffer) {
        let live: Vec<Arc<DynamicBinding>> = {
            let observers = self.observers.lock().unwrap();
            observers.values().filter_map(Weak::upgrade).collect()
        };
        for binding in live {
            binding.notify(buffer);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

#[cfg(all(test, not(feature = "backend_wgpu")))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_binding(
        registry: &Arc<ObserverRegistry>,
        buffer: imp::Buffer,
        notified: Arc<AtomicUsize>,
    ) -> Arc<DynamicBinding> {
        registry.register(move |id, registry| {
            let resolve_buffer = buffer.clone();
            let argument_buffer = buffer.clone();
            DynamicBinding::new(
                id,
                registry,
                Box::new(move |_seq| BindingRef::Buffer {
                    buffer: resolve_buffer.clone(),
                    offset: 0,
                }),
                Box::new(move || ArgumentData {
                    handle: argument_buffer.gpu_address(),
                }),
                Box::new(move |_buffer| {
                    notified.fetch_add(1, Ordering::Relaxed);
                }),
            )
        })
    }

    #[test]
    fn register_notify_deregister() {
        let device = imp::Device::new();
        let buffer = device
            .new_buffer(64, imp::BufferOptions::default(), "observers")
            .unwrap();
        let registry = ObserverRegistry::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let binding = test_binding(&registry, buffer.clone(), notified.clone());
        assert_eq!(registry.len(), 1);

        registry.notify_all(&buffer);
        assert_eq!(notified.load(Ordering::Relaxed), 1);

        drop(binding);
        assert_eq!(registry.len(), 0);
        registry.notify_all(&buffer);
        assert_eq!(notified.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dead_observers_are_skipped() {
        let device = imp::Device::new();
        let buffer = device
            .new_buffer(64, imp::BufferOptions::default(), "observers")
            .unwrap();
        let registry = ObserverRegistry::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let keep = test_binding(&registry, buffer.clone(), notified.clone());
        let dropped = test_binding(&registry, buffer.clone(), notified.clone());
        drop(dropped);

        registry.notify_all(&buffer);
        assert_eq!(notified.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 1);
        drop(keep);
    }

    #[test]
    fn binding_resolves_through_trait() {
        let device = imp::Device::new();
        let buffer = device
            .new_buffer(64, imp::BufferOptions::default(), "resolve")
            .unwrap();
        let registry = ObserverRegistry::new();
        let binding = test_binding(&registry, buffer.clone(), Arc::new(AtomicUsize::new(0)));
        let resolved = binding.binding(0);
        assert_eq!(resolved.resource_id(), buffer.id());
        assert_eq!(binding.argument_data().handle, buffer.gpu_address());
    }
}
