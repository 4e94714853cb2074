//! Open device handles

use nvmedev_backends::AnyResources;
use nvmedev_core::{BackendAttr, Specifier};
use std::cell::Cell;
use std::marker::PhantomData;
use tracing::warn;

/// Lifecycle of a handle. A handle only exists after a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closed,
}

/// An opened device, bound to the backend that opened it.
///
/// Dropping an open handle releases its resources and logs a warning; call
/// [`Context::close`](crate::Context::close) to observe release failures.
#[derive(Debug)]
pub struct DeviceHandle {
    index: usize,
    attr: BackendAttr,
    spec: Specifier,
    resources: Option<AnyResources>,
    _not_sync: PhantomData<Cell<()>>,
}

impl DeviceHandle {
    pub(crate) fn new(index: usize, attr: BackendAttr, spec: Specifier, resources: AnyResources) -> Self {
        Self {
            index,
            attr,
            spec,
            resources: Some(resources),
            _not_sync: PhantomData,
        }
    }

    /// Attributes of the backend that opened this handle, as of open time
    pub fn backend(&self) -> &BackendAttr {
        &self.attr
    }

    pub fn specifier(&self) -> &Specifier {
        &self.spec
    }

    pub fn state(&self) -> HandleState {
        if self.resources.is_some() {
            HandleState::Open
        } else {
            HandleState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Open
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn resources(&self) -> Option<&AnyResources> {
        self.resources.as_ref()
    }

    pub(crate) fn take_resources(&mut self) -> Option<AnyResources> {
        self.resources.take()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Some(resources) = self.resources.take() {
            warn!(
                backend = %self.attr.name(),
                specifier = %self.spec,
                "Device handle dropped while open, releasing"
            );
            drop(resources);
        }
    }
}
