//! Routing hub
//!
//! Owns the routing registry and runs the routing step for every record a
//! transport subscription yields.

pub mod admission;
pub mod dispatch;
pub mod registry;

use std::sync::Arc;

use crate::directory::Directory;
use crate::store::MessageStore;

pub use admission::{Admission, BoundedBuffer};
pub use dispatch::RouteReport;
pub use registry::{Forward, Registry, Removal};

pub struct Hub {
    registry: Registry,
    directory: Arc<dyn Directory>,
    store: Arc<dyn MessageStore>,
    echo_to_sender: bool,
}

impl Hub {
    pub fn new(
        registry: Registry,
        directory: Arc<dyn Directory>,
        store: Arc<dyn MessageStore>,
        echo_to_sender: bool,
    ) -> Self {
        Self {
            registry,
            directory,
            store,
            echo_to_sender,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }
}
