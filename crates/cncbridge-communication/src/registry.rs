//! Process-wide controller registry
//!
//! One controller instance exists per open serial port. The registry is
//! an explicit dependency handed to controllers on open (never an ambient
//! global) so the core stays testable.

use crate::firmware::Controller;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Map of open port name to controller instance
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Mutex<HashMap<String, Arc<dyn Controller>>>,
}

impl ControllerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller under its port name
    ///
    /// Re-registering a port without a prior clean close is an anomaly:
    /// it is logged and the new controller supersedes the old one.
    pub fn register(&self, port: &str, controller: Arc<dyn Controller>) {
        let mut controllers = self.controllers.lock();
        if controllers.insert(port.to_string(), controller).is_some() {
            tracing::warn!("port {} re-registered without a clean close", port);
        }
    }

    /// Remove the controller registered under the port name
    pub fn unregister(&self, port: &str) -> Option<Arc<dyn Controller>> {
        self.controllers.lock().remove(port)
    }

    /// Remove the port's registration only if it still points at the
    /// given instance
    ///
    /// A superseded controller tearing itself down must not evict its
    /// replacement.
    pub fn unregister_instance(&self, port: &str, instance: &Arc<dyn Controller>) -> bool {
        let mut controllers = self.controllers.lock();
        if controllers
            .get(port)
            .is_some_and(|existing| Arc::ptr_eq(existing, instance))
        {
            controllers.remove(port);
            true
        } else {
            false
        }
    }

    /// Look up the controller for a port
    pub fn get(&self, port: &str) -> Option<Arc<dyn Controller>> {
        self.controllers.lock().get(port).cloned()
    }

    /// Names of all registered ports
    pub fn ports(&self) -> Vec<String> {
        self.controllers.lock().keys().cloned().collect()
    }

    /// Number of registered controllers
    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    /// True when no controller is registered
    pub fn is_empty(&self) -> bool {
        self.controllers.lock().is_empty()
    }
}
