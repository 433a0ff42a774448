use crate::check::Check;
use crate::target::DeliveryTarget;
use std::collections::HashMap;
use std::sync::Arc;

/// Holds the process' delivery targets and check modules by name.
///
/// Built once during startup, sealed, then shared read-only. Duplicate
/// names and post-seal registration are programmer errors and panic.
#[derive(Default)]
pub struct Registry {
    targets: HashMap<String, Arc<dyn DeliveryTarget>>,
    checks: HashMap<String, Arc<dyn Check>>,
    sealed: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_target(&mut self, target: Arc<dyn DeliveryTarget>) {
        assert!(
            !self.sealed,
            "register_target: registry is sealed, registration is init-time only"
        );
        let name = target.name().to_string();
        if self.targets.insert(name.clone(), target).is_some() {
            panic!("register_target: target {name:?} is already registered");
        }
    }

    pub fn register_check(&mut self, check: Arc<dyn Check>) {
        assert!(
            !self.sealed,
            "register_check: registry is sealed, registration is init-time only"
        );
        let name = check.name().to_string();
        if self.checks.insert(name.clone(), check).is_some() {
            panic!("register_check: check {name:?} is already registered");
        }
    }

    /// End the registration phase. Typically followed by wrapping the
    /// registry in an `Arc` and handing it to the components.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn target(&self, name: &str) -> Option<Arc<dyn DeliveryTarget>> {
        self.targets.get(name).cloned()
    }

    pub fn check(&self, name: &str) -> Option<Arc<dyn Check>> {
        self.checks.get(name).cloned()
    }
}
