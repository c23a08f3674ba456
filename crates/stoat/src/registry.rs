use stoat_core::{Backend, Error, Result, WeightTensor};

use crate::replica::{MultiDeviceModule, TaggingModel};

// ModuleRegistry — explicit, ordered module registration
//
// Every learnable module the orchestrator owns is registered exactly once,
// under a unique name, at construction time. Registration order is the
// canonical order for parameter enumeration (sync, reduction, optimizer,
// checkpoints); nothing is discovered at runtime and nothing re-enumerates
// per step.

/// Ordered `(name, module)` registry; duplicate names are fatal.
pub struct ModuleRegistry<B: Backend, M> {
    entries: Vec<(String, MultiDeviceModule<B, M>)>,
}

impl<B: Backend, M: TaggingModel<B>> ModuleRegistry<B, M> {
    pub fn new() -> Self {
        ModuleRegistry {
            entries: Vec::new(),
        }
    }

    /// Register a module under `name`. A second registration of the same
    /// name is a configuration error, surfaced immediately.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        module: MultiDeviceModule<B, M>,
    ) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|(n, _)| *n == name) {
            return Err(Error::DuplicateModule(name));
        }
        self.entries.push((name, module));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&MultiDeviceModule<B, M>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MultiDeviceModule<B, M>)> {
        self.entries.iter().map(|(n, m)| (n.as_str(), m))
    }

    /// Canonical-device parameters of all modules, in registration order,
    /// with checkpoint keys `module/param`.
    pub fn named_params_on_default_device(&self) -> Vec<(String, WeightTensor<B>)> {
        let mut out = Vec::new();
        for (name, module) in &self.entries {
            for param in module.params_on_default_device() {
                out.push((format!("{name}/{}", param.name()), param));
            }
        }
        out
    }
}

impl<B: Backend, M: TaggingModel<B>> Default for ModuleRegistry<B, M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // Registry behavior (including the duplicate-name error) is covered in
    // the trainer integration tests, where real modules are available.
}
