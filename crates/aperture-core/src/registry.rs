//! Registered backends and the rules for which of them apply.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::backend::Backend;
use crate::settings::{BackendLink, Settings};
use crate::types::{BackendKind, ProjectClass};

/// Builds a client for a backend from its configured link.
pub type Connector = dyn Fn(BackendKind, &BackendLink) -> Arc<dyn Backend> + Send + Sync;

/// The set of backends known to the process, keyed by kind.
///
/// Backends come from two places. Registered backends are fixed for the
/// life of the registry. With a [`Connector`] installed, every other kind is
/// resolved from its current link on each lookup, so links added or changed
/// while the process runs take effect on the next orchestration. A connected
/// client is reused for as long as its link stays the same.
///
/// Iteration is always in canonical order (tracker first), which is the
/// creation order; teardown walks it in reverse.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<BackendKind, Arc<dyn Backend>>,
    connector: Option<Arc<Connector>>,
    connected: Arc<Mutex<HashMap<BackendKind, (BackendLink, Arc<dyn Backend>)>>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("registered", &self.backends.keys().collect::<Vec<_>>())
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that connects every kind from its link on demand.
    pub fn connecting<F>(connector: F) -> Self
    where
        F: Fn(BackendKind, &BackendLink) -> Arc<dyn Backend> + Send + Sync + 'static,
    {
        Self {
            connector: Some(Arc::new(connector)),
            ..Self::default()
        }
    }

    /// Register `backend`, replacing any earlier one of the same kind.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> &mut Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty() && self.connector.is_none()
    }

    fn linked(&self, settings: &Settings) -> Vec<Arc<dyn Backend>> {
        BackendKind::all()
            .iter()
            .filter_map(|&kind| match self.backends.get(&kind) {
                Some(backend) => (!kind.requires_link() || settings.is_linked(kind))
                    .then(|| Arc::clone(backend)),
                None => self.connect(kind, settings),
            })
            .collect()
    }

    fn connect(&self, kind: BackendKind, settings: &Settings) -> Option<Arc<dyn Backend>> {
        let connector = self.connector.as_ref()?;
        let link = match settings.link(kind) {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(backend = %kind, error = %e, "failed to read backend link");
                None
            }
        };
        let mut connected = match self.connected.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(link) = link else {
            if connected.remove(&kind).is_some() {
                tracing::info!(backend = %kind, "backend unlinked");
            }
            return None;
        };
        if let Some((known, backend)) = connected.get(&kind) {
            if *known == link {
                return Some(Arc::clone(backend));
            }
        }
        let backend = connector(kind, &link);
        connected.insert(kind, (link, Arc::clone(&backend)));
        Some(backend)
    }

    /// Backends to create for a project of `class`, in creation order.
    pub fn for_create(&self, class: ProjectClass, settings: &Settings) -> Vec<Arc<dyn Backend>> {
        self.linked(settings)
            .into_iter()
            .filter(|b| class.admits(b.kind()))
            .collect()
    }

    /// Every backend configured for use, regardless of project class.
    pub fn configured(&self, settings: &Settings) -> Vec<Arc<dyn Backend>> {
        self.linked(settings)
    }

    /// Configured backends in teardown order.
    pub fn for_teardown(&self, settings: &Settings) -> Vec<Arc<dyn Backend>> {
        let mut backends = self.configured(settings);
        backends.reverse();
        backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::settings::BackendLink;

    fn link(settings: &Settings, kind: BackendKind) {
        settings
            .set_link(
                kind,
                Some(BackendLink {
                    url: "memory://".into(),
                    token: None,
                }),
            )
            .unwrap();
    }

    fn full_registry() -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        // Registration order must not matter.
        for kind in BackendKind::all().iter().rev() {
            registry.register(Arc::new(MemoryBackend::new(*kind)));
        }
        registry
    }

    fn kinds(backends: &[Arc<dyn Backend>]) -> Vec<BackendKind> {
        backends.iter().map(|b| b.kind()).collect()
    }

    #[test]
    fn unlinked_optional_backends_are_skipped() {
        let settings = Settings::in_memory();
        let registry = full_registry();
        link(&settings, BackendKind::Build);
        assert_eq!(
            kinds(&registry.for_create(ProjectClass::Software, &settings)),
            vec![BackendKind::Tracker, BackendKind::Build]
        );
    }

    #[test]
    fn class_filters_software_backends() {
        let settings = Settings::in_memory();
        let registry = full_registry();
        for kind in BackendKind::all() {
            link(&settings, *kind);
        }
        assert_eq!(
            kinds(&registry.for_create(ProjectClass::NonSoftware, &settings)),
            vec![BackendKind::Tracker, BackendKind::Wiki]
        );
        assert_eq!(registry.configured(&settings).len(), 5);
    }

    #[test]
    fn teardown_is_reverse_creation_order() {
        let settings = Settings::in_memory();
        let registry = full_registry();
        link(&settings, BackendKind::Wiki);
        link(&settings, BackendKind::Review);
        assert_eq!(
            kinds(&registry.for_teardown(&settings)),
            vec![BackendKind::Review, BackendKind::Wiki, BackendKind::Tracker]
        );
    }

    #[test]
    fn connected_backends_follow_link_changes() {
        let settings = Settings::in_memory();
        link(&settings, BackendKind::Tracker);
        let registry = BackendRegistry::connecting(|kind, _link| {
            Arc::new(MemoryBackend::new(kind)) as Arc<dyn Backend>
        });
        let first = registry.configured(&settings);
        assert_eq!(kinds(&first), vec![BackendKind::Tracker]);

        link(&settings, BackendKind::Wiki);
        let second = registry.configured(&settings);
        assert_eq!(kinds(&second), vec![BackendKind::Tracker, BackendKind::Wiki]);
        assert!(Arc::ptr_eq(&first[0], &second[0]), "unchanged link reconnected");

        settings
            .set_link(
                BackendKind::Tracker,
                Some(BackendLink {
                    url: "https://tracker.example".into(),
                    token: None,
                }),
            )
            .unwrap();
        settings.set_link(BackendKind::Wiki, None).unwrap();
        let third = registry.configured(&settings);
        assert_eq!(kinds(&third), vec![BackendKind::Tracker]);
        assert!(!Arc::ptr_eq(&first[0], &third[0]), "changed link kept old client");
    }

    #[test]
    fn empty_registry_yields_nothing() {
        let settings = Settings::in_memory();
        let registry = BackendRegistry::new();
        assert!(registry.for_create(ProjectClass::Software, &settings).is_empty());
        assert!(registry.is_empty());
    }
}
