//! Service discovery and the service registry.
//!
//! The registry maps service names to their supervisors. It is populated
//! exactly once, by walking the backend root for directories that carry a
//! `devwatch.yaml`, and never gains or loses entries afterwards, so lookups
//! need no lock.

use crate::config::{self, Descriptor};
use crate::error::{Error, Result};
use crate::supervisor::Supervisor;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Mapping from service name to its lifecycle supervisor.
pub struct Registry {
    services: OnceLock<HashMap<String, Arc<Supervisor>>>,
}

impl Registry {
    /// Discover services under `root`. Every directory containing a parseable
    /// `devwatch.yaml` becomes a managed service; directories whose config
    /// fails to parse are skipped with a warning. When `only` is non-empty,
    /// discovery is restricted to the named services.
    ///
    /// Must be called from within the tokio runtime (supervisors spawn their
    /// debouncer tasks at construction).
    pub fn discover(root: impl AsRef<Path>, only: &[String]) -> Result<Arc<Registry>> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "backend root '{}' is not a directory",
                root.display()
            )));
        }

        let registry = Arc::new(Registry {
            services: OnceLock::new(),
        });

        let mut services = HashMap::new();
        let mut pending = VecDeque::from([root.to_path_buf()]);
        while let Some(dir) = pending.pop_front() {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() && !config::is_noise_dir(&entry.file_name().to_string_lossy())
                    {
                        pending.push_back(path);
                    }
                }
            }

            match Descriptor::load(root, &dir) {
                Ok(Some(descriptor)) => {
                    if !only.is_empty() && !only.contains(&descriptor.name) {
                        continue;
                    }
                    tracing::debug!(service = %descriptor.name, dir = %dir.display(), "discovered");
                    let supervisor = Supervisor::new(descriptor, Arc::downgrade(&registry));
                    services.insert(supervisor.name().to_string(), supervisor);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(dir = %dir.display(), %error, "skipping unparseable service config");
                }
            }
        }

        let _ = registry.services.set(services);
        Ok(registry)
    }

    fn services(&self) -> Option<&HashMap<String, Arc<Supervisor>>> {
        self.services.get()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.services().and_then(|s| s.get(name)).cloned()
    }

    /// Resolve declared dependency names to supervisors. Unresolvable names
    /// are silently dropped: a configuration error, not a runtime fault.
    pub fn resolve(&self, names: &[String]) -> Vec<Arc<Supervisor>> {
        let Some(services) = self.services() else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|name| services.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted service names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Start every discovered service.
    pub async fn start_all(&self) {
        for name in self.names() {
            if let Some(supervisor) = self.get(&name) {
                supervisor.start().await;
            }
        }
    }

    /// Start one service by name.
    pub async fn start(&self, name: &str) -> Result<()> {
        let supervisor = self
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        supervisor.start().await;
        Ok(())
    }

    /// End every service, dependents before their dependencies, one at a
    /// time. Ordering is deterministic so shutdown is reproducible.
    pub async fn shutdown(&self) {
        for name in self.shutdown_order() {
            if let Some(supervisor) = self.get(&name) {
                tracing::info!(service = %name, "Ending...");
                supervisor.end().await;
            }
        }
    }

    /// Reverse topological order over the declared dependency edges:
    /// dependents first. Ties break lexicographically; services caught in a
    /// dependency cycle are appended at the end, sorted.
    pub fn shutdown_order(&self) -> Vec<String> {
        let Some(services) = self.services() else {
            return Vec::new();
        };

        // in-degree = number of resolvable dependencies
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, supervisor) in services {
            let degree = supervisor
                .descriptor()
                .dependencies
                .iter()
                .filter(|dep| services.contains_key(*dep))
                .count();
            in_degree.insert(name.as_str(), degree);
            for dep in &supervisor.descriptor().dependencies {
                if services.contains_key(dep) {
                    dependents.entry(dep.as_str()).or_default().push(name.as_str());
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut order = Vec::with_capacity(services.len());
        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
                let degree = in_degree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }

        // Cycles never drain; append what is left so nothing is skipped
        if order.len() < services.len() {
            let mut rest: Vec<String> = services
                .keys()
                .filter(|name| !order.contains(name))
                .cloned()
                .collect();
            rest.sort();
            order.extend(rest);
        }

        order.reverse();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_service(root: &Path, name: &str, config: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(config::CONFIG_FILE), config).unwrap();
    }

    #[tokio::test]
    async fn discovery_finds_configured_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_service(tmp.path(), "auth", "run: [sleep, \"30\"]\nstatus_port: 4001\n");
        write_service(tmp.path(), "email", "run: [sleep, \"30\"]\nstatus_port: 4002\n");
        std::fs::create_dir_all(tmp.path().join("not-a-service")).unwrap();

        let registry = Registry::discover(tmp.path(), &[]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["auth", "email"]);
        assert!(registry.get("auth").is_some());
        assert!(registry.get("not-a-service").is_none());
    }

    #[tokio::test]
    async fn discovery_honors_the_service_filter() {
        let tmp = tempfile::tempdir().unwrap();
        write_service(tmp.path(), "auth", "run: [sleep, \"30\"]\nstatus_port: 4001\n");
        write_service(tmp.path(), "email", "run: [sleep, \"30\"]\nstatus_port: 4002\n");

        let registry = Registry::discover(tmp.path(), &["auth".to_string()]).unwrap();
        assert_eq!(registry.names(), vec!["auth"]);
    }

    #[tokio::test]
    async fn unparseable_configs_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_service(tmp.path(), "good", "run: [sleep, \"30\"]\nstatus_port: 4001\n");
        write_service(tmp.path(), "bad", ": not yaml at all {{{\n");

        let registry = Registry::discover(tmp.path(), &[]).unwrap();
        assert_eq!(registry.names(), vec!["good"]);
    }

    #[tokio::test]
    async fn resolve_drops_unknown_names() {
        let tmp = tempfile::tempdir().unwrap();
        write_service(tmp.path(), "auth", "run: [sleep, \"30\"]\nstatus_port: 4001\n");

        let registry = Registry::discover(tmp.path(), &[]).unwrap();
        let resolved = registry.resolve(&["auth".to_string(), "missing".to_string()]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name(), "auth");
    }

    #[tokio::test]
    async fn shutdown_order_puts_dependents_first() {
        let tmp = tempfile::tempdir().unwrap();
        write_service(tmp.path(), "db", "run: [sleep, \"30\"]\nstatus_port: 4001\n");
        write_service(
            tmp.path(),
            "api",
            "dependencies: [db]\nrun: [sleep, \"30\"]\nstatus_port: 4002\n",
        );
        write_service(
            tmp.path(),
            "web",
            "dependencies: [api]\nrun: [sleep, \"30\"]\nstatus_port: 4003\n",
        );

        let registry = Registry::discover(tmp.path(), &[]).unwrap();
        let order = registry.shutdown_order();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("web") < pos("api"));
        assert!(pos("api") < pos("db"));
    }
}
