use chaincore::{ConnectionError, ServerConfig, Workflow};
use std::collections::HashMap;

/// Registry of known tool servers, keyed by server id
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: HashMap<String, ServerConfig>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the servers a workflow declares inline.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut registry = Self::new();
        for server in &workflow.servers {
            registry.register(server.clone());
        }
        registry
    }

    /// Register a server, replacing any previous entry with the same id
    pub fn register(&mut self, server: ServerConfig) {
        tracing::info!("Registering tool server: {}", server.id);
        self.servers.insert(server.id.clone(), server);
    }

    pub fn get(&self, server_id: &str) -> Option<&ServerConfig> {
        self.servers.get(server_id)
    }

    pub fn resolve(&self, server_id: &str) -> Result<&ServerConfig, ConnectionError> {
        self.get(server_id)
            .ok_or_else(|| ConnectionError::UnknownServer(server_id.to_string()))
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers.contains_key(server_id)
    }

    /// Registered server ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Overlay `other` on top of this registry. Entries in `other` win.
    pub fn merge(&self, other: &ServerRegistry) -> ServerRegistry {
        let mut merged = self.clone();
        merged
            .servers
            .extend(other.servers.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overlays_other_registry() {
        let mut base = ServerRegistry::new();
        base.register(ServerConfig::http("search", "http://localhost:1"));
        base.register(ServerConfig::local("math"));

        let mut workflow = Workflow::new("merge");
        workflow.add_server(ServerConfig::http("search", "http://localhost:2"));
        let merged = base.merge(&ServerRegistry::from_workflow(&workflow));

        assert_eq!(merged.list(), vec!["math".to_string(), "search".to_string()]);
        assert_eq!(
            merged.get("search"),
            Some(&ServerConfig::http("search", "http://localhost:2"))
        );
        assert!(matches!(
            merged.resolve("missing"),
            Err(ConnectionError::UnknownServer(_))
        ));
    }
}
