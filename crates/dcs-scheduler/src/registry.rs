//! Server registry (§4.1): the list of configured DICOM peers, addressable
//! by name or index, with proxy-chain lookup.
//!
//! Uses an `IndexMap` rather than a `HashMap` for the same reason the
//! message-routing layer this crate is descended from groups messages by
//! group id in one: insertion order must be preserved so `nth(i)` and
//! iteration order are stable and predictable in tests.

use dcs_common::Server;
use indexmap::IndexMap;

/// Holds the configured Server set. No duplicate-name check is enforced —
/// callers must not add duplicates; `by_name` returns the first match in
/// insertion order if they do (see SPEC_FULL.md §9's open-question decision).
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: IndexMap<String, Server>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self { servers: IndexMap::new() }
    }

    pub fn add(&mut self, server: Server) {
        self.servers.insert(server.connection_name.clone(), server);
    }

    pub fn remove_by_name(&mut self, name: &str) -> Option<Server> {
        self.servers.shift_remove(name)
    }

    pub fn remove_nth(&mut self, index: usize) -> Option<Server> {
        if index >= self.servers.len() {
            return None;
        }
        self.servers.shift_remove_index(index).map(|(_, v)| v)
    }

    pub fn remove_all(&mut self) {
        self.servers.clear();
    }

    pub fn nth(&self, index: usize) -> Option<&Server> {
        self.servers.get_index(index).map(|(_, v)| v)
    }

    /// Looks up by name at the top level; if not found, consults each
    /// top-level server's proxy by the proxy's own `connection_name`.
    pub fn by_name(&self, name: &str) -> Option<&Server> {
        if let Some(server) = self.servers.get(name) {
            return Some(server);
        }
        self.servers
            .values()
            .find_map(|s| s.proxy.as_deref().filter(|p| p.connection_name == name))
    }

    pub fn count(&self) -> usize {
        self.servers.len()
    }

    pub fn count_query_retrieve_enabled(&self) -> usize {
        self.servers.values().filter(|s| s.query_retrieve_enabled).count()
    }

    pub fn count_storage_enabled(&self) -> usize {
        self.servers.values().filter(|s| s.storage_enabled).count()
    }

    /// Every server with `query_retrieve_enabled`, in registration order —
    /// the scheduler fans a query/retrieve entry point out to one Job per
    /// server in this set.
    pub fn query_retrieve_enabled_servers(&self) -> Vec<Server> {
        self.servers
            .values()
            .filter(|s| s.query_retrieve_enabled)
            .cloned()
            .collect()
    }

    pub fn name_at_index(&self, index: usize) -> Option<&str> {
        self.servers.get_index(index).map(|(k, _)| k.as_str())
    }

    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.servers.get_index_of(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> Server {
        Server::new(name)
    }

    #[test]
    fn nth_out_of_range_returns_none_not_error() {
        let registry = ServerRegistry::new();
        assert!(registry.nth(0).is_none());
    }

    #[test]
    fn by_name_finds_top_level_and_proxy() {
        let mut registry = ServerRegistry::new();
        let mut primary = server("primary");
        primary.proxy = Some(Box::new(server("proxy1")));
        registry.add(primary);

        assert!(registry.by_name("primary").is_some());
        assert!(registry.by_name("proxy1").is_some());
        assert!(registry.by_name("missing").is_none());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut registry = ServerRegistry::new();
        registry.add(server("b"));
        registry.add(server("a"));
        assert_eq!(registry.name_at_index(0), Some("b"));
        assert_eq!(registry.name_at_index(1), Some("a"));
    }

    #[test]
    fn query_retrieve_enabled_servers_filters_disabled() {
        let mut registry = ServerRegistry::new();
        let mut disabled = server("disabled");
        disabled.query_retrieve_enabled = false;
        registry.add(disabled);
        registry.add(server("enabled"));

        let enabled = registry.query_retrieve_enabled_servers();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].connection_name, "enabled");
    }
}
