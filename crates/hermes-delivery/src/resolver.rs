//! Destination resolution.
//!
//! A [`RoutingTable`] is built once from configuration and never changes.
//! Resolving an event is a pure function of the event's source and
//! attributes: every matching route contributes its destinations, in route
//! order, and duplicates are dropped so each destination appears once.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, RwLock},
};

use hermes_core::{Destination, DestinationKey, Event};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Source pattern that matches every producer.
pub const ANY_SOURCE: &str = "*";

/// Errors raised while building a routing table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// Two destinations share a key.
    #[error("destination key '{key}' is defined more than once")]
    DuplicateDestination {
        /// The repeated key.
        key: String,
    },

    /// A route references a destination that is not defined.
    #[error("route {route} references unknown destination '{key}'")]
    UnknownDestination {
        /// Index of the offending route.
        route: usize,
        /// The missing key.
        key: String,
    },

    /// A route lists no destinations.
    #[error("route {route} has no destinations")]
    EmptyRoute {
        /// Index of the offending route.
        route: usize,
    },
}

/// The resolver found no destination for an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no route matches source '{source_id}'")]
pub struct NoRoute {
    /// Source of the unroutable event.
    pub source_id: String,
}

/// One routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Route {
    /// Source to match exactly. `None` or `"*"` matches any source.
    #[serde(default)]
    pub source: Option<String>,
    /// Attributes that must all be present with equal values.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Destination keys to deliver to, in order.
    pub destinations: Vec<DestinationKey>,
}

impl Route {
    /// Creates a route for a source. `"*"` matches any source.
    pub fn for_source(source: impl Into<String>) -> Self {
        Self { source: Some(source.into()), ..Self::default() }
    }

    /// Creates a route that matches every event.
    pub fn catch_all() -> Self {
        Self::default()
    }

    /// Requires an attribute value.
    pub fn when(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds a destination key.
    pub fn to(mut self, key: impl Into<DestinationKey>) -> Self {
        self.destinations.push(key.into());
        self
    }

    /// Whether this route applies to `event`.
    pub fn matches(&self, event: &Event) -> bool {
        let source_matches = match self.source.as_deref() {
            None | Some(ANY_SOURCE) => true,
            Some(source) => source == event.source(),
        };

        source_matches
            && self
                .attributes
                .iter()
                .all(|(name, value)| event.attribute(name) == Some(value.as_str()))
    }
}

/// Routing configuration as loaded from a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// All known destinations.
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Ordered routing rules.
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Immutable, validated routing table.
#[derive(Debug)]
pub struct RoutingTable {
    destinations: HashMap<DestinationKey, Destination>,
    routes: Vec<Route>,
    cache: DestinationCache,
}

impl RoutingTable {
    /// Validates a routing configuration and builds the table.
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] for duplicate destination keys, routes
    /// that name unknown destinations and routes with no destinations.
    pub fn build(config: RoutingConfig) -> Result<Self, RoutingError> {
        let mut destinations = HashMap::with_capacity(config.destinations.len());
        for destination in config.destinations {
            let key = destination.key.clone();
            if destinations.insert(key.clone(), destination).is_some() {
                return Err(RoutingError::DuplicateDestination { key: key.to_string() });
            }
        }

        for (index, route) in config.routes.iter().enumerate() {
            if route.destinations.is_empty() {
                return Err(RoutingError::EmptyRoute { route: index });
            }
            if let Some(missing) = route.destinations.iter().find(|k| !destinations.contains_key(*k))
            {
                return Err(RoutingError::UnknownDestination {
                    route: index,
                    key: missing.to_string(),
                });
            }
        }

        Ok(Self { destinations, routes: config.routes, cache: DestinationCache::default() })
    }

    /// Resolves an event to its ordered, deduplicated destinations.
    ///
    /// # Errors
    ///
    /// Returns [`NoRoute`] when no route matches.
    pub fn resolve(&self, event: &Event) -> Result<Vec<Arc<Destination>>, NoRoute> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for route in self.routes.iter().filter(|route| route.matches(event)) {
            for key in &route.destinations {
                if !seen.insert(key) {
                    continue;
                }
                if let Some(destination) = self.destination(key) {
                    resolved.push(destination);
                }
            }
        }

        if resolved.is_empty() {
            return Err(NoRoute { source_id: event.source().to_string() });
        }

        Ok(resolved)
    }

    /// Looks up a destination by key, creating its shared handle on first
    /// use.
    pub fn destination(&self, key: &DestinationKey) -> Option<Arc<Destination>> {
        let config = self.destinations.get(key)?;
        Some(self.cache.get_or_insert(key, || config.clone()))
    }

    /// Number of configured destinations.
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Number of routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// Lazily populated, process-lifetime cache of destination handles.
///
/// Read-mostly: lookups take a shared lock and only the first reference to
/// a key takes the write lock.
#[derive(Debug, Default)]
pub struct DestinationCache {
    entries: RwLock<HashMap<DestinationKey, Arc<Destination>>>,
}

impl DestinationCache {
    /// Returns the cached handle for `key`, creating it with `create` if it
    /// does not exist yet.
    pub fn get_or_insert(
        &self,
        key: &DestinationKey,
        create: impl FnOnce() -> Destination,
    ) -> Arc<Destination> {
        {
            let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(existing) = entries.get(key) {
                return existing.clone();
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.entry(key.clone()).or_insert_with(|| Arc::new(create())).clone()
    }

    /// Number of destinations created so far.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Whether no destination has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use hermes_core::TransportKind;

    use super::*;

    fn https(key: &str) -> Destination {
        Destination::new(key, TransportKind::Https, format!("https://{key}.example.com/hook"))
    }

    fn table() -> RoutingTable {
        RoutingTable::build(RoutingConfig {
            destinations: vec![
                https("ci"),
                https("audit"),
                Destination::new("mirror", TransportKind::SshGit, "git@github.com:org/api.git"),
            ],
            routes: vec![
                Route::for_source("github").when("repository", "api").to("mirror").to("ci"),
                Route::for_source("github").to("ci"),
                Route::catch_all().to("audit"),
            ],
        })
        .unwrap()
    }

    fn keys(destinations: &[Arc<Destination>]) -> Vec<&str> {
        destinations.iter().map(|d| d.key.as_str()).collect()
    }

    #[test]
    fn union_of_matching_routes_in_order() {
        let event = Event::builder("github", "k", "p").attribute("repository", "api").build();
        let resolved = table().resolve(&event).unwrap();

        assert_eq!(keys(&resolved), vec!["mirror", "ci", "audit"]);
    }

    #[test]
    fn attribute_mismatch_skips_route() {
        let event = Event::builder("github", "k", "p").attribute("repository", "web").build();
        let resolved = table().resolve(&event).unwrap();

        assert_eq!(keys(&resolved), vec!["ci", "audit"]);
    }

    #[test]
    fn no_matching_route_is_no_route() {
        let table = RoutingTable::build(RoutingConfig {
            destinations: vec![https("ci")],
            routes: vec![Route::for_source("github").to("ci")],
        })
        .unwrap();

        let event = Event::builder("gitlab", "k", "p").build();
        assert_eq!(table.resolve(&event).unwrap_err(), NoRoute { source_id: "gitlab".to_string() });
    }

    #[test]
    fn wildcard_source_matches_any() {
        let route = Route::for_source(ANY_SOURCE).to("ci");
        assert!(route.matches(&Event::builder("anything", "k", "p").build()));
    }

    #[test]
    fn destinations_are_created_once() {
        let table = table();
        let event = Event::builder("github", "k", "p").build();

        let first = table.resolve(&event).unwrap();
        let second = table.resolve(&event).unwrap();

        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(table.cache.len(), 2);
    }

    #[test]
    fn build_rejects_invalid_tables() {
        assert_eq!(
            RoutingTable::build(RoutingConfig { destinations: vec![https("ci"), https("ci")], routes: vec![] })
                .unwrap_err(),
            RoutingError::DuplicateDestination { key: "ci".to_string() }
        );
        assert_eq!(
            RoutingTable::build(RoutingConfig {
                destinations: vec![https("ci")],
                routes: vec![Route::catch_all().to("missing")],
            })
            .unwrap_err(),
            RoutingError::UnknownDestination { route: 0, key: "missing".to_string() }
        );
        assert_eq!(
            RoutingTable::build(RoutingConfig { destinations: vec![https("ci")], routes: vec![Route::catch_all()] })
                .unwrap_err(),
            RoutingError::EmptyRoute { route: 0 }
        );
    }

    #[test]
    fn config_deserializes_from_json() {
        let config: RoutingConfig = serde_json::from_value(serde_json::json!({
            "destinations": [
                { "key": "ci", "transport": "https", "address": "https://ci.example.com" }
            ],
            "routes": [
                { "source": "github", "attributes": { "event": "push" }, "destinations": ["ci"] }
            ]
        }))
        .unwrap();

        let table = RoutingTable::build(config).unwrap();
        assert_eq!(table.destination_count(), 1);
        assert_eq!(table.route_count(), 1);
    }
}
