//! Local view of the clients attached to one instance.
//!
//! The bus addresses clients by display name once they have one, while the
//! transport knows them by client id. The roster joins the two and remembers
//! each client's current opponent.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalClient {
    pub client_id: String,
    pub name: Option<String>,
    pub opponent: Option<String>,
}

#[derive(Debug, Default)]
pub struct Roster {
    clients: HashMap<String, LocalClient>,
    by_name: HashMap<String, String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a client. Re-inserting an id resets it.
    pub fn insert(&mut self, client_id: &str) {
        self.remove(client_id);
        self.clients.insert(
            client_id.to_string(),
            LocalClient {
                client_id: client_id.to_string(),
                name: None,
                opponent: None,
            },
        );
    }

    pub fn remove(&mut self, client_id: &str) -> Option<LocalClient> {
        let client = self.clients.remove(client_id)?;
        if let Some(name) = &client.name {
            self.by_name.remove(name);
        }
        Some(client)
    }

    pub fn get(&self, client_id: &str) -> Option<&LocalClient> {
        self.clients.get(client_id)
    }

    /// Gives a client its display name. False if the client is unknown here.
    pub fn assign_name(&mut self, client_id: &str, name: &str) -> bool {
        let Some(client) = self.clients.get_mut(client_id) else {
            return false;
        };
        if let Some(previous) = client.name.replace(name.to_string()) {
            self.by_name.remove(&previous);
        }
        self.by_name.insert(name.to_string(), client_id.to_string());
        true
    }

    pub fn name_of(&self, client_id: &str) -> Option<&str> {
        self.clients.get(client_id)?.name.as_deref()
    }

    /// Client id of the local client with this display name.
    pub fn client_for_name(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(String::as_str)
    }

    pub fn opponent_of(&self, client_id: &str) -> Option<&str> {
        self.clients.get(client_id)?.opponent.as_deref()
    }

    /// Sets the opponent of the named local client, returning its client id.
    pub fn set_opponent(&mut self, name: &str, opponent: Option<&str>) -> Option<String> {
        let client_id = self.by_name.get(name)?;
        let client = self.clients.get_mut(client_id)?;
        client.opponent = opponent.map(str::to_string);
        Some(client.client_id.clone())
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_lookup_both_ways() {
        let mut roster = Roster::new();
        roster.insert("i1-1");
        assert!(roster.name_of("i1-1").is_none());

        assert!(roster.assign_name("i1-1", "SwiftOwl10"));
        assert_eq!(roster.name_of("i1-1"), Some("SwiftOwl10"));
        assert_eq!(roster.client_for_name("SwiftOwl10"), Some("i1-1"));
        assert!(!roster.assign_name("ghost", "Nope"));
    }

    #[test]
    fn test_rename_drops_old_name() {
        let mut roster = Roster::new();
        roster.insert("c");
        roster.assign_name("c", "Old");
        roster.assign_name("c", "New");
        assert!(roster.client_for_name("Old").is_none());
        assert_eq!(roster.client_for_name("New"), Some("c"));
    }

    #[test]
    fn test_opponent_tracking() {
        let mut roster = Roster::new();
        roster.insert("c");
        roster.assign_name("c", "A");

        assert_eq!(roster.set_opponent("A", Some("B")), Some("c".to_string()));
        assert_eq!(roster.opponent_of("c"), Some("B"));
        assert_eq!(roster.set_opponent("Z", Some("B")), None);

        roster.set_opponent("A", None);
        assert!(roster.opponent_of("c").is_none());
    }

    #[test]
    fn test_remove_forgets_name() {
        let mut roster = Roster::new();
        roster.insert("c");
        roster.assign_name("c", "A");
        roster.set_opponent("A", Some("B"));

        let removed = roster.remove("c").unwrap();
        assert_eq!(removed.name.as_deref(), Some("A"));
        assert_eq!(removed.opponent.as_deref(), Some("B"));
        assert!(roster.client_for_name("A").is_none());
        assert!(roster.client_ids().is_empty());
    }
}
