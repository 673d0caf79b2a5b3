//! Leader-only arbitration: skill-bin matchmaking, unique name allocation
//! and cleanup after an instance restarts.
//!
//! The bin table is plain in-memory state owned by the coordinator and only
//! consulted while its engine is leader. Name allocation and recovery talk to
//! the shared registry and are run off the coordinator loop so a slow
//! registry never delays heartbeats.

use crate::error::{ArbiterError, RegistryError};
use crate::registry::Registry;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use shared::{MatchPreferences, RelayMessage};

/// A player waiting in a skill bin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingSlot {
    pub player: String,
    pub allow_lower: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched {
        requester: String,
        opponent: String,
        bin: usize,
    },
    /// No opponent; the requester now waits in `bin`.
    Waiting { bin: usize },
}

/// Highest acceptable occupied bin for a request, scanning downwards.
///
/// The floor is the requester's own level unless it accepts lower-level
/// opponents. An occupant qualifies if it is someone else and either accepts
/// lower-level opponents itself or sits at or below the requester's level.
pub fn find_opponent(
    bins: &[Option<WaitingSlot>],
    requester: &str,
    level: usize,
    allow_lower: bool,
) -> Option<usize> {
    let floor = if allow_lower { 0 } else { level };
    (floor..bins.len()).rev().find(|&bin| match &bins[bin] {
        Some(slot) => slot.player != requester && (slot.allow_lower || bin <= level),
        None => false,
    })
}

/// Skill-bin matchmaking table.
#[derive(Debug, Clone)]
pub struct Arbiter {
    bins: Vec<Option<WaitingSlot>>,
}

impl Arbiter {
    pub fn new(levels: usize) -> Self {
        Self {
            bins: vec![None; levels.max(1)],
        }
    }

    pub fn clamp_level(&self, level: i64) -> usize {
        level.clamp(0, self.bins.len() as i64 - 1) as usize
    }

    pub fn waiting(&self, bin: usize) -> Option<&WaitingSlot> {
        self.bins.get(bin).and_then(Option::as_ref)
    }

    pub fn waiting_count(&self) -> usize {
        self.bins.iter().flatten().count()
    }

    pub fn request_match(
        &mut self,
        requester: &str,
        preferences: MatchPreferences,
    ) -> MatchOutcome {
        let level = self.clamp_level(preferences.level);

        if let Some(bin) = find_opponent(&self.bins, requester, level, preferences.allow_lower) {
            let opponent = self.bins[bin]
                .take()
                .map(|slot| slot.player)
                .unwrap_or_default();
            self.scrub(requester);
            info!("Matched {} with {} from bin {}", requester, opponent, bin);
            return MatchOutcome::Matched {
                requester: requester.to_string(),
                opponent,
                bin,
            };
        }

        // Any other occupant of the requester's own bin would have matched,
        // so this only ever overwrites an empty slot.
        self.scrub(requester);
        self.bins[level] = Some(WaitingSlot {
            player: requester.to_string(),
            allow_lower: preferences.allow_lower,
        });
        MatchOutcome::Waiting { bin: level }
    }

    /// Removes a player from every bin. Returns true if they were waiting.
    pub fn scrub(&mut self, player: &str) -> bool {
        let mut found = false;
        for bin in self.bins.iter_mut() {
            if bin.as_ref().map_or(false, |slot| slot.player == player) {
                *bin = None;
                found = true;
            }
        }
        found
    }

    pub fn clear(&mut self) {
        self.bins.iter_mut().for_each(|bin| *bin = None);
    }
}

const ADJECTIVES: &[&str] = &[
    "Amber", "Brave", "Calm", "Clever", "Daring", "Eager", "Fuzzy", "Gentle", "Happy", "Jolly",
    "Lively", "Lucky", "Mighty", "Nimble", "Plucky", "Quick", "Quiet", "Swift", "Witty", "Zesty",
];

const ANIMALS: &[&str] = &[
    "Badger", "Falcon", "Ferret", "Heron", "Koala", "Lynx", "Marten", "Otter", "Owl", "Panda",
    "Puffin", "Raven", "Seal", "Tiger", "Walrus", "Wombat", "Yak", "Zebra",
];

/// Human-readable display name such as `NimbleOtter42`.
pub fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Owl");
    format!("{}{}{}", adjective, animal, rng.gen_range(10..100))
}

async fn name_in_use<R>(
    registry: &R,
    requesting_instance: &str,
    name: &str,
) -> Result<bool, RegistryError>
where
    R: Registry + ?Sized,
{
    let mut instances = registry.instances().await?;
    if !instances.iter().any(|id| id == requesting_instance) {
        instances.push(requesting_instance.to_string());
    }
    for instance in instances {
        if registry.clients(&instance).await?.contains_key(name) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Finds a display name unused by any live instance and records it under
/// `instance_id`.
///
/// Collisions and registry failures each consume one attempt. The check and
/// the write are not atomic, so two leaders racing during a split vote can in
/// rare cases hand out the same name.
pub async fn allocate_name<R, G>(
    registry: &R,
    instance_id: &str,
    attempts: usize,
    mut generate: G,
) -> Result<String, ArbiterError>
where
    R: Registry + ?Sized,
    G: FnMut() -> String,
{
    for attempt in 1..=attempts {
        let candidate = generate();
        match name_in_use(registry, instance_id, &candidate).await {
            Ok(false) => match registry.set_client(instance_id, &candidate, None).await {
                Ok(()) => return Ok(candidate),
                Err(e) => warn!(
                    "Failed to record name {} ({}/{}): {}",
                    candidate, attempt, attempts, e
                ),
            },
            Ok(true) => debug!("Name {} taken ({}/{})", candidate, attempt, attempts),
            Err(e) => warn!(
                "Name check for {} failed ({}/{}): {}",
                candidate, attempt, attempts, e
            ),
        }
    }
    Err(ArbiterError::NamesExhausted { attempts })
}

/// Disconnect notices for every client a restarted instance had registered,
/// ordered by client name.
pub async fn recovery_notices<R>(
    registry: &R,
    instance_id: &str,
) -> Result<Vec<RelayMessage>, ArbiterError>
where
    R: Registry + ?Sized,
{
    let mut clients: Vec<(String, Option<String>)> =
        registry.clients(instance_id).await?.into_iter().collect();
    clients.sort();
    Ok(clients
        .into_iter()
        .map(|(source, opponent)| RelayMessage::DisconnectNotice { source, opponent })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientMap, InMemoryRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prefs(level: i64, allow_lower: bool) -> MatchPreferences {
        MatchPreferences { level, allow_lower }
    }

    fn matched(requester: &str, opponent: &str, bin: usize) -> MatchOutcome {
        MatchOutcome::Matched {
            requester: requester.to_string(),
            opponent: opponent.to_string(),
            bin,
        }
    }

    #[test]
    fn test_empty_bins_place_requester() {
        let mut arbiter = Arbiter::new(3);
        let outcome = arbiter.request_match("X", prefs(1, false));
        assert_eq!(outcome, MatchOutcome::Waiting { bin: 1 });
        assert_eq!(arbiter.waiting(1).map(|s| s.player.as_str()), Some("X"));
    }

    #[test]
    fn test_higher_occupant_allowing_lower_matches() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("Y", prefs(2, true));

        let outcome = arbiter.request_match("X", prefs(0, false));
        assert_eq!(outcome, matched("X", "Y", 2));
        assert!(arbiter.waiting(2).is_none());
        assert_eq!(arbiter.waiting_count(), 0);
    }

    #[test]
    fn test_lower_occupant_below_floor_is_skipped() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("Y", prefs(0, false));

        let outcome = arbiter.request_match("X", prefs(2, false));
        assert_eq!(outcome, MatchOutcome::Waiting { bin: 2 });
        assert_eq!(arbiter.waiting(0).map(|s| s.player.as_str()), Some("Y"));
    }

    #[test]
    fn test_allow_lower_reaches_lower_bins() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("Y", prefs(0, false));

        let outcome = arbiter.request_match("X", prefs(2, true));
        assert_eq!(outcome, matched("X", "Y", 0));
    }

    #[test]
    fn test_higher_occupant_refusing_lower_is_skipped() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("Y", prefs(2, false));

        let outcome = arbiter.request_match("X", prefs(0, true));
        assert_eq!(outcome, MatchOutcome::Waiting { bin: 0 });
    }

    #[test]
    fn test_scan_prefers_highest_bin() {
        let mut arbiter = Arbiter::new(5);
        arbiter.request_match("A", prefs(1, true));
        arbiter.request_match("B", prefs(3, true));

        let outcome = arbiter.request_match("X", prefs(0, true));
        assert_eq!(outcome, matched("X", "B", 3));
        assert!(arbiter.waiting(1).is_some());
    }

    #[test]
    fn test_same_level_matches() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("Y", prefs(1, false));
        let outcome = arbiter.request_match("X", prefs(1, false));
        assert_eq!(outcome, matched("X", "Y", 1));
    }

    #[test]
    fn test_requester_never_matches_itself() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("X", prefs(1, true));
        let outcome = arbiter.request_match("X", prefs(1, true));
        assert_eq!(outcome, MatchOutcome::Waiting { bin: 1 });
        assert_eq!(arbiter.waiting_count(), 1);
    }

    #[test]
    fn test_rerequest_moves_waiting_player() {
        let mut arbiter = Arbiter::new(4);
        arbiter.request_match("X", prefs(1, false));
        arbiter.request_match("X", prefs(3, false));
        assert!(arbiter.waiting(1).is_none());
        assert_eq!(arbiter.waiting(3).map(|s| s.player.as_str()), Some("X"));
    }

    #[test]
    fn test_occupant_of_own_bin_always_matches() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("High", prefs(2, false));
        arbiter.request_match("Mid", prefs(1, false));

        let outcome = arbiter.request_match("X", prefs(1, false));
        assert_eq!(outcome, matched("X", "Mid", 1));
        assert_eq!(arbiter.waiting(2).map(|s| s.player.as_str()), Some("High"));
    }

    #[test]
    fn test_level_is_clamped() {
        let mut arbiter = Arbiter::new(3);
        assert_eq!(arbiter.clamp_level(-4), 0);
        assert_eq!(arbiter.clamp_level(99), 2);

        let outcome = arbiter.request_match("X", prefs(99, false));
        assert_eq!(outcome, MatchOutcome::Waiting { bin: 2 });
    }

    #[test]
    fn test_scrub_and_clear() {
        let mut arbiter = Arbiter::new(3);
        arbiter.request_match("X", prefs(0, false));
        arbiter.request_match("Y", prefs(2, false));

        assert!(arbiter.scrub("X"));
        assert!(!arbiter.scrub("X"));
        assert_eq!(arbiter.waiting_count(), 1);

        arbiter.clear();
        assert_eq!(arbiter.waiting_count(), 0);
        assert!(arbiter.waiting(2).is_none());
    }

    #[test]
    fn test_random_name_shape() {
        for _ in 0..50 {
            let name = random_name();
            assert!(name.chars().next().map_or(false, char::is_uppercase));
            assert!(name.chars().rev().take(2).all(|c| c.is_ascii_digit()));
        }
    }

    fn scripted(names: &[&str]) -> impl FnMut() -> String {
        let mut names: Vec<String> = names.iter().rev().map(|n| n.to_string()).collect();
        move || names.pop().unwrap_or_else(|| "Fallback".to_string())
    }

    #[tokio::test]
    async fn test_allocate_skips_names_in_any_live_registry() {
        let registry = InMemoryRegistry::new();
        registry.add_instance("i1").await.unwrap();
        registry.add_instance("i2").await.unwrap();
        registry.set_client("i2", "SwiftOwl11", None).await.unwrap();
        registry.set_client("i1", "CalmYak20", None).await.unwrap();

        let script = scripted(&["SwiftOwl11", "CalmYak20", "EagerSeal33"]);
        let name = allocate_name(&registry, "i1", 5, script).await.unwrap();

        assert_eq!(name, "EagerSeal33");
        let clients = registry.clients("i1").await.unwrap();
        assert_eq!(clients.get("EagerSeal33"), Some(&None));
    }

    #[tokio::test]
    async fn test_allocate_checks_requesting_instance_even_if_not_live() {
        let registry = InMemoryRegistry::new();
        registry.set_client("i9", "LuckyLynx50", None).await.unwrap();

        let script = scripted(&["LuckyLynx50", "QuietOwl51"]);
        let name = allocate_name(&registry, "i9", 3, script).await.unwrap();
        assert_eq!(name, "QuietOwl51");
    }

    #[tokio::test]
    async fn test_allocate_gives_up_after_budget() {
        let registry = InMemoryRegistry::new();
        registry.add_instance("i1").await.unwrap();
        registry.set_client("i1", "Taken", None).await.unwrap();

        let mut calls = 0;
        let result = allocate_name(&registry, "i1", 3, || {
            calls += 1;
            "Taken".to_string()
        })
        .await;

        assert_eq!(result, Err(ArbiterError::NamesExhausted { attempts: 3 }));
        assert_eq!(calls, 3);
        assert_eq!(registry.clients("i1").await.unwrap().len(), 1);
    }

    /// Registry whose first `failures` calls fail.
    struct FlakyRegistry {
        inner: InMemoryRegistry,
        failures: AtomicUsize,
    }

    impl FlakyRegistry {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemoryRegistry::new(),
                failures: AtomicUsize::new(failures),
            }
        }

        fn check(&self) -> Result<(), RegistryError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(RegistryError::Timeout);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Registry for FlakyRegistry {
        async fn add_instance(&self, instance_id: &str) -> Result<(), RegistryError> {
            self.check()?;
            self.inner.add_instance(instance_id).await
        }

        async fn remove_instance(&self, instance_id: &str) -> Result<(), RegistryError> {
            self.check()?;
            self.inner.remove_instance(instance_id).await
        }

        async fn instances(&self) -> Result<Vec<String>, RegistryError> {
            self.check()?;
            self.inner.instances().await
        }

        async fn clients(&self, instance_id: &str) -> Result<ClientMap, RegistryError> {
            self.check()?;
            self.inner.clients(instance_id).await
        }

        async fn set_client(
            &self,
            instance_id: &str,
            name: &str,
            opponent: Option<&str>,
        ) -> Result<(), RegistryError> {
            self.check()?;
            self.inner.set_client(instance_id, name, opponent).await
        }

        async fn remove_client(&self, instance_id: &str, name: &str) -> Result<(), RegistryError> {
            self.check()?;
            self.inner.remove_client(instance_id, name).await
        }

        async fn clear_clients(&self, instance_id: &str) -> Result<(), RegistryError> {
            self.check()?;
            self.inner.clear_clients(instance_id).await
        }
    }

    #[tokio::test]
    async fn test_registry_failure_consumes_an_attempt() {
        let registry = FlakyRegistry::new(1);
        let name = allocate_name(&registry, "i1", 2, scripted(&["FirstTry", "SecondTry"]))
            .await
            .unwrap();
        assert_eq!(name, "SecondTry");
    }

    #[tokio::test]
    async fn test_registry_down_abandons_request() {
        let registry = FlakyRegistry::new(100);
        let result = allocate_name(&registry, "i1", 4, random_name).await;
        assert_eq!(result, Err(ArbiterError::NamesExhausted { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_recovery_notices_cover_prior_clients() {
        let registry = InMemoryRegistry::new();
        registry.set_client("r", "c", None).await.unwrap();
        registry.set_client("r", "a", Some("b")).await.unwrap();
        registry.set_client("other", "z", None).await.unwrap();

        let notices = recovery_notices(&registry, "r").await.unwrap();
        assert_eq!(
            notices,
            vec![
                RelayMessage::DisconnectNotice {
                    source: "a".to_string(),
                    opponent: Some("b".to_string())
                },
                RelayMessage::DisconnectNotice {
                    source: "c".to_string(),
                    opponent: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_recovery_notices_surface_registry_errors() {
        let registry = FlakyRegistry::new(1);
        let result = recovery_notices(&registry, "r").await;
        assert_eq!(result, Err(ArbiterError::Registry(RegistryError::Timeout)));
    }
}
