//! Server-side observation registry (RFC 7641).
//!
//! Observations are owned by the registry and addressed by an opaque ID;
//! resources never hold them directly, so dropping the registry entry is
//! all the cleanup there is. The notification counter is 24 bits wide
//! and wraps; the client side applies the freshness rule.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use shrike_msg::Token;
use shrike_oscore::RequestAssociation;
use shrike_transport::RemoteEndpoint;

/// Send a confirmable notification at least this often, so dead
/// observers are garbage-collected by the retransmission failure path.
const CON_NOTIFY_INTERVAL: Duration = Duration::from_secs(128);

/// Every how many notifications one is confirmable regardless of time.
const CON_NOTIFY_EVERY: u32 = 20;

/// Opaque observation identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObservationId(u64);

/// One registered observer.
#[derive(Debug, Clone)]
pub(crate) struct Observation {
    pub(crate) remote: RemoteEndpoint,
    pub(crate) token: Token,
    pub(crate) path: Vec<String>,
    /// Next Observe value to send (24-bit, wrapping)
    seq: u32,
    notifications_sent: u32,
    last_con: Instant,
    /// OSCORE association of the registering request, when protected
    pub(crate) security: Option<RequestAssociation>,
}

/// What a notification send should look like.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct NotificationPlan {
    pub(crate) observe_value: u32,
    pub(crate) confirmable: bool,
}

struct RegistryState {
    next_id: u64,
    by_id: HashMap<u64, Observation>,
    by_key: HashMap<(RemoteEndpoint, Token), u64>,
    /// Message ID of each observation's latest notification, so an RST
    /// to one can be traced back to its registration.
    by_mid: HashMap<(RemoteEndpoint, u16), u64>,
}

/// The registry.
pub(crate) struct ObservationRegistry {
    state: Mutex<RegistryState>,
}

impl ObservationRegistry {
    pub(crate) fn new() -> Self {
        ObservationRegistry {
            state: Mutex::new(RegistryState {
                next_id: 1,
                by_id: HashMap::new(),
                by_key: HashMap::new(),
                by_mid: HashMap::new(),
            }),
        }
    }

    /// Register (or re-register) an observer. The same (remote, token)
    /// replaces its previous registration. Returns the id and the
    /// Observe value for the registration response.
    pub(crate) fn register(
        &self,
        remote: RemoteEndpoint,
        token: Token,
        path: Vec<String>,
        security: Option<RequestAssociation>,
    ) -> (ObservationId, u32) {
        let mut state = self.state.lock().expect("observation registry lock");
        let key = (remote.clone(), token);
        if let Some(old) = state.by_key.remove(&key) {
            state.by_id.remove(&old);
        }

        let id = state.next_id;
        state.next_id += 1;
        let observation = Observation {
            remote,
            token,
            path,
            seq: 0,
            notifications_sent: 0,
            last_con: Instant::now(),
            security,
        };
        state.by_id.insert(id, observation);
        state.by_key.insert(key, id);
        (ObservationId(id), 0)
    }

    /// Drop the observation of (remote, token), if any. Used for
    /// Observe=1 deregistrations and RSTs to notifications.
    pub(crate) fn deregister(
        &self,
        remote: &RemoteEndpoint,
        token: &Token,
    ) -> Option<ObservationId> {
        let mut state = self.state.lock().expect("observation registry lock");
        let id = state.by_key.remove(&(remote.clone(), *token))?;
        state.by_id.remove(&id);
        state.by_mid.retain(|_, observation| *observation != id);
        Some(ObservationId(id))
    }

    /// Drop by id (notification failure path).
    pub(crate) fn deregister_id(&self, id: ObservationId) -> Option<Observation> {
        let mut state = self.state.lock().expect("observation registry lock");
        let observation = state.by_id.remove(&id.0)?;
        state
            .by_key
            .remove(&(observation.remote.clone(), observation.token));
        state.by_mid.retain(|_, entry| *entry != id.0);
        Some(observation)
    }

    /// Everything registered on exactly `path`; used to fan out
    /// notifications and to terminate on resource removal.
    pub(crate) fn on_path(&self, path: &[String]) -> Vec<(ObservationId, Observation)> {
        let state = self.state.lock().expect("observation registry lock");
        state
            .by_id
            .iter()
            .filter(|(_, obs)| obs.path == path)
            .map(|(&id, obs)| (ObservationId(id), obs.clone()))
            .collect()
    }

    /// Advance the counter for a notification to `id` and decide whether
    /// it travels confirmably.
    pub(crate) fn plan_notification(&self, id: ObservationId) -> Option<NotificationPlan> {
        let mut state = self.state.lock().expect("observation registry lock");
        let observation = state.by_id.get_mut(&id.0)?;

        observation.seq = (observation.seq + 1) & 0x00FF_FFFF;
        observation.notifications_sent += 1;
        let confirmable = observation.notifications_sent % CON_NOTIFY_EVERY == 0
            || observation.last_con.elapsed() >= CON_NOTIFY_INTERVAL;
        if confirmable {
            observation.last_con = Instant::now();
        }

        Some(NotificationPlan {
            observe_value: observation.seq,
            confirmable,
        })
    }

    /// Remember the message ID the latest notification to `id` used.
    pub(crate) fn note_notification_mid(&self, id: ObservationId, remote: &RemoteEndpoint, mid: u16) {
        let mut state = self.state.lock().expect("observation registry lock");
        state.by_mid.retain(|_, observation| *observation != id.0);
        state.by_mid.insert((remote.clone(), mid), id.0);
    }

    /// An RST answering a notification cancels its observation.
    pub(crate) fn deregister_by_mid(
        &self,
        remote: &RemoteEndpoint,
        mid: u16,
    ) -> Option<ObservationId> {
        let mut state = self.state.lock().expect("observation registry lock");
        let id = state.by_mid.remove(&(remote.clone(), mid))?;
        let observation = state.by_id.remove(&id)?;
        state
            .by_key
            .remove(&(observation.remote.clone(), observation.token));
        Some(ObservationId(id))
    }

    /// Number of live observations.
    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .expect("observation registry lock")
            .by_id
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteEndpoint {
        RemoteEndpoint::from_socket_addr("udp", "192.0.2.7:5683".parse().unwrap())
    }

    fn token(b: u8) -> Token {
        Token::new(&[b]).unwrap()
    }

    fn path() -> Vec<String> {
        vec!["sensor".to_string()]
    }

    #[test]
    fn test_register_and_fan_out() {
        let registry = ObservationRegistry::new();
        registry.register(remote(), token(1), path(), None);
        registry.register(remote(), token(2), path(), None);
        registry.register(remote(), token(3), vec!["other".into()], None);

        assert_eq!(registry.on_path(&path()).len(), 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = ObservationRegistry::new();
        let (first, _) = registry.register(remote(), token(1), path(), None);
        let (second, _) = registry.register(remote(), token(1), path(), None);

        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
        assert!(registry.deregister_id(first).is_none());
        assert!(registry.deregister_id(second).is_some());
    }

    #[test]
    fn test_deregister_by_key() {
        let registry = ObservationRegistry::new();
        registry.register(remote(), token(1), path(), None);
        assert!(registry.deregister(&remote(), &token(1)).is_some());
        assert!(registry.deregister(&remote(), &token(1)).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_notification_counter_increments() {
        let registry = ObservationRegistry::new();
        let (id, initial) = registry.register(remote(), token(1), path(), None);
        assert_eq!(initial, 0);

        let first = registry.plan_notification(id).unwrap();
        let second = registry.plan_notification(id).unwrap();
        assert_eq!(first.observe_value, 1);
        assert_eq!(second.observe_value, 2);
    }

    #[test]
    fn test_every_twentieth_is_confirmable() {
        let registry = ObservationRegistry::new();
        let (id, _) = registry.register(remote(), token(1), path(), None);

        let mut con_positions = Vec::new();
        for i in 1..=40u32 {
            let plan = registry.plan_notification(id).unwrap();
            if plan.confirmable {
                con_positions.push(i);
            }
        }
        assert_eq!(con_positions, vec![20, 40]);
    }

    #[test]
    fn test_counter_wraps_at_24_bits() {
        let registry = ObservationRegistry::new();
        let (id, _) = registry.register(remote(), token(1), path(), None);
        {
            let mut state = registry.state.lock().unwrap();
            state.by_id.get_mut(&1).unwrap().seq = 0x00FF_FFFF;
        }
        let plan = registry.plan_notification(id).unwrap();
        assert_eq!(plan.observe_value, 0);
    }

    #[test]
    fn test_plan_for_unknown_id() {
        let registry = ObservationRegistry::new();
        assert!(registry.plan_notification(ObservationId(99)).is_none());
    }

    #[test]
    fn test_rst_cancels_by_mid() {
        let registry = ObservationRegistry::new();
        let (id, _) = registry.register(remote(), token(1), path(), None);
        registry.note_notification_mid(id, &remote(), 0x1234);

        assert_eq!(registry.deregister_by_mid(&remote(), 0x1234), Some(id));
        assert_eq!(registry.len(), 0);
        // second RST finds nothing
        assert!(registry.deregister_by_mid(&remote(), 0x1234).is_none());
    }
}
