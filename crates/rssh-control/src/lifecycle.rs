//! Agent lifecycle states and the per-agent handles of running lifecycles

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Where an agent is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Authenticating,
    SlotAllocated,
    TunnelActive,
    Closing,
    Released,
}

impl AgentState {
    /// Whether `next` may follow `self`; any live state may fall through to `Closing`
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Authenticating, SlotAllocated)
                | (SlotAllocated, TunnelActive)
                | (Authenticating | SlotAllocated | TunnelActive, Closing)
                | (Closing, Released)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Authenticating => "authenticating",
            AgentState::SlotAllocated => "slot-allocated",
            AgentState::TunnelActive => "tunnel-active",
            AgentState::Closing => "closing",
            AgentState::Released => "released",
        };
        f.write_str(name)
    }
}

static NEXT_LIFECYCLE_ID: AtomicU64 = AtomicU64::new(1);

/// Control over one running agent lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    id: u64,
    cancel: CancellationToken,
    state: watch::Receiver<AgentState>,
}

impl LifecycleHandle {
    /// New handle plus the sender the lifecycle reports its state through
    pub fn new(cancel: CancellationToken) -> (Self, watch::Sender<AgentState>) {
        let (tx, rx) = watch::channel(AgentState::Authenticating);
        let handle = Self {
            id: NEXT_LIFECYCLE_ID.fetch_add(1, Ordering::Relaxed),
            cancel,
            state: rx,
        };
        (handle, tx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the lifecycle reached `Released` (or its task is gone)
    pub async fn released(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == AgentState::Released).await;
    }
}

/// Running lifecycles by agent ID
pub struct LifecycleTracker {
    lifecycles: Mutex<HashMap<String, LifecycleHandle>>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self {
            lifecycles: Mutex::new(HashMap::new()),
        }
    }

    /// Track `handle` for `agent_id`, returning the lifecycle it replaces
    pub fn register(&self, agent_id: &str, handle: LifecycleHandle) -> Option<LifecycleHandle> {
        match self.lifecycles.lock() {
            Ok(mut lifecycles) => lifecycles.insert(agent_id.to_string(), handle),
            Err(_) => None,
        }
    }

    /// Stop tracking `agent_id` if it is still tracked under lifecycle `id`
    pub fn unregister(&self, agent_id: &str, id: u64) {
        if let Ok(mut lifecycles) = self.lifecycles.lock() {
            if lifecycles.get(agent_id).map(|h| h.id) == Some(id) {
                lifecycles.remove(agent_id);
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<LifecycleHandle> {
        self.lifecycles
            .lock()
            .ok()
            .and_then(|lifecycles| lifecycles.get(agent_id).cloned())
    }

    /// Tracked agents and their states, sorted by agent ID
    pub fn snapshot(&self) -> Vec<(String, AgentState)> {
        let mut agents: Vec<(String, AgentState)> = match self.lifecycles.lock() {
            Ok(lifecycles) => lifecycles
                .iter()
                .map(|(agent_id, handle)| (agent_id.clone(), handle.state()))
                .collect(),
            Err(_) => Vec::new(),
        };
        agents.sort_by(|a, b| a.0.cmp(&b.0));
        agents
    }

    pub fn handles(&self) -> Vec<LifecycleHandle> {
        match self.lifecycles.lock() {
            Ok(lifecycles) => lifecycles.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lifecycles.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use AgentState::*;
        assert!(Authenticating.can_transition_to(SlotAllocated));
        assert!(SlotAllocated.can_transition_to(TunnelActive));
        assert!(TunnelActive.can_transition_to(Closing));
        assert!(Authenticating.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Released));

        assert!(!Authenticating.can_transition_to(TunnelActive));
        assert!(!Released.can_transition_to(Closing));
        assert!(!TunnelActive.can_transition_to(Released));
    }

    #[test]
    fn test_register_replaces() {
        let tracker = LifecycleTracker::new();
        let (first, _tx1) = LifecycleHandle::new(CancellationToken::new());
        let (second, _tx2) = LifecycleHandle::new(CancellationToken::new());
        let first_id = first.id();

        assert!(tracker.register("foo", first).is_none());
        let replaced = tracker.register("foo", second.clone()).unwrap();
        assert_eq!(replaced.id(), first_id);

        // A stale lifecycle must not untrack its replacement
        tracker.unregister("foo", first_id);
        assert_eq!(tracker.len(), 1);

        tracker.unregister("foo", second.id());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_released_waits_for_state() {
        let (handle, tx) = LifecycleHandle::new(CancellationToken::new());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.released().await })
        };

        tx.send_replace(AgentState::Closing);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send_replace(AgentState::Released);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_released_when_lifecycle_dropped() {
        let (handle, tx) = LifecycleHandle::new(CancellationToken::new());
        drop(tx);
        handle.released().await;
    }

    #[test]
    fn test_snapshot_sorted() {
        let tracker = LifecycleTracker::new();
        let (b, tx) = LifecycleHandle::new(CancellationToken::new());
        tx.send_replace(AgentState::TunnelActive);
        tracker.register("b", b);
        let (a, _tx) = LifecycleHandle::new(CancellationToken::new());
        tracker.register("a", a);

        assert_eq!(
            tracker.snapshot(),
            vec![
                ("a".to_string(), AgentState::Authenticating),
                ("b".to_string(), AgentState::TunnelActive)
            ]
        );
    }
}
