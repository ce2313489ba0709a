//! Hub coordination loop
//!
//! The hub owns the set of live members. Every membership change and every
//! broadcast is an event processed one at a time by a single task, so the
//! member map needs no lock. Callers only ever hold a [`HubHandle`].

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ClientId, Member, Payload};

/// Errors returned by hub handle operations
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub is no longer running")]
    Closed,
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Events processed by the coordination loop, in arrival order
#[derive(Debug)]
pub enum HubEvent {
    /// A connection started its loops and joins the member set
    Register(Member),
    /// A connection is gone; no-op if it is not a member
    Unregister(ClientId),
    /// Deliver a payload to every current member
    Broadcast(Payload),
    /// Snapshot of current member ids
    Members(oneshot::Sender<Vec<ClientId>>),
}

/// The coordination loop and the member set it owns
pub struct Hub {
    members: HashMap<ClientId, Member>,
    events: mpsc::UnboundedReceiver<HubEvent>,
}

/// Cheap, cloneable handle for submitting events to the hub
///
/// Submissions never wait on the hub: the event queue is unbounded, so a
/// busy hub cannot stall a connection's receive loop.
#[derive(Debug, Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    /// Create a hub and the handle that feeds it
    pub fn new() -> (Self, HubHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let hub = Self {
            members: HashMap::new(),
            events: events_rx,
        };
        (hub, HubHandle { events: events_tx })
    }

    /// Create a hub and run its loop on a background task
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    /// Run the coordination loop
    ///
    /// Returns once every handle has been dropped.
    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(event) = self.events.recv().await {
            self.handle_event(event);
        }
        info!("Hub stopped with {} members", self.members.len());
    }

    fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(member) => self.register(member),
            HubEvent::Unregister(id) => self.unregister(id),
            HubEvent::Broadcast(payload) => self.broadcast(payload),
            HubEvent::Members(reply) => {
                let _ = reply.send(self.members.keys().copied().collect());
            }
        }
    }

    fn register(&mut self, member: Member) {
        let id = member.id;
        let identity = member.identity.clone();
        if self.members.insert(id, member).is_some() {
            warn!("Client {} registered twice, replacing previous entry", id);
        }
        info!(
            "Client {} ({}) joined, {} members",
            id,
            identity,
            self.members.len()
        );
    }

    /// Dropping the member drops the hub's outbox sender, which closes the
    /// outbox and lets the send loop write a close frame and exit.
    fn unregister(&mut self, id: ClientId) {
        match self.members.remove(&id) {
            Some(member) => info!(
                "Client {} ({}) left, {} members",
                id,
                member.identity,
                self.members.len()
            ),
            None => debug!("Unregister for unknown client {}, ignoring", id),
        }
    }

    fn broadcast(&mut self, payload: Payload) {
        let mut evicted = Vec::new();

        for (id, member) in &self.members {
            match member.outbox.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Outbox full for client {} ({}), evicting",
                        id, member.identity
                    );
                    evicted.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Outbox closed for client {}, evicting", id);
                    evicted.push(*id);
                }
            }
        }

        for id in evicted {
            self.unregister(id);
        }

        debug!(
            "Broadcast {} bytes to {} members",
            payload.len(),
            self.members.len()
        );
    }
}

impl HubHandle {
    fn submit(&self, event: HubEvent) -> HubResult<()> {
        self.events.send(event).map_err(|_| HubError::Closed)
    }

    /// Add a member; call exactly once per connection
    pub fn register(&self, member: Member) -> HubResult<()> {
        self.submit(HubEvent::Register(member))
    }

    /// Remove a member; safe to call more than once
    pub fn unregister(&self, id: ClientId) -> HubResult<()> {
        self.submit(HubEvent::Unregister(id))
    }

    /// Fan a payload out to every member, the sender included
    pub fn broadcast(&self, payload: Payload) -> HubResult<()> {
        self.submit(HubEvent::Broadcast(payload))
    }

    /// Ids of current members
    ///
    /// The reply reflects every event submitted before this call.
    pub async fn members(&self) -> HubResult<Vec<ClientId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(HubEvent::Members(reply_tx))?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    /// Number of current members
    pub async fn member_count(&self) -> HubResult<usize> {
        Ok(self.members().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{outbox, OutboxReceiver};
    use std::collections::HashSet;

    fn join(hub: &HubHandle, name: &str, capacity: usize) -> (ClientId, OutboxReceiver) {
        let id = ClientId::new();
        let (tx, rx) = outbox(capacity);
        hub.register(Member::new(id, name, tx)).unwrap();
        (id, rx)
    }

    fn drain(rx: &mut OutboxReceiver) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(payload);
        }
        out
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let hub = Hub::spawn();
        let mut receivers: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|name| join(&hub, name, 256).1)
            .collect();

        hub.broadcast(Payload::from("hello")).unwrap();
        assert_eq!(hub.member_count().await.unwrap(), 3);

        for rx in &mut receivers {
            assert_eq!(drain(rx), vec![Payload::from("hello")]);
        }
    }

    #[tokio::test]
    async fn test_full_outbox_is_evicted() {
        let hub = Hub::spawn();
        let (slow, _slow_rx) = join(&hub, "slow", 256);
        let (_, mut fast_a) = join(&hub, "fast-a", 512);
        let (_, mut fast_b) = join(&hub, "fast-b", 512);

        for i in 0..257 {
            hub.broadcast(Payload::from(format!("msg-{i}"))).unwrap();
        }

        let members = hub.members().await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(!members.contains(&slow));

        for rx in [&mut fast_a, &mut fast_b] {
            let got = drain(rx);
            assert_eq!(got.len(), 257);
            assert_eq!(got[256], Payload::from("msg-256"));
        }
    }

    #[tokio::test]
    async fn test_eviction_does_not_block_later_broadcasts() {
        let hub = Hub::spawn();
        let (_, _stuck_rx) = join(&hub, "stuck", 1);
        let (_, mut live) = join(&hub, "live", 64);

        for i in 0..10 {
            hub.broadcast(Payload::from(format!("{i}"))).unwrap();
        }

        let count = tokio::time::timeout(std::time::Duration::from_secs(1), hub.member_count())
            .await
            .expect("hub should not block on a full outbox")
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(drain(&mut live).len(), 10);
    }

    #[tokio::test]
    async fn test_evicted_outbox_is_closed() {
        let hub = Hub::spawn();
        let (_, mut rx) = join(&hub, "slow", 1);

        hub.broadcast(Payload::from("first")).unwrap();
        hub.broadcast(Payload::from("second")).unwrap();
        assert_eq!(hub.member_count().await.unwrap(), 0);

        // Whatever was queued is still readable, then the channel reports closed.
        assert_eq!(rx.recv().await, Some(Payload::from("first")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_double_unregister_removes_once() {
        let hub = Hub::spawn();
        let (target, mut target_rx) = join(&hub, "target", 8);
        let (_, _other_rx) = join(&hub, "other", 8);
        assert_eq!(hub.member_count().await.unwrap(), 2);

        hub.unregister(target).unwrap();
        hub.unregister(target).unwrap();

        assert_eq!(hub.member_count().await.unwrap(), 1);
        assert_eq!(target_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let hub = Hub::spawn();
        let (_, _rx) = join(&hub, "member", 8);

        hub.unregister(ClientId::new()).unwrap();
        assert_eq!(hub.member_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_outbox_is_evicted_on_broadcast() {
        let hub = Hub::spawn();
        let (gone, rx) = join(&hub, "gone", 8);
        drop(rx);

        hub.broadcast(Payload::from("ping")).unwrap();
        let members = hub.members().await.unwrap();
        assert!(!members.contains(&gone));
    }

    #[tokio::test]
    async fn test_per_member_order_is_preserved() {
        let hub = Hub::spawn();
        let (_, mut rx) = join(&hub, "reader", 256);

        for i in 0..100 {
            hub.broadcast(Payload::from(format!("{i}"))).unwrap();
        }
        hub.members().await.unwrap();

        let got: Vec<_> = drain(&mut rx);
        let expected: Vec<_> = (0..100).map(|i| Payload::from(format!("{i}"))).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_broadcast_after_unregister_skips_member() {
        let hub = Hub::spawn();
        let (left, mut left_rx) = join(&hub, "left", 8);
        let (_, mut stay_rx) = join(&hub, "stay", 8);

        hub.unregister(left).unwrap();
        hub.broadcast(Payload::from("after")).unwrap();
        hub.members().await.unwrap();

        assert_eq!(left_rx.recv().await, None);
        assert_eq!(drain(&mut stay_rx), vec![Payload::from("after")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_keeps_members_consistent() {
        let hub = Hub::spawn();
        let mut tasks = Vec::new();

        for worker in 0..16 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let mut kept = None;
                for round in 0..50 {
                    let (id, rx) = join(&hub, &format!("w{worker}-{round}"), 4);
                    hub.broadcast(Payload::from(format!("{worker}:{round}")))
                        .unwrap();
                    if round == 49 {
                        kept = Some((id, rx));
                    } else {
                        hub.unregister(id).unwrap();
                        hub.unregister(id).unwrap();
                    }
                    tokio::task::yield_now().await;
                }
                kept
            }));
        }

        let mut survivors = Vec::new();
        for task in tasks {
            survivors.push(task.await.unwrap().unwrap());
        }

        let members = hub.members().await.unwrap();
        let unique: HashSet<_> = members.iter().copied().collect();
        assert_eq!(unique.len(), members.len(), "no member may appear twice");

        // Survivors may have been evicted for a full outbox, but nothing that
        // was unregistered can come back.
        let survivor_ids: HashSet<_> = survivors.iter().map(|(id, _)| *id).collect();
        assert!(unique.is_subset(&survivor_ids));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_hub() {
        let (hub, handle) = Hub::new();
        drop(hub);

        assert!(matches!(
            handle.broadcast(Payload::from("x")),
            Err(HubError::Closed)
        ));
        assert!(matches!(handle.member_count().await, Err(HubError::Closed)));
    }
}
