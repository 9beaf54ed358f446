//! The single writer driving both managers.
//!
//! One worker owns the [`Context`] by value and handles exactly one trigger at
//! a time: either a full synchronization when the jittered timer fires, or one
//! event from the subscriber. Nothing else holds mutable access to the
//! managers, so no locking is involved.

use std::{
    future::Future,
    time::{Duration, Instant as StdInstant},
};

use metrics::{counter, histogram};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::api::{Action, Event, Peer, PeerSource};

pub trait PeerManager {
    fn add_peer(&mut self, peer: &Peer);
    fn remove_peer(&mut self, peer: &Peer);
    /// Returns the keys of connected peers.
    fn update_peers(&mut self, peers: &[Peer]) -> Vec<String>;
}

pub trait PortforwardManager {
    fn add_portforwarding(&mut self, peer: &Peer);
    fn remove_portforwarding(&mut self, peer: &Peer);
    fn update_single_peer_portforwarding(&mut self, peer: &Peer);
    fn update_portforwarding(&mut self, peers: &[Peer]);
}

/// Handles built once at startup and owned by the worker.
pub struct Context<S, W, P> {
    pub source: S,
    pub wireguard: W,
    pub portforward: P,
}

/// Fires after `interval` plus a uniform random delay of up to `max_delay`,
/// drawn again for every tick.
#[derive(Debug)]
pub struct JitterTicker {
    interval: Duration,
    max_delay: Duration,
    next: Instant,
}

impl JitterTicker {
    pub fn new(interval: Duration, max_delay: Duration) -> Self {
        let now = Instant::now();
        let mut ticker = Self {
            interval,
            max_delay,
            next: now,
        };
        ticker.next = now + ticker.period();
        ticker
    }

    fn period(&self) -> Duration {
        let max = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        self.interval + Duration::from_millis(rand::random_range(0..=max))
    }

    /// Completes at the next deadline. Cancel safe.
    ///
    /// Deadlines missed while the worker was busy collapse into a single
    /// pending tick, which completes immediately.
    pub async fn tick(&mut self) {
        sleep_until(self.next).await;

        let now = Instant::now();
        if now.duration_since(self.next) >= self.interval {
            counter!("sync.coalesced_ticks").increment(1);
        }
        self.next = now + self.period();
    }
}

pub struct Scheduler<S, W, P> {
    ctx: Context<S, W, P>,
    ticker: JitterTicker,
    api_timeout: Duration,
    shutdown: CancellationToken,
}

fn record(name: &'static str, started: StdInstant) {
    histogram!(name).record(started.elapsed().as_secs_f64());
}

impl<S, W, P> Scheduler<S, W, P>
where
    S: PeerSource,
    W: PeerManager,
    P: PortforwardManager,
{
    pub fn new(
        ctx: Context<S, W, P>,
        ticker: JitterTicker,
        api_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            ticker,
            api_timeout,
            shutdown,
        }
    }

    /// Consumes triggers until shutdown. Work that already started runs to
    /// completion, shutdown is only observed between units of work.
    ///
    /// A due tick and a pending event are picked at random, so a steady
    /// stream of events cannot hold off synchronization.
    pub async fn run(&mut self, mut events: mpsc::Receiver<Event>) {
        let mut events_open = true;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        log::warn!("event stream closed, continuing with periodic synchronization only");
                        events_open = false;
                    }
                },

                _ = self.ticker.tick() => self.synchronize().await,
            }
        }

        log::info!("scheduler stopped");
    }

    pub fn handle_event(&mut self, event: Event) {
        let Event { action, peer } = event;
        let ctx = &mut self.ctx;

        match action {
            Action::Add => {
                let t = StdInstant::now();
                ctx.wireguard.add_peer(&peer);
                record("event.add.peer_seconds", t);

                let t = StdInstant::now();
                ctx.portforward.add_portforwarding(&peer);
                record("event.add.portforwarding_seconds", t);
            }

            Action::Remove => {
                let t = StdInstant::now();
                ctx.wireguard.remove_peer(&peer);
                record("event.remove.peer_seconds", t);

                let t = StdInstant::now();
                ctx.portforward.remove_portforwarding(&peer);
                record("event.remove.portforwarding_seconds", t);
            }

            Action::UpdatePorts => {
                let t = StdInstant::now();
                ctx.portforward.update_single_peer_portforwarding(&peer);
                record("event.update_ports.portforwarding_seconds", t);
            }

            Action::Unknown => {
                counter!("event.unknown_action").increment(1);
                log::debug!("ignoring event with unknown action for {}", peer.public_key);
                return;
            }
        }

        log::debug!("applied {action:?} event for {}", peer.public_key);
    }

    /// Awaits a control plane call, giving up on timeout or shutdown. Nothing
    /// is mutated while waiting.
    async fn call<T, E, Fut>(&self, fut: Fut) -> Option<Result<T, String>>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            res = timeout(self.api_timeout, fut) => Some(match res {
                Ok(res) => res.map_err(|err| err.to_string()),
                Err(_) => Err(format!("timed out after {:?}", self.api_timeout)),
            }),
        }
    }

    pub async fn synchronize(&mut self) {
        let started = StdInstant::now();

        let t = StdInstant::now();
        let peers = match self.call(self.ctx.source.get_peers()).await {
            Some(Ok(peers)) => peers,
            Some(Err(err)) => {
                counter!("sync.errors", "op" => "get_peers").increment(1);
                log::error!("error getting peers: {err}");
                return;
            }
            None => return,
        };
        record("sync.get_peers_seconds", t);

        let t = StdInstant::now();
        let connected = self.ctx.wireguard.update_peers(&peers);
        record("sync.update_peers_seconds", t);

        let t = StdInstant::now();
        self.ctx.portforward.update_portforwarding(&peers);
        record("sync.update_portforwarding_seconds", t);

        let t = StdInstant::now();
        match self.call(self.ctx.source.post_connections(&connected)).await {
            Some(Ok(())) => record("sync.post_connections_seconds", t),
            Some(Err(err)) => {
                counter!("sync.errors", "op" => "post_connections").increment(1);
                log::error!("error posting connections: {err}");
            }
            None => {}
        }

        record("sync.total_seconds", started);
        log::info!(
            "synchronized {} peers, {} connected",
            peers.len(),
            connected.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        rc::Rc,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use super::*;

    /// Trips when a manager is entered while another call is in progress.
    #[derive(Clone, Default)]
    struct Guard {
        busy: Arc<AtomicBool>,
        tripped: Arc<AtomicBool>,
    }

    impl Guard {
        fn enter(&self) -> GuardToken<'_> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.tripped.store(true, Ordering::SeqCst);
            }
            GuardToken(self)
        }
    }

    struct GuardToken<'a>(&'a Guard);

    impl Drop for GuardToken<'_> {
        fn drop(&mut self) {
            self.0.busy.store(false, Ordering::SeqCst);
        }
    }

    type Log = Rc<RefCell<Vec<String>>>;

    struct FakeSource {
        peers: Result<Vec<Peer>, String>,
        posted: Log,
        post_fails: bool,
        hang: bool,
        fetches: Arc<AtomicUsize>,
    }

    impl PeerSource for FakeSource {
        type Error = String;

        async fn get_peers(&self) -> Result<Vec<Peer>, Self::Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.peers.clone()
        }

        async fn post_connections(&self, keys: &[String]) -> Result<(), Self::Error> {
            if self.post_fails {
                return Err("service unavailable".into());
            }
            self.posted.borrow_mut().extend(keys.iter().cloned());
            Ok(())
        }
    }

    struct FakeWireguard {
        guard: Guard,
        calls: Log,
        connected: Vec<String>,
        /// Time each add blocks the worker for.
        work: Duration,
        /// Cancels the token once this many peers were added.
        stop_after: Option<(usize, CancellationToken)>,
        adds: usize,
    }

    impl PeerManager for FakeWireguard {
        fn add_peer(&mut self, peer: &Peer) {
            let _g = self.guard.enter();
            std::thread::sleep(self.work);
            self.calls.borrow_mut().push(format!("wg add {}", peer.public_key));

            self.adds += 1;
            if let Some((limit, shutdown)) = &self.stop_after {
                if self.adds >= *limit {
                    shutdown.cancel();
                }
            }
        }

        fn remove_peer(&mut self, peer: &Peer) {
            let _g = self.guard.enter();
            self.calls.borrow_mut().push(format!("wg remove {}", peer.public_key));
        }

        fn update_peers(&mut self, peers: &[Peer]) -> Vec<String> {
            let _g = self.guard.enter();
            self.calls.borrow_mut().push(format!("wg update {}", peers.len()));
            self.connected.clone()
        }
    }

    struct FakePortforward {
        guard: Guard,
        calls: Log,
    }

    impl PortforwardManager for FakePortforward {
        fn add_portforwarding(&mut self, peer: &Peer) {
            let _g = self.guard.enter();
            self.calls.borrow_mut().push(format!("pf add {}", peer.public_key));
        }

        fn remove_portforwarding(&mut self, peer: &Peer) {
            let _g = self.guard.enter();
            self.calls.borrow_mut().push(format!("pf remove {}", peer.public_key));
        }

        fn update_single_peer_portforwarding(&mut self, peer: &Peer) {
            let _g = self.guard.enter();
            self.calls.borrow_mut().push(format!("pf update {}", peer.public_key));
        }

        fn update_portforwarding(&mut self, peers: &[Peer]) {
            let _g = self.guard.enter();
            self.calls.borrow_mut().push(format!("pf update all {}", peers.len()));
        }
    }

    struct Harness {
        scheduler: Scheduler<FakeSource, FakeWireguard, FakePortforward>,
        calls: Log,
        posted: Log,
        guard: Guard,
        fetches: Arc<AtomicUsize>,
        shutdown: CancellationToken,
    }

    fn peer(key: &str) -> Peer {
        Peer {
            public_key: key.to_string(),
            ..Default::default()
        }
    }

    fn harness(peers: Result<Vec<Peer>, String>) -> Harness {
        let calls = Log::default();
        let posted = Log::default();
        let guard = Guard::default();
        let fetches = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let ctx = Context {
            source: FakeSource {
                peers,
                posted: posted.clone(),
                post_fails: false,
                hang: false,
                fetches: fetches.clone(),
            },
            wireguard: FakeWireguard {
                guard: guard.clone(),
                calls: calls.clone(),
                connected: vec!["a".into()],
                work: Duration::ZERO,
                stop_after: None,
                adds: 0,
            },
            portforward: FakePortforward {
                guard: guard.clone(),
                calls: calls.clone(),
            },
        };

        let scheduler = Scheduler::new(
            ctx,
            JitterTicker::new(Duration::from_secs(60), Duration::from_secs(45)),
            Duration::from_secs(30),
            shutdown.clone(),
        );

        Harness {
            scheduler,
            calls,
            posted,
            guard,
            fetches,
            shutdown,
        }
    }

    fn calls(log: &Log) -> Vec<String> {
        log.borrow().clone()
    }

    #[tokio::test]
    async fn test_synchronize_applies_and_reports() {
        let mut h = harness(Ok(vec![peer("a"), peer("b")]));

        h.scheduler.synchronize().await;

        assert_eq!(calls(&h.calls), vec!["wg update 2", "pf update all 2"]);
        assert_eq!(calls(&h.posted), vec!["a"]);
    }

    #[tokio::test]
    async fn test_synchronize_fetch_failure_mutates_nothing() {
        let mut h = harness(Err("connection refused".into()));

        h.scheduler.synchronize().await;

        assert!(calls(&h.calls).is_empty());
        assert!(calls(&h.posted).is_empty());
    }

    #[tokio::test]
    async fn test_synchronize_keeps_state_when_report_fails() {
        let mut h = harness(Ok(vec![peer("a")]));
        h.scheduler.ctx.source.post_fails = true;

        h.scheduler.synchronize().await;

        assert_eq!(calls(&h.calls), vec!["wg update 1", "pf update all 1"]);
        assert!(calls(&h.posted).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronize_gives_up_on_hung_api() {
        let mut h = harness(Ok(vec![peer("a")]));
        h.scheduler.ctx.source.hang = true;

        h.scheduler.synchronize().await;

        assert_eq!(h.fetches.load(Ordering::SeqCst), 1);
        assert!(calls(&h.calls).is_empty());
    }

    #[tokio::test]
    async fn test_event_dispatch() {
        let mut h = harness(Ok(vec![]));
        let events = [
            (Action::Add, "a"),
            (Action::Remove, "b"),
            (Action::UpdatePorts, "c"),
            (Action::Unknown, "d"),
        ];

        for (action, key) in events {
            h.scheduler.handle_event(Event {
                action,
                peer: peer(key),
            });
        }

        assert_eq!(
            calls(&h.calls),
            vec![
                "wg add a",
                "pf add a",
                "wg remove b",
                "pf remove b",
                "pf update c"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_triggers_is_serialized() {
        let mut h = harness(Ok(vec![peer("a"), peer("b")]));
        let (tx, rx) = mpsc::channel(256);

        let mut producers = Vec::new();
        for i in 0..8 {
            let tx = tx.clone();
            producers.push(tokio::spawn(async move {
                for j in 0..16 {
                    let action = match (i + j) % 3 {
                        0 => Action::Add,
                        1 => Action::Remove,
                        _ => Action::UpdatePorts,
                    };
                    let peer = peer(&format!("{i}-{j}"));
                    if tx.send(Event { action, peer }).await.is_err() {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        drop(tx);

        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            shutdown.cancel();
        });

        h.scheduler.run(rx).await;

        for producer in producers {
            producer.await.unwrap();
        }

        assert!(!h.guard.tripped.load(Ordering::SeqCst));
        let calls = calls(&h.calls);
        let applied = calls.iter().filter(|c| !c.contains("update all")).count();
        assert!(applied >= 128);
        assert!(h.fetches.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker() {
        let mut h = harness(Ok(vec![]));
        let (_tx, rx) = mpsc::channel(1);
        h.shutdown.cancel();

        h.scheduler.run(rx).await;

        assert_eq!(h.fetches.load(Ordering::SeqCst), 0);
        assert!(calls(&h.calls).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_ticker_bounds() {
        let interval = Duration::from_secs(60);
        let max_delay = Duration::from_secs(45);

        for _ in 0..32 {
            let start = Instant::now();
            let ticker = JitterTicker::new(interval, max_delay);
            let wait = ticker.next - start;
            assert!(wait >= interval);
            assert!(wait <= interval + max_delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_ticker_coalesces_missed_ticks() {
        let mut ticker = JitterTicker::new(Duration::from_secs(10), Duration::ZERO);
        ticker.tick().await;

        // Busy for more than two periods.
        tokio::time::advance(Duration::from_secs(25)).await;

        let start = Instant::now();
        ticker.tick().await;
        assert_eq!(Instant::now(), start);
        assert_eq!(ticker.next - start, Duration::from_secs(10));

        ticker.tick().await;
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_synchronize_runs_during_event_backlog() {
        const EVENTS: usize = 500;

        let mut h = harness(Ok(vec![peer("a")]));
        h.scheduler.ticker = JitterTicker::new(Duration::from_millis(50), Duration::ZERO);
        h.scheduler.ctx.wireguard.work = Duration::from_millis(2);
        h.scheduler.ctx.wireguard.stop_after = Some((EVENTS, h.shutdown.clone()));

        let (tx, rx) = mpsc::channel(EVENTS);
        for i in 0..EVENTS {
            let event = Event {
                action: Action::Add,
                peer: peer(&i.to_string()),
            };
            tx.try_send(event).unwrap();
        }

        h.scheduler.run(rx).await;

        let calls = calls(&h.calls);
        let last_add = calls.iter().rposition(|c| c.starts_with("wg add")).unwrap();
        let first_sync = calls.iter().position(|c| c.starts_with("wg update")).unwrap();
        assert!(first_sync < last_add);
    }
}
