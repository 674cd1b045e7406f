//! Connection manager opening the serial link to a bonded peer with bounded retries

use super::dispatch::{Dispatcher, InlineDispatcher};
use super::listener::ConnectionListener;
use super::slot::{LinkHandle, LinkSlot};
use crate::peer::{BondedPeer, PeerDirectory};
use crate::permission::PermissionGate;
use crate::transport::Transport;
use safeway_shared::state_machine::{
    ConnectionState, ConnectionStateMachine, LinkEvent, TransitionResult,
};
use safeway_shared::{LinkError, RetryPolicy, ServiceId};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// State shared between a [`ConnectSession`] and its worker
struct SessionShared {
    generation: u64,
    /// Cleared on cancellation, never set again
    active: AtomicBool,
    wake: Notify,
    fsm: Mutex<ConnectionStateMachine>,
    slot: LinkSlot,
}

impl SessionShared {
    fn new(generation: u64, max_retries: u32, slot: LinkSlot) -> Self {
        Self {
            generation,
            active: AtomicBool::new(true),
            wake: Notify::new(),
            fsm: Mutex::new(ConnectionStateMachine::new(max_retries)),
            slot,
        }
    }

    fn fsm(&self) -> MutexGuard<'_, ConnectionStateMachine> {
        self.fsm.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn transition(&self, event: LinkEvent) -> TransitionResult {
        let result = self.fsm().process_event(event);
        if let TransitionResult::Invalid { from, event } = &result {
            debug!("[LINK] Flow {}: ignored {:?} in {:?}", self.generation, event, from);
        }
        result
    }

    /// Install the link and mark the flow connected, unless it was cancelled
    fn publish(&self, handle: LinkHandle) -> bool {
        let mut fsm = self.fsm();
        if fsm.state() != ConnectionState::Connecting {
            return false;
        }
        if !self.slot.install(handle) {
            // A newer flow owns the slot now
            fsm.process_event(LinkEvent::Cancelled);
            self.active.store(false, Ordering::SeqCst);
            return false;
        }
        fsm.process_event(LinkEvent::Connected);
        true
    }

    fn cancel(&self) -> bool {
        let mut fsm = self.fsm();
        if fsm.state().is_terminal() {
            return false;
        }
        fsm.process_event(LinkEvent::Cancelled);
        self.active.store(false, Ordering::SeqCst);
        drop(fsm);

        self.slot.retire(self.generation);
        self.wake.notify_waiters();
        true
    }

    /// Sleep for the retry delay; false if the flow was cancelled meanwhile
    async fn wait_retry(&self, delay: Duration) -> bool {
        // notify_waiters only wakes waiters registered before the flag check
        let cancelled = self.wake.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if !self.is_active() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled => {}
        }
        self.is_active()
    }
}

/// Posts listener callbacks through the dispatcher while the flow is live
#[derive(Clone)]
struct Notifier {
    dispatcher: Arc<dyn Dispatcher>,
    listener: Arc<dyn ConnectionListener>,
    shared: Arc<SessionShared>,
}

impl Notifier {
    fn emit<F>(&self, callback: F)
    where
        F: FnOnce(&dyn ConnectionListener) + Send + 'static,
    {
        // Cancellation silences everything that follows it
        if !self.shared.is_active() {
            return;
        }
        let listener = self.listener.clone();
        self.dispatcher
            .dispatch(Box::new(move || callback(listener.as_ref())));
    }
}

/// Handle to one connection flow started by [`ConnectionManager::begin`]
pub struct ConnectSession {
    shared: Arc<SessionShared>,
    task: JoinHandle<Result<LinkHandle, LinkError>>,
}

/// Cancels a flow without owning its [`ConnectSession`]
#[derive(Clone)]
pub struct SessionCanceller {
    shared: Arc<SessionShared>,
}

impl SessionCanceller {
    /// Stop the flow. Nothing is reported to the listener after this returns
    /// and a link opened by an in-flight attempt is discarded.
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.cancel();
        if cancelled {
            info!("[LINK] Flow {} cancelled", self.shared.generation);
        }
        cancelled
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }
}

impl ConnectSession {
    /// See [`SessionCanceller::cancel`]
    pub fn cancel(&self) -> bool {
        self.canceller().cancel()
    }

    /// Detached handle for cancelling while the outcome is awaited
    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            shared: self.shared.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.fsm().state()
    }

    /// Failed transport attempts so far
    pub fn retry_count(&self) -> u32 {
        self.shared.fsm().retry_count()
    }

    /// Slot generation this flow publishes into
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// Wait for the flow's terminal outcome
    pub async fn finished(self) -> Result<LinkHandle, LinkError> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[LINK] Connection worker aborted: {}", e);
                Err(LinkError::Cancelled)
            }
        }
    }
}

/// Establishes the link to a named bonded peer
pub struct ConnectionManager<T: Transport> {
    policy: RetryPolicy,
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<T>,
    gate: Arc<dyn PermissionGate>,
    dispatcher: Arc<dyn Dispatcher>,
    slot: LinkSlot,
    /// Most recently started flow
    current: Mutex<Weak<SessionShared>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager that runs listener callbacks inline
    pub fn new(
        policy: RetryPolicy,
        directory: Arc<dyn PeerDirectory>,
        transport: T,
        gate: Arc<dyn PermissionGate>,
        slot: LinkSlot,
    ) -> Self {
        Self {
            policy,
            directory,
            transport: Arc::new(transport),
            gate,
            dispatcher: Arc::new(InlineDispatcher),
            slot,
            current: Mutex::new(Weak::new()),
        }
    }

    /// Route listener callbacks through `dispatcher`
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// The slot successful flows publish their link into
    pub fn slot(&self) -> &LinkSlot {
        &self.slot
    }

    /// Look `peer_name` up and, if it is bonded, start connecting to it in
    /// the background.
    ///
    /// Permission, adapter and lookup failures are reported to `listener`
    /// before this returns and no attempt is made. A flow still running from
    /// an earlier call is cancelled first.
    pub async fn begin(
        &self,
        peer_name: &str,
        service: ServiceId,
        listener: Arc<dyn ConnectionListener>,
    ) -> ConnectSession {
        let shared = self.supersede();
        let generation = shared.generation;
        let notifier = Notifier {
            dispatcher: self.dispatcher.clone(),
            listener,
            shared: shared.clone(),
        };

        shared.transition(LinkEvent::SearchStarted);
        info!("[LINK] Flow {}: searching bonded devices for '{}'", generation, peer_name);

        let task = match self.locate(peer_name, &notifier).await {
            Ok(peer) => {
                info!("[LINK] Found {} ({}), connecting", peer.name, peer.address);
                shared.transition(LinkEvent::PeerFound);
                tokio::spawn(attempt_loop(AttemptContext {
                    peer,
                    service,
                    policy: self.policy,
                    transport: self.transport.clone(),
                    gate: self.gate.clone(),
                    notifier,
                }))
            }
            Err(err) => tokio::spawn(std::future::ready(Err(err))),
        };

        ConnectSession { shared, task }
    }

    /// Cancel the previous flow, if still live, and register a new one
    fn supersede(&self) -> Arc<SessionShared> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.upgrade() {
            if previous.cancel() {
                info!("[LINK] Flow {} superseded by a new connection request", previous.generation);
            }
        }

        let shared = Arc::new(SessionShared::new(
            self.slot.next_generation(),
            self.policy.max_retries,
            self.slot.clone(),
        ));
        *current = Arc::downgrade(&shared);
        shared
    }

    /// Permission gate, adapter power and bonded-peer lookup
    async fn locate(&self, peer_name: &str, notifier: &Notifier) -> Result<BondedPeer, LinkError> {
        let shared = &notifier.shared;

        if !self.gate.has_connect_permission() {
            warn!("[LINK] Connect permission not granted");
            shared.transition(LinkEvent::PermissionDenied);
            notifier.emit(|l| l.on_permission_denied());
            return Err(LinkError::PermissionDenied);
        }

        match self.directory.adapter_enabled().await {
            Ok(true) => {}
            Ok(false) => {
                info!("[LINK] Adapter is off, enabling it");
                if let Err(e) = self.directory.enable_adapter().await {
                    warn!("[LINK] Could not enable adapter: {:#}", e);
                }
            }
            Err(e) => return Err(adapter_unavailable(notifier, e)),
        }

        let peers = match self.directory.list_bonded_peers().await {
            Ok(peers) => peers,
            Err(e) => return Err(adapter_unavailable(notifier, e)),
        };
        for peer in &peers {
            debug!("[LINK] Bonded device: {}", peer.name);
        }

        match peers.into_iter().find(|p| p.name == peer_name) {
            Some(peer) => Ok(peer),
            None => {
                warn!("[LINK] '{}' is not among the bonded devices", peer_name);
                shared.transition(LinkEvent::PeerNotFound);
                notifier.emit(|l| l.on_peer_not_found());
                Err(LinkError::PeerNotFound {
                    name: peer_name.to_string(),
                })
            }
        }
    }
}

fn adapter_unavailable(notifier: &Notifier, err: anyhow::Error) -> LinkError {
    let detail = format!("{:#}", err);
    error!("[LINK] Bluetooth adapter unavailable: {}", detail);
    notifier.shared.transition(LinkEvent::AdapterUnavailable);

    let reported = detail.clone();
    notifier.emit(move |l| l.on_adapter_unavailable(&reported));
    LinkError::AdapterUnavailable(detail)
}

struct AttemptContext<T: Transport> {
    peer: BondedPeer,
    service: ServiceId,
    policy: RetryPolicy,
    transport: Arc<T>,
    gate: Arc<dyn PermissionGate>,
    notifier: Notifier,
}

/// Worker running the attempts of one flow back to back
async fn attempt_loop<T: Transport>(ctx: AttemptContext<T>) -> Result<LinkHandle, LinkError> {
    let AttemptContext {
        peer,
        service,
        policy,
        transport,
        gate,
        notifier,
    } = ctx;
    let shared = notifier.shared.clone();
    let max_attempts = shared.fsm().max_retries();

    loop {
        let cancelled = shared.wake.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        if !shared.is_active() {
            debug!("[LINK] Flow {}: attempt abandoned", shared.generation);
            return Err(LinkError::Cancelled);
        }

        if !gate.has_connect_permission() {
            warn!("[LINK] Connect permission revoked, giving up");
            shared.transition(LinkEvent::PermissionDenied);
            notifier.emit(|l| l.on_permission_denied());
            return Err(LinkError::PermissionDenied);
        }

        let attempt = shared.fsm().retry_count() + 1;
        info!(
            "[LINK] Connecting to {} via {} ({}/{})",
            peer.name,
            transport.name(),
            attempt,
            max_attempts
        );
        notifier.emit(|l| l.on_attempt_started());

        let opened = tokio::select! {
            res = timeout(policy.connect_timeout, transport.open_stream(&peer, service)) => {
                res.unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", policy.connect_timeout),
                    ))
                })
            }
            _ = &mut cancelled => {
                debug!("[LINK] Flow {}: in-flight attempt interrupted", shared.generation);
                return Err(LinkError::Cancelled);
            }
        };

        let detail = match opened {
            Ok(stream) => {
                let handle = LinkHandle::new(peer.clone(), shared.generation, Box::new(stream));
                if !shared.publish(handle.clone()) {
                    debug!("[LINK] Flow {}: dropping link opened after cancellation", shared.generation);
                    return Err(LinkError::Cancelled);
                }

                info!(
                    "[LINK] Connected to {} after {} failed attempts",
                    peer.name,
                    shared.fsm().retry_count()
                );
                let connected = handle.clone();
                notifier.emit(move |l| l.on_connected(connected));
                return Ok(handle);
            }
            Err(e) => e.to_string(),
        };

        match shared.transition(LinkEvent::AttemptFailed) {
            TransitionResult::RetryScheduled { attempt } => {
                warn!(
                    "[LINK] Connection failed ({}/{}): {}, retrying in {:?}",
                    attempt, max_attempts, detail, policy.retry_delay
                );
                notifier.emit(move |l| l.on_attempt_failed(attempt, max_attempts, &detail));

                if !shared.wait_retry(policy.retry_delay).await {
                    return Err(LinkError::Cancelled);
                }
                shared.transition(LinkEvent::RetryElapsed);
            }
            TransitionResult::Exhausted { attempts } => {
                error!(
                    "[LINK] Connection failed ({}/{}): {}, giving up",
                    attempts, max_attempts, detail
                );
                let reported = detail.clone();
                notifier.emit(move |l| l.on_attempt_failed(attempts, max_attempts, &reported));
                notifier.emit(|l| l.on_exhausted());
                return Err(LinkError::RetriesExhausted {
                    attempts,
                    last_error: detail,
                });
            }
            // Cancelled between the open and the failure bookkeeping
            _ => return Err(LinkError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::dispatch::ChannelDispatcher;
    use crate::connection::listener::{ConnectionEvent, EventForwarder};
    use crate::connection::slot::tests::test_peer;
    use crate::peer::StaticDirectory;
    use crate::permission::PermissionFlag;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Fail,
        Succeed,
        Hang,
    }

    #[derive(Default)]
    struct Script {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<Instant>>,
        remotes: Mutex<Vec<DuplexStream>>,
    }

    /// Transport following a fixed list of outcomes
    #[derive(Clone, Default)]
    struct ScriptedTransport {
        script: Arc<Script>,
    }

    impl ScriptedTransport {
        fn new(steps: &[Step]) -> Self {
            let t = Self::default();
            t.script.steps.lock().unwrap().extend(steps.iter().copied());
            t
        }

        fn calls(&self) -> Vec<Instant> {
            self.script.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Stream = DuplexStream;

        async fn open_stream(&self, _peer: &BondedPeer, _service: ServiceId) -> io::Result<DuplexStream> {
            self.script.calls.lock().unwrap().push(Instant::now());
            let step = self.script.steps.lock().unwrap().pop_front().unwrap_or(Step::Fail);
            match step {
                Step::Fail => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")),
                Step::Succeed => {
                    let (local, remote) = tokio::io::duplex(64);
                    self.script.remotes.lock().unwrap().push(remote);
                    Ok(local)
                }
                Step::Hang => std::future::pending().await,
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct UnavailableDirectory;

    #[async_trait]
    impl PeerDirectory for UnavailableDirectory {
        async fn adapter_enabled(&self) -> anyhow::Result<bool> {
            Err(anyhow!("org.bluez not available"))
        }

        async fn enable_adapter(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn list_bonded_peers(&self) -> anyhow::Result<Vec<BondedPeer>> {
            Ok(Vec::new())
        }
    }

    fn bonded() -> Arc<StaticDirectory> {
        Arc::new(StaticDirectory::new(vec![
            BondedPeer::new("headphones", bluer::Address::any()),
            test_peer(),
        ]))
    }

    fn manager(
        transport: ScriptedTransport,
        directory: Arc<dyn PeerDirectory>,
        gate: Arc<dyn PermissionGate>,
    ) -> ConnectionManager<ScriptedTransport> {
        ConnectionManager::new(RetryPolicy::default(), directory, transport, gate, LinkSlot::new())
    }

    fn granted() -> Arc<dyn PermissionGate> {
        Arc::new(PermissionFlag::granted())
    }

    fn labels(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(match event {
                ConnectionEvent::AttemptStarted => "started".to_string(),
                ConnectionEvent::AttemptFailed {
                    attempt,
                    max_attempts,
                    ..
                } => format!("failed {}/{}", attempt, max_attempts),
                ConnectionEvent::Connected(_) => "connected".to_string(),
                ConnectionEvent::Exhausted => "exhausted".to_string(),
                ConnectionEvent::PeerNotFound => "not_found".to_string(),
                ConnectionEvent::PermissionDenied => "denied".to_string(),
                ConnectionEvent::AdapterUnavailable { .. } => "adapter".to_string(),
            });
        }
        out
    }

    fn gaps(calls: &[Instant]) -> Vec<Duration> {
        calls.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_third_attempt() {
        let transport = ScriptedTransport::new(&[Step::Fail, Step::Fail, Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        let generation = session.generation();
        let retry_count_handle = session.shared.clone();
        let handle = session.finished().await.unwrap();

        assert_eq!(retry_count_handle.fsm().retry_count(), 2);
        assert_eq!(retry_count_handle.fsm().state(), ConnectionState::Connected);
        assert_eq!(
            labels(&mut rx),
            vec!["started", "failed 1/5", "started", "failed 2/5", "started", "connected"]
        );
        assert_eq!(handle.peer().name, "raspberrypi");
        assert_eq!(handle.generation(), generation);
        assert!(mgr.slot().current().is_some_and(|h| h.same_link(&handle)));
        assert_eq!(gaps(&transport.calls()), vec![Duration::from_millis(5000); 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_five_failures() {
        let transport = ScriptedTransport::new(&[
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Succeed,
        ]);
        let mgr = manager(transport.clone(), bonded(), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        let outcome = session.finished().await;

        assert!(matches!(
            outcome,
            Err(LinkError::RetriesExhausted { attempts: 5, .. })
        ));
        // The sixth attempt, which would have succeeded, never happens
        assert_eq!(transport.calls().len(), 5);
        assert_eq!(gaps(&transport.calls()), vec![Duration::from_millis(5000); 4]);
        assert_eq!(
            labels(&mut rx),
            vec![
                "started", "failed 1/5", "started", "failed 2/5", "started", "failed 3/5",
                "started", "failed 4/5", "started", "failed 5/5", "exhausted",
            ]
        );
        assert!(!mgr.slot().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_not_found() {
        let transport = ScriptedTransport::new(&[Step::Succeed]);
        let directory = Arc::new(StaticDirectory::new(vec![BondedPeer::new(
            "headphones",
            bluer::Address::any(),
        )]));
        let mgr = manager(transport.clone(), directory, granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        // Reported before begin returns
        assert_eq!(labels(&mut rx), vec!["not_found"]);
        assert_eq!(session.state(), ConnectionState::Failed);

        assert_eq!(
            session.finished().await.unwrap_err(),
            LinkError::PeerNotFound {
                name: "raspberrypi".into()
            }
        );
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_at_start() {
        let transport = ScriptedTransport::new(&[Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), Arc::new(PermissionFlag::denied()));
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;

        assert_eq!(labels(&mut rx), vec!["denied"]);
        assert_eq!(session.finished().await.unwrap_err(), LinkError::PermissionDenied);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_revoked_between_attempts() {
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        // Granted for the entry check and the first attempt only
        let gate = move || counter.fetch_add(1, Ordering::SeqCst) < 2;

        let transport = ScriptedTransport::new(&[Step::Fail, Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), Arc::new(gate));
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        let shared = session.shared.clone();

        assert_eq!(session.finished().await.unwrap_err(), LinkError::PermissionDenied);
        assert_eq!(labels(&mut rx), vec!["started", "failed 1/5", "denied"]);
        assert_eq!(shared.fsm().retry_count(), 1);
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_attempt() {
        let transport = ScriptedTransport::new(&[Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        assert!(session.cancel());
        assert!(!session.is_active());
        assert_eq!(session.state(), ConnectionState::Cancelled);

        assert_eq!(session.finished().await.unwrap_err(), LinkError::Cancelled);
        assert!(labels(&mut rx).is_empty());
        assert!(transport.calls().is_empty());
        assert!(!mgr.slot().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_wait() {
        let transport = ScriptedTransport::new(&[Step::Fail, Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::AttemptStarted)));
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::AttemptFailed { attempt: 1, .. })
        ));
        assert_eq!(session.state(), ConnectionState::RetryWait);

        session.cancel();
        assert_eq!(session.finished().await.unwrap_err(), LinkError::Cancelled);

        assert!(labels(&mut rx).is_empty());
        assert_eq!(transport.calls().len(), 1);
        assert!(!mgr.slot().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceller_while_awaiting_outcome() {
        let transport = ScriptedTransport::new(&[Step::Hang]);
        let mgr = manager(transport.clone(), bonded(), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        let canceller = session.canceller();

        let outcome = tokio::spawn(session.finished());
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::AttemptStarted)));

        // Interrupts the hanging open instead of waiting for its timeout
        assert!(canceller.cancel());
        assert!(!canceller.is_active());
        assert_eq!(outcome.await.unwrap().unwrap_err(), LinkError::Cancelled);
        assert!(labels(&mut rx).is_empty());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_connect_is_noop() {
        let transport = ScriptedTransport::new(&[Step::Succeed]);
        let mgr = manager(transport, bonded(), granted());
        let (listener, _rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        let shared = session.shared.clone();
        let handle = session.finished().await.unwrap();

        assert!(!shared.cancel());
        assert!(mgr.slot().current().is_some_and(|h| h.same_link(&handle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_times_out_and_retries() {
        let transport = ScriptedTransport::new(&[Step::Hang, Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        session.finished().await.unwrap();

        // 12s connect timeout plus the 5s retry delay
        assert_eq!(gaps(&transport.calls()), vec![Duration::from_secs(17)]);
        assert_eq!(
            labels(&mut rx),
            vec!["started", "failed 1/5", "started", "connected"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_adapter_is_enabled() {
        let directory = Arc::new(StaticDirectory::disabled(vec![test_peer()]));
        let transport = ScriptedTransport::new(&[Step::Succeed]);
        let mgr = manager(transport, directory.clone(), granted());
        let (listener, _rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        session.finished().await.unwrap();

        assert!(directory.adapter_enabled().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_unavailable() {
        let transport = ScriptedTransport::new(&[Step::Succeed]);
        let mgr = manager(transport.clone(), Arc::new(UnavailableDirectory), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;

        assert!(matches!(
            session.finished().await,
            Err(LinkError::AdapterUnavailable(_))
        ));
        assert_eq!(labels(&mut rx), vec!["adapter"]);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_dispatcher_defers_callbacks() {
        let transport = ScriptedTransport::new(&[Step::Fail, Step::Succeed]);
        let (dispatcher, mut queue) = ChannelDispatcher::new();
        let mgr = manager(transport, bonded(), granted()).with_dispatcher(Arc::new(dispatcher));
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        session.finished().await.unwrap();

        // Outcome is known, but nothing reached the listener yet
        assert!(labels(&mut rx).is_empty());

        assert_eq!(queue.drain(), 4);
        assert_eq!(
            labels(&mut rx),
            vec!["started", "failed 1/5", "started", "connected"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_flow_cancels_retrying_flow() {
        let transport = ScriptedTransport::new(&[Step::Fail, Step::Succeed, Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), granted());

        let (first_listener, mut rx1) = EventForwarder::new();
        let first = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(first_listener))
            .await;
        assert!(matches!(rx1.recv().await, Some(ConnectionEvent::AttemptStarted)));
        assert!(matches!(
            rx1.recv().await,
            Some(ConnectionEvent::AttemptFailed { attempt: 1, .. })
        ));
        assert_eq!(first.state(), ConnectionState::RetryWait);

        let (second_listener, mut rx2) = EventForwarder::new();
        let second = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(second_listener))
            .await;
        assert!(!first.is_active());
        assert_eq!(first.state(), ConnectionState::Cancelled);
        assert!(second.generation() > first.generation());

        let handle = second.finished().await.unwrap();
        assert_eq!(first.finished().await.unwrap_err(), LinkError::Cancelled);

        // Well past every retry the first flow would have made
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.calls().len(), 2);
        assert!(labels(&mut rx1).is_empty());
        assert_eq!(labels(&mut rx2), vec!["started", "connected"]);
        assert!(mgr.slot().current().is_some_and(|h| h.same_link(&handle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_flow_interrupts_open_in_flight() {
        let transport = ScriptedTransport::new(&[Step::Hang, Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), granted());

        let (first_listener, mut rx1) = EventForwarder::new();
        let first = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(first_listener))
            .await;
        assert!(matches!(rx1.recv().await, Some(ConnectionEvent::AttemptStarted)));

        let (second_listener, _rx2) = EventForwarder::new();
        let second = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(second_listener))
            .await;

        // Ends without waiting out the connect timeout
        let started = Instant::now();
        assert_eq!(first.finished().await.unwrap_err(), LinkError::Cancelled);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(labels(&mut rx1).is_empty());

        second.finished().await.unwrap();
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_flow_keeps_connected_link() {
        let transport = ScriptedTransport::new(&[Step::Succeed, Step::Fail]);
        let mgr = manager(transport, bonded(), granted());

        let (first_listener, _rx1) = EventForwarder::new();
        let first = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(first_listener))
            .await;
        let shared = first.shared.clone();
        let handle = first.finished().await.unwrap();

        let (second_listener, _rx2) = EventForwarder::new();
        let second = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(second_listener))
            .await;

        // A finished flow is left alone; its link stays until replaced
        assert_eq!(shared.fsm().state(), ConnectionState::Connected);
        assert!(mgr.slot().current().is_some_and(|h| h.same_link(&handle)));
        second.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_races_with_retry_wait() {
        let transport = ScriptedTransport::new(&[Step::Fail, Step::Succeed]);
        let mgr = manager(transport.clone(), bonded(), granted());
        let (listener, mut rx) = EventForwarder::new();

        let session = mgr
            .begin("raspberrypi", ServiceId::SERIAL_PORT, Arc::new(listener))
            .await;
        let shared = session.shared.clone();
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::AttemptStarted)));

        // Cancelled before the waiter registers: it must still return at once
        shared.cancel();
        let started = Instant::now();
        assert!(!shared.wait_retry(Duration::from_secs(5)).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(session.finished().await.unwrap_err(), LinkError::Cancelled);
    }
}
