use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicBool, Ordering},
};

use tokio::{
    sync::broadcast::error::RecvError,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{Instrument, debug, field, info, info_span, warn};
use widget_realtime::{
    ConnectionContext, ConnectionEvent, ConnectionManager, ConnectionStatus, Messenger,
    RealtimeConfig, ReconnectionScheduler, SchedulerError, SharedTokenSource, SharedTransport,
};

use widget_telemetry::with_widget_fields;

use crate::config::AdapterConfig;
use crate::identity::{IdentitySnapshot, SharedIdentityStore};
use crate::token::SharedTokenProvider;

pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collaborators injected into a [`WidgetConnection`].
#[derive(Clone)]
pub struct WidgetDeps {
    pub transport: SharedTransport,
    pub token_source: SharedTokenSource,
    pub token_provider: SharedTokenProvider,
    pub identity: SharedIdentityStore,
}

#[derive(Clone, Debug)]
pub struct WidgetOptions {
    pub workspace_id: String,
    pub enabled: bool,
    pub realtime: RealtimeConfig,
    pub adapter: AdapterConfig,
}

impl WidgetOptions {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            enabled: true,
            realtime: RealtimeConfig::default(),
            adapter: AdapterConfig::default(),
        }
    }

    pub fn from_env(workspace_id: impl Into<String>) -> Self {
        Self {
            realtime: RealtimeConfig::from_env(),
            adapter: AdapterConfig::from_env(),
            ..Self::new(workspace_id)
        }
    }
}

struct Inner {
    ctx: Arc<ConnectionContext>,
    manager: ConnectionManager,
    messenger: Messenger,
    scheduler: Arc<ReconnectionScheduler>,
    token_provider: SharedTokenProvider,
    identity: SharedIdentityStore,
    workspace_id: String,
    config: AdapterConfig,
    enabled: AtomicBool,
    mounted: AtomicBool,
    exhausted: AtomicBool,
    on_status: Mutex<Option<StatusCallback>>,
    last_status: Mutex<Option<ConnectionStatus>>,
    last_identity: Mutex<IdentitySnapshot>,
    observers: Mutex<Vec<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for handle in lock(&self.observers).drain(..) {
            handle.abort();
        }
        if let Some(handle) = lock(&self.reconnect_task).take() {
            handle.abort();
        }
    }
}

/// Lifecycle bridge between the widget shell and the realtime layer.
#[derive(Clone)]
pub struct WidgetConnection {
    inner: Arc<Inner>,
}

impl WidgetConnection {
    pub fn new(deps: WidgetDeps, options: WidgetOptions) -> Self {
        let ctx = ConnectionContext::new(options.realtime.clone());
        let manager = ConnectionManager::new(ctx.clone(), deps.transport, deps.token_source);
        let messenger = manager.messenger();
        let scheduler = Arc::new(ReconnectionScheduler::new(options.realtime.reconnect.clone()));
        Self {
            inner: Arc::new(Inner {
                ctx,
                manager,
                messenger,
                scheduler,
                token_provider: deps.token_provider,
                identity: deps.identity,
                workspace_id: options.workspace_id,
                config: options.adapter,
                enabled: AtomicBool::new(options.enabled),
                mounted: AtomicBool::new(false),
                exhausted: AtomicBool::new(false),
                on_status: Mutex::new(None),
                last_status: Mutex::new(None),
                last_identity: Mutex::new(IdentitySnapshot::default()),
                observers: Mutex::new(Vec::new()),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    pub fn with_status_callback<F>(self, callback: F) -> Self
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        *lock(&self.inner.on_status) = Some(Arc::new(callback));
        self
    }

    /// Starts observers and, when identity allows, connects. A failed first
    /// connect hands over to the reconnection scheduler.
    pub async fn mount(&self) {
        if self.inner.mounted.swap(true, Ordering::SeqCst) {
            debug!("widget connection already mounted");
            return;
        }
        let snapshot = self.inner.identity.snapshot();
        *lock(&self.inner.last_identity) = snapshot.clone();
        let mirror = tokio::spawn(mirror_status(Arc::downgrade(&self.inner)));
        let identity = tokio::spawn(watch_identity(Arc::downgrade(&self.inner)));
        lock(&self.inner.observers).extend([mirror, identity]);
        info!(workspace_id = %self.inner.workspace_id, "widget connection mounted");

        let span = info_span!(
            "widget.mount",
            workspace_id = field::Empty,
            session_id = field::Empty
        );
        with_widget_fields(&span, &self.inner.workspace_id, snapshot.session_id.as_deref());
        self.inner.ensure_connection().instrument(span).await;
    }

    /// Full teardown: observers, reconnection, subscriptions and client.
    pub async fn unmount(&self) {
        if !self.inner.mounted.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in lock(&self.inner.observers).drain(..) {
            handle.abort();
        }
        self.inner.stop_reconnect();
        self.inner.messenger.clear().await;
        self.inner.manager.cleanup().await;
        self.inner.exhausted.store(false, Ordering::SeqCst);
        self.inner.deliver_status(self.inner.status());
        info!(workspace_id = %self.inner.workspace_id, "widget connection unmounted");
    }

    pub async fn set_enabled(&self, enabled: bool) {
        if self.inner.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        if enabled {
            info!("realtime enabled");
            self.inner.ensure_connection().await;
        } else {
            info!("realtime disabled");
            self.inner.stop_reconnect();
            self.inner.manager.cleanup().await;
            self.inner.exhausted.store(false, Ordering::SeqCst);
            self.inner.deliver_status(self.inner.status());
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// Number of publishes waiting for the connection.
    pub fn pending_messages(&self) -> usize {
        self.inner.ctx.pending_count()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    pub fn messenger(&self) -> Messenger {
        self.inner.messenger.clone()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.inner.ctx
    }
}

impl Inner {
    fn status(&self) -> ConnectionStatus {
        self.effective(self.ctx.status())
    }

    fn effective(&self, status: ConnectionStatus) -> ConnectionStatus {
        if self.exhausted.load(Ordering::SeqCst) && status != ConnectionStatus::Connected {
            ConnectionStatus::Failed
        } else {
            status
        }
    }

    /// Invokes the status callback when `status` differs from the last one
    /// delivered.
    fn deliver_status(&self, status: ConnectionStatus) {
        {
            let mut last = lock(&self.last_status);
            if *last == Some(status) {
                return;
            }
            *last = Some(status);
        }
        debug!(%status, "delivering connection status");
        let callback = lock(&self.on_status).clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    async fn ensure_connection(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::SeqCst) || !self.mounted.load(Ordering::SeqCst) {
            return;
        }
        let identity = self.identity.snapshot();
        if identity.access_token.is_none() {
            debug!("no access token yet, deferring realtime connection");
            return;
        }
        if self.ctx.is_connected() || self.scheduler.is_running() {
            return;
        }
        let auth_url = match self
            .token_provider
            .auth_url(&self.workspace_id, identity.session_id.as_deref())
        {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "cannot build realtime auth url");
                return;
            }
        };

        self.exhausted.store(false, Ordering::SeqCst);
        match self.manager.initialize_connection(&auth_url).await {
            Ok(()) => self.deliver_status(self.status()),
            Err(err) => {
                warn!(error = %err, "initial realtime connection failed, scheduling reconnect");
                self.deliver_status(self.status());
                self.start_reconnect(auth_url);
            }
        }
    }

    fn start_reconnect(self: &Arc<Self>, auth_url: String) {
        let mut slot = lock(&self.reconnect_task);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(self);
        let scheduler = self.scheduler.clone();
        let manager = self.manager.clone();
        *slot = Some(tokio::spawn(async move {
            let result = scheduler
                .start(|| {
                    let manager = manager.clone();
                    let auth_url = auth_url.clone();
                    async move { manager.reconnect_attempt(&auth_url).await }
                })
                .await;
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(()) => {
                    inner.exhausted.store(false, Ordering::SeqCst);
                    inner.deliver_status(inner.status());
                }
                Err(SchedulerError::Exhausted { attempts }) => {
                    warn!(attempts, "giving up on realtime, staying in local mode");
                    inner.exhausted.store(true, Ordering::SeqCst);
                    inner.deliver_status(ConnectionStatus::Failed);
                }
                Err(err) => debug!(error = %err, "reconnection loop ended"),
            }
        }));
    }

    fn stop_reconnect(&self) {
        self.scheduler.stop();
        if let Some(handle) = lock(&self.reconnect_task).take() {
            handle.abort();
        }
    }

    async fn on_identity_changed(self: &Arc<Self>) {
        let snapshot = self.identity.snapshot();
        let previous = {
            let mut last = lock(&self.last_identity);
            if *last == snapshot {
                return;
            }
            std::mem::replace(&mut *last, snapshot.clone())
        };
        info!(
            has_token = snapshot.access_token.is_some(),
            session_changed = previous.session_id != snapshot.session_id,
            "widget identity changed"
        );

        if snapshot.access_token.is_none() {
            self.stop_reconnect();
            self.manager.cleanup().await;
            self.deliver_status(self.status());
            return;
        }
        if previous.session_id != snapshot.session_id {
            // channels and the auth url are scoped to the session
            self.stop_reconnect();
            self.manager.cleanup().await;
        }
        self.ensure_connection().await;
    }
}

/// Forwards status events, re-reading the transport state on an interval to
/// catch anything missed.
async fn mirror_status(inner: Weak<Inner>) {
    let (mut events, period) = match inner.upgrade() {
        Some(inner) => (inner.ctx.subscribe_events(), inner.config.status_poll_interval),
        None => return,
    };
    let mut poll = time::interval(period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let status = tokio::select! {
            event = events.recv() => match event {
                Ok(ConnectionEvent::StatusChanged { status, .. }) => Some(status),
                Ok(_) => None,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "status events lagged");
                    None
                }
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick() => None,
        };
        let Some(inner) = inner.upgrade() else { break };
        let status = status.unwrap_or_else(|| inner.ctx.status());
        inner.deliver_status(inner.effective(status));
    }
}

/// Reacts to identity pushes, polling as a fallback.
async fn watch_identity(inner: Weak<Inner>) {
    let (mut changes, period) = match inner.upgrade() {
        Some(inner) => (inner.identity.watch(), inner.config.token_poll_interval),
        None => return,
    };
    let mut poll = time::interval(period);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.tick().await;

    loop {
        let push_closed = tokio::select! {
            changed = async {
                match changes.as_mut() {
                    Some(receiver) => receiver.changed().await.is_err(),
                    None => std::future::pending().await,
                }
            } => changed,
            _ = poll.tick() => false,
        };
        if push_closed {
            debug!("identity push channel closed, relying on polling");
            changes = None;
        }
        let Some(inner) = inner.upgrade() else { break };
        inner.on_identity_changed().await;
    }
}
