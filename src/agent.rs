//! Reconciliation loop and the agent's HTTP surface
//!
//! One [`Agent`] runs per member. It owns the [`Dispatcher`] and feeds it
//! from three sources: channel notices, a periodic tick and operator
//! actions arriving through an [`AgentHandle`]. Handlers run one at a time.
//!
//! The HTTP router exposes:
//! - `GET /health`, `GET /status`, `GET /metrics`
//! - `GET /watch`: channel notices as server-sent events
//! - `POST /actions/promote-to-primary`, `POST /actions/create-replication`

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;

use crate::arbitration::{self, PromoteRequest};
use crate::channel::{ChangeNotice, CoordinationChannel, FileChannel};
use crate::common::{AgentConfig, AuditLogger, Error, MetricsRegistry, Result};
use crate::context::{Collaborators, Context};
use crate::dispatch::{events_for, resync_events, Dispatcher, Event};
use crate::raft_admin::CliRaftAdmin;
use crate::secrets::FileSecretStore;
use crate::supervisor::HttpSupervisor;
use crate::workload::LocalWorkload;

/// How often the file-backed channel is polled for foreign writes
const CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pending operator actions before callers block
const ACTION_QUEUE: usize = 16;

struct ActionRequest {
    event: Event,
    reply: oneshot::Sender<Result<String>>,
}

/// Submits operator actions to a running agent
#[derive(Clone)]
pub struct AgentHandle {
    actions: mpsc::Sender<ActionRequest>,
}

impl AgentHandle {
    /// Run an action on the agent's loop and wait for its answer
    pub async fn request(&self, event: Event) -> Result<String> {
        if !event.is_action() {
            return Err(Error::InvalidConfig(format!(
                "{} is not an operator action",
                event.kind()
            )));
        }
        let (reply, answer) = oneshot::channel();
        self.actions
            .send(ActionRequest { event, reply })
            .await
            .map_err(|_| Error::Internal("agent loop has stopped".into()))?;
        answer
            .await
            .map_err(|_| Error::Internal("agent dropped the request".into()))?
    }
}

/// Wire the production collaborators for `config`
pub async fn build_context(config: AgentConfig) -> Result<Arc<Context>> {
    config.validate()?;
    let channel = FileChannel::open(&config.channel_dir, CHANNEL_POLL_INTERVAL).await?;
    let supervisor = HttpSupervisor::new(&config)?;
    let raft = CliRaftAdmin::new(
        config.raft_admin_tool.clone(),
        config.command_timeout(),
        config.retry_policy(),
    );
    let workload = LocalWorkload::new(&config);
    let secrets = FileSecretStore::open(&config.secrets_dir)?;
    let audit = AuditLogger::new(config.audit_log.as_deref(), true);

    let collaborators = Collaborators {
        channel,
        supervisor: Arc::new(supervisor),
        raft: Arc::new(raft),
        workload: Arc::new(workload),
        secrets: Arc::new(secrets),
    };
    Ok(Arc::new(Context::new(
        config,
        collaborators,
        Arc::new(audit),
        Arc::new(MetricsRegistry::new()),
    )))
}

pub struct Agent {
    dispatcher: Dispatcher,
    notices: broadcast::Receiver<ChangeNotice>,
    actions: mpsc::Receiver<ActionRequest>,
    /// Notices were missed or could not be read; the next tick re-runs
    /// every handler
    resync: bool,
}

impl Agent {
    /// Subscribe to the channel, then join the deployment roster
    pub async fn start(ctx: Arc<Context>) -> Result<(Self, AgentHandle)> {
        let notices = ctx.channel.subscribe();
        ctx.channel.join(ctx.deployment(), ctx.member()).await?;
        tracing::info!(
            member = %ctx.member(),
            deployment = %ctx.deployment(),
            "Joined the coordination channel"
        );

        let (tx, rx) = mpsc::channel(ACTION_QUEUE);
        let agent = Self {
            dispatcher: Dispatcher::new(ctx),
            notices,
            actions: rx,
            resync: false,
        };
        Ok((agent, AgentHandle { actions: tx }))
    }

    pub fn context(&self) -> &Arc<Context> {
        self.dispatcher.context()
    }

    /// Run until `shutdown` resolves or the channel closes
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let ctx = self.dispatcher.context().clone();
        let mut tick = tokio::time::interval(ctx.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(member = %ctx.member(), "Agent shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let events = self.tick_events(&ctx).await;
                    self.dispatcher.run_cycle(events).await;
                }
                Some(request) = self.actions.recv() => {
                    tracing::info!(member = %ctx.member(), action = request.event.kind(), "Operator action");
                    let result = self.dispatcher.act(request.event).await;
                    let _ = request.reply.send(result);
                }
                notice = self.notices.recv() => {
                    let events = match notice {
                        Ok(first) => self.drain(first, &ctx).await,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(member = %ctx.member(), missed, "Missed channel notices, resyncing");
                            self.resync_all(&ctx).await
                        }
                        Err(RecvError::Closed) => {
                            tracing::warn!(member = %ctx.member(), "Coordination channel closed");
                            break;
                        }
                    };
                    if !events.is_empty() {
                        self.dispatcher.run_cycle(events).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Collect every queued notice into one batch of events
    async fn drain(&mut self, first: ChangeNotice, ctx: &Context) -> Vec<Event> {
        let mut batch = vec![first];
        let mut lagged = false;
        loop {
            match self.notices.try_recv() {
                Ok(notice) => batch.push(notice),
                Err(TryRecvError::Lagged(_)) => lagged = true,
                Err(_) => break,
            }
        }

        if lagged {
            return self.resync_all(ctx).await;
        }
        let roster = match ctx.channel.roster().await {
            Ok(roster) => roster,
            Err(e) => {
                tracing::warn!(member = %ctx.member(), "Cannot read the roster, resyncing on the next tick: {}", e);
                self.resync = true;
                return Vec::new();
            }
        };
        let mut events: Vec<Event> = Vec::new();
        for notice in &batch {
            for event in events_for(notice, ctx.deployment(), ctx.member(), &roster) {
                if !events.contains(&event) {
                    events.push(event);
                }
            }
        }
        events
    }

    /// Events re-running every handler; on failure the next tick retries
    async fn resync_all(&mut self, ctx: &Context) -> Vec<Event> {
        match ctx.channel.roster().await {
            Ok(roster) => {
                self.resync = false;
                resync_events(&roster, ctx.deployment())
            }
            Err(e) => {
                tracing::warn!(member = %ctx.member(), "Cannot read the roster, resyncing on the next tick: {}", e);
                self.resync = true;
                Vec::new()
            }
        }
    }

    async fn tick_events(&mut self, ctx: &Context) -> Vec<Event> {
        if self.resync {
            let events = self.resync_all(ctx).await;
            if !events.is_empty() {
                return events;
            }
        }
        vec![Event::Tick]
    }
}

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AgentState {
    pub ctx: Arc<Context>,
    pub handle: AgentHandle,
}

pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/watch", get(watch))
        .route("/actions/promote-to-primary", post(promote_to_primary))
        .route("/actions/create-replication", post(create_replication))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AgentState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "member": state.ctx.member(),
        "deployment": state.ctx.deployment(),
        "version": crate::VERSION,
        "uptime_secs": state.ctx.metrics.uptime_seconds(),
    }))
}

async fn status(State(state): State<AgentState>) -> impl IntoResponse {
    let ctx = &state.ctx;
    let view = match arbitration::current_view(ctx).await {
        Ok(view) => view,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
        }
    };
    let is_leader = ctx.is_leader().await.unwrap_or(false);
    let link = view.as_ref().map(|v| {
        json!({
            "name": v.link.name,
            "remote": v.remote,
            "state": v.state(),
            "local_epoch": v.local_epoch,
            "remote_epoch": v.remote_epoch,
            "highest_epoch": v.highest(),
        })
    });
    (
        StatusCode::OK,
        Json(json!({
            "member": ctx.member(),
            "deployment": ctx.deployment(),
            "is_leader": is_leader,
            "status": ctx.status(),
            "arbitration": view
                .as_ref()
                .map(|v| v.state())
                .unwrap_or(arbitration::ArbitrationState::NoLink),
            "link": link,
            "deferred": ctx.metrics.deferred_queue.get(),
        })),
    )
}

async fn metrics(State(state): State<AgentState>) -> impl IntoResponse {
    state.ctx.metrics.to_prometheus()
}

/// Stream channel notices; lagged notices are skipped
async fn watch(
    State(state): State<AgentState>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(state.ctx.channel.subscribe()).filter_map(|notice| async move {
        let data = serde_json::to_string(&notice.ok()?).ok()?;
        Some(Ok::<_, Infallible>(SseEvent::default().data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn action_response(result: Result<String>) -> (StatusCode, Json<serde_json::Value>) {
    match result {
        Ok(message) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "result": message })),
        ),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

async fn promote_to_primary(
    State(state): State<AgentState>,
    body: Option<Json<PromoteRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    action_response(
        state
            .handle
            .request(Event::PromoteRequested { request })
            .await,
    )
}

async fn create_replication(State(state): State<AgentState>) -> impl IntoResponse {
    action_response(state.handle.request(Event::CreateReplication).await)
}

/// Run the agent and its HTTP server until `shutdown` resolves
pub async fn serve(ctx: Arc<Context>, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let config = &ctx.config;
    tracing::info!("Starting topokeeper agent: {}", config.member);
    tracing::info!("  Deployment: {}", config.deployment);
    tracing::info!("  Address: {}", config.address);
    tracing::info!("  Channel: {}", config.channel_dir.display());
    tracing::info!("  Status API: {}", config.status_bind);

    let (agent, handle) = Agent::start(ctx.clone()).await?;
    let router = create_router(AgentState {
        ctx: ctx.clone(),
        handle,
    });
    let listener = tokio::net::TcpListener::bind(config.status_bind).await?;
    let http_server = axum::serve(listener, router);

    tracing::info!("✓ Agent ready ({})", config.member);

    tokio::select! {
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        res = agent.run(shutdown) => {
            if let Err(e) = res {
                tracing::error!("Agent loop error: {}", e);
                return Err(e);
            }
        }
    }
    Ok(())
}
