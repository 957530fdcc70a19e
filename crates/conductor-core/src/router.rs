//! ConnectionRouter - per-connection dispatch of inbound frames.
//!
//! The transport hands every text frame to [`ConnectionRouter::handle_frame`]
//! along with the [`Connection`] it arrived on. Handlers are looked up by the
//! frame's `type`; any error they return becomes a single `error` frame to
//! that client and the connection stays open.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bookmarks::BookmarkError;
use crate::clients::ClientHandle;
use crate::context::Engine;
use crate::process::{ProcessError, ProcessEvent, ProcessId, SpawnRequest};
use crate::protocol::{
    BookmarksAddRequest, BookmarksGetRequest, BookmarksRemoveRequest, ClearRequest, ClientId,
    ExecRequest, KillRequest, Outbound, ProjectSetRequest, SessionRequest, WatchUpdateRequest,
};
use crate::spawn::{Signal, StreamKind, UnknownSignal};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Message has no type")]
    MissingType,

    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        source: serde_json::Error,
    },

    #[error("No project selected")]
    NoProject,

    #[error("No session given")]
    NoSession,

    #[error("Command cannot be empty")]
    EmptyCommand,

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Bookmark(#[from] BookmarkError),

    #[error(transparent)]
    Signal(#[from] UnknownSignal),
}

/// Mutable per-connection state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub project_slug: Option<String>,
    pub session_id: Option<String>,
}

/// One live client connection.
pub struct Connection {
    client: ClientHandle,
    context: ConnectionContext,
}

impl Connection {
    pub fn id(&self) -> ClientId {
        self.client.id()
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    fn project(&self) -> Result<String, RouterError> {
        self.context.project_slug.clone().ok_or(RouterError::NoProject)
    }

    fn session(&self, requested: Option<String>) -> Result<String, RouterError> {
        requested
            .filter(|s| !s.is_empty())
            .or_else(|| self.context.session_id.clone())
            .ok_or(RouterError::NoSession)
    }
}

type Handler = fn(&ConnectionRouter, &mut Connection, Value) -> Result<(), RouterError>;

pub struct ConnectionRouter {
    engine: Engine,
    handlers: HashMap<&'static str, Handler>,
}

impl ConnectionRouter {
    pub fn new(engine: Engine) -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert("exec", handle_exec);
        handlers.insert("kill", handle_kill);
        handlers.insert("list", handle_list);
        handlers.insert("clear", handle_clear);
        handlers.insert("watch:update", handle_watch_update);
        handlers.insert("watch:list", handle_watch_list);
        handlers.insert("bookmarks:get", handle_bookmarks_get);
        handlers.insert("bookmarks:add", handle_bookmarks_add);
        handlers.insert("bookmarks:remove", handle_bookmarks_remove);
        handlers.insert("project:set", handle_project_set);
        handlers.insert("session:watch", handle_session_watch);
        handlers.insert("session:unwatch", handle_session_unwatch);
        handlers.insert("task:get", handle_task_get);
        handlers.insert("task:cancel", handle_task_cancel);
        handlers.insert("task:ack", handle_task_ack);
        Self { engine, handlers }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Message types this router understands, sorted.
    pub fn message_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Register a new client and send it the `connected` acknowledgement.
    pub fn connect(&self, tx: mpsc::UnboundedSender<String>) -> Connection {
        let client = self.engine.clients.register(tx);
        self.engine.clients.send(
            &client,
            &Outbound::Connected {
                client_id: client.id(),
            },
        );
        log::info!("Client {} connected", client.id());
        Connection {
            client,
            context: ConnectionContext::default(),
        }
    }

    pub fn handle_frame(&self, conn: &mut Connection, text: &str) {
        let message: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.reply_error(conn, &RouterError::InvalidJson(e), None);
                return;
            }
        };
        let Some(kind) = message.get("type").and_then(Value::as_str).map(str::to_string) else {
            self.reply_error(conn, &RouterError::MissingType, None);
            return;
        };
        let Some(handler) = self.handlers.get(kind.as_str()) else {
            log::warn!("Ignoring unknown message type {:?} from client {}", kind, conn.id());
            return;
        };

        log::debug!("Client {} -> {}", conn.id(), kind);
        if let Err(e) = handler(self, conn, message) {
            self.reply_error(conn, &e, Some(&kind));
        }
    }

    pub fn disconnect(&self, conn: Connection) {
        self.engine.clients.unregister(conn.id());
        log::info!("Client {} disconnected", conn.id());
    }

    fn reply(&self, conn: &Connection, msg: &Outbound) {
        self.engine.clients.send(&conn.client, msg);
    }

    fn reply_error(&self, conn: &Connection, error: &RouterError, kind: Option<&str>) {
        log::debug!("Client {} request {:?} failed: {}", conn.id(), kind, error);
        self.reply(conn, &Outbound::error(error.to_string(), kind));
    }

    fn broadcast_processes(&self, project_slug: &str) {
        self.engine.clients.broadcast(&Outbound::Processes {
            project_slug: project_slug.to_string(),
            processes: self.engine.processes.list(project_slug),
        });
    }

    fn reply_bookmarks(&self, conn: &Connection, project: Option<&str>) {
        let list = self.engine.bookmarks.list(project);
        self.reply(
            conn,
            &Outbound::Bookmarks {
                global: list.global,
                project: list.project,
            },
        );
    }
}

fn payload<T: DeserializeOwned>(message: Value) -> Result<T, RouterError> {
    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(message).map_err(|source| RouterError::InvalidPayload { kind, source })
}

fn bookmark_project(explicit: Option<String>, conn: &Connection) -> Option<String> {
    explicit
        .filter(|p| !p.is_empty())
        .or_else(|| conn.context.project_slug.clone())
}

// ============================================================================
// Processes
// ============================================================================

fn handle_exec(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: ExecRequest = payload(message)?;
    let project = conn.project()?;
    let command = req.command.trim();
    if command.is_empty() {
        return Err(RouterError::EmptyCommand);
    }

    let spawned = router
        .engine
        .processes
        .spawn(&project, SpawnRequest::new(command).cwd(req.cwd));
    let record = spawned.record;
    // A failed spawn never ran; the relay reports it as error then exit.
    if record.status.is_running() {
        router.engine.clients.broadcast(&Outbound::Started {
            process_id: record.id.clone(),
            command: record.command,
            pid: record.pid,
            cwd: record.cwd,
            project_slug: project.clone(),
        });
    }

    tokio::spawn(relay_process_events(
        router.engine.clone(),
        conn.client.clone(),
        project,
        record.id,
        spawned.events,
    ));
    Ok(())
}

/// Forward a process's events to every client until it exits.
async fn relay_process_events(
    engine: Engine,
    requester: ClientHandle,
    project_slug: String,
    process_id: ProcessId,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output { stream, data } => {
                engine.clients.broadcast(&Outbound::Output {
                    process_id: process_id.clone(),
                    stream,
                    data,
                    project_slug: project_slug.clone(),
                });
            }
            ProcessEvent::Failed { message } => {
                engine
                    .clients
                    .send(&requester, &Outbound::error(message.clone(), Some("exec")));
                engine.clients.broadcast(&Outbound::Output {
                    process_id: process_id.clone(),
                    stream: StreamKind::Stderr,
                    data: message,
                    project_slug: project_slug.clone(),
                });
            }
            ProcessEvent::Exit {
                code,
                signal,
                status,
            } => {
                engine.clients.broadcast(&Outbound::Exit {
                    process_id: process_id.clone(),
                    code,
                    signal,
                    status,
                    project_slug: project_slug.clone(),
                });
                break;
            }
        }
    }
}

fn handle_kill(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: KillRequest = payload(message)?;
    let project = conn.project()?;
    let signal = match req.signal.as_deref() {
        Some(name) => name.parse::<Signal>()?,
        None => Signal::default(),
    };
    let id = ProcessId(req.process_id);
    if !router.engine.processes.kill(&project, &id, signal)? {
        log::debug!("Kill for {} ignored: already exited", id);
    }
    Ok(())
}

fn handle_list(
    router: &ConnectionRouter,
    conn: &mut Connection,
    _message: Value,
) -> Result<(), RouterError> {
    let project = conn.project()?;
    router.reply(
        conn,
        &Outbound::Processes {
            processes: router.engine.processes.list(&project),
            project_slug: project,
        },
    );
    Ok(())
}

fn handle_clear(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: ClearRequest = payload(message)?;
    let project = conn.project()?;
    let id = req.process_id.map(ProcessId);
    let removed = router.engine.processes.clear(&project, id.as_ref())?;
    log::debug!("Cleared {} records for {}", removed.len(), project);
    router.broadcast_processes(&project);
    Ok(())
}

// ============================================================================
// Watches and bookmarks
// ============================================================================

fn handle_watch_update(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: WatchUpdateRequest = payload(message)?;
    let project = bookmark_project(req.project_slug, conn);
    let watch = req.watch.validate()?;
    if watch.enabled && project.is_none() {
        return Err(RouterError::NoProject);
    }

    let bookmark = router.engine.bookmarks.set_watch(
        req.scope,
        project.as_deref(),
        &req.bookmark_id,
        watch,
    )?;
    match project.as_deref() {
        Some(slug) if bookmark.watch_enabled() => router.engine.watches.start_watch(slug, bookmark),
        _ => {
            router.engine.watches.stop_watch(&bookmark.id);
        }
    }

    router.reply_bookmarks(conn, project.as_deref());
    Ok(())
}

fn handle_watch_list(
    router: &ConnectionRouter,
    conn: &mut Connection,
    _message: Value,
) -> Result<(), RouterError> {
    router.reply(
        conn,
        &Outbound::WatchState {
            active: router.engine.watches.active_watches(),
        },
    );
    Ok(())
}

fn handle_bookmarks_get(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: BookmarksGetRequest = payload(message)?;
    let project = bookmark_project(req.project_slug, conn);
    router.reply_bookmarks(conn, project.as_deref());
    Ok(())
}

fn handle_bookmarks_add(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: BookmarksAddRequest = payload(message)?;
    let project = bookmark_project(req.project_slug, conn);
    router
        .engine
        .bookmarks
        .add(req.scope, project.as_deref(), &req.command, req.cwd)?;
    router.reply_bookmarks(conn, project.as_deref());
    Ok(())
}

fn handle_bookmarks_remove(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: BookmarksRemoveRequest = payload(message)?;
    let project = bookmark_project(req.project_slug, conn);
    let removed = router
        .engine
        .bookmarks
        .remove(req.scope, project.as_deref(), &req.id)?;
    router.engine.watches.stop_watch(&removed.id);
    router.reply_bookmarks(conn, project.as_deref());
    Ok(())
}

// ============================================================================
// Connection context, sessions and tasks
// ============================================================================

fn handle_project_set(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: ProjectSetRequest = payload(message)?;
    if req.project_slug.is_empty() {
        return Err(RouterError::NoProject);
    }
    conn.context.project_slug = Some(req.project_slug.clone());
    router.reply(
        conn,
        &Outbound::Processes {
            processes: router.engine.processes.list(&req.project_slug),
            project_slug: req.project_slug,
        },
    );
    Ok(())
}

fn handle_session_watch(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: SessionRequest = payload(message)?;
    let session_id = req
        .session_id
        .filter(|s| !s.is_empty())
        .ok_or(RouterError::NoSession)?;

    if let Some(previous) = conn.context.session_id.take() {
        if previous != session_id {
            router.engine.clients.unwatch_session(&previous, conn.id());
        }
    }
    let had_other_watchers = router
        .engine
        .clients
        .watch_session(&session_id, &conn.client);
    conn.context.session_id = Some(session_id.clone());

    router.reply(
        conn,
        &Outbound::SessionWatching {
            session_id,
            had_other_watchers,
        },
    );
    Ok(())
}

fn handle_session_unwatch(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: SessionRequest = payload(message)?;
    let session_id = conn.session(req.session_id)?;
    router.engine.clients.unwatch_session(&session_id, conn.id());
    if conn.context.session_id.as_deref() == Some(session_id.as_str()) {
        conn.context.session_id = None;
    }
    Ok(())
}

fn handle_task_get(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: SessionRequest = payload(message)?;
    let session_id = conn.session(req.session_id)?;
    let task = router.engine.tasks.get_or_create_task(&session_id);
    router.reply(conn, &Outbound::Task { task });
    Ok(())
}

fn handle_task_cancel(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: SessionRequest = payload(message)?;
    let session_id = conn.session(req.session_id)?;
    let cancelled = router.engine.tasks.cancel_task(&session_id);
    router.reply(
        conn,
        &Outbound::TaskCancelled {
            session_id,
            cancelled,
        },
    );
    Ok(())
}

fn handle_task_ack(
    router: &ConnectionRouter,
    conn: &mut Connection,
    message: Value,
) -> Result<(), RouterError> {
    let req: SessionRequest = payload(message)?;
    let session_id = conn.session(req.session_id)?;
    let cleared = router.engine.tasks.clear_completed_task(&session_id);
    router.reply(
        conn,
        &Outbound::TaskCleared {
            session_id,
            cleared,
        },
    );
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
