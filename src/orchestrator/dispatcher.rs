//! Routes direct messages to per-user program sessions.
//!
//! Every user gets a dedicated worker task fed by an unbounded queue. The
//! stream loop enqueues in arrival order, so commands from one user run
//! strictly one after another and in the order they were typed, while
//! different users are served concurrently.
//!
//! A worker retires once its session is gone and its queue is empty, so idle
//! users cost nothing. Each live session holds a permit from a semaphore
//! sized to `max_sessions`; the permit is taken before the program starts
//! and returned when the session ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::orchestrator::registry::{Lookup, SessionRegistry};
use crate::process::session::{ProcessSession, SessionConfig};
use crate::slack::connection::OutboundSink;
use crate::slack::message::{InboundMessage, OutboundMessage};
use crate::slack::stream::InboundHandler;
use crate::{AppError, Result};

/// Reply after an orderly program exit.
pub const SESSION_ENDED_TEXT: &str =
    "The session has ended. Send another message to start a new one.";

/// One queued command together with the sink to answer on.
#[derive(Debug)]
struct Job {
    message: InboundMessage,
    outbound: OutboundSink,
}

/// A user's job queue, tagged so a retiring worker only removes its own.
#[derive(Debug)]
struct Queue {
    generation: u64,
    tx: mpsc::UnboundedSender<Job>,
}

/// Shared state used by every worker.
#[derive(Debug)]
struct Shared {
    registry: Arc<SessionRegistry<ProcessSession>>,
    session_config: SessionConfig,
    max_sessions: usize,
    permits: Arc<Semaphore>,
    leases: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    queues: Mutex<HashMap<String, Queue>>,
    next_generation: AtomicU64,
}

impl Shared {
    fn release_lease(&self, user: &str) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user);
    }
}

/// Direct-message handler backed by a [`SessionRegistry`].
#[derive(Debug)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Build a dispatcher that starts sessions with `session_config`.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry<ProcessSession>>,
        session_config: SessionConfig,
        max_sessions: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                session_config,
                max_sessions,
                permits: Arc::new(Semaphore::new(max_sessions.min(Semaphore::MAX_PERMITS))),
                leases: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// The registry this dispatcher populates.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry<ProcessSession>> {
        &self.shared.registry
    }

    /// Number of users with a running worker.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close every session and stop accepting work.
    pub async fn shutdown(&self) {
        self.shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let sessions = self.shared.registry.drain().await;
        info!(count = sessions.len(), "closing all sessions");
        for session in sessions {
            session.close().await;
        }
        self.shared
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn enqueue(&self, user: String, job: Job) {
        let mut queues = self
            .shared
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let job = match queues.get(&user) {
            Some(queue) => match queue.tx.send(job) {
                Ok(()) => return,
                // Worker gone; start a fresh one below.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            warn!(user, "user queue closed before first job");
        }
        queues.insert(user.clone(), Queue { generation, tx });
        drop(queues);

        tokio::spawn(
            run_worker(Arc::clone(&self.shared), user.clone(), generation, rx)
                .instrument(info_span!("user_worker", user = %user)),
        );
    }
}

impl InboundHandler for Dispatcher {
    fn on_message(&self, message: InboundMessage, outbound: OutboundSink) {
        let Some(user) = message.user.clone() else {
            debug!("message without user ignored");
            return;
        };
        self.enqueue(user, Job { message, outbound });
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    user: String,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    debug!("user worker started");

    while let Some(job) = rx.recv().await {
        let text = job.message.text.as_deref().unwrap_or_default();
        let reply = handle_command(&shared, &user, text).await;

        if let Err(err) = job
            .outbound
            .send(OutboundMessage::reply(&job.message, reply))
            .await
        {
            warn!(%err, "failed to queue reply");
        }

        if !shared.registry.contains(&user).await && retire(&shared, &user, generation, &rx) {
            break;
        }
    }

    debug!("user worker stopped");
}

/// Drop the user's queue if nothing is waiting in it.
///
/// Runs under the queue map lock, which `enqueue` also holds while sending,
/// so a job is either seen here or routed to a fresh worker.
fn retire(
    shared: &Shared,
    user: &str,
    generation: u64,
    rx: &mpsc::UnboundedReceiver<Job>,
) -> bool {
    let mut queues = shared.queues.lock().unwrap_or_else(PoisonError::into_inner);
    if !rx.is_empty() {
        return false;
    }
    if queues
        .get(user)
        .is_some_and(|queue| queue.generation == generation)
    {
        queues.remove(user);
    }
    true
}

/// Run one command for `user` and produce the reply text.
async fn handle_command(shared: &Shared, user: &str, text: &str) -> String {
    let mut lease = None;
    let taken = &mut lease;
    let lookup = shared
        .registry
        .get_or_create(user, || async move {
            let (session, greeting, permit) = start_session(shared).await?;
            *taken = Some(permit);
            Ok::<_, AppError>((session, greeting))
        })
        .await;

    let session = match lookup {
        Ok(Lookup::Created { greeting, .. }) => {
            if let Some(permit) = lease {
                shared
                    .leases
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(user.to_owned(), permit);
            }
            info!("new session started");
            return greeting;
        }
        Ok(Lookup::Existing(session)) => session,
        Err(err) => {
            warn!(%err, "session start failed");
            return format!("Unable to start a session: {}", short_reason(&err));
        }
    };

    match session.execute(text).await {
        Ok(output) => output,
        Err(err) => {
            if err.ends_session() {
                shared.registry.remove(user).await;
                session.close().await;
                shared.release_lease(user);
            }
            if let AppError::CleanExit = err {
                info!("session ended cleanly");
                SESSION_ENDED_TEXT.to_owned()
            } else {
                warn!(%err, "session ended abnormally");
                format!(
                    "The session stopped unexpectedly ({}). Send another message to start a new one.",
                    short_reason(&err)
                )
            }
        }
    }
}

/// Reserve a slot, then start the program. The permit is released if the
/// start fails.
async fn start_session(
    shared: &Shared,
) -> Result<(ProcessSession, String, OwnedSemaphorePermit)> {
    let permit = Arc::clone(&shared.permits)
        .try_acquire_owned()
        .map_err(|_| {
            AppError::Spawn(format!("session limit reached ({})", shared.max_sessions))
        })?;
    let (session, greeting) = ProcessSession::start(&shared.session_config).await?;
    Ok((session, greeting, permit))
}

/// Error text without the category prefix, suitable for chat.
fn short_reason(err: &AppError) -> String {
    match err {
        AppError::Config(msg)
        | AppError::Auth(msg)
        | AppError::Transport(msg)
        | AppError::Spawn(msg)
        | AppError::Execution(msg)
        | AppError::FrameParse(msg)
        | AppError::Io(msg) => msg.clone(),
        AppError::CleanExit => "program exited".to_owned(),
    }
}
