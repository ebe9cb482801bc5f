//! Session manager
//!
//! Decides whether a turn reuses the caller's thread or opens a fresh one,
//! seeds new threads with user context, and clears stale active runs
//! before appending to an existing thread.

use tracing::{info, warn};

use crate::assistant::ReasoningService;
use crate::models::UserProfile;
use crate::Result;

/// Thread ids minted by the assistant API carry this prefix; anything else
/// the caller sends is treated as stale client state.
const THREAD_ID_PREFIX: &str = "thread_";

pub struct SessionManager<'a> {
    service: &'a dyn ReasoningService,
}

/// Outcome of session preparation: the thread the run should execute on
/// and whether it was created this turn.
pub struct PreparedSession {
    pub thread_id: String,
    pub fresh: bool,
}

impl<'a> SessionManager<'a> {
    pub fn new(service: &'a dyn ReasoningService) -> Self {
        Self { service }
    }

    /// Resolve the thread for this turn and append the user message.
    ///
    /// A fresh thread is seeded with the user's display name so the
    /// assistant can address them. When onboarding is requested and still
    /// pending, the onboarding-intent seed stands in for the user's
    /// literal text, which is not posted.
    pub async fn prepare(
        &self,
        incoming_thread: Option<&str>,
        profile: &UserProfile,
        wants_onboarding: bool,
        message: &str,
    ) -> Result<PreparedSession> {
        let reusable = incoming_thread
            .filter(|id| id.starts_with(THREAD_ID_PREFIX))
            .map(str::to_string);

        if let Some(thread_id) = reusable {
            self.cancel_active_runs(&thread_id).await;
            self.service.post_message(&thread_id, "user", message).await?;
            return Ok(PreparedSession {
                thread_id,
                fresh: false,
            });
        }

        if let Some(stale) = incoming_thread {
            warn!(thread_id = %stale, "Discarding malformed thread id");
        }

        let thread_id = self.service.create_thread().await?;
        let onboarding = wants_onboarding && !profile.onboarding_complete;
        self.seed_thread(&thread_id, profile, onboarding).await?;
        info!(thread_id = %thread_id, "Started fresh conversation thread");

        if !onboarding {
            self.service.post_message(&thread_id, "user", message).await?;
        }

        Ok(PreparedSession {
            thread_id,
            fresh: true,
        })
    }

    async fn seed_thread(
        &self,
        thread_id: &str,
        profile: &UserProfile,
        onboarding: bool,
    ) -> Result<()> {
        let mut seed = format!("El usuario se llama {}.", profile.display_name);
        if onboarding {
            seed.push_str(
                " Aún no completa su registro inicial: guía la conversación para \
                 capturar su ingreso mensual, meta de ahorro y moneda.",
            );
        }

        self.service.post_message(thread_id, "user", &seed).await
    }

    /// A run left active by an interrupted turn blocks new messages on the
    /// thread. Cancellation is best-effort; a failed cancel is logged and
    /// the turn proceeds.
    async fn cancel_active_runs(&self, thread_id: &str) {
        let runs = match self.service.list_runs(thread_id).await {
            Ok(runs) => runs,
            Err(error) => {
                warn!(thread_id = %thread_id, "Could not list runs: {}", error);
                return;
            }
        };

        for run in runs.iter().filter(|r| r.is_active()) {
            match self.service.cancel_run(thread_id, &run.id).await {
                Ok(()) => info!(thread_id = %thread_id, run_id = %run.id, "Cancelled stale run"),
                Err(error) => {
                    warn!(run_id = %run.id, "Stale run cancel failed: {}", error)
                }
            }
        }
    }
}
