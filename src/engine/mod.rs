//! Conversational-flow execution engine
//!
//! The [`Engine`] is the long-lived dispatcher: it holds the loaded
//! [`Program`], the collaborator ports, and the per-user lock table. Platform
//! adapters translate webhook deliveries into calls on the entry points
//! (`on_text`, `on_button`, `on_referral`, ...); each call runs one complete
//! load-run-save cycle under the user's lock and commits the session at a
//! single point, only when the run reached idle or a wait.

pub mod condition;
pub mod error;
pub mod interp;
pub mod lock;
pub mod memory;
pub mod message;
pub mod normalize;
pub mod ports;
pub mod program;
pub mod session;
pub mod subst;

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use self::error::{EngineError, EngineResult};
use self::interp::ExecutionContext;
use self::lock::SessionLocks;
use self::message::{ButtonPayload, EventSource, Receipt};
use self::ports::{Conversation, Mailer, PlatformInit, SessionStore, TaskId, TaskScheduler};
use self::program::{InitEntry, ON_START_BLOCK, Program};
use self::session::{ReferralHandler, Session, predefined};
use self::subst::substitute_text;

/// Engine-level tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on instructions executed per inbound event. A run that
    /// exceeds it fails with a budget error instead of looping forever.
    pub instruction_budget: usize,
    /// Collapse typing pauses to 1ms. Meant for tests.
    pub debug_delay: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instruction_budget: 1000,
            debug_delay: false,
        }
    }
}

/// Per-request context: which user on which platform, and the outbound
/// channel to reach them.
#[derive(Clone)]
pub struct RequestContext {
    /// Platform name, e.g. `facebook` or `telegram`.
    pub platform: String,
    /// Platform-scoped user identifier.
    pub user_id: String,
    /// Outbound side of this user's conversation.
    pub conversation: Arc<dyn Conversation>,
}

impl RequestContext {
    /// Bundle a request context.
    pub fn new(
        platform: impl Into<String>,
        user_id: impl Into<String>,
        conversation: Arc<dyn Conversation>,
    ) -> Self {
        Self {
            platform: platform.into(),
            user_id: user_id.into(),
            conversation,
        }
    }
}

/// One inbound event, normalized across entry points.
enum Inbound<'a> {
    Text(&'a str),
    Operator(&'a str),
    Button(&'a ButtonPayload),
    Trigger {
        task_id: &'a TaskId,
        trigger: &'a str,
    },
    Referral(Option<&'a str>),
    StartBlock(&'a str),
}

/// The long-lived dispatcher shared by all platform adapters.
pub struct Engine {
    program: Arc<Program>,
    store: Arc<dyn SessionStore>,
    scheduler: Arc<dyn TaskScheduler>,
    mailer: Arc<dyn Mailer>,
    locks: SessionLocks,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine over a loaded program and its collaborators.
    pub fn new(
        program: Arc<Program>,
        store: Arc<dyn SessionStore>,
        scheduler: Arc<dyn TaskScheduler>,
        mailer: Arc<dyn Mailer>,
        config: EngineConfig,
    ) -> Self {
        info!(blocks = program.block_count(), "engine ready");
        Self {
            program,
            store,
            scheduler,
            mailer,
            locks: SessionLocks::new(),
            config,
        }
    }

    /// The loaded program.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Run the platform directives of the initialize block for one platform
    /// adapter. Called once at startup per registered platform.
    pub async fn initialize(&self, platform: &dyn PlatformInit) -> EngineResult<()> {
        for entry in self.program.init_entries() {
            if let InitEntry::PlatformDirective {
                platform: name,
                payload,
            } = entry
            {
                if name == platform.platform() {
                    platform
                        .process_init_directive(payload)
                        .await
                        .map_err(EngineError::PlatformInit)?;
                }
            }
        }
        Ok(())
    }

    /// Handle a free-text user message.
    pub async fn on_text(&self, ctx: &RequestContext, text: &str) -> EngineResult<()> {
        self.append_receipt(ctx, Receipt::text(text)).await?;
        self.dispatch(ctx, Inbound::Text(text)).await?;
        Ok(())
    }

    /// Handle a button press.
    pub async fn on_button(&self, ctx: &RequestContext, payload: &ButtonPayload) -> EngineResult<()> {
        self.append_receipt(ctx, payload_receipt(EventSource::Button, payload))
            .await?;
        self.dispatch(ctx, Inbound::Button(payload)).await?;
        Ok(())
    }

    /// Handle a quick-reply selection. Same routing as a button press.
    pub async fn on_quick_reply(
        &self,
        ctx: &RequestContext,
        payload: &ButtonPayload,
    ) -> EngineResult<()> {
        self.append_receipt(ctx, payload_receipt(EventSource::QuickReply, payload))
            .await?;
        self.dispatch(ctx, Inbound::Button(payload)).await?;
        Ok(())
    }

    /// Handle a human-operator message. Only operator handlers are consulted.
    pub async fn on_operator_text(&self, ctx: &RequestContext, text: &str) -> EngineResult<()> {
        self.append_receipt(ctx, Receipt::operator(text)).await?;
        self.dispatch(ctx, Inbound::Operator(text)).await?;
        Ok(())
    }

    /// Handle a scheduled trigger firing. The recorded task is consumed
    /// exactly once; a fired task whose recorded trigger name differs from
    /// `trigger` is dropped with a warning.
    pub async fn on_scheduled_trigger(
        &self,
        ctx: &RequestContext,
        task_id: &TaskId,
        trigger: &str,
    ) -> EngineResult<()> {
        let receipt = Receipt::payload(
            EventSource::ScheduledTask,
            serde_json::json!({"task_id": task_id, "trigger": trigger}),
        );
        self.append_receipt(ctx, receipt).await?;
        self.dispatch(ctx, Inbound::Trigger { task_id, trigger }).await?;
        Ok(())
    }

    /// Handle a referral deep link. Returns whether a referral handler
    /// matched the tag.
    pub async fn on_referral(&self, ctx: &RequestContext, tag: Option<&str>) -> EngineResult<bool> {
        let receipt = Receipt::payload(
            EventSource::Referral,
            tag.map(|tag| Value::String(tag.to_string()))
                .unwrap_or(Value::Null),
        );
        self.append_receipt(ctx, receipt).await?;
        self.dispatch(ctx, Inbound::Referral(tag)).await
    }

    /// Start (or restart) the conversation at an explicit block. Used by
    /// operator consoles and test drivers.
    pub async fn start_with_block(&self, ctx: &RequestContext, block: &str) -> EngineResult<()> {
        self.dispatch(ctx, Inbound::StartBlock(block)).await?;
        Ok(())
    }

    /// Substitute placeholders in `text` against a user's current variables,
    /// without running or saving anything.
    pub async fn substitute_preview(
        &self,
        ctx: &RequestContext,
        text: &str,
    ) -> EngineResult<String> {
        let (session, _) = self
            .store
            .load_or_create(&ctx.platform, &ctx.user_id)
            .await
            .map_err(EngineError::Storage)?;
        Ok(substitute_text(text, &session.variables))
    }

    async fn append_receipt(&self, ctx: &RequestContext, receipt: Receipt) -> EngineResult<()> {
        self.store
            .append_received(&ctx.platform, &ctx.user_id, &receipt)
            .await
            .map_err(EngineError::Storage)
    }

    /// The load-run-save cycle shared by every entry point. The session is
    /// committed only when the run finishes cleanly; a fatal error leaves
    /// the stored session untouched.
    async fn dispatch(&self, ctx: &RequestContext, event: Inbound<'_>) -> EngineResult<bool> {
        let lock = self.locks.lock_for(&ctx.platform, &ctx.user_id);
        let _guard = lock.lock_owned().await;

        let (mut session, created) = self
            .store
            .load_or_create(&ctx.platform, &ctx.user_id)
            .await
            .map_err(EngineError::Storage)?;
        if created {
            debug!(platform = %ctx.platform, user = %ctx.user_id, "first contact");
        }
        let referral_handlers = self.init_session(&mut session, ctx, created).await;

        let mut handled = true;
        {
            let mut interp = ExecutionContext::new(
                &self.program,
                &mut session,
                ctx,
                self.store.as_ref(),
                self.scheduler.as_ref(),
                self.mailer.as_ref(),
                &self.config,
                referral_handlers,
            );
            match event {
                Inbound::Text(text) => {
                    // First contact still runs the full routing chain; the
                    // start block only catches what nothing else consumed.
                    let fallback = if created && self.program.has_block(ON_START_BLOCK) {
                        Some(ON_START_BLOCK)
                    } else {
                        None
                    };
                    interp.handle_text(text, fallback).await?;
                }
                Inbound::Operator(text) => interp.handle_operator_text(text).await?,
                Inbound::Button(payload) => {
                    let fallback = if created && self.program.has_block(ON_START_BLOCK) {
                        Some(ON_START_BLOCK)
                    } else {
                        None
                    };
                    interp.handle_button(payload, fallback).await?;
                }
                Inbound::Trigger { task_id, trigger } => {
                    let record = self
                        .store
                        .take_scheduled_task(task_id)
                        .await
                        .map_err(EngineError::Storage)?;
                    match record {
                        Some(task) if task.trigger == trigger => {
                            if let Some(goto) = &task.payload.goto {
                                interp.do_goto(goto).await?;
                            }
                        }
                        Some(task) => {
                            warn!(
                                expected = %task.trigger,
                                got = trigger,
                                "dropping fired task with mismatched trigger"
                            );
                        }
                        None => {
                            warn!(task = %task_id, trigger, "fired task not found or already consumed");
                        }
                    }
                }
                Inbound::Referral(tag) => handled = interp.handle_referral(tag).await?,
                Inbound::StartBlock(block) => interp.do_goto(block).await?,
            }
        }

        self.store
            .save(&ctx.platform, &session)
            .await
            .map_err(EngineError::Storage)?;
        Ok(handled)
    }

    /// Per-fetch session initialization: profile variables on first contact,
    /// predefined context variables, and the handler lists and defaults from
    /// the initialize block (re-registered on every fetch so script updates
    /// reach existing sessions).
    async fn init_session(
        &self,
        session: &mut Session,
        ctx: &RequestContext,
        created: bool,
    ) -> Vec<ReferralHandler> {
        if created {
            match ctx.conversation.fetch_user_variables().await {
                Ok(Some(vars)) => {
                    for (key, value) in vars {
                        session.variables.assign(key, value);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to fetch user profile variables"),
            }
        }

        session.variables.assign(
            predefined::PLATFORM_USER_ID,
            Value::String(ctx.user_id.clone()),
        );
        session
            .variables
            .assign(predefined::PLATFORM, Value::String(ctx.platform.clone()));
        session.variables.assign(
            predefined::TIMESTAMP,
            Value::String(Utc::now().to_rfc3339()),
        );

        session.global_input_handlers.clear();
        session.operator_input_handlers.clear();
        let mut referral_handlers = Vec::new();
        for entry in self.program.init_entries() {
            match entry {
                InitEntry::GlobalInput(handler) => {
                    session.global_input_handlers.push(handler.clone());
                }
                InitEntry::OperatorInput(handler) => {
                    session.operator_input_handlers.push(handler.clone());
                }
                InitEntry::Assign { name, value } => {
                    session.variables.assign(name.clone(), value.clone());
                }
                InitEntry::Referral(handler) => referral_handlers.push(handler.clone()),
                InitEntry::PlatformDirective { .. } => {}
            }
        }
        referral_handlers
    }
}

fn payload_receipt(source: EventSource, payload: &ButtonPayload) -> Receipt {
    Receipt::payload(
        source,
        serde_json::to_value(payload).unwrap_or(Value::Null),
    )
}
