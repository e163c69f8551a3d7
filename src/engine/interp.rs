//! The interpreter: frame-stack execution over one session
//!
//! [`ExecutionContext`] drives the fetch-decode-execute loop for a single
//! user's session: pop completed frames, execute the instruction under the
//! pointer, suspend on wait conditions. It also implements the
//! input-handling state machine that routes inbound text through pending
//! input targets, local handlers, global handlers, and the unrecognized
//! fallback, in that order.

use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::error::{EngineError, EngineResult, ScriptError};
use super::message::{ButtonPayload, OutboundMessage, TaskPayload, UserEvent};
use super::normalize::normalize;
use super::program::{Button, GalleryCard, GalleryItem, Instruction, ON_UNRECOGNIZED_BLOCK, Program};
use super::ports::{Mailer, ScheduledTask, SessionStore, TaskScheduler};
use super::session::{
    Frame, FrameState, InputHandler, ReferralHandler, Session, predefined,
};
use super::subst::{substitute_card, substitute_instruction};
use super::{EngineConfig, RequestContext};

/// Outcome of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The loop proceeds to the next instruction.
    Continue,
    /// The loop suspends; the session stays parked at this point.
    Wait,
}

/// Local input context consumed from a waiting frame: at most one of the
/// two fields is populated.
#[derive(Debug, Default)]
struct LocalInput {
    handlers: Vec<InputHandler>,
    pending_input: Option<String>,
}

/// Push or replace frames for a jump to `target`.
///
/// A waiting frame with recorded expectations collapses the stack when the
/// jump is not among them; a frame waiting on a named input likewise never
/// survives an external jump. Otherwise the new frame is pushed and control
/// returns to the caller when it falls off the end of its block.
pub(crate) fn apply_goto(session: &mut Session, target: &str, mut no_return: bool) {
    if !no_return {
        if let Some(top) = session.top_frame() {
            if top.state == FrameState::WaitingForReply {
                if let Some(expected) = &top.expected_gotos {
                    if !expected.iter().any(|goto| goto == target) {
                        no_return = true;
                    }
                } else if top.pending_input.is_some() {
                    no_return = true;
                }
            }
        }
    }

    if let Some(top) = session.top_frame_mut() {
        top.state = FrameState::Goto;
    }
    if let Some(previous) = session.top_frame().map(|frame| frame.block_id.clone()) {
        session
            .variables
            .assign(predefined::LAST_BLOCK, Value::String(previous));
    }
    session
        .variables
        .assign(predefined::CURRENT_BLOCK, Value::String(target.to_string()));

    let frame = Frame::new(target);
    if no_return {
        session.stack = vec![frame];
    } else {
        session.stack.push(frame);
    }
}

/// One session's interpreter run: owns the mutable session for the duration
/// of a single inbound event.
pub struct ExecutionContext<'a> {
    program: &'a Program,
    session: &'a mut Session,
    ctx: &'a RequestContext,
    store: &'a dyn SessionStore,
    scheduler: &'a dyn TaskScheduler,
    mailer: &'a dyn Mailer,
    config: &'a EngineConfig,
    referral_handlers: Vec<ReferralHandler>,
    executed: usize,
}

impl<'a> ExecutionContext<'a> {
    /// Create an interpreter over one session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        program: &'a Program,
        session: &'a mut Session,
        ctx: &'a RequestContext,
        store: &'a dyn SessionStore,
        scheduler: &'a dyn TaskScheduler,
        mailer: &'a dyn Mailer,
        config: &'a EngineConfig,
        referral_handlers: Vec<ReferralHandler>,
    ) -> Self {
        Self {
            program,
            session,
            ctx,
            store,
            scheduler,
            mailer,
            config,
            referral_handlers,
            executed: 0,
        }
    }

    /// Jump to a block and run the loop until idle or a wait point.
    pub async fn do_goto(&mut self, target: &str) -> EngineResult<()> {
        self.goto(target, false);
        self.run().await
    }

    fn goto(&mut self, target: &str, no_return: bool) {
        debug!(target, no_return, "goto");
        apply_goto(self.session, target, no_return);
    }

    /// Drive the fetch-decode-execute loop until the stack empties or an
    /// instruction suspends.
    pub async fn run(&mut self) -> EngineResult<()> {
        loop {
            let Some(frame) = self.session.top_frame() else {
                break;
            };
            let block_id = frame.block_id.clone();
            let ip = frame.ip;
            let block = self
                .program
                .block(&block_id)
                .ok_or_else(|| ScriptError::UnresolvedBlock(block_id.clone()))?;

            if ip >= block.len() {
                self.session.stack.pop();
                continue;
            }
            if self.executed >= self.config.instruction_budget {
                return Err(ScriptError::BudgetExhausted {
                    budget: self.config.instruction_budget,
                    block: block_id,
                }
                .into());
            }

            let instr = block[ip].clone();
            if let Some(frame) = self.session.top_frame_mut() {
                frame.ip = ip + 1;
                frame.state = FrameState::Executing;
            }
            debug!(block = %block_id, ip, "executing");
            if self.execute(&instr).await? == Step::Wait {
                break;
            }
        }
        Ok(())
    }

    /// Execute one instruction. Boxed because random groups recurse.
    fn execute<'b>(&'b mut self, instr: &'b Instruction) -> BoxFuture<'b, EngineResult<Step>> {
        Box::pin(async move {
            self.executed += 1;
            let instr = substitute_instruction(instr, &self.session.variables);
            match &instr {
                Instruction::Say {
                    text,
                    buttons,
                    quick_replies,
                } => {
                    if !quick_replies.is_empty() {
                        self.send(OutboundMessage::TextWithQuickReplies {
                            text: text.clone(),
                            quick_replies: quick_replies.clone(),
                        })
                        .await?;
                        self.arm_reply_wait(quick_replies);
                        Ok(Step::Wait)
                    } else if !buttons.is_empty() {
                        self.send(OutboundMessage::TextWithButtons {
                            text: text.clone(),
                            buttons: buttons.clone(),
                        })
                        .await?;
                        self.arm_reply_wait(buttons);
                        // Buttons stay clickable while the script continues;
                        // only a free-text accept list requires a reply now.
                        if buttons.iter().any(|button| !button.user_input.is_empty()) {
                            Ok(Step::Wait)
                        } else {
                            Ok(Step::Continue)
                        }
                    } else {
                        self.send(OutboundMessage::Text { text: text.clone() }).await?;
                        Ok(Step::Continue)
                    }
                }
                Instruction::RequestInput { target } => {
                    if let Some(top) = self.session.top_frame_mut() {
                        top.state = FrameState::WaitingForReply;
                        top.pending_input = Some(target.clone());
                        top.user_input_handlers.clear();
                        top.expected_gotos = None;
                    }
                    Ok(Step::Wait)
                }
                Instruction::ShowImage { url } => {
                    self.send(OutboundMessage::Image { url: url.clone() }).await?;
                    Ok(Step::Continue)
                }
                Instruction::Typing { millis } => {
                    self.send(OutboundMessage::TypingOn).await?;
                    let pause = if self.config.debug_delay { 1 } else { *millis };
                    tokio::time::sleep(std::time::Duration::from_millis(pause)).await;
                    Ok(Step::Continue)
                }
                Instruction::ShowGallery {
                    items,
                    image_aspect_ratio,
                } => {
                    let cards = self.resolve_gallery(items)?;
                    self.send(OutboundMessage::Gallery {
                        cards,
                        image_aspect_ratio: image_aspect_ratio.clone(),
                    })
                    .await?;
                    Ok(Step::Continue)
                }
                Instruction::ScheduleTask {
                    delay,
                    trigger,
                    goto,
                } => {
                    let task = ScheduledTask {
                        platform: self.ctx.platform.clone(),
                        user_id: self.ctx.user_id.clone(),
                        delay: delay.clone(),
                        trigger: trigger.clone(),
                        payload: TaskPayload { goto: goto.clone() },
                    };
                    match self.store.record_scheduled_task(&task).await {
                        Ok(id) => {
                            match self
                                .scheduler
                                .schedule(&id, &self.ctx.platform, &self.ctx.user_id, delay, trigger)
                                .await
                            {
                                Ok(()) => debug!(task = %id, trigger, "scheduled task"),
                                Err(err) => {
                                    warn!(error = %err, trigger, "failed to arm scheduled task");
                                }
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, trigger, "failed to record scheduled task");
                        }
                    }
                    Ok(Step::Continue)
                }
                Instruction::Goto { block, no_return } => {
                    self.goto(block, *no_return);
                    Ok(Step::Continue)
                }
                Instruction::GotoRandom { blocks } => {
                    let choice = {
                        let mut rng = rand::thread_rng();
                        blocks.choose(&mut rng).cloned()
                    };
                    if let Some(choice) = choice {
                        self.goto(&choice, false);
                    }
                    Ok(Step::Continue)
                }
                Instruction::Assign { name, value } => {
                    self.session.variables.assign(name.clone(), value.clone());
                    Ok(Step::Continue)
                }
                Instruction::Append { name, value } => {
                    self.session.variables.append(name, value.clone())?;
                    Ok(Step::Continue)
                }
                Instruction::SendEmail { to, subject, body } => {
                    if let Err(err) = self.mailer.send_email(to, subject, body).await {
                        error!(error = %err, "email delivery failed");
                    }
                    Ok(Step::Continue)
                }
                Instruction::RandomSubset { count, options } => {
                    if *count > 0 {
                        let mut chosen = options.clone();
                        {
                            let mut rng = rand::thread_rng();
                            chosen.shuffle(&mut rng);
                        }
                        chosen.truncate(*count);
                        for option in &chosen {
                            if self.execute(option).await? == Step::Wait {
                                return Err(ScriptError::AsyncInRandomGroup(format!(
                                    "{option:?}"
                                ))
                                .into());
                            }
                        }
                    }
                    Ok(Step::Continue)
                }
                Instruction::Conditional { arms, otherwise } => {
                    for arm in arms {
                        if arm.condition.evaluate(&self.session.variables) {
                            self.goto(&arm.goto, false);
                            return Ok(Step::Continue);
                        }
                    }
                    if let Some(target) = otherwise {
                        self.goto(target, false);
                    }
                    Ok(Step::Continue)
                }
                Instruction::EmitEvent {
                    event_type,
                    data,
                    unique,
                    start_new_session,
                } => {
                    let current_block = self
                        .session
                        .top_frame()
                        .map(|frame| frame.block_id.clone())
                        .unwrap_or_default();
                    let event = UserEvent {
                        user_id: self.ctx.user_id.clone(),
                        event_type: event_type.clone(),
                        current_block,
                        data: data.clone(),
                        unique: *unique,
                        start_new_session: *start_new_session,
                    };
                    info!(event_type = %event.event_type, user = %event.user_id, "user event");
                    self.store
                        .append_event(&event)
                        .await
                        .map_err(EngineError::Storage)?;
                    Ok(Step::Continue)
                }
            }
        })
    }

    fn resolve_gallery(&self, items: &[GalleryItem]) -> EngineResult<Vec<GalleryCard>> {
        let mut cards = Vec::new();
        for item in items {
            match item {
                GalleryItem::Card(card) => cards.push(card.clone()),
                GalleryItem::Refs(refs) => {
                    for reference in refs {
                        let card = self
                            .program
                            .card(reference)
                            .ok_or_else(|| ScriptError::UnresolvedGalleryItem(reference.clone()))?;
                        cards.push(substitute_card(card, &self.session.variables));
                    }
                }
                GalleryItem::RandomSelection { count, from } => {
                    let mut pool = from.clone();
                    let mut rng = rand::thread_rng();
                    pool.shuffle(&mut rng);
                    pool.truncate(*count);
                    cards.extend(pool);
                }
            }
        }
        Ok(cards)
    }

    /// Record wait context from a button or quick-reply message on the
    /// current frame. Clears any pending named input (the two are mutually
    /// exclusive).
    fn arm_reply_wait(&mut self, buttons: &[Button]) {
        let expected: Vec<String> = buttons
            .iter()
            .filter_map(|button| button.goto.clone())
            .collect();
        let handlers: Vec<InputHandler> = buttons
            .iter()
            .filter_map(|button| {
                button.goto.clone().map(|goto| InputHandler {
                    user_input: std::iter::once(normalize(&button.title))
                        .chain(button.user_input.iter().map(|utterance| normalize(utterance)))
                        .collect(),
                    goto,
                })
            })
            .collect();
        if let Some(top) = self.session.top_frame_mut() {
            top.state = FrameState::WaitingForReply;
            top.expected_gotos = Some(expected);
            top.user_input_handlers = handlers;
            top.pending_input = None;
        }
    }

    async fn send(&mut self, message: OutboundMessage) -> EngineResult<()> {
        if let Err(err) = self.ctx.conversation.send(&message).await {
            // Delivery failure is logged, not fatal; the attempt is still
            // recorded in the message log.
            error!(error = %err, user = %self.ctx.user_id, "message delivery failed");
        }
        self.store
            .append_sent(&self.ctx.platform, &self.ctx.user_id, &message)
            .await
            .map_err(EngineError::Storage)
    }

    /// Consume the local input context of the waiting frame, if any. The
    /// frame keeps its expected gotos; only the one-shot handlers and the
    /// pending input target are removed.
    fn take_local_input(&mut self) -> LocalInput {
        match self.session.top_frame_mut() {
            Some(top) => LocalInput {
                handlers: std::mem::take(&mut top.user_input_handlers),
                pending_input: top.pending_input.take(),
            },
            None => LocalInput::default(),
        }
    }

    /// Route inbound text through the input-handling state machine: pending
    /// input target, then local handlers, then global handlers. When nothing
    /// matches, `fallback` (the start block on a first-contact turn) wins
    /// over the unrecognized block.
    pub async fn handle_text(&mut self, text: &str, fallback: Option<&str>) -> EngineResult<()> {
        self.session
            .variables
            .assign(predefined::LAST_USER_MESSAGE, Value::String(text.to_string()));

        let local = self.take_local_input();
        if let Some(target) = local.pending_input {
            self.session
                .variables
                .assign(target, Value::String(text.to_string()));
            return self.run().await;
        }

        let normalized = normalize(text);
        if self.dispatch_input(&normalized, &local.handlers).await? {
            return Ok(());
        }
        let global = self.session.global_input_handlers.clone();
        if self.dispatch_input(&normalized, &global).await? {
            return Ok(());
        }
        if let Some(target) = fallback {
            return self.do_goto(target).await;
        }
        if self.program.has_block(ON_UNRECOGNIZED_BLOCK) {
            return self.do_goto(ON_UNRECOGNIZED_BLOCK).await;
        }
        // Nothing consumed the reply; the wait stays armed for the next one.
        if !local.handlers.is_empty() {
            if let Some(top) = self.session.top_frame_mut() {
                if top.state == FrameState::WaitingForReply {
                    top.user_input_handlers = local.handlers;
                }
            }
        }
        debug!(user = %self.ctx.user_id, "no handler matched; turn is a no-op");
        Ok(())
    }

    /// Route a button press or quick-reply selection. The payload's title
    /// is recorded before the jump so the target block can read which
    /// button brought the user there. A payload without a goto falls back
    /// to `fallback` when one is given (the get-started case).
    pub async fn handle_button(
        &mut self,
        payload: &ButtonPayload,
        fallback: Option<&str>,
    ) -> EngineResult<()> {
        if let Some(title) = &payload.title {
            self.session
                .variables
                .assign(predefined::LAST_BUTTON, Value::String(title.clone()));
        }
        match (&payload.goto, fallback) {
            (Some(target), _) => self.do_goto(target).await,
            (None, Some(target)) => self.do_goto(target).await,
            (None, None) => {
                debug!(user = %self.ctx.user_id, "button press without a jump target");
                Ok(())
            }
        }
    }

    /// Route an operator message: only operator handlers are consulted.
    pub async fn handle_operator_text(&mut self, text: &str) -> EngineResult<()> {
        self.session.variables.assign(
            predefined::LAST_OPERATOR_MESSAGE,
            Value::String(text.to_string()),
        );
        let handlers = self.session.operator_input_handlers.clone();
        self.dispatch_input(&normalize(text), &handlers).await?;
        Ok(())
    }

    /// Store the referral tag and jump when a handler matches. Returns
    /// whether the referral was handled.
    pub async fn handle_referral(&mut self, tag: Option<&str>) -> EngineResult<bool> {
        self.session.variables.assign(
            predefined::REFERRAL_TAG,
            tag.map(|tag| Value::String(tag.to_string()))
                .unwrap_or(Value::Null),
        );
        if let Some(tag) = tag {
            let tag = tag.to_lowercase();
            let handlers = self.referral_handlers.clone();
            for handler in &handlers {
                if handler.tag == tag {
                    self.do_goto(&handler.goto).await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn dispatch_input(
        &mut self,
        normalized: &str,
        handlers: &[InputHandler],
    ) -> EngineResult<bool> {
        for handler in handlers {
            if handler
                .user_input
                .iter()
                .any(|expected| expected == normalized)
            {
                self.do_goto(&handler.goto).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}
