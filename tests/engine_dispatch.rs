use std::collections::HashMap;
use std::sync::{Arc, Once};

use async_trait::async_trait;
use colloquy::engine::memory::MemoryStore;
use colloquy::engine::message::{ButtonPayload, OutboundMessage};
use colloquy::engine::ports::{Conversation, Mailer, PlatformInit, TaskId, TaskScheduler};
use colloquy::engine::program::DelaySpec;
use colloquy::{Engine, EngineConfig, Program, RequestContext};
use parking_lot::Mutex;
use serde_json::{Value, json};

struct SilentConversation;

#[async_trait]
impl Conversation for SilentConversation {
    async fn send(&self, _message: &OutboundMessage) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_user_variables(&self) -> anyhow::Result<Option<HashMap<String, Value>>> {
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingScheduler {
    scheduled: Mutex<Vec<(TaskId, String, DelaySpec)>>,
}

#[async_trait]
impl TaskScheduler for RecordingScheduler {
    async fn schedule(
        &self,
        task_id: &TaskId,
        _platform: &str,
        _user_id: &str,
        delay: &DelaySpec,
        trigger: &str,
    ) -> anyhow::Result<()> {
        self.scheduled
            .lock()
            .push((task_id.clone(), trigger.to_string(), delay.clone()));
        Ok(())
    }
}

struct NullMailer;

#[async_trait]
impl Mailer for NullMailer {
    async fn send_email(&self, _to: &[String], _subject: &str, _body: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

struct GreetingPlatform {
    directives: Mutex<Vec<Value>>,
}

#[async_trait]
impl PlatformInit for GreetingPlatform {
    fn platform(&self) -> &str {
        "test"
    }

    async fn process_init_directive(&self, payload: &Value) -> anyhow::Result<()> {
        self.directives.lock().push(payload.clone());
        Ok(())
    }
}

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

struct TestBed {
    store: Arc<MemoryStore>,
    scheduler: Arc<RecordingScheduler>,
    engine: Engine,
}

impl TestBed {
    fn new(script: Value) -> Self {
        init_tracing();
        let program = Arc::new(Program::from_json(&script).unwrap());
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = Engine::new(
            program,
            store.clone(),
            scheduler.clone(),
            Arc::new(NullMailer),
            EngineConfig {
                debug_delay: true,
                ..EngineConfig::default()
            },
        );
        Self {
            store,
            scheduler,
            engine,
        }
    }

    fn ctx(&self, user_id: &str) -> RequestContext {
        RequestContext::new("test", user_id, Arc::new(SilentConversation))
    }

    fn sent_texts(&self, user_id: &str) -> Vec<String> {
        self.store
            .sent_messages(user_id)
            .iter()
            .filter_map(|message| match message {
                OutboundMessage::Text { text }
                | OutboundMessage::TextWithButtons { text, .. }
                | OutboundMessage::TextWithQuickReplies { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

fn script() -> Value {
    json!({
        "__initialize": [
            {"platform": "test", "greeting": "Hello there"},
            {"platform": "other", "greeting": "Elsewhere"},
            {"user_input": ["help", "help me"], "goto": "help"},
            {"operator_input": ["take over"], "goto": "operator-block"},
            {"assign": "${mood}", "value": "neutral"},
            {"referral_tag": "Summer-Promo", "goto": "promo"}
        ],
        "__on_start": [{"text": "Welcome"}],
        "help": [{"text": "Helping."}],
        "operator-block": [{"text": "An operator will join."}],
        "promo": [{"text": "Summer promo!"}],
        "reminder": [
            {"schedule": {"wait": 10, "unit": "minute"}, "trigger": "nudge", "goto": "follow-up"}
        ],
        "follow-up": [{"text": "Still there?"}]
    })
}

#[tokio::test]
async fn initialize_runs_only_matching_platform_directives() {
    let bed = TestBed::new(script());
    let platform = GreetingPlatform {
        directives: Mutex::new(Vec::new()),
    };

    bed.engine.initialize(&platform).await.unwrap();
    let directives = platform.directives.lock();
    assert_eq!(directives.len(), 1);
    assert_eq!(directives[0]["greeting"], json!("Hello there"));
}

#[tokio::test]
async fn first_text_enters_the_start_block() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");

    bed.engine.on_text(&ctx, "anything").await.unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome"]);
}

#[tokio::test]
async fn first_text_still_routes_through_handlers() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");

    // A matching first message goes to its handler, not the start block,
    // and is stored like any other inbound text.
    bed.engine.on_text(&ctx, "help").await.unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Helping."]);

    let session = bed.store.session("test", "u1").unwrap();
    assert_eq!(
        session.variables.as_text("${last_user_message}"),
        Some("help".to_string())
    );
}

#[tokio::test]
async fn global_handler_matches_after_normalization() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");
    bed.engine.on_text(&ctx, "hi").await.unwrap();

    bed.engine.on_text(&ctx, "  HELP, me!! ").await.unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome", "Helping."]);
}

#[tokio::test]
async fn operator_text_only_consults_operator_handlers() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");
    bed.engine.on_text(&ctx, "hi").await.unwrap();

    // A global-handler utterance on the operator channel does nothing.
    bed.engine.on_operator_text(&ctx, "help").await.unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome"]);

    bed.engine.on_operator_text(&ctx, "Take over").await.unwrap();
    assert_eq!(
        bed.sent_texts("u1"),
        vec!["Welcome", "An operator will join."]
    );
}

#[tokio::test]
async fn referral_tags_match_case_insensitively() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");

    let handled = bed
        .engine
        .on_referral(&ctx, Some("SUMMER-promo"))
        .await
        .unwrap();
    assert!(handled);
    assert_eq!(bed.sent_texts("u1"), vec!["Summer promo!"]);

    let handled = bed.engine.on_referral(&ctx, Some("unknown")).await.unwrap();
    assert!(!handled);
}

#[tokio::test]
async fn button_press_jumps_and_records_the_title() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");
    bed.engine.on_text(&ctx, "hi").await.unwrap();

    let payload = ButtonPayload {
        goto: Some("promo".to_string()),
        title: Some("Open promo".to_string()),
    };
    bed.engine.on_button(&ctx, &payload).await.unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome", "Summer promo!"]);

    let session = bed.store.session("test", "u1").unwrap();
    assert_eq!(
        session.variables.as_text("${last_button}"),
        Some("Open promo".to_string())
    );
}

#[tokio::test]
async fn first_button_without_target_enters_the_start_block() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");

    bed.engine
        .on_button(&ctx, &ButtonPayload::default())
        .await
        .unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome"]);
}

#[tokio::test]
async fn schedule_instruction_records_then_arms_a_trigger() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");

    bed.engine.start_with_block(&ctx, "reminder").await.unwrap();
    let scheduled = bed.scheduler.scheduled.lock();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].1, "nudge");
    assert_eq!(scheduled[0].2.wait, 10);
    drop(scheduled);
    assert_eq!(bed.store.pending_task_count(), 1);
}

#[tokio::test]
async fn fired_trigger_consumes_the_task_and_resumes() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");
    bed.engine.on_text(&ctx, "hi").await.unwrap();
    bed.engine.start_with_block(&ctx, "reminder").await.unwrap();

    let task_id = bed.scheduler.scheduled.lock()[0].0.clone();
    bed.engine
        .on_scheduled_trigger(&ctx, &task_id, "nudge")
        .await
        .unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome", "Still there?"]);
    assert_eq!(bed.store.pending_task_count(), 0);

    // A second firing finds the record already consumed and is a no-op.
    bed.engine
        .on_scheduled_trigger(&ctx, &task_id, "nudge")
        .await
        .unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome", "Still there?"]);
}

#[tokio::test]
async fn mismatched_trigger_name_drops_the_fired_task() {
    let bed = TestBed::new(script());
    let ctx = bed.ctx("u1");
    bed.engine.on_text(&ctx, "hi").await.unwrap();
    bed.engine.start_with_block(&ctx, "reminder").await.unwrap();

    let task_id = bed.scheduler.scheduled.lock()[0].0.clone();
    bed.engine
        .on_scheduled_trigger(&ctx, &task_id, "somebody-else")
        .await
        .unwrap();
    assert_eq!(bed.sent_texts("u1"), vec!["Welcome"]);
    assert_eq!(bed.store.pending_task_count(), 0);
}

#[tokio::test]
async fn unique_events_collapse_across_turns() {
    let bed = TestBed::new(json!({
        "a": [{"event": "signup", "unique": true, "data": {"plan": "${mood}"}}]
    }));
    let ctx = bed.ctx("u1");

    bed.engine.start_with_block(&ctx, "a").await.unwrap();
    bed.engine.start_with_block(&ctx, "a").await.unwrap();
    let events = bed.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "signup");
    assert_eq!(events[0].current_block, "a");
}

#[tokio::test]
async fn substitute_preview_reads_without_running() {
    let bed = TestBed::new(json!({
        "a": [{"assign": "${name}", "value": "Ada"}]
    }));
    let ctx = bed.ctx("u1");
    bed.engine.start_with_block(&ctx, "a").await.unwrap();

    let preview = bed
        .engine
        .substitute_preview(&ctx, "Hi ${name}, regarding ${missing}")
        .await
        .unwrap();
    assert_eq!(preview, "Hi Ada, regarding <no value>");
    // Preview leaves the message log untouched.
    assert!(bed.store.sent_messages("u1").is_empty());
}

#[tokio::test]
async fn concurrent_events_for_one_user_serialize() {
    let bed = TestBed::new(json!({
        "__on_start": [{"text": "Welcome"}],
        "count": [{"append": "${turns}", "value": 1}]
    }));
    let ctx = bed.ctx("u1");
    bed.engine.on_text(&ctx, "hi").await.unwrap();

    let engine = Arc::new(bed.engine);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            engine.start_with_block(&ctx, "count").await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let session = bed.store.session("test", "u1").unwrap();
    assert_eq!(
        session.variables.get("${turns}"),
        Some(&json!([1, 1, 1, 1, 1, 1, 1, 1]))
    );
}
