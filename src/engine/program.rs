//! The immutable loaded script
//!
//! A [`Program`] maps block identifiers to ordered instruction lists, plus
//! named gallery cards and the entries of the reserved initialize block.
//! The whole document is decoded into the [`Instruction`] sum type up front:
//! an entry matching zero (or ambiguously many) instruction shapes fails
//! loading with the offending block id and index, never at run time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::condition::Predicate;
use super::error::{ScriptError, ScriptResult};
use super::normalize::normalize;

/// Reserved block executed once per platform at engine startup and per
/// session on every fetch.
pub const INITIALIZE_BLOCK: &str = "__initialize";
/// Reserved block serving as the default conversation entry point.
pub const ON_START_BLOCK: &str = "__on_start";
/// Reserved block invoked when no input handler matches.
pub const ON_UNRECOGNIZED_BLOCK: &str = "__on_unrecognized";

/// A button or quick reply attached to a text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    /// Button caption shown to the user.
    pub title: String,
    /// Block to jump to when pressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    /// External URL opened when pressed, instead of a goto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    /// Icon for quick replies that support one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Extra free-text utterances accepted as equivalent to pressing the
    /// button. A non-empty list makes the surrounding message suspend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_input: Vec<String>,
}

/// A single card of a gallery message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryCard {
    /// Card title.
    pub title: String,
    /// Card subtitle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    /// Card image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Buttons attached to the card.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
}

/// One entry of a gallery instruction before resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum GalleryItem {
    /// A literal card, passed through after substitution.
    Card(GalleryCard),
    /// References to named cards defined at the program's top level.
    Refs(Vec<String>),
    /// Pick `count` cards at random from a candidate set.
    RandomSelection {
        /// Number of cards to keep.
        count: usize,
        /// Candidate cards, shuffled independently per send.
        from: Vec<GalleryCard>,
    },
}

/// Delay specification for a scheduled task, e.g. `{wait: 10, unit: "minute"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelaySpec {
    /// Number of units to wait.
    pub wait: u64,
    /// Unit name understood by the scheduling service.
    pub unit: String,
}

/// One arm of a conditional instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalArm {
    /// Predicate guarding the arm.
    pub condition: Predicate,
    /// Block to jump to when the predicate holds.
    pub goto: String,
}

/// A single script instruction. Exactly one variant tag matches each source
/// entry; anything else is rejected at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Send text, optionally with buttons or quick replies.
    Say {
        /// Message text.
        text: String,
        /// Attached buttons (mutually exclusive with quick replies).
        buttons: Vec<Button>,
        /// Attached quick replies.
        quick_replies: Vec<Button>,
    },
    /// Suspend and store the next text reply into the named variable.
    RequestInput {
        /// Placeholder key receiving the reply.
        target: String,
    },
    /// Send an image message.
    ShowImage {
        /// Image URL.
        url: String,
    },
    /// Show a typing indicator and pause.
    Typing {
        /// Pause duration in milliseconds.
        millis: u64,
    },
    /// Send a gallery of cards.
    ShowGallery {
        /// Gallery entries, resolved per send.
        items: Vec<GalleryItem>,
        /// Platform rendering hint for card images.
        image_aspect_ratio: Option<String>,
    },
    /// Register a deferred trigger with the scheduling service.
    ScheduleTask {
        /// How long to wait before firing.
        delay: DelaySpec,
        /// Trigger name echoed back on firing.
        trigger: String,
        /// Block to jump to when the trigger fires.
        goto: Option<String>,
    },
    /// Jump to a block.
    Goto {
        /// Target block id.
        block: String,
        /// Replace the whole stack instead of pushing.
        no_return: bool,
    },
    /// Jump to one of the candidate blocks, chosen uniformly at random.
    GotoRandom {
        /// Candidate block ids.
        blocks: Vec<String>,
    },
    /// Overwrite a variable with a value-copy.
    Assign {
        /// Placeholder key.
        name: String,
        /// Value to store (substituted per execution).
        value: Value,
    },
    /// Append a value-copy to a sequence variable (assign if absent).
    Append {
        /// Placeholder key.
        name: String,
        /// Value to append (substituted per execution).
        value: Value,
    },
    /// Hand an email to the mail collaborator.
    SendEmail {
        /// Recipient addresses.
        to: Vec<String>,
        /// Subject line.
        subject: String,
        /// Plain-text body.
        body: String,
    },
    /// Shuffle the candidates and execute the first `count` of them. Every
    /// candidate must be synchronous.
    RandomSubset {
        /// Number of candidates to execute.
        count: usize,
        /// Candidate instructions.
        options: Vec<Instruction>,
    },
    /// Evaluate arms top to bottom; the first matching arm performs its goto.
    Conditional {
        /// Ordered predicate/goto arms.
        arms: Vec<ConditionalArm>,
        /// Goto taken when no arm matches.
        otherwise: Option<String>,
    },
    /// Emit a structured event to the log collaborator.
    EmitEvent {
        /// Event type name.
        event_type: String,
        /// Optional event payload (substituted per execution).
        data: Option<Value>,
        /// Ask the store to dedupe by (user, type).
        unique: bool,
        /// Marks the event as the start of a fresh logical session.
        start_new_session: bool,
    },
}

/// An entry of the reserved initialize block.
#[derive(Debug, Clone, PartialEq)]
pub enum InitEntry {
    /// Platform-level directive executed once at engine startup, for the
    /// named platform only.
    PlatformDirective {
        /// Platform the directive applies to.
        platform: String,
        /// Raw directive payload handed to the platform adapter.
        payload: Value,
    },
    /// Global text handler, persisted per session.
    GlobalInput(super::session::InputHandler),
    /// Operator-channel handler.
    OperatorInput(super::session::InputHandler),
    /// Default variable assignment applied on session fetch.
    Assign {
        /// Placeholder key.
        name: String,
        /// Default value.
        value: Value,
    },
    /// Referral handler keyed by a lowercased deep-link tag.
    Referral(super::session::ReferralHandler),
}

/// An ordered sequence of instructions.
pub type Block = Vec<Instruction>;

/// The immutable loaded script: blocks, named gallery cards, and initialize
/// entries. Provided once at startup, never mutated.
#[derive(Debug, Clone, Default)]
pub struct Program {
    blocks: HashMap<String, Block>,
    cards: HashMap<String, GalleryCard>,
    init: Vec<InitEntry>,
}

impl Program {
    /// Decode a program from its JSON document, validating every entry.
    pub fn from_json(document: &Value) -> ScriptResult<Self> {
        let root = document.as_object().ok_or(ScriptError::InvalidRoot)?;
        let mut program = Program::default();

        for (block_id, entry) in root {
            match entry {
                _ if block_id == INITIALIZE_BLOCK => {
                    let entries = entry.as_array().ok_or_else(|| invalid(
                        block_id,
                        0,
                        "initialize block must be an array of entries",
                    ))?;
                    for (index, raw) in entries.iter().enumerate() {
                        program.init.push(decode_init_entry(block_id, index, raw)?);
                    }
                }
                Value::Array(entries) => {
                    let mut block = Vec::with_capacity(entries.len());
                    for (index, raw) in entries.iter().enumerate() {
                        block.push(decode_instruction(block_id, index, raw)?);
                    }
                    program.blocks.insert(block_id.clone(), block);
                }
                Value::Object(_) => {
                    let card = decode_card(block_id, 0, entry)?;
                    program.cards.insert(block_id.clone(), card);
                }
                _ => {
                    return Err(invalid(
                        block_id,
                        0,
                        "top-level entry must be an instruction array or a gallery card",
                    ));
                }
            }
        }

        Ok(program)
    }

    /// Parse a program from JSON text.
    pub fn from_json_str(text: &str) -> ScriptResult<Self> {
        let document: Value = serde_json::from_str(text).map_err(|err| {
            ScriptError::InvalidInstruction {
                block: String::new(),
                index: 0,
                detail: format!("invalid JSON: {err}"),
            }
        })?;
        Self::from_json(&document)
    }

    /// Look up a block by id.
    pub fn block(&self, block_id: &str) -> Option<&[Instruction]> {
        self.blocks.get(block_id).map(Vec::as_slice)
    }

    /// Whether a block with this id exists.
    pub fn has_block(&self, block_id: &str) -> bool {
        self.blocks.contains_key(block_id)
    }

    /// Look up a named gallery card.
    pub fn card(&self, ref_id: &str) -> Option<&GalleryCard> {
        self.cards.get(ref_id)
    }

    /// Entries of the reserved initialize block.
    pub fn init_entries(&self) -> &[InitEntry] {
        &self.init
    }

    /// Number of loaded blocks (excluding gallery cards).
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

fn invalid(block: &str, index: usize, detail: impl Into<String>) -> ScriptError {
    ScriptError::InvalidInstruction {
        block: block.to_string(),
        index,
        detail: detail.into(),
    }
}

/// Keys that select an instruction shape. `goto` doubles as the payload of a
/// schedule instruction, which is handled before the ambiguity check.
const DISCRIMINATORS: &[&str] = &[
    "text",
    "input",
    "image_url",
    "typing",
    "gallery",
    "schedule",
    "goto",
    "goto_random",
    "assign",
    "append",
    "email_to",
    "random",
    "conditional",
    "event",
];

fn decode_instruction(block: &str, index: usize, raw: &Value) -> ScriptResult<Instruction> {
    let object = raw
        .as_object()
        .ok_or_else(|| invalid(block, index, "instruction must be a JSON object"))?;

    let mut present: Vec<&str> = DISCRIMINATORS
        .iter()
        .copied()
        .filter(|key| object.contains_key(*key))
        .collect();
    if present.contains(&"schedule") {
        present.retain(|key| *key != "goto");
    }

    match present.as_slice() {
        [] => Err(invalid(
            block,
            index,
            format!("unsupported instruction shape: {raw}"),
        )),
        [tag] => decode_tagged(block, index, tag, raw),
        many => Err(invalid(
            block,
            index,
            format!("ambiguous instruction, matches {}", many.join(", ")),
        )),
    }
}

fn decode_tagged(block: &str, index: usize, tag: &str, raw: &Value) -> ScriptResult<Instruction> {
    let field = |key: &str| raw.get(key);
    let string_field = |key: &str| -> ScriptResult<String> {
        field(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(block, index, format!("'{key}' must be a string")))
    };

    match tag {
        "text" => {
            let buttons = decode_buttons(block, index, field("buttons"))?;
            let quick_replies = decode_buttons(block, index, field("quick_replies"))?;
            if !buttons.is_empty() && !quick_replies.is_empty() {
                return Err(invalid(
                    block,
                    index,
                    "a message cannot carry both buttons and quick replies",
                ));
            }
            Ok(Instruction::Say {
                text: string_field("text")?,
                buttons,
                quick_replies,
            })
        }
        "input" => Ok(Instruction::RequestInput {
            target: string_field("input")?,
        }),
        "image_url" => Ok(Instruction::ShowImage {
            url: string_field("image_url")?,
        }),
        "typing" => {
            let millis = field("typing")
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid(block, index, "'typing' must be a duration in ms"))?;
            Ok(Instruction::Typing { millis })
        }
        "gallery" => {
            let entries = field("gallery")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(block, index, "'gallery' must be an array of items"))?;
            let mut items = Vec::with_capacity(entries.len());
            for entry in entries {
                items.push(decode_gallery_item(block, index, entry)?);
            }
            let image_aspect_ratio = field("image_aspect_ratio")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Instruction::ShowGallery {
                items,
                image_aspect_ratio,
            })
        }
        "schedule" => {
            let delay: DelaySpec = serde_json::from_value(
                field("schedule").cloned().unwrap_or(Value::Null),
            )
            .map_err(|err| invalid(block, index, format!("invalid schedule delay: {err}")))?;
            let trigger = field("trigger")
                .and_then(Value::as_str)
                .unwrap_or("no_trigger")
                .to_string();
            let goto = field("goto").and_then(Value::as_str).map(str::to_string);
            Ok(Instruction::ScheduleTask {
                delay,
                trigger,
                goto,
            })
        }
        "goto" => Ok(Instruction::Goto {
            block: string_field("goto")?,
            no_return: field("no_return").and_then(Value::as_bool).unwrap_or(false),
        }),
        "goto_random" => {
            let blocks = decode_string_list(block, index, field("goto_random"), "goto_random")?;
            if blocks.is_empty() {
                return Err(invalid(block, index, "'goto_random' needs candidates"));
            }
            Ok(Instruction::GotoRandom { blocks })
        }
        "assign" => Ok(Instruction::Assign {
            name: string_field("assign")?,
            value: field("value").cloned().unwrap_or(Value::Null),
        }),
        "append" => Ok(Instruction::Append {
            name: string_field("append")?,
            value: field("value").cloned().unwrap_or(Value::Null),
        }),
        "email_to" => Ok(Instruction::SendEmail {
            to: decode_string_list(block, index, field("email_to"), "email_to")?,
            subject: string_field("subject")?,
            body: string_field("body")?,
        }),
        "random" => {
            let count = field("random")
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid(block, index, "'random' must be a count"))?;
            let raw_options = field("options")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(block, index, "'options' must be an array"))?;
            let mut options = Vec::with_capacity(raw_options.len());
            for raw_option in raw_options {
                options.push(decode_instruction(block, index, raw_option)?);
            }
            Ok(Instruction::RandomSubset {
                count: count as usize,
                options,
            })
        }
        "conditional" => decode_conditional(block, index, field("conditional")),
        "event" => Ok(Instruction::EmitEvent {
            event_type: string_field("event")?,
            data: field("data").cloned(),
            unique: field("unique").and_then(Value::as_bool).unwrap_or(false),
            start_new_session: field("start_new_session")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        other => Err(invalid(block, index, format!("unsupported tag '{other}'"))),
    }
}

fn decode_buttons(block: &str, index: usize, raw: Option<&Value>) -> ScriptResult<Vec<Button>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    serde_json::from_value(raw.clone())
        .map_err(|err| invalid(block, index, format!("invalid buttons: {err}")))
}

fn decode_string_list(
    block: &str,
    index: usize,
    raw: Option<&Value>,
    key: &str,
) -> ScriptResult<Vec<String>> {
    raw.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| invalid(block, index, format!("'{key}' must hold strings")))
                })
                .collect()
        })
        .unwrap_or_else(|| Err(invalid(block, index, format!("'{key}' must be an array"))))
}

fn decode_card(block: &str, index: usize, raw: &Value) -> ScriptResult<GalleryCard> {
    serde_json::from_value(raw.clone())
        .map_err(|err| invalid(block, index, format!("invalid gallery card: {err}")))
}

fn decode_gallery_item(block: &str, index: usize, raw: &Value) -> ScriptResult<GalleryItem> {
    let object = raw
        .as_object()
        .ok_or_else(|| invalid(block, index, "gallery item must be an object"))?;

    if object.contains_key("refs") {
        return Ok(GalleryItem::Refs(decode_string_list(
            block,
            index,
            raw.get("refs"),
            "refs",
        )?));
    }
    if let Some(count) = object.get("random_selection") {
        let count = count
            .as_u64()
            .ok_or_else(|| invalid(block, index, "'random_selection' must be a count"))?;
        let from = raw
            .get("from")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid(block, index, "'from' must be an array of cards"))?
            .iter()
            .map(|card| decode_card(block, index, card))
            .collect::<ScriptResult<Vec<_>>>()?;
        return Ok(GalleryItem::RandomSelection {
            count: count as usize,
            from,
        });
    }
    Ok(GalleryItem::Card(decode_card(block, index, raw)?))
}

fn decode_conditional(block: &str, index: usize, raw: Option<&Value>) -> ScriptResult<Instruction> {
    let entries = raw
        .and_then(Value::as_array)
        .ok_or_else(|| invalid(block, index, "'conditional' must be an array of arms"))?;

    let mut arms = Vec::new();
    let mut otherwise = None;
    for entry in entries {
        if let Some(else_entries) = entry.get("else") {
            let target = else_entries
                .as_array()
                .and_then(|list| list.first())
                .and_then(|first| first.get("goto"))
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(block, index, "'else' must hold a goto entry"))?;
            otherwise = Some(target.to_string());
        } else if let Some(condition) = entry.get("if") {
            let condition = Predicate::from_value(condition)
                .map_err(|detail| invalid(block, index, detail))?;
            let goto = entry
                .get("goto")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(block, index, "conditional arm needs a goto"))?;
            arms.push(ConditionalArm {
                condition,
                goto: goto.to_string(),
            });
        } else {
            return Err(invalid(
                block,
                index,
                "conditional entry must carry 'if' or 'else'",
            ));
        }
    }

    Ok(Instruction::Conditional { arms, otherwise })
}

fn decode_init_entry(block: &str, index: usize, raw: &Value) -> ScriptResult<InitEntry> {
    use super::session::{InputHandler, ReferralHandler};

    let object = raw
        .as_object()
        .ok_or_else(|| invalid(block, index, "initialize entry must be an object"))?;

    if let Some(platform) = object.get("platform").and_then(Value::as_str) {
        return Ok(InitEntry::PlatformDirective {
            platform: platform.to_string(),
            payload: raw.clone(),
        });
    }
    if object.contains_key("operator_input") {
        return Ok(InitEntry::OperatorInput(InputHandler {
            user_input: normalized_utterances(block, index, raw.get("operator_input"))?,
            goto: init_goto(block, index, object)?,
        }));
    }
    if object.contains_key("user_input") {
        return Ok(InitEntry::GlobalInput(InputHandler {
            user_input: normalized_utterances(block, index, raw.get("user_input"))?,
            goto: init_goto(block, index, object)?,
        }));
    }
    if let Some(name) = object.get("assign").and_then(Value::as_str) {
        return Ok(InitEntry::Assign {
            name: name.to_string(),
            value: raw.get("value").cloned().unwrap_or(Value::Null),
        });
    }
    if let Some(tag) = object.get("referral_tag").and_then(Value::as_str) {
        return Ok(InitEntry::Referral(ReferralHandler {
            tag: tag.to_lowercase(),
            goto: init_goto(block, index, object)?,
        }));
    }

    Err(invalid(
        block,
        index,
        format!("unsupported initialize entry: {raw}"),
    ))
}

fn init_goto(
    block: &str,
    index: usize,
    object: &serde_json::Map<String, Value>,
) -> ScriptResult<String> {
    object
        .get("goto")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(block, index, "initialize handler needs a goto"))
}

fn normalized_utterances(
    block: &str,
    index: usize,
    raw: Option<&Value>,
) -> ScriptResult<Vec<String>> {
    Ok(decode_string_list(block, index, raw, "user_input")?
        .iter()
        .map(|utterance| normalize(utterance))
        .collect())
}
