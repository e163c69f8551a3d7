//! Variable substitution engine
//!
//! Placeholders use `${name}` syntax. Text substitution replaces every
//! occurrence with the variable's current value, or the literal `<no value>`
//! marker when unset; it never fails. Instruction expansion deep-copies the
//! instruction and substitutes its user-facing fields: message text, URLs,
//! button and gallery subtrees, mail fields, and assigned values. Structural
//! fields (goto targets, variable names, counts, nested instruction lists)
//! are left alone; nested groups substitute at their own execution time.
//!
//! A value of the form `{"deref": "${name}"}` is replaced by the variable's
//! raw value rather than rendered text, letting numbers and structured data
//! flow through assignments and event payloads.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use super::program::{Button, GalleryCard, GalleryItem, Instruction};
use super::session::Variables;

/// Marker substituted for placeholders with no assigned value.
pub const NO_VALUE: &str = "<no value>";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{[^}]+\}").expect("placeholder pattern"));

/// Replace every placeholder in `text` with its current value.
pub fn substitute_text(text: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(text, |captures: &regex::Captures<'_>| {
            let key = captures.get(0).expect("whole match").as_str();
            vars.as_text(key).unwrap_or_else(|| NO_VALUE.to_string())
        })
        .into_owned()
}

/// Substitute every string inside a JSON value, resolving `deref` markers to
/// raw variable values.
pub fn substitute_value(value: &Value, vars: &Variables) -> Value {
    if let Some(key) = deref_key(value) {
        return vars.get(key).cloned().unwrap_or(Value::Null);
    }
    match value {
        Value::String(text) => Value::String(substitute_text(text, vars)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, vars))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, field)| (key.clone(), substitute_value(field, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn deref_key(value: &Value) -> Option<&str> {
    value.as_object()?.get("deref")?.as_str()
}

fn substitute_button(button: &Button, vars: &Variables) -> Button {
    Button {
        title: substitute_text(&button.title, vars),
        goto: button
            .goto
            .as_deref()
            .map(|goto| substitute_text(goto, vars)),
        web_url: button
            .web_url
            .as_deref()
            .map(|url| substitute_text(url, vars)),
        image_url: button
            .image_url
            .as_deref()
            .map(|url| substitute_text(url, vars)),
        user_input: button
            .user_input
            .iter()
            .map(|utterance| substitute_text(utterance, vars))
            .collect(),
    }
}

/// Substitute every string field of a gallery card, buttons included.
pub fn substitute_card(card: &GalleryCard, vars: &Variables) -> GalleryCard {
    GalleryCard {
        title: substitute_text(&card.title, vars),
        subtitle: card
            .subtitle
            .as_deref()
            .map(|subtitle| substitute_text(subtitle, vars)),
        image_url: card
            .image_url
            .as_deref()
            .map(|url| substitute_text(url, vars)),
        buttons: card
            .buttons
            .iter()
            .map(|button| substitute_button(button, vars))
            .collect(),
    }
}

fn substitute_gallery_item(item: &GalleryItem, vars: &Variables) -> GalleryItem {
    match item {
        GalleryItem::Card(card) => GalleryItem::Card(substitute_card(card, vars)),
        GalleryItem::Refs(refs) => GalleryItem::Refs(
            refs.iter()
                .map(|reference| substitute_text(reference, vars))
                .collect(),
        ),
        GalleryItem::RandomSelection { count, from } => GalleryItem::RandomSelection {
            count: *count,
            from: from.iter().map(|card| substitute_card(card, vars)).collect(),
        },
    }
}

/// Expand an instruction against the current variables, returning a deep
/// copy. The stored program is never mutated.
pub fn substitute_instruction(instr: &Instruction, vars: &Variables) -> Instruction {
    match instr {
        Instruction::Say {
            text,
            buttons,
            quick_replies,
        } => Instruction::Say {
            text: substitute_text(text, vars),
            buttons: buttons
                .iter()
                .map(|button| substitute_button(button, vars))
                .collect(),
            quick_replies: quick_replies
                .iter()
                .map(|button| substitute_button(button, vars))
                .collect(),
        },
        Instruction::ShowImage { url } => Instruction::ShowImage {
            url: substitute_text(url, vars),
        },
        Instruction::ShowGallery {
            items,
            image_aspect_ratio,
        } => Instruction::ShowGallery {
            items: items
                .iter()
                .map(|item| substitute_gallery_item(item, vars))
                .collect(),
            image_aspect_ratio: image_aspect_ratio.clone(),
        },
        Instruction::Assign { name, value } => Instruction::Assign {
            name: name.clone(),
            value: substitute_value(value, vars),
        },
        Instruction::Append { name, value } => Instruction::Append {
            name: name.clone(),
            value: substitute_value(value, vars),
        },
        Instruction::SendEmail { to, subject, body } => Instruction::SendEmail {
            to: to
                .iter()
                .map(|address| substitute_text(address, vars))
                .collect(),
            subject: substitute_text(subject, vars),
            body: substitute_text(body, vars),
        },
        Instruction::EmitEvent {
            event_type,
            data,
            unique,
            start_new_session,
        } => Instruction::EmitEvent {
            event_type: event_type.clone(),
            data: data.as_ref().map(|data| substitute_value(data, vars)),
            unique: *unique,
            start_new_session: *start_new_session,
        },
        // Structural instructions carry no user-facing strings; random-group
        // candidates and conditional operands substitute when executed.
        Instruction::RequestInput { .. }
        | Instruction::Typing { .. }
        | Instruction::ScheduleTask { .. }
        | Instruction::Goto { .. }
        | Instruction::GotoRandom { .. }
        | Instruction::RandomSubset { .. }
        | Instruction::Conditional { .. } => instr.clone(),
    }
}
