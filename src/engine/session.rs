//! Per-user persisted session state
//!
//! A [`Session`] is the sole persisted entity per (platform, user) pair: the
//! frame stack, the variable store, and the handler lists registered during
//! per-session initialization. It is loaded before every inbound event and
//! saved at the single commit point after a run reaches idle or a wait.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::error::{ScriptError, ScriptResult};

/// Reserved placeholder names populated from platform/session context rather
/// than script assignments.
pub mod predefined {
    /// Public base URL of the hosting server.
    pub const SERVER_BASE_URL: &str = "${server_base_url}";
    /// User's first name as reported by the platform.
    pub const USER_FIRST_NAME: &str = "${user_first_name}";
    /// User's last name as reported by the platform.
    pub const USER_LAST_NAME: &str = "${user_last_name}";
    /// Platform-scoped user identifier.
    pub const PLATFORM_USER_ID: &str = "${platform_user_id}";
    /// Title of the most recently pressed button.
    pub const LAST_BUTTON: &str = "${last_button}";
    /// Block id the interpreter most recently left.
    pub const LAST_BLOCK: &str = "${last_block}";
    /// Block id the interpreter most recently entered.
    pub const CURRENT_BLOCK: &str = "${current_block}";
    /// Raw text of the last user message.
    pub const LAST_USER_MESSAGE: &str = "${last_user_message}";
    /// Raw text of the last human-operator message.
    pub const LAST_OPERATOR_MESSAGE: &str = "${last_operator_message}";
    /// User locale, e.g. `en_US`.
    pub const LOCALE: &str = "${locale}";
    /// URL of the user's profile picture.
    pub const USER_PIC_URL: &str = "${user_pic_url}";
    /// Referral tag from the most recent deep link.
    pub const REFERRAL_TAG: &str = "${referral_tag}";
    /// User timezone offset.
    pub const TIMEZONE: &str = "${timezone}";
    /// Timestamp of the current session fetch (RFC 3339).
    pub const TIMESTAMP: &str = "${timestamp}";
    /// Platform-level username where available.
    pub const USERNAME: &str = "${username}";
    /// Name of the messaging platform handling this session.
    pub const PLATFORM: &str = "${platform}";
}

/// Wrap a bare variable name in placeholder syntax.
pub fn placeholder(name: &str) -> String {
    format!("${{{name}}}")
}

/// Strip placeholder syntax from a key, returning the bare name.
pub fn bare_name(key: &str) -> &str {
    key.strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(key)
}

/// Execution state of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameState {
    /// Freshly created, nothing executed yet.
    Initial,
    /// An instruction of this frame is being executed.
    Executing,
    /// The frame performed a goto and handed control to a new frame.
    Goto,
    /// The frame is suspended until an inbound event arrives.
    WaitingForReply,
}

/// A text input handler: normalized utterances mapped to a goto target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputHandler {
    /// Normalized utterances this handler accepts.
    pub user_input: Vec<String>,
    /// Block to jump to on a match.
    pub goto: String,
}

/// A referral handler: a lowercased deep-link tag mapped to a goto target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralHandler {
    /// Lowercased referral tag.
    pub tag: String,
    /// Block to jump to on a match.
    pub goto: String,
}

/// One activation of a block on the stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Block this frame executes.
    pub block_id: String,
    /// Index of the next instruction to execute. Equal to the block length
    /// when the frame is complete and due to be popped.
    pub ip: usize,
    /// Current execution state.
    pub state: FrameState,
    /// Local input handlers advertised by the last button/quick-reply
    /// message, consumed by the next text event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_input_handlers: Vec<InputHandler>,
    /// Goto targets advertised by the last button/quick-reply message.
    /// `None` means no expectation was recorded; `Some(vec![])` means a
    /// message was sent whose buttons advertise no jump targets at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_gotos: Option<Vec<String>>,
    /// Variable the next text reply should be assigned to. Mutually
    /// exclusive with `user_input_handlers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_input: Option<String>,
}

impl Frame {
    /// Create a fresh frame at the start of a block.
    pub fn new(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            ip: 0,
            state: FrameState::Initial,
            user_input_handlers: Vec::new(),
            expected_gotos: None,
            pending_input: None,
        }
    }
}

/// Session-scoped variable store.
///
/// Keys are full placeholder strings (`${name}`). The serialized form uses
/// bare names, matching the stored session document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    map: BTreeMap<String, Value>,
}

impl Variables {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable by placeholder key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Overwrite a variable with a value-copy.
    pub fn assign(&mut self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), value);
    }

    /// Append a value-copy to a sequence variable, or assign if the
    /// variable is absent. An existing non-sequence value is a script error.
    pub fn append(&mut self, key: &str, value: Value) -> ScriptResult<()> {
        match self.map.get_mut(key) {
            None => {
                self.map.insert(key.to_string(), Value::Array(vec![value]));
                Ok(())
            }
            Some(Value::Array(items)) => {
                items.push(value);
                Ok(())
            }
            Some(_) => Err(ScriptError::AppendToNonSequence(key.to_string())),
        }
    }

    /// Whether a variable holds a meaningful value. Unset, `null`, `false`,
    /// and the empty string all count as not set.
    pub fn is_set(&self, key: &str) -> bool {
        match self.map.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => !text.is_empty(),
            Some(_) => true,
        }
    }

    /// Render a variable as substitution text. String values pass through
    /// unchanged; other values render as compact JSON.
    pub fn as_text(&self, key: &str) -> Option<String> {
        match self.map.get(key)? {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Iterate over (placeholder key, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.map.iter()
    }

    /// Number of variables in the store.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Serialize for Variables {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.map.len()))?;
        for (key, value) in &self.map {
            map.serialize_entry(bare_name(key), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Variables {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VariablesVisitor;

        impl<'de> Visitor<'de> for VariablesVisitor {
            type Value = Variables;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of variable names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    let key = if key.starts_with("${") {
                        key
                    } else {
                        placeholder(&key)
                    };
                    map.insert(key, value);
                }
                Ok(Variables { map })
            }
        }

        deserializer.deserialize_map(VariablesVisitor)
    }
}

/// The persisted state of one user's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Platform-scoped user identifier.
    pub id: String,
    /// Frame stack; the last element is the active frame. Empty means idle.
    #[serde(default)]
    pub stack: Vec<Frame>,
    /// Session-scoped variables.
    #[serde(default)]
    pub variables: Variables,
    /// Global text handlers registered during initialization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_input_handlers: Vec<InputHandler>,
    /// Operator-channel handlers, persisted symmetrically with global ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_input_handlers: Vec<InputHandler>,
}

impl Session {
    /// Create a fresh session for a user: empty stack, empty variables.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stack: Vec::new(),
            variables: Variables::new(),
            global_input_handlers: Vec::new(),
            operator_input_handlers: Vec::new(),
        }
    }

    /// The currently active frame, if any.
    pub fn top_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    /// Mutable access to the currently active frame.
    pub fn top_frame_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }

    /// Whether the conversation is idle (no frames on the stack).
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholder_round_trip() {
        assert_eq!(placeholder("foo"), "${foo}");
        assert_eq!(bare_name("${foo}"), "foo");
        assert_eq!(bare_name("plain"), "plain");
    }

    #[test]
    fn append_creates_then_extends() {
        let mut vars = Variables::new();
        vars.append("${log}", json!("a")).unwrap();
        vars.append("${log}", json!("b")).unwrap();
        assert_eq!(vars.get("${log}"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn append_to_scalar_is_an_error() {
        let mut vars = Variables::new();
        vars.assign("${n}", json!(1));
        assert!(matches!(
            vars.append("${n}", json!(2)),
            Err(ScriptError::AppendToNonSequence(_))
        ));
    }

    #[test]
    fn is_set_treats_empty_as_unset() {
        let mut vars = Variables::new();
        assert!(!vars.is_set("${x}"));
        vars.assign("${x}", json!(""));
        assert!(!vars.is_set("${x}"));
        vars.assign("${x}", json!(Value::Null));
        assert!(!vars.is_set("${x}"));
        vars.assign("${x}", json!("value"));
        assert!(vars.is_set("${x}"));
        vars.assign("${x}", json!(0));
        assert!(vars.is_set("${x}"));
    }

    #[test]
    fn session_document_uses_bare_variable_names() {
        let mut session = Session::new("42");
        session.variables.assign("${name}", json!("Alice"));
        let doc = serde_json::to_value(&session).unwrap();
        assert_eq!(doc["variables"]["name"], json!("Alice"));

        let restored: Session = serde_json::from_value(doc).unwrap();
        assert_eq!(restored.variables.get("${name}"), Some(&json!("Alice")));
    }

    #[test]
    fn frame_wait_state_survives_serialization() {
        let mut frame = Frame::new("greet");
        frame.ip = 1;
        frame.state = FrameState::WaitingForReply;
        frame.expected_gotos = Some(vec!["yes-block".into()]);
        frame.user_input_handlers = vec![InputHandler {
            user_input: vec!["yes".into()],
            goto: "yes-block".into(),
        }];

        let json = serde_json::to_string(&frame).unwrap();
        let restored: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, frame);
    }
}
