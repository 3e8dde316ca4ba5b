//! Conversation turns and the history sanitizer.
//!
//! Clients send whatever history they kept locally. Backends that apply a
//! chat template insist on a strict user/assistant alternation, so every
//! inbound history passes through [`sanitize`] before it reaches prompt
//! assembly. The sanitizer never fails: turns that break the alternation are
//! dropped and the longest legal prefix survives.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human side of the conversation
    User,
    /// The character played by the backend
    Assistant,
}

impl Role {
    /// Parse a client-supplied role name. Case-insensitive; anything other
    /// than `user` or `assistant` is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// The other speaker.
    pub fn flip(self) -> Self {
        match self {
            Self::User => Self::Assistant,
            Self::Assistant => Self::User,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a conversation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// A turn exactly as the client sent it. Neither field is trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTurn {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl RawTurn {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            content: Some(content.to_string()),
        }
    }

    /// Convert into a valid turn, or `None` if the role is unknown or the
    /// trimmed content is empty.
    fn to_turn(&self) -> Option<Turn> {
        let role = Role::parse(self.role.as_deref()?)?;
        let content = self.content.as_deref()?.trim();
        if content.is_empty() {
            return None;
        }
        Some(Turn::new(role, content))
    }
}

impl From<&Turn> for RawTurn {
    fn from(turn: &Turn) -> Self {
        Self::new(turn.role.as_str(), &turn.content)
    }
}

/// A sanitized conversation history.
///
/// Non-empty histories start with a user turn, strictly alternate and end
/// with an assistant turn, so a new user turn can always be appended.
/// The only ways to obtain one are [`sanitize`] and [`History::empty`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct History {
    turns: Vec<Turn>,
}

impl History {
    /// The history of a conversation that has not started yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Number of complete user/assistant exchanges.
    pub fn pairs(&self) -> usize {
        self.turns.len() / 2
    }

    /// Round-trip back into the wire form (used to re-sanitize).
    pub fn to_raw(&self) -> Vec<RawTurn> {
        self.turns.iter().map(RawTurn::from).collect()
    }
}

/// Repair an arbitrary turn list into a legal, bounded history.
///
/// 1. Drop turns with an unknown role or blank content.
/// 2. Drop leading turns until the first one is a user turn.
/// 3. Keep a turn only if its role is the one expected next.
/// 4. Drop a trailing user turn.
/// 5. Keep the most recent `2 * max_pairs` turns.
pub fn sanitize(raw_turns: &[RawTurn], max_pairs: usize) -> History {
    let clean = raw_turns.iter().filter_map(RawTurn::to_turn);

    let mut turns = Vec::new();
    let mut expected = Role::User;
    for turn in clean.skip_while(|t| t.role != Role::User) {
        if turn.role == expected {
            turns.push(turn);
            expected = expected.flip();
        }
    }

    if turns.last().is_some_and(|t| t.role == Role::User) {
        turns.pop();
    }

    let limit = max_pairs.saturating_mul(2);
    if turns.len() > limit {
        turns.drain(..turns.len() - limit);
    }

    History { turns }
}

/// Check that a turn list satisfies the alternation invariant.
///
/// Assembly calls this on histories that should already be sanitized; an
/// `Err` here means a caller skipped [`sanitize`].
pub fn check_alternation(turns: &[Turn]) -> Result<(), Error> {
    for (i, turn) in turns.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        if turn.role != expected {
            return Err(Error::Alternation(format!(
                "turn {i} has role '{}', expected '{expected}'",
                turn.role
            )));
        }
    }
    if turns.last().is_some_and(|t| t.role == Role::User) {
        return Err(Error::Alternation(
            "history must end with an assistant turn".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> Vec<RawTurn> {
        pairs.iter().map(|(r, c)| RawTurn::new(r, c)).collect()
    }

    #[test]
    fn legal_history_is_unchanged() {
        let history = sanitize(&raw(&[("user", "a"), ("assistant", "b")]), 10);
        assert_eq!(history.turns(), &[Turn::user("a"), Turn::assistant("b")]);
    }

    #[test]
    fn leading_assistant_is_dropped() {
        let history = sanitize(&raw(&[("assistant", "x")]), 10);
        assert!(history.is_empty());
    }

    #[test]
    fn trailing_user_is_dropped() {
        let history = sanitize(
            &raw(&[("user", "a"), ("assistant", "b"), ("user", "c")]),
            10,
        );
        assert_eq!(history.len(), 2);
        assert_eq!(history.turns()[1], Turn::assistant("b"));
    }

    #[test]
    fn blank_and_unknown_turns_are_dropped() {
        let history = sanitize(
            &raw(&[
                ("system", "rules"),
                ("user", "   "),
                ("USER", " hello "),
                ("tool", "x"),
                ("Assistant", "hi there"),
            ]),
            10,
        );
        assert_eq!(
            history.turns(),
            &[Turn::user("hello"), Turn::assistant("hi there")]
        );
    }

    #[test]
    fn missing_fields_are_dropped() {
        let turns = vec![
            RawTurn {
                role: None,
                content: Some("orphan".into()),
            },
            RawTurn {
                role: Some("user".into()),
                content: None,
            },
        ];
        assert!(sanitize(&turns, 10).is_empty());
    }

    #[test]
    fn out_of_order_turns_are_skipped_not_rejected() {
        // Two users in a row: the second is discarded, the walk continues.
        let history = sanitize(
            &raw(&[
                ("user", "a"),
                ("user", "a2"),
                ("assistant", "b"),
                ("assistant", "b2"),
                ("user", "c"),
                ("assistant", "d"),
            ]),
            10,
        );
        let contents: Vec<&str> = history.turns().iter().map(Turn::content).collect();
        assert_eq!(contents, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn empty_placeholder_history_becomes_first_turn() {
        let history = sanitize(&raw(&[("user", ""), ("assistant", "")]), 10);
        assert!(history.is_empty());
    }

    #[test]
    fn keeps_only_most_recent_pairs() {
        let mut turns = Vec::new();
        for i in 0..25 {
            turns.push(RawTurn::new("user", &format!("q{i}")));
            turns.push(RawTurn::new("assistant", &format!("a{i}")));
        }
        let history = sanitize(&turns, 10);
        assert_eq!(history.len(), 20);
        assert_eq!(history.pairs(), 10);
        assert_eq!(history.turns()[0], Turn::user("q15"));
        assert_eq!(history.turns()[19], Turn::assistant("a24"));
    }

    #[test]
    fn zero_pairs_yields_empty_history() {
        let history = sanitize(&raw(&[("user", "a"), ("assistant", "b")]), 0);
        assert!(history.is_empty());
    }

    #[test]
    fn check_alternation_accepts_sanitized() {
        let history = sanitize(&raw(&[("user", "a"), ("assistant", "b")]), 10);
        assert!(check_alternation(history.turns()).is_ok());
        assert!(check_alternation(&[]).is_ok());
    }

    #[test]
    fn check_alternation_rejects_broken_sequences() {
        let err = check_alternation(&[Turn::assistant("x")]).unwrap_err();
        assert!(matches!(err, Error::Alternation(_)));

        let err = check_alternation(&[Turn::user("a")]).unwrap_err();
        assert!(err.to_string().contains("assistant"));
    }

    #[test]
    fn role_parsing() {
        assert_eq!(Role::parse("User"), Some(Role::User));
        assert_eq!(Role::parse(" assistant "), Some(Role::Assistant));
        assert_eq!(Role::parse("model"), None);
        assert_eq!(Role::User.flip(), Role::Assistant);
    }

    #[test]
    fn turn_wire_format() {
        let json = serde_json::to_string(&Turn::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn raw_turn() -> impl Strategy<Value = RawTurn> {
            let role = prop_oneof![
                Just(Some("user".to_string())),
                Just(Some("assistant".to_string())),
                Just(Some("Assistant".to_string())),
                Just(Some("system".to_string())),
                Just(None),
            ];
            let content = prop_oneof![
                Just(Some(String::new())),
                Just(Some("  ".to_string())),
                Just(None),
                "[a-z ]{1,8}".prop_map(Some),
            ];
            (role, content).prop_map(|(role, content)| RawTurn { role, content })
        }

        proptest! {
            #[test]
            fn output_satisfies_invariant(
                turns in proptest::collection::vec(raw_turn(), 0..40),
                max_pairs in 0usize..12,
            ) {
                let history = sanitize(&turns, max_pairs);
                prop_assert!(history.len() <= 2 * max_pairs);
                prop_assert!(history.len() % 2 == 0);
                prop_assert!(check_alternation(history.turns()).is_ok());
                for turn in history.turns() {
                    prop_assert!(!turn.content().trim().is_empty());
                }
            }

            #[test]
            fn sanitize_is_idempotent(
                turns in proptest::collection::vec(raw_turn(), 0..40),
                max_pairs in 0usize..12,
            ) {
                let once = sanitize(&turns, max_pairs);
                let twice = sanitize(&once.to_raw(), max_pairs);
                prop_assert_eq!(once, twice);
            }
        }
    }
}
