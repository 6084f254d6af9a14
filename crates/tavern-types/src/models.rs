use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// -- Users --

/// A user as seen by everything past the gatekeeper. Never carries a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeUser {
    pub id: i64,
    pub name: String,
    pub is_admin: bool,
    pub locale: String,
    pub theme: String,
}

// -- Sessions --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub master_id: i64,
    pub game: String,
    pub name: String,
    pub sketch: Sketch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: i64,
    pub user_id: i64,
    pub game: String,
    pub data: Value,
}

// -- Sketch --

/// The shared drawing board of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sketch {
    pub displayed: bool,
    pub paths: Vec<SketchItem>,
    pub images: Vec<SketchItem>,
    pub texts: Vec<SketchItem>,
    pub tokens: Vec<Token>,
}

/// A drawable element. Only the client-generated `id` is interpreted by the
/// server; every other attribute is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchItem {
    pub id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

pub type Token = SketchItem;

impl Sketch {
    /// Replace the token sharing `token.id`. Returns false when no such token exists.
    pub fn replace_token(&mut self, token: Token) -> bool {
        match self.tokens.iter_mut().find(|t| t.id == token.id) {
            Some(slot) => {
                *slot = token;
                true
            }
            None => false,
        }
    }
}

// -- Notes --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: i64,
    pub session_id: i64,
    pub user_id: i64,
    pub is_shared: bool,
    pub position: i64,
    pub title: String,
    pub text: String,
}

/// Partial note edit. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePatch {
    pub title: Option<String>,
    pub text: Option<String>,
    pub is_shared: Option<bool>,
}

// -- Dice --

/// Supported die sizes. Declaration order is ascending size, which `Ord` relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiceType {
    D4,
    D6,
    D8,
    D10,
    D12,
    D20,
    D100,
}

impl DiceType {
    pub fn sides(self) -> u32 {
        match self {
            Self::D4 => 4,
            Self::D6 => 6,
            Self::D8 => 8,
            Self::D10 => 10,
            Self::D12 => 12,
            Self::D20 => 20,
            Self::D100 => 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub dice: DiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollResult {
    pub dice: DiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub result: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceResult {
    pub rolls: Vec<DiceRoll>,
    pub aggregated_rolls: std::collections::BTreeMap<DiceType, u32>,
    pub results: Vec<RollResult>,
    pub total: u32,
}
