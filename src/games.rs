use crate::store::Database;
use anyhow::{Context, Result};
use serde::{
    de::{self, SeqAccess, Visitor},
    ser::SerializeSeq,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{collections::BTreeMap, fmt, fs, path::Path};

/// Operator-authored list of managed games. Read-only to the resolver and the
/// synchronizer; only the id comments are rewritten on save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GamesConfig(pub Vec<GameEntry>);

impl GamesConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read games config {}", path.display()))?;
        let games: GamesConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse games config {}", path.display()))?;
        Ok(games)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut raw = serde_json::to_string_pretty(self).context("serialize games config")?;
        raw.push('\n');
        fs::write(path, raw)
            .with_context(|| format!("write games config {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&GameEntry> {
        self.0.iter().find(|game| game.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|game| game.name.clone()).collect()
    }

    /// Refreshes every id comment from the store titles. Comments are a
    /// readability aid in the config file and carry no meaning on load.
    pub fn update_comments(&mut self, db: &Database) {
        for game in &mut self.0 {
            game.update_comments(db);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameEntry {
    pub name: String,
    pub app_id: u64,
    #[serde(default)]
    pub beta_branch: String,
    pub workshop_app_id: u64,
    #[serde(default)]
    pub make_workshop_items_lowercase: bool,
    #[serde(default)]
    pub post_install: String,
    #[serde(default)]
    pub workshop_items: Vec<IdWithComment>,
    #[serde(default)]
    pub workshop_collections: Vec<IdWithComment>,
    #[serde(default)]
    pub dependency_add: BTreeMap<u64, Vec<IdWithComment>>,
    #[serde(default)]
    pub dependency_remove: BTreeMap<u64, Vec<IdWithComment>>,
}

impl GameEntry {
    fn update_comments(&mut self, db: &Database) {
        for entry in self
            .workshop_items
            .iter_mut()
            .chain(self.dependency_add.values_mut().flatten())
            .chain(self.dependency_remove.values_mut().flatten())
        {
            if let Some(item) = db.workshop_items.get(&entry.id) {
                entry.comment = item.title.clone();
            }
        }
    }
}

/// Workshop id plus a human-readable comment, stored in JSON as either a bare
/// number or an `[id, "comment"]` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdWithComment {
    pub id: u64,
    pub comment: String,
}

impl IdWithComment {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            comment: String::new(),
        }
    }
}

impl Serialize for IdWithComment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.id)?;
        seq.serialize_element(&self.comment)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for IdWithComment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IdWithCommentVisitor)
    }
}

struct IdWithCommentVisitor;

impl<'de> Visitor<'de> for IdWithCommentVisitor {
    type Value = IdWithComment;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a workshop id or an [id, comment] pair")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        Ok(IdWithComment::new(value))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let id: u64 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        // A single-element pair keeps an empty comment.
        let comment: String = seq.next_element()?.unwrap_or_default();
        Ok(IdWithComment { id, comment })
    }
}
