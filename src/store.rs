use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use time::OffsetDateTime;

/// Local record of everything observed from the workshop. Loaded wholesale at
/// startup and written back wholesale; entries are never garbage collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub collections: BTreeMap<u64, Collection>,
    #[serde(default)]
    pub workshop_items: BTreeMap<u64, WorkshopItem>,
    /// Original-cased relative paths recorded while lowercasing workshop item
    /// content, needed to restore the casing before the next download.
    #[serde(default)]
    pub path_changes: Vec<String>,
}

impl Database {
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Database::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read database {}", path.display()))?;
        let db: Database = serde_json::from_str(&raw)
            .with_context(|| format!("parse database {}", path.display()))?;
        Ok(db)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create database dir")?;
        }
        let mut raw = serde_json::to_string_pretty(self).context("serialize database")?;
        raw.push('\n');
        fs::write(path, raw).with_context(|| format!("write database {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopItem {
    #[serde(default)]
    pub creator_app_id: u64,
    #[serde(default)]
    pub time_created: i64,
    #[serde(default)]
    pub time_updated: i64,
    #[serde(default)]
    pub last_refreshed: i64,
    /// Unix seconds of the last successful download, 0 if never downloaded.
    #[serde(default)]
    pub last_downloaded: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub requires: Vec<u64>,
}

impl WorkshopItem {
    pub fn needs_download(&self) -> bool {
        self.last_downloaded <= self.time_updated
    }
}

/// Collections are replaced wholesale on every refresh, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub members: Vec<CollectionMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMember {
    pub id: u64,
    pub kind: MemberKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Item,
    Collection,
    #[serde(other)]
    Unrecognized,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn load_missing_database_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::load_or_create(&dir.path().join("db.json")).unwrap();
        assert_eq!(db, Database::default());
    }

    #[test]
    fn database_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        let mut db = Database::default();
        db.collections.insert(
            961618554,
            Collection {
                members: vec![
                    CollectionMember {
                        id: 158164864,
                        kind: MemberKind::Item,
                    },
                    CollectionMember {
                        id: 50,
                        kind: MemberKind::Collection,
                    },
                ],
            },
        );
        db.workshop_items.insert(
            463939057,
            WorkshopItem {
                creator_app_id: 107410,
                time_created: 1758384867,
                time_updated: 1758384867,
                last_refreshed: 1758384900,
                last_downloaded: 0,
                title: "Hello".to_string(),
                requires: vec![120, 2],
            },
        );
        db.path_changes.push("107410/120/Addons".to_string());

        db.save(&path).unwrap();
        let loaded = Database::load_or_create(&path).unwrap();
        assert_eq!(db, loaded);
    }

    #[test]
    fn unknown_member_kind_parses_as_unrecognized() {
        let raw = r#"{"id": 7, "kind": "hologram"}"#;
        let member: CollectionMember = serde_json::from_str(raw).unwrap();
        assert_eq!(member.kind, MemberKind::Unrecognized);
    }

    #[test]
    fn needs_download_compares_update_time() {
        let mut item = WorkshopItem {
            time_updated: 100,
            last_downloaded: 0,
            ..WorkshopItem::default()
        };
        assert!(item.needs_download());
        item.last_downloaded = 100;
        assert!(item.needs_download());
        item.last_downloaded = 101;
        assert!(!item.needs_download());
    }
}
