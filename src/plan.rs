use crate::games::GamesConfig;
use crate::resolve::{self, ResolveError};
use crate::store::Database;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOpts {
    /// Also download items whose local copy is already up to date.
    pub download_up_to_date: bool,
    /// Ask steamcmd to validate the base game installs.
    pub validate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadPlan {
    pub games: Vec<PlannedGame>,
}

impl DownloadPlan {
    pub fn total_items(&self) -> usize {
        self.games.iter().map(|game| game.items.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannedGame {
    pub name: String,
    pub app_id: u64,
    pub beta_branch: String,
    pub validate: bool,
    pub workshop_app_id: u64,
    pub make_items_lowercase: bool,
    /// Selected items in dependency order.
    pub items: Vec<PlannedItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlannedItem {
    pub id: u64,
    pub title: String,
}

impl PlannedGame {
    /// Path of an item's content dir relative to the workshop content root.
    pub fn item_content_suffix(&self, item_id: u64) -> String {
        format!("{}/{}", self.workshop_app_id, item_id)
    }
}

/// Resolves every game's configured items and selects what to download: an
/// item is picked when it was never downloaded or the remote copy is newer,
/// or unconditionally with `download_up_to_date`. Base installs are always
/// part of the plan.
pub fn build_plan(
    db: &Database,
    games: &GamesConfig,
    opts: DownloadOpts,
) -> Result<DownloadPlan, ResolveError> {
    let mut plan = DownloadPlan::default();
    for game in &games.0 {
        let mut planned = PlannedGame {
            name: game.name.clone(),
            app_id: game.app_id,
            beta_branch: game.beta_branch.clone(),
            validate: opts.validate,
            workshop_app_id: game.workshop_app_id,
            make_items_lowercase: game.make_workshop_items_lowercase,
            items: Vec::new(),
        };
        for id in resolve::ordered_for_game(db, game)? {
            let Some(item) = db.workshop_items.get(&id) else {
                // Resolution only emits store-backed items.
                continue;
            };
            if !opts.download_up_to_date && !item.needs_download() {
                continue;
            }
            planned.items.push(PlannedItem {
                id,
                title: item.title.clone(),
            });
        }
        plan.games.push(planned);
    }
    Ok(plan)
}
