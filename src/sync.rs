use crate::cancel::{CancelToken, Cancelled};
use crate::games::GamesConfig;
use crate::store::{now_unix, Collection, Database, MemberKind, WorkshopItem};
use crate::workshop::CatalogSource;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, warn};

/// The batch lookup endpoints take up to this many ids per call.
pub const BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching {what} failed")]
    Fetch {
        what: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("workshop item {0} not in the store on requirement update")]
    Consistency(u64),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Brings the store up to date with the remote catalog: the collection
/// closure first, then the item metadata closure with a per-item requirement
/// refresh for anything new or updated. Safe to re-run; a fetch failure
/// leaves the mutations of completed batches in place.
pub fn sync_catalog(
    cancel: &CancelToken,
    source: &dyn CatalogSource,
    db: &mut Database,
    games: &GamesConfig,
) -> Result<(), SyncError> {
    let discovered = sync_collections(cancel, source, db, games)?;
    let seed = seed_items(db, games, discovered);
    sync_items(cancel, source, db, seed)
}

fn sync_collections(
    cancel: &CancelToken,
    source: &dyn CatalogSource,
    db: &mut Database,
    games: &GamesConfig,
) -> Result<BTreeSet<u64>, SyncError> {
    let mut discovered: BTreeSet<u64> = BTreeSet::new();
    let mut pending: BTreeSet<u64> = games
        .0
        .iter()
        .flat_map(|game| game.workshop_collections.iter().map(|entry| entry.id))
        .collect();
    let mut seen: BTreeSet<u64> = pending.clone();

    while !pending.is_empty() {
        let current: Vec<u64> = pending.iter().copied().collect();
        pending.clear();
        for batch in current.chunks(BATCH_SIZE) {
            cancel.check()?;
            info!(count = batch.len(), "fetching collection details");
            let details = source.collection_details(batch).map_err(|source| {
                SyncError::Fetch {
                    what: "collection details".to_string(),
                    source,
                }
            })?;
            for detail in details {
                for member in &detail.members {
                    match member.kind {
                        MemberKind::Item => {
                            discovered.insert(member.id);
                        }
                        MemberKind::Collection => {
                            if seen.insert(member.id) {
                                pending.insert(member.id);
                            }
                        }
                        MemberKind::Unrecognized => {
                            warn!(
                                collection = detail.id,
                                member = member.id,
                                "unrecognized collection member kind, skipping"
                            );
                        }
                    }
                }
                db.collections.insert(
                    detail.id,
                    Collection {
                        members: detail.members,
                    },
                );
            }
        }
    }

    Ok(discovered)
}

/// Unions the items discovered from collections with everything the games
/// config references, then closes over the requirements already recorded in
/// the store. A store-only closure, no fetches happen here.
fn seed_items(db: &Database, games: &GamesConfig, mut seed: BTreeSet<u64>) -> BTreeSet<u64> {
    for game in &games.0 {
        seed.extend(game.workshop_items.iter().map(|entry| entry.id));
        for entries in game.dependency_add.values() {
            seed.extend(entries.iter().map(|entry| entry.id));
        }
        for entries in game.dependency_remove.values() {
            seed.extend(entries.iter().map(|entry| entry.id));
        }
    }

    let mut queue: Vec<u64> = seed.iter().copied().collect();
    while let Some(id) = queue.pop() {
        let Some(item) = db.workshop_items.get(&id) else {
            continue;
        };
        for &required in &item.requires {
            if seed.insert(required) {
                queue.push(required);
            }
        }
    }

    seed
}

fn sync_items(
    cancel: &CancelToken,
    source: &dyn CatalogSource,
    db: &mut Database,
    mut pending: BTreeSet<u64>,
) -> Result<(), SyncError> {
    let mut seen: BTreeSet<u64> = BTreeSet::new();

    while !pending.is_empty() {
        let current: Vec<u64> = pending.iter().copied().collect();
        pending.clear();
        let mut needs_refresh: BTreeSet<u64> = BTreeSet::new();

        for batch in current.chunks(BATCH_SIZE) {
            cancel.check()?;
            info!(count = batch.len(), "fetching workshop item details");
            let details = source.file_details(batch).map_err(|source| SyncError::Fetch {
                what: "workshop item details".to_string(),
                source,
            })?;
            for detail in details {
                let mut item = WorkshopItem {
                    creator_app_id: detail.creator_app_id,
                    time_created: detail.time_created,
                    time_updated: detail.time_updated,
                    last_refreshed: now_unix(),
                    last_downloaded: 0,
                    title: detail.title,
                    requires: Vec::new(),
                };
                // Download state and requirements survive the metadata
                // overwrite; requirements are only replaced by a successful
                // refresh below.
                let stale = match db.workshop_items.get(&detail.id) {
                    Some(existing) => {
                        item.last_downloaded = existing.last_downloaded;
                        item.requires = existing.requires.clone();
                        existing.time_updated < detail.time_updated
                    }
                    None => true,
                };
                if stale {
                    needs_refresh.insert(detail.id);
                }
                db.workshop_items.insert(detail.id, item);
                seen.insert(detail.id);
            }
        }

        for id in needs_refresh {
            cancel.check()?;
            info!(item = id, "refreshing workshop item requirements");
            let web = source.file_details_web(id).map_err(|source| SyncError::Fetch {
                what: format!("requirements of workshop item {id}"),
                source,
            })?;
            let item = db
                .workshop_items
                .get_mut(&id)
                .ok_or(SyncError::Consistency(id))?;
            item.requires.clear();
            for required in web.required_items {
                item.requires.push(required.id);
                if !seen.contains(&required.id) {
                    pending.insert(required.id);
                }
            }
        }
    }

    Ok(())
}
