use crate::games::GameEntry;
use crate::store::Database;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{0} is neither a collection nor a workshop item")]
    UnknownId(u64),
}

/// Expands the game's configured workshop items into the full install order.
pub fn ordered_for_game(db: &Database, game: &GameEntry) -> Result<Vec<u64>, ResolveError> {
    let ids: Vec<u64> = game.workshop_items.iter().map(|entry| entry.id).collect();
    resolve(db, game, &ids)
}

/// Expands the requested ids into a duplicate-free, dependency-first install
/// order. Dependencies of an item come strictly before the item; collections
/// expand depth-first in their stored member order and are walked at most
/// once. Only workshop items are emitted.
///
/// Driven by an explicit stack since the dependency graph depth is operator
/// controlled. A dependency cycle is broken at the back-edge, so both ends of
/// the cycle still appear exactly once.
pub fn resolve(
    db: &Database,
    game: &GameEntry,
    requested: &[u64],
) -> Result<Vec<u64>, ResolveError> {
    enum Task {
        Visit(u64),
        Finish(u64),
    }

    let mut finalized: HashSet<u64> = HashSet::new();
    let mut visiting: HashSet<u64> = HashSet::new();
    let mut order: Vec<u64> = Vec::new();
    let mut stack: Vec<Task> = requested.iter().rev().map(|&id| Task::Visit(id)).collect();

    while let Some(task) = stack.pop() {
        match task {
            Task::Visit(id) => {
                if finalized.contains(&id) || visiting.contains(&id) {
                    continue;
                }
                if let Some(item) = db.workshop_items.get(&id) {
                    visiting.insert(id);
                    stack.push(Task::Finish(id));
                    for dep in effective_requires(game, id, &item.requires).into_iter().rev() {
                        stack.push(Task::Visit(dep));
                    }
                } else if let Some(collection) = db.collections.get(&id) {
                    // Finalized before its members so a self-referencing
                    // collection cannot be re-entered.
                    finalized.insert(id);
                    for member in collection.members.iter().rev() {
                        stack.push(Task::Visit(member.id));
                    }
                } else {
                    return Err(ResolveError::UnknownId(id));
                }
            }
            Task::Finish(id) => {
                visiting.remove(&id);
                if finalized.insert(id) {
                    order.push(id);
                }
            }
        }
    }

    Ok(order)
}

/// An item's stored requirements with the game's remove overrides filtered
/// out and its add overrides appended. Remove overrides apply only here,
/// never to collection member traversal.
fn effective_requires(game: &GameEntry, id: u64, requires: &[u64]) -> Vec<u64> {
    let removed = game.dependency_remove.get(&id);
    let mut deps: Vec<u64> = requires
        .iter()
        .copied()
        .filter(|required| {
            removed.map_or(true, |entries| !entries.iter().any(|entry| entry.id == *required))
        })
        .collect();
    if let Some(added) = game.dependency_add.get(&id) {
        deps.extend(added.iter().map(|entry| entry.id));
    }
    deps
}
