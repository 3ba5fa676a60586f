use crate::cancel::CancelToken;
use crate::config::Config;
use crate::filecasing;
use crate::games::GamesConfig;
use crate::plan::{self, DownloadOpts};
use crate::resolve;
use crate::steamcmd::{self, AppUpdate, ExecOpts, ItemDownload};
use crate::store::{now_unix, Database};
use crate::sync;
use crate::workshop::WorkshopClient;
use anyhow::{anyhow, bail, Context, Result};
use std::{
    fs, io,
    os::unix::fs as unix_fs,
    path::{Path, PathBuf},
};
use tracing::info;

pub const WORKSHOP_SUBDIR: &str = "steamapps/workshop";
pub const WORKSHOP_CONTENT_DIR: &str = "steamapps/workshop/content";

/// Owns the loaded config, catalog database and games configuration for the
/// duration of one invocation.
pub struct App {
    config: Config,
    db: Database,
    games: GamesConfig,
}

impl App {
    pub fn load(config: Config) -> Result<Self> {
        let db = Database::load_or_create(&config.database_path)?;
        let games = GamesConfig::load(&config.games_config_path)?;
        Ok(Self { config, db, games })
    }

    pub fn set_login_username(&mut self, username: &str) {
        if !username.is_empty() {
            self.config.login_username = username.to_string();
        }
    }

    pub fn game_names(&self) -> Vec<String> {
        self.games.names()
    }

    /// Persists the database and the games config (with refreshed comments)
    /// and keeps the convenience `workshop` symlink current.
    pub fn save(&mut self) -> Result<()> {
        self.db.save(&self.config.database_path)?;
        self.games.update_comments(&self.db);
        self.games.save(&self.config.games_config_path)?;

        if self.config.games_dir.join(WORKSHOP_SUBDIR).is_dir() {
            let _ = overwrite_symlink(
                &self.config.games_dir.join(WORKSHOP_CONTENT_DIR),
                &self.config.games_dir.join("workshop"),
            );
        }
        Ok(())
    }

    /// Syncs the catalog database against the workshop and persists it.
    pub fn update_catalog(&mut self, cancel: &CancelToken) -> Result<()> {
        let client = WorkshopClient::new();
        sync::sync_catalog(cancel, &client, &mut self.db, &self.games)?;
        self.save()
    }

    /// Resolves, plans and runs one steamcmd download session, then records
    /// the download times. Persistence and symlink maintenance still run when
    /// part of the casing work failed; all errors are surfaced together.
    pub fn download(&mut self, cancel: &CancelToken, opts: DownloadOpts, logout: bool) -> Result<()> {
        let plan = plan::build_plan(&self.db, &self.games, opts)?;
        info!(
            games = plan.games.len(),
            items = plan.total_items(),
            "planned downloads"
        );

        let lowercase_suffixes: Vec<String> = plan
            .games
            .iter()
            .filter(|game| game.make_items_lowercase)
            .flat_map(|game| {
                game.items
                    .iter()
                    .map(|item| game.item_content_suffix(item.id))
            })
            .collect();

        self.restore_item_casing(&lowercase_suffixes)
            .context("restore workshop item file casing")?;

        let exec_opts = ExecOpts {
            steamcmd_path: self.config.steamcmd_path.clone(),
            install_dir: self.config.games_dir.clone(),
            login_username: self.config.login_username.clone(),
            app_updates: plan
                .games
                .iter()
                .map(|game| AppUpdate {
                    id: game.app_id,
                    beta_branch: game.beta_branch.clone(),
                    validate: game.validate,
                })
                .collect(),
            item_downloads: plan
                .games
                .iter()
                .flat_map(|game| {
                    game.items.iter().map(|item| ItemDownload {
                        app_id: game.workshop_app_id,
                        item_id: item.id,
                    })
                })
                .collect(),
            logout,
        };

        if let Err(download_err) = steamcmd::exec(cancel, &exec_opts) {
            let pending = plan.total_items();
            let mut errors = vec![download_err
                .context(format!("download failed, {pending} planned items not recorded"))];
            if let Err(case_err) = self.lowercase_item_casing(&lowercase_suffixes) {
                errors.push(case_err.context("re-lowercase workshop item file casing"));
            }
            return join_errors(errors);
        }

        let now = now_unix();
        for game in &plan.games {
            for item in &game.items {
                if let Some(entry) = self.db.workshop_items.get_mut(&item.id) {
                    entry.last_downloaded = now;
                }
            }
        }

        let mut errors = Vec::new();
        if let Err(err) = self.lowercase_item_casing(&lowercase_suffixes) {
            errors.push(err.context("lowercase workshop item file casing"));
        }
        if let Err(err) = self.save() {
            errors.push(err);
        }
        if let Err(err) = self.create_symlinks() {
            errors.push(err);
        }
        join_errors(errors)
    }

    pub fn logout(&self, cancel: &CancelToken, username: &str) -> Result<()> {
        let username = if username.is_empty() {
            &self.config.login_username
        } else {
            username
        };
        steamcmd::logout(cancel, &self.config.steamcmd_path, username)
    }

    /// Looks the given titles up in the store and returns them with their
    /// dependency closure in install order, as (id, title) pairs.
    pub fn dependency_order_by_title(
        &self,
        game_name: &str,
        titles: &[String],
    ) -> Result<Vec<(u64, String)>> {
        let Some(game) = self.games.get(game_name) else {
            bail!("game {game_name} is not configured");
        };
        let mut ids = Vec::with_capacity(titles.len());
        for title in titles {
            let id = self
                .db
                .workshop_items
                .iter()
                .find(|(_, item)| item.title == *title)
                .map(|(id, _)| *id)
                .with_context(|| format!("could not find workshop item {title}"))?;
            ids.push(id);
        }
        let order = resolve::resolve(&self.db, game, &ids)?;
        Ok(order
            .into_iter()
            .map(|id| {
                let title = self
                    .db
                    .workshop_items
                    .get(&id)
                    .map(|item| item.title.clone())
                    .unwrap_or_default();
                (id, title)
            })
            .collect())
    }

    fn workshop_content_dir(&self) -> PathBuf {
        self.config.games_dir.join(WORKSHOP_CONTENT_DIR)
    }

    /// Puts the recorded original casing back for the given item content
    /// dirs so steamcmd sees the paths it created. Records whose files are
    /// gone are skipped.
    fn restore_item_casing(&mut self, suffixes: &[String]) -> Result<()> {
        if suffixes.is_empty() {
            return Ok(());
        }
        let base = self.workshop_content_dir();
        for recorded in &self.db.path_changes {
            if !covered_by(recorded, suffixes) {
                continue;
            }
            match filecasing::restore_case(&base, recorded) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("restore casing of {recorded}"))
                }
            }
        }
        Ok(())
    }

    /// Lower-cases the given item content dirs and replaces their recorded
    /// path changes in the database wholesale.
    fn lowercase_item_casing(&mut self, suffixes: &[String]) -> Result<()> {
        if suffixes.is_empty() {
            return Ok(());
        }
        let base = self.workshop_content_dir();
        let mut changed = Vec::new();
        for suffix in suffixes {
            let root = base.join(suffix);
            let result = filecasing::make_lower_case(&root, &mut |original| {
                changed.push(format!("{suffix}/{original}"));
            });
            match result {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("lowercase {}", root.display()))
                }
            }
        }
        self.db
            .path_changes
            .retain(|recorded| !covered_by(recorded, suffixes));
        self.db.path_changes.extend(changed);
        Ok(())
    }

    /// One `<game>/mods` symlink per game that has at least one downloaded
    /// workshop item, pointing into the shared workshop content dir.
    fn create_symlinks(&self) -> Result<()> {
        let mut errors = Vec::new();
        for game in &self.games.0 {
            let mut downloaded = false;
            for entry in &game.workshop_items {
                let item = self
                    .db
                    .workshop_items
                    .get(&entry.id)
                    .with_context(|| format!("workshop item {} not found", entry.id))?;
                if item.last_downloaded != 0 {
                    downloaded = true;
                    break;
                }
            }
            if !downloaded {
                continue;
            }
            let target = self
                .workshop_content_dir()
                .join(game.workshop_app_id.to_string());
            let link = self.config.games_dir.join(&game.name).join("mods");
            if let Err(err) = overwrite_symlink(&target, &link) {
                errors.push(err.context(format!("link mods dir of {}", game.name)));
            }
        }
        join_errors(errors)
    }
}

fn covered_by(recorded: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suffix| {
        recorded
            .strip_prefix(suffix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Creates the symlink at a temporary name first, then renames it over the
/// link path so an existing link is replaced.
fn overwrite_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let file_name = link.file_name().context("symlink has no file name")?;
    let temp = link.with_file_name(format!(".{}.stoker-link", file_name.to_string_lossy()));
    let _ = fs::remove_file(&temp);
    unix_fs::symlink(target, &temp)
        .with_context(|| format!("create symlink {}", temp.display()))?;
    fs::rename(&temp, link).with_context(|| format!("replace symlink {}", link.display()))?;
    Ok(())
}

fn join_errors(mut errors: Vec<anyhow::Error>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    if errors.len() == 1 {
        return Err(errors.remove(0));
    }
    let joined = errors
        .iter()
        .map(|err| format!("{err:#}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(anyhow!(joined))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::{GameEntry, IdWithComment};
    use crate::store::WorkshopItem;
    use pretty_assertions::assert_eq;

    fn test_app(games_dir: &Path) -> App {
        App {
            config: Config {
                database_path: games_dir.join("db.json"),
                games_config_path: games_dir.join("games.json"),
                games_dir: games_dir.to_path_buf(),
                login_username: String::new(),
                steamcmd_path: PathBuf::from("/usr/bin/steamcmd"),
            },
            db: Database::default(),
            games: GamesConfig::default(),
        }
    }

    fn item(title: &str, requires: &[u64]) -> WorkshopItem {
        WorkshopItem {
            title: title.to_string(),
            requires: requires.to_vec(),
            ..WorkshopItem::default()
        }
    }

    #[test]
    fn lowercase_and_restore_bracket_updates_path_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = test_app(dir.path());
        let content = dir.path().join(WORKSHOP_CONTENT_DIR).join("107410/42");
        fs::create_dir_all(content.join("Addons")).unwrap();
        fs::write(content.join("Addons/Mod.PBO"), b"x").unwrap();
        // A record for another item must survive untouched.
        app.db.path_changes.push("107410/7/Old".to_string());

        let suffixes = vec!["107410/42".to_string()];
        app.lowercase_item_casing(&suffixes).unwrap();
        assert!(content.join("addons/mod.pbo").exists());
        assert_eq!(
            app.db.path_changes,
            vec![
                "107410/7/Old".to_string(),
                "107410/42/Addons/Mod.PBO".to_string(),
                "107410/42/Addons".to_string(),
            ]
        );

        app.restore_item_casing(&suffixes).unwrap();
        assert!(content.join("Addons/Mod.PBO").exists());
    }

    #[test]
    fn restore_tolerates_missing_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = test_app(dir.path());
        app.db.path_changes.push("107410/42/Gone".to_string());
        app.restore_item_casing(&["107410/42".to_string()]).unwrap();
    }

    #[test]
    fn covered_by_requires_a_path_boundary() {
        let suffixes = vec!["107410/42".to_string()];
        assert!(covered_by("107410/42/Addons", &suffixes));
        assert!(!covered_by("107410/421/Addons", &suffixes));
        assert!(!covered_by("107410/42", &suffixes));
    }

    #[test]
    fn save_persists_both_files_and_refreshes_comments() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = test_app(dir.path());
        app.db.workshop_items.insert(463939057, item("ace", &[]));
        app.games.0.push(GameEntry {
            name: "Arma3".to_string(),
            app_id: 233780,
            workshop_app_id: 107410,
            workshop_items: vec![IdWithComment::new(463939057)],
            ..GameEntry::default()
        });

        app.save().unwrap();

        let games = GamesConfig::load(&dir.path().join("games.json")).unwrap();
        assert_eq!(games.0[0].workshop_items[0].comment, "ace");
        let db = Database::load_or_create(&dir.path().join("db.json")).unwrap();
        assert_eq!(db.workshop_items[&463939057].title, "ace");
    }

    #[test]
    fn symlinks_created_for_games_with_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = test_app(dir.path());
        app.db.workshop_items.insert(
            1,
            WorkshopItem {
                last_downloaded: 5,
                ..item("one", &[])
            },
        );
        app.db.workshop_items.insert(2, item("two", &[]));
        app.games.0.push(GameEntry {
            name: "Arma3".to_string(),
            workshop_app_id: 107410,
            workshop_items: vec![IdWithComment::new(1)],
            ..GameEntry::default()
        });
        app.games.0.push(GameEntry {
            name: "Quiet".to_string(),
            workshop_app_id: 999,
            workshop_items: vec![IdWithComment::new(2)],
            ..GameEntry::default()
        });

        app.create_symlinks().unwrap();

        let link = dir.path().join("Arma3/mods");
        assert_eq!(
            fs::read_link(&link).unwrap(),
            dir.path().join(WORKSHOP_CONTENT_DIR).join("107410")
        );
        assert!(!dir.path().join("Quiet/mods").exists());

        // Re-running replaces the link instead of failing.
        app.create_symlinks().unwrap();
        assert!(fs::read_link(&link).is_ok());
    }

    #[test]
    fn dependency_order_by_title_resolves_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = test_app(dir.path());
        app.db.workshop_items.insert(1, item("mod one", &[2]));
        app.db.workshop_items.insert(2, item("base", &[]));
        app.games.0.push(GameEntry {
            name: "Arma3".to_string(),
            ..GameEntry::default()
        });

        let order = app
            .dependency_order_by_title("Arma3", &["mod one".to_string()])
            .unwrap();
        assert_eq!(order, vec![(2, "base".to_string()), (1, "mod one".to_string())]);

        assert!(app
            .dependency_order_by_title("Arma3", &["missing".to_string()])
            .is_err());
        assert!(app
            .dependency_order_by_title("Nope", &["mod one".to_string()])
            .is_err());
    }

    #[test]
    fn join_errors_combines_messages() {
        assert!(join_errors(Vec::new()).is_ok());
        let err = join_errors(vec![anyhow!("first"), anyhow!("second")]).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("first"));
        assert!(message.contains("second"));
    }
}
