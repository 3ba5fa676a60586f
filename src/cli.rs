use crate::{
    app::App,
    cancel::CancelToken,
    config::{self, Config},
    plan::DownloadOpts,
};
use anyhow::{bail, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

struct GlobalOptions {
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Update(UpdateOptions),
    WorkshopItems { game: String, titles: Vec<String> },
    Games,
    Logout { username: String },
    Help,
    Version,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct UpdateOptions {
    skip_database_update: bool,
    skip_download: bool,
    download_up_to_date: bool,
    validate: bool,
    login_username: Option<String>,
    logout: bool,
}

pub fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("stoker v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let config_path = match global.config {
                Some(path) => path,
                None => config::default_config_path()?,
            };
            let config = Config::load(&config_path)?;
            let cancel = CancelToken::new();
            cancel.install_signal_handlers();
            run_command(config, &cancel, command)
        }
    }
}

fn run_command(config: Config, cancel: &CancelToken, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::Update(options) => {
            let mut app = App::load(config)?;
            if let Some(username) = &options.login_username {
                app.set_login_username(username);
            }
            if !options.skip_database_update {
                app.update_catalog(cancel)?;
            }
            if !options.skip_download {
                let opts = DownloadOpts {
                    download_up_to_date: options.download_up_to_date,
                    validate: options.validate,
                };
                app.download(cancel, opts, options.logout)?;
            }
            Ok(())
        }
        CliCommand::WorkshopItems { game, titles } => {
            let app = App::load(config)?;
            for (id, title) in app.dependency_order_by_title(&game, &titles)? {
                println!("{id} # {title}");
            }
            Ok(())
        }
        CliCommand::Games => {
            let app = App::load(config)?;
            for name in app.game_names() {
                println!("{name}");
            }
            Ok(())
        }
        CliCommand::Logout { username } => {
            let app = App::load(config)?;
            app.logout(cancel, &username)
        }
        CliCommand::Help | CliCommand::Version => Ok(()),
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let (global, tokens) = parse_global_options(args)?;
    let Some(head) = tokens.first() else {
        return Ok((global, CliCommand::Update(UpdateOptions::default())));
    };
    let command = match head.as_str() {
        "--help" | "-h" | "help" => CliCommand::Help,
        "--version" | "-V" | "version" => CliCommand::Version,
        "update" => CliCommand::Update(parse_update(tokens.get(1..).unwrap_or(&[]))?),
        "workshop-items" => {
            let Some(game) = tokens.get(1) else {
                bail!("workshop-items requires a game name");
            };
            let titles: Vec<String> = tokens.get(2..).unwrap_or(&[]).to_vec();
            if titles.is_empty() {
                bail!("workshop-items requires at least one item title");
            }
            CliCommand::WorkshopItems {
                game: game.clone(),
                titles,
            }
        }
        "games" => CliCommand::Games,
        "logout" => CliCommand::Logout {
            username: tokens.get(1).cloned().unwrap_or_default(),
        },
        other => bail!("unknown command: {other} (see 'stoker help')"),
    };
    Ok((global, command))
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut config = None;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(value));
            continue;
        }
        if arg == "--config" {
            let Some(value) = iter.next() else {
                bail!("--config requires a path");
            };
            config = Some(PathBuf::from(value));
            continue;
        }
        tokens.push(arg.to_string());
    }
    Ok((GlobalOptions { config }, tokens))
}

fn parse_update(args: &[String]) -> Result<UpdateOptions> {
    let mut options = UpdateOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--skip-database-update" => options.skip_database_update = true,
            "--skip-download" => options.skip_download = true,
            "--download-up-to-date" => options.download_up_to_date = true,
            "--validate" => options.validate = true,
            "--logout" => options.logout = true,
            "--login-username" => {
                let Some(value) = iter.next() else {
                    bail!("--login-username requires a value");
                };
                options.login_username = Some(value.to_string());
            }
            value if value.starts_with("--login-username=") => {
                options.login_username =
                    Some(value.trim_start_matches("--login-username=").to_string());
            }
            other => bail!("unknown update flag: {other}"),
        }
    }
    Ok(options)
}

fn print_help() {
    println!(
        "stoker v{}

Keeps a catalog of workshop items and their dependencies, and drives
steamcmd to download what is out of date.

Usage:
  stoker [--config <path>] [command]

Commands:
  update            Sync the catalog and download stale items (default)
    --skip-database-update   Do not sync the catalog first
    --skip-download          Sync only, download nothing
    --download-up-to-date    Download planned items even when current
    --validate               Ask steamcmd to validate app installs
    --login-username <name>  Override the configured steamcmd login
    --logout                 Log out of steamcmd after downloading
  workshop-items <game> <title>...
                    Print the given items plus dependencies in install order
  games             List configured games
  logout [username] Log the steamcmd session out
  help              Show this help
  version           Show the version",
        env!("CARGO_PKG_VERSION")
    );
}
