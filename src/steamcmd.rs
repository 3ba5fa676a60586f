use crate::cancel::CancelToken;
use anyhow::{bail, Context, Result};
use std::{
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc,
    thread,
    time::Duration,
};
use tracing::{debug, info};

/// One scripted steamcmd session: base install updates plus workshop item
/// downloads, commands sent one at a time on the interactive prompt.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub steamcmd_path: PathBuf,
    pub install_dir: PathBuf,
    /// Empty means anonymous.
    pub login_username: String,
    pub app_updates: Vec<AppUpdate>,
    pub item_downloads: Vec<ItemDownload>,
    /// Log the user out once the session's work is done.
    pub logout: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AppUpdate {
    pub id: u64,
    pub beta_branch: String,
    pub validate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ItemDownload {
    pub app_id: u64,
    pub item_id: u64,
}

const READY_PROMPT: &[u8] = b"Steam>";
const PASSWORD_PROMPT: &[u8] = b"password:";
const GUARD_CODE_PROMPT: &[u8] = b"Steam Guard code:";

pub fn build_script(opts: &ExecOpts) -> Vec<String> {
    let username = if opts.login_username.is_empty() {
        "anonymous"
    } else {
        &opts.login_username
    };
    let mut commands = vec![
        "@ShutdownOnFailedCommand 1".to_string(),
        format!("force_install_dir {}", opts.install_dir.display()),
        format!("login {username}"),
    ];
    for app in &opts.app_updates {
        let mut command = format!("app_update {}", app.id);
        if !app.beta_branch.is_empty() {
            command.push_str(" -beta ");
            command.push_str(&app.beta_branch);
        }
        if app.validate {
            command.push_str(" validate");
        }
        commands.push(command);
    }
    for item in &opts.item_downloads {
        commands.push(format!("download_item {} {}", item.app_id, item.item_id));
    }
    if opts.logout {
        commands.push("logout".to_string());
    }
    commands.push("quit".to_string());
    commands
}

pub fn exec(cancel: &CancelToken, opts: &ExecOpts) -> Result<()> {
    if opts.steamcmd_path.as_os_str().is_empty() {
        bail!("steamcmd path is not set");
    }
    if !opts.install_dir.is_dir() {
        bail!("install dir {} does not exist", opts.install_dir.display());
    }

    let commands = build_script(opts);
    run_session(cancel, &opts.steamcmd_path, &commands)
}

/// Logs the given user out of steamcmd. With a cached login this completes
/// without prompting.
pub fn logout(cancel: &CancelToken, steamcmd_path: &Path, username: &str) -> Result<()> {
    if steamcmd_path.as_os_str().is_empty() {
        bail!("steamcmd path is not set");
    }
    let mut commands = Vec::new();
    if !username.is_empty() {
        commands.push(format!("login {username}"));
    }
    commands.push("logout".to_string());
    commands.push("quit".to_string());
    run_session(cancel, steamcmd_path, &commands)
}

fn run_session(cancel: &CancelToken, steamcmd_path: &Path, commands: &[String]) -> Result<()> {
    let mut child = Command::new(steamcmd_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {}", steamcmd_path.display()))?;

    let mut stdin = child.stdin.take().context("steamcmd stdin pipe")?;
    let stdout = child.stdout.take().context("steamcmd stdout pipe")?;
    let stderr = child.stderr.take().context("steamcmd stderr pipe")?;

    thread::spawn(move || {
        let mut stderr = stderr;
        let mut buf = [0u8; 4096];
        while let Ok(read) = stderr.read(&mut buf) {
            if read == 0 {
                break;
            }
            debug!("steamcmd stderr: {}", String::from_utf8_lossy(&buf[..read]));
        }
    });

    // Raw conversation log, useful when steamcmd misbehaves.
    let mut session_log = File::create("steamcmd.log").ok();

    let (sender, receiver) = mpsc::channel::<Vec<u8>>();
    thread::spawn(move || {
        let mut stdout = stdout;
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if sender.send(buf[..read].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut command_index = 0;
    let mut window: Vec<u8> = Vec::new();
    loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            bail!("steamcmd cancelled");
        }

        let chunk = match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(chunk) => chunk,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if let Some(log) = session_log.as_mut() {
            let _ = log.write_all(&chunk);
        }
        debug!("steamcmd: {}", String::from_utf8_lossy(&chunk));
        window.extend_from_slice(&chunk);
        if window.len() > 8192 {
            let excess = window.len() - 8192;
            window.drain(..excess);
        }

        if ends_with_trimmed(&window, PASSWORD_PROMPT) {
            let secret = read_operator_line("password")?;
            write_line(&mut stdin, &secret)?;
            window.clear();
        } else if ends_with_trimmed(&window, GUARD_CODE_PROMPT) {
            let code = read_operator_line("Steam Guard code")?;
            write_line(&mut stdin, &code)?;
            window.clear();
        } else if find_prompt(&window, READY_PROMPT) {
            if command_index >= commands.len() {
                break;
            }
            let command = &commands[command_index];
            debug!("steamcmd command: {command}");
            write_line(&mut stdin, command)
                .with_context(|| format!("send command {command}"))?;
            command_index += 1;
            window.clear();
        }
    }
    drop(stdin);

    let status = child.wait().context("wait for steamcmd")?;
    if !status.success() {
        bail!("steamcmd exited with {status}");
    }
    if command_index < commands.len() {
        bail!(
            "steamcmd ended early, {} of {} commands sent",
            command_index,
            commands.len()
        );
    }
    info!("steamcmd session finished");
    Ok(())
}

/// The ready prompt arrives wrapped in ANSI escapes, so look for it anywhere
/// in the unanswered output instead of only at the very end.
fn find_prompt(window: &[u8], prompt: &[u8]) -> bool {
    window
        .windows(prompt.len())
        .any(|candidate| candidate == prompt)
}

fn ends_with_trimmed(window: &[u8], prompt: &[u8]) -> bool {
    let trimmed = match window.iter().rposition(|byte| !byte.is_ascii_whitespace()) {
        Some(last) => &window[..=last],
        None => return false,
    };
    trimmed.ends_with(prompt)
}

fn read_operator_line(what: &str) -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .with_context(|| format!("read {what} from stdin"))?;
    Ok(line.trim_end_matches('\n').to_string())
}

fn write_line(stdin: &mut impl Write, content: &str) -> Result<()> {
    stdin
        .write_all(content.as_bytes())
        .and_then(|()| stdin.write_all(b"\n"))
        .and_then(|()| stdin.flush())
        .context("write to steamcmd stdin")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn script_covers_games_and_items_in_order() {
        let opts = ExecOpts {
            steamcmd_path: PathBuf::from("/usr/bin/steamcmd"),
            install_dir: PathBuf::from("/srv/games"),
            login_username: "operator".to_string(),
            app_updates: vec![
                AppUpdate {
                    id: 233780,
                    beta_branch: "creatordlc".to_string(),
                    validate: true,
                },
                AppUpdate {
                    id: 107410,
                    ..AppUpdate::default()
                },
            ],
            item_downloads: vec![ItemDownload {
                app_id: 107410,
                item_id: 463939057,
            }],
            logout: false,
        };

        assert_eq!(
            build_script(&opts),
            vec![
                "@ShutdownOnFailedCommand 1",
                "force_install_dir /srv/games",
                "login operator",
                "app_update 233780 -beta creatordlc validate",
                "app_update 107410",
                "download_item 107410 463939057",
                "quit",
            ]
        );
    }

    #[test]
    fn empty_username_logs_in_anonymously() {
        let opts = ExecOpts {
            install_dir: PathBuf::from("/srv/games"),
            ..ExecOpts::default()
        };
        assert!(build_script(&opts).contains(&"login anonymous".to_string()));
    }

    #[test]
    fn logout_flag_appends_before_quit() {
        let opts = ExecOpts {
            install_dir: PathBuf::from("/srv/games"),
            logout: true,
            ..ExecOpts::default()
        };
        let script = build_script(&opts);
        assert_eq!(script[script.len() - 2], "logout");
        assert_eq!(script[script.len() - 1], "quit");
    }

    #[test]
    fn prompt_detection() {
        assert!(ends_with_trimmed(b"Cached credentials not found.\npassword: ", PASSWORD_PROMPT));
        assert!(ends_with_trimmed(b"Steam Guard code: ", GUARD_CODE_PROMPT));
        assert!(ends_with_trimmed(b"password: \n", PASSWORD_PROMPT));
        assert!(!ends_with_trimmed(b"password: extra", PASSWORD_PROMPT));
        assert!(find_prompt(b"\x1b[0m\x1b[1m\nSteam>\x1b[0m", READY_PROMPT));
        assert!(!find_prompt(b"loading...", READY_PROMPT));
    }
}
