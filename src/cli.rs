//! Command-line interface for aes128-cli.
//!
//! Tunnel commands (connect, disconnect, status) need root; account
//! commands (login, logout, account) refuse it so the session files stay
//! owned by the user.

use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::{Input, Password, Select};
use nix::unistd::geteuid;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use aes128_cli::api::{ApiClient, ApiError, AppSession};
use aes128_cli::config::{AppConfig, ConfigError, ConfigManager, ConfigPaths};
use aes128_cli::logging::{parse_level, LogOptions};
use aes128_cli::probe::{IcmpProbe, RankedEndpoint, SelectError, Selector};
use aes128_cli::store::{
    clear_session_data, SettingsStore, StoreError, TokenStore, UserCache,
};
use aes128_cli::tunnel::{
    ensure_core, format_uptime, synthesize_with, FileSessionStore, InstallError,
    LifecycleManager, LifecycleState, SessionStatus, SynthesisError, SystemProcessControl,
    TunnelError,
};
use aes128_cli::Endpoint;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

/// Command-line client for the AES128 VPN service
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = None,
    after_help = "Examples:\n  aes128-cli login\n  sudo aes128-cli connect\n  sudo aes128-cli connect de.aes128.com\n  aes128-cli settings set protocol trojan"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (defaults to the config file's `log_level`)
    #[arg(short, long, value_enum, env = "AES128_LOG_LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Emit diagnostics as JSON
    #[arg(long, env = "AES128_JSON_LOGS", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Log in to the service
    Login {
        /// Account identifier (prompted for when omitted)
        #[arg(short, long)]
        username: Option<String>,

        /// Account password (prompted for, without echo, when omitted)
        #[arg(long, env = "AES128_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Session to terminate if the device limit is reached (asked
        /// interactively when omitted on a terminal)
        #[arg(long, value_name = "SESSION_ID")]
        terminate: Option<i64>,
    },
    /// Log out and remove local session data
    Logout,
    /// Connect to a location (defaults to the fastest)
    Connect {
        /// Location number from `locations`, or its domain
        location: Option<String>,
    },
    /// Disconnect from the VPN
    Disconnect,
    /// Show the current connection status
    Status,
    /// List locations (with ping when run as root)
    Locations,
    /// View or change settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsCmd>,
    },
    /// Manage the account's app sessions
    Sessions {
        #[command(subcommand)]
        action: Option<SessionsCmd>,
    },
    /// Show the logged-in account
    Account,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum SettingsCmd {
    /// Show current settings
    Get,
    /// Set `protocol` (vless|vmess|trojan) or `adblock` (on|off)
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum SessionsCmd {
    /// List active sessions
    List,
    /// Delete an active session
    Delete {
        #[arg(long)]
        id: i64,
    },
}

/// Error type for CLI operations
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Could not generate tunnel config: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Could not pick a location: {0}")]
    Select(#[from] SelectError),

    #[error("Error during core setup: {0}")]
    Install(#[from] InstallError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Prompt failed: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error("This command requires root privileges. Please run with sudo.")]
    RootRequired,

    #[error("Do not run the '{0}' command with sudo.")]
    RootRefused(&'static str),

    #[error("Could not find location matching '{0}'. Run 'locations' to see the list.")]
    UnknownLocation(String),

    #[error("No session with ID {0}")]
    UnknownSession(i64),

    #[error("The server did not return a session token")]
    MissingToken,
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

impl Cli {
    /// Logging options: the flag wins over the config file.
    pub fn log_options(&self, config: &AppConfig) -> LogOptions {
        let level = match self.log_level {
            Some(level) => level.into(),
            None => parse_level(&config.log_level),
        };
        LogOptions {
            level,
            json_format: self.json_logs,
            ..Default::default()
        }
    }
}

/// Resolve the state directory and load the application config from it
/// (or from `--config`).
pub fn load_context(cli: &Cli) -> CliResult<Context> {
    let paths = ConfigPaths::resolve()?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| paths.config_file());
    let manager = ConfigManager::load(&config_path)?;
    Ok(Context {
        config: manager.config().clone(),
        paths,
    })
}

/// Everything a command needs.
pub struct Context {
    pub config: AppConfig,
    pub paths: ConfigPaths,
}

impl Context {
    fn api(&self, token: Option<String>) -> CliResult<ApiClient> {
        Ok(ApiClient::new(
            &self.config.api.base_url,
            self.config.api.timeout(),
            token,
        )?)
    }

    fn authed_api(&self) -> CliResult<ApiClient> {
        let token = TokenStore::new(self.paths.clone()).read()?;
        self.api(Some(token))
    }

    fn lifecycle(&self) -> LifecycleManager<FileSessionStore, SystemProcessControl> {
        LifecycleManager::new(
            FileSessionStore::new(self.paths.clone()),
            SystemProcessControl::new(&self.config.core.path),
        )
    }

    fn selector(&self) -> Selector {
        Selector::new(Arc::new(IcmpProbe::new(self.config.probe.settings())))
            .with_max_parallel(self.config.probe.max_parallel)
    }
}

/// Run the parsed command
pub async fn run(cli: Cli, ctx: Context) -> CliResult<()> {
    match cli.command {
        Command::Login {
            username,
            password,
            terminate,
        } => login(&ctx, username, password, terminate).await,
        Command::Logout => logout(&ctx).await,
        Command::Connect { location } => connect(&ctx, location).await,
        Command::Disconnect => disconnect(&ctx),
        Command::Status => status(&ctx),
        Command::Locations => locations(&ctx).await,
        Command::Settings { action } => settings(&ctx, action.unwrap_or(SettingsCmd::Get)),
        Command::Sessions { action } => sessions(&ctx, action.unwrap_or(SessionsCmd::List)).await,
        Command::Account => account(&ctx),
    }
}

fn is_root() -> bool {
    geteuid().is_root()
}

fn require_root() -> CliResult<()> {
    if is_root() {
        Ok(())
    } else {
        Err(CliError::RootRequired)
    }
}

fn refuse_root(command: &'static str) -> CliResult<()> {
    if is_root() {
        Err(CliError::RootRefused(command))
    } else {
        Ok(())
    }
}

fn read_username(given: Option<String>) -> CliResult<String> {
    match given {
        Some(username) => Ok(username),
        None => Ok(Input::<String>::new()
            .with_prompt("Identifier")
            .interact_text()?),
    }
}

/// The typed password is masked; `--password` skips the prompt entirely.
fn read_password(given: Option<String>) -> CliResult<String> {
    match given {
        Some(password) => Ok(password),
        None => Ok(Password::new().with_prompt("Password").interact()?),
    }
}

fn session_label(session: &AppSession) -> String {
    format!("ID: {}, Name: {}", session.id, session.name)
}

/// Session to end at the device limit: the one given with `--terminate`,
/// otherwise one picked from a menu when stdin is a terminal.
fn choose_session(sessions: &[AppSession], terminate: Option<i64>) -> CliResult<Option<&AppSession>> {
    if let Some(id) = terminate {
        return sessions
            .iter()
            .find(|s| s.id == id)
            .map(Some)
            .ok_or(CliError::UnknownSession(id));
    }
    if sessions.is_empty() || !io::stdin().is_terminal() {
        return Ok(None);
    }

    let labels: Vec<String> = sessions.iter().map(session_label).collect();
    let picked = Select::new()
        .with_prompt("Select a session to terminate")
        .items(&labels)
        .default(0)
        .interact_opt()?;
    Ok(picked.and_then(|index| sessions.get(index)))
}

async fn login(
    ctx: &Context,
    username: Option<String>,
    password: Option<String>,
    terminate: Option<i64>,
) -> CliResult<()> {
    refuse_root("login")?;

    let username = read_username(username)?;
    let password = read_password(password)?;

    println!("Logging in...");
    let client = ctx.api(None)?;
    let response = match client.login(&username, &password).await {
        Ok(response) => response,
        Err(ApiError::SessionLimit { sessions }) => {
            println!("Device limit reached.");
            print_sessions(&sessions);
            let chosen = choose_session(&sessions, terminate)?.map(|s| (s.id, s.name.clone()));
            let Some((id, name)) = chosen else {
                println!("Re-run with --terminate <ID> to end one of these sessions.");
                return Err(ApiError::SessionLimit { sessions }.into());
            };

            println!("Terminating session: {name}...");
            client
                .delete_session_with_credentials(&username, &password, id)
                .await?;
            println!("Session terminated. Retrying login...");
            client.login(&username, &password).await?
        }
        Err(err) => return Err(err.into()),
    };

    if response.app_session_token.is_empty() {
        return Err(CliError::MissingToken);
    }
    TokenStore::new(ctx.paths.clone()).save(&response.app_session_token)?;
    println!("Login successful. Fetching user data...");

    let directory = ctx
        .api(Some(response.app_session_token.clone()))?
        .locations()
        .await?;
    let cache = UserCache {
        user_uuid: directory.user_uuid,
        username,
        session_name: response.session_name,
        locations: directory.locations,
    };
    cache.save(&ctx.paths)?;
    info!(locations = cache.locations.len(), "user cache saved");
    println!("Session and user data saved.");
    Ok(())
}

async fn logout(ctx: &Context) -> CliResult<()> {
    refuse_root("logout")?;

    let Some(token) = TokenStore::new(ctx.paths.clone()).read_optional()? else {
        println!("You are already logged out.");
        return Ok(());
    };

    let lifecycle = ctx.lifecycle();
    if !matches!(lifecycle.state()?, LifecycleState::Stopped) {
        println!("Active VPN connection found. Disconnecting first...");
        match lifecycle.stop() {
            Ok(_) | Err(TunnelError::NotRunning) => println!("Disconnected successfully."),
            Err(err) => println!("Could not disconnect cleanly, but proceeding with logout. Error: {err}"),
        }
    }

    println!("Logging out from server...");
    if let Err(err) = ctx.api(Some(token))?.logout().await {
        warn!("server logout failed: {err}");
        println!("Warning: could not log out from server. You may need to terminate this session manually via the website. Error: {err}");
    }

    clear_session_data(&ctx.paths);
    println!("Local session data cleared.");
    println!("Logout successful.");
    Ok(())
}

async fn connect(ctx: &Context, location: Option<String>) -> CliResult<()> {
    require_root()?;

    if !ctx.config.core.path.exists() {
        println!("VPN core not found. Attempting to download...");
        ensure_core(&ctx.config.core).await?;
        println!("VPN core installed successfully.");
    }

    let client = ctx.authed_api()?;
    println!("Reading user cache...");
    let cache = UserCache::load(&ctx.paths)?;

    let endpoint: Endpoint = match location {
        Some(query) => cache
            .find_location(&query)
            .cloned()
            .ok_or(CliError::UnknownLocation(query))?,
        None => {
            println!("No location specified, finding the fastest server...");
            let fastest = ctx.selector().select_fastest(&cache.locations).await?.clone();
            println!("Fastest server found: {}", fastest.domain);
            fastest
        }
    };
    println!("Selected location: {}", endpoint.name);

    println!("Fetching settings...");
    let settings = SettingsStore::new(ctx.paths.clone()).load()?;
    let dns = client.dns_settings().await?;

    println!("Generating configuration...");
    let document = synthesize_with(
        &ctx.config.tunnel.synthesis_options(),
        &endpoint,
        settings.protocol.as_str(),
        settings.ad_block,
        &dns,
        &cache.user_uuid,
    )?;

    println!(
        "Connecting to {} via {} protocol...",
        endpoint.name, settings.protocol
    );
    let handle = ctx.lifecycle().start(&document, &endpoint.name)?;
    debug!(pid = handle.pid, "connected");
    println!("\nConnection successful!");
    Ok(())
}

fn disconnect(ctx: &Context) -> CliResult<()> {
    require_root()?;

    let lifecycle = ctx.lifecycle();
    match lifecycle.stop() {
        Ok(_) => {
            println!("Disconnected successfully.");
            Ok(())
        }
        Err(TunnelError::NotRunning) => {
            lifecycle.clear_metadata()?;
            println!("VPN is not running.");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn status(ctx: &Context) -> CliResult<()> {
    require_root()?;

    match ctx.lifecycle().status()? {
        SessionStatus::Disconnected => println!("Status: Disconnected"),
        SessionStatus::Connected {
            location_name,
            uptime,
        } => {
            println!("Status: Connected");
            println!("Location: {location_name}");
            println!("Uptime: {}", format_uptime(uptime));
        }
        SessionStatus::Unverified { location_name, pid } => {
            println!("Status: Unknown (process {pid} could not be inspected)");
            println!("Location: {location_name}");
        }
    }
    Ok(())
}

async fn locations(ctx: &Context) -> CliResult<()> {
    let client = ctx.authed_api()?;
    println!("Fetching locations...");
    let directory = client.locations().await?;
    if directory.locations.is_empty() {
        println!("No locations available.");
        return Ok(());
    }

    if !is_root() {
        let rows: Vec<Vec<String>> = directory
            .locations
            .iter()
            .enumerate()
            .map(|(i, loc)| vec![(i + 1).to_string(), loc.name.clone(), loc.domain.clone()])
            .collect();
        print!("{}", render_table(&["ID", "Location", "Domain"], &rows));
        println!("\nNote: To check server ping, run this command with sudo:");
        println!("sudo aes128-cli locations");
        return Ok(());
    }

    println!("Checking ping...");
    let ranked = ctx.selector().rank_all(&directory.locations).await?;
    print!(
        "{}",
        render_table(&["ID", "Location", "Domain", "Ping (ms)"], &ranked_rows(&ranked))
    );
    Ok(())
}

fn ranked_rows(ranked: &[RankedEndpoint]) -> Vec<Vec<String>> {
    ranked
        .iter()
        .map(|row| {
            vec![
                row.position.to_string(),
                row.endpoint.name.clone(),
                row.endpoint.domain.clone(),
                row.outcome.label(),
            ]
        })
        .collect()
}

/// Left-aligned columns separated by three spaces, no borders.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let format_row = |cells: Vec<&str>| -> String {
        let line = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("   ");
        format!("{}\n", line.trim_end())
    };

    let mut out = format_row(headers.to_vec());
    out.push('\n');
    for row in rows {
        out.push_str(&format_row(row.iter().map(String::as_str).collect()));
    }
    out
}

fn settings(ctx: &Context, action: SettingsCmd) -> CliResult<()> {
    let store = SettingsStore::new(ctx.paths.clone());
    match action {
        SettingsCmd::Get => {
            let settings = store.load()?;
            println!("Current Settings:");
            println!("  Protocol: {}", settings.protocol);
            println!("  AdBlock Enabled: {}", settings.ad_block);
        }
        SettingsCmd::Set { key, value } => {
            let updated = store.set(&key, &value)?;
            if key.eq_ignore_ascii_case("protocol") {
                println!("Protocol set to: {}", updated.protocol);
            } else if updated.ad_block {
                println!("AdBlock enabled.");
            } else {
                println!("AdBlock disabled.");
            }
        }
    }
    Ok(())
}

fn print_sessions(sessions: &[AppSession]) {
    if sessions.is_empty() {
        println!("No active sessions found.");
        return;
    }
    println!("Active sessions:");
    for session in sessions {
        println!("  - {}", session_label(session));
    }
}

async fn sessions(ctx: &Context, action: SessionsCmd) -> CliResult<()> {
    let client = ctx.authed_api()?;
    match action {
        SessionsCmd::List => print_sessions(&client.sessions().await?),
        SessionsCmd::Delete { id } => {
            let sessions = client.sessions().await?;
            let target = sessions
                .iter()
                .find(|s| s.id == id)
                .ok_or(CliError::UnknownSession(id))?;
            println!("Deleting session: {} (ID: {})...", target.name, target.id);
            client.delete_session(id).await?;
            println!("Session deleted successfully.");
        }
    }
    Ok(())
}

fn account(ctx: &Context) -> CliResult<()> {
    refuse_root("account")?;

    let cache = UserCache::load(&ctx.paths)?;
    if cache.username.is_empty() || cache.session_name.is_empty() {
        println!("Account information is incomplete. Please try logging in again.");
        return Ok(());
    }
    println!("Current Account Info:");
    println!("  Username: {}", cache.username);
    println!("  Session Name: {}", cache.session_name);
    Ok(())
}
