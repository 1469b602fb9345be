use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use btop_plugin::bridge::{ByteStream, TERMINAL_SERVICE_DEVICE, TerminalOptions};
use btop_plugin::pty::PtyTerminalService;
use btop_plugin::settings::setting_keys;
use btop_plugin::{
    BtopPlugin, DeviceRegistry, LocalHost, Outcome, PluginConfig, PluginError, supervise,
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Conventional "temporary failure, try again" status; the supervisor
/// restarts the plugin when it sees it.
const RESTART_EXIT_CODE: u8 = 75;

#[derive(Parser, Debug)]
#[command(name = "btop-plugin", version, about)]
struct Cli {
    /// State directory (defaults to $BTOP_PLUGIN_VOLUME, then the platform data dir)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Log filter, e.g. "debug" or "btop_plugin=trace"
    #[arg(long, env = "BTOP_PLUGIN_LOG", global = true)]
    log: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay this terminal to btop (default)
    Run,
    /// Install btop and print the executable path
    Install,
    /// Print the settings as JSON
    Settings,
    /// Print the plugin documentation
    Readme,
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Themes(ThemesCommand),
    /// One-time import of settings from the legacy plugin
    #[command(subcommand)]
    Migrate(MigrateCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the saved btop.conf
    Show,
    /// Save btop.conf from FILE, or stdin with "-"
    Save { file: String },
}

#[derive(Subcommand, Debug)]
enum ThemesCommand {
    /// Print available themes and configured theme URLs
    List,
    /// Replace the theme URL list
    Set { urls: Vec<String> },
}

#[derive(Subcommand, Debug)]
enum MigrateCommand {
    Config { file: String },
    Themes { urls: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    btop_plugin::logging::init(cli.log.as_deref());

    let config = PluginConfig::from_env(cli.root);
    let host = Arc::new(LocalHost::new());
    let devices = Arc::new(DeviceRegistry::new());
    devices.register_terminal(TERMINAL_SERVICE_DEVICE, Arc::new(PtyTerminalService::default()));

    let plugin = BtopPlugin::start(config, host.clone(), devices).context("failed to start plugin")?;

    let outcome = match cli.command.unwrap_or(Command::Run) {
        Command::Run => btop_plugin::run(&host, relay_stdio(&plugin)).await?,
        Command::Install => {
            supervise(&host, async {
                let record = plugin.install_record().await?;
                println!("{}", record.executable.display());
                Ok::<_, PluginError>(())
            })
            .await?
        }
        Command::Settings => {
            supervise(&host, async {
                let settings = plugin.get_settings().await?;
                println!("{}", serde_json::to_string_pretty(&settings)?);
                Ok::<_, PluginError>(())
            })
            .await?
        }
        Command::Readme => {
            supervise(&host, async {
                print!("{}", plugin.readme().await?);
                Ok::<_, PluginError>(())
            })
            .await?
        }
        Command::Config(ConfigCommand::Show) => {
            supervise(&host, async {
                for script in plugin.load_scripts().await?.values() {
                    print!("{}", script.script);
                }
                Ok::<_, PluginError>(())
            })
            .await?
        }
        Command::Config(ConfigCommand::Save { file }) => {
            let contents = read_input(&file)?;
            supervise(&host, plugin.save_script(&contents)).await?
        }
        Command::Themes(ThemesCommand::List) => {
            supervise(&host, async {
                for theme in plugin.available_themes().await? {
                    println!("{theme}");
                }
                for url in plugin.theme_urls() {
                    println!("# {url}");
                }
                Ok::<_, PluginError>(())
            })
            .await?
        }
        Command::Themes(ThemesCommand::Set { urls }) => {
            supervise(&host, plugin.put_setting(setting_keys::THEME_URLS, json!(urls))).await?
        }
        Command::Migrate(MigrateCommand::Config { file }) => {
            let contents = read_input(&file)?;
            let migrate = plugin.put_setting(setting_keys::LEGACY_CONFIG, json!(contents));
            supervise(&host, migrate).await?
        }
        Command::Migrate(MigrateCommand::Themes { urls }) => {
            supervise(&host, plugin.put_setting(setting_keys::LEGACY_THEMES, json!(urls))).await?
        }
    };

    if outcome == Outcome::Restart || host.restart_count() > 0 {
        tracing::info!("exiting so the plugin can be restarted");
        return Ok(ExitCode::from(RESTART_EXIT_CODE));
    }
    Ok(ExitCode::SUCCESS)
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut contents = String::new();
        std::io::stdin()
            .read_to_string(&mut contents)
            .context("failed to read stdin")?;
        return Ok(contents);
    }
    std::fs::read_to_string(file).with_context(|| format!("failed to read {file}"))
}

/// Restores cooked mode on drop.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> btop_plugin::Result<Option<Self>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        crossterm::terminal::enable_raw_mode()
            .map_err(|e| PluginError::Terminal(format!("failed to enable raw mode: {e}")))?;
        Ok(Some(Self))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

async fn relay_stdio(plugin: &BtopPlugin) -> btop_plugin::Result<()> {
    plugin.wait_ready().await?;

    let options = crossterm::terminal::size()
        .ok()
        .map(|(cols, rows)| TerminalOptions {
            cmd: Vec::new(),
            rows: Some(rows),
            cols: Some(cols),
        });
    let _raw = RawModeGuard::enable()?;

    let input: ByteStream = Box::pin(async_stream::stream! {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => yield buf[..n].to_vec(),
            }
        }
    });

    let mut output = plugin.connect_stream(input, options).await?;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = output.next().await {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }
    Ok(())
}
