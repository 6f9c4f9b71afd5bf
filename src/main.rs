use chat_automod::config::{Config, HostConfig};
use chat_automod::normalization::TextNormalizer;
use chat_automod::page::memory::{MemoryPage, MessageSpec};
use chat_automod::{
    AutoMod, ChatPage, CommandResponse, HttpModerationClient, MemorySettingsStore,
    ModerationEndpoint, TriggerSet,
};
use clap::{Arg, Command};
use log::LevelFilter;
use serde::Deserialize;
use std::process;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long a replay waits for the queue to drain.
const REPLAY_DRAIN_LIMIT: Duration = Duration::from_secs(120);

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let matches = Command::new("chat-automod")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Automatic spam moderation for live chat rooms")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("chat-automod.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate trigger rules and host settings")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-message")
                .long("test-message")
                .value_name("TEXT")
                .help("Classify a single chat message against the configured triggers")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("FILE")
                .help("Replay a JSON-lines chat script through the moderation pipeline")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("chat-automod.yaml");

    let config = match Config::load_or_default(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(text) = matches.get_one::<String>("test-message") {
        test_message(&config, text);
        return;
    }

    if let Some(script) = matches.get_one::<String>("replay") {
        if let Err(e) = replay(&config, script).await {
            eprintln!("Replay failed: {e:#}");
            process::exit(1);
        }
        return;
    }

    println!("Nothing to do. Use --help to list the available commands.");
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
        Ok(()) => println!("Default configuration written to: {path}"),
        Err(e) => {
            eprintln!("Error writing configuration: {e}");
            process::exit(1);
        }
    }
}

fn load_triggers(config: &Config) -> TriggerSet {
    match TriggerSet::parse(&config.settings.trigger_rules.join("\n")) {
        Ok(triggers) => triggers,
        Err(e) => {
            println!("❌ Trigger validation failed:");
            println!("Error: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();

    let triggers = load_triggers(config);
    println!("Enabled: {}", config.settings.enabled);
    println!("Mode: {}", config.settings.mode);
    if config.settings.trigger_rules.iter().all(|r| r.trim().is_empty()) {
        println!("No trigger rules configured, loading the default triggers");
    }
    println!("Number of trigger rules: {}", triggers.len());
    for (i, rule) in triggers.rules().iter().enumerate() {
        println!("  Rule {}: {} ({})", i + 1, rule.raw(), rule.kind());
    }
    println!("All trigger patterns compiled successfully.");

    if let Some(flag) = &config.settings.network_blocked {
        println!(
            "⚠️  Network actions blocked since {} ({})",
            flag.blocked_at, flag.reason
        );
    }

    report_host(&config.host);
    println!("Ban reason label: {}", config.ban_reason_label);
    println!("✅ Configuration validated");
}

fn report_host(host: &HostConfig) {
    if !host.network_configured() {
        println!("Host API not configured, moderation will use UI automation only");
        return;
    }
    match HttpModerationClient::new(host) {
        Ok(_) => println!(
            "Host API: {} (room {}, timeout {}s)",
            host.api_base.as_deref().unwrap_or_default(),
            host.room_id.as_deref().unwrap_or_default(),
            host.timeout_seconds
        ),
        Err(e) => {
            println!("❌ Host API settings are invalid: {e}");
            process::exit(1);
        }
    }
}

fn test_message(config: &Config, text: &str) {
    let triggers = load_triggers(config);
    let normalizer = TextNormalizer::new();

    println!("Message: {text}");
    println!("Normalized: {}", normalizer.normalize(text));
    let indicators = normalizer.obfuscation_indicators(text);
    if !indicators.is_empty() {
        println!("Obfuscation: {indicators:?}");
    }

    match triggers.find_match(text) {
        Some(rule) => println!("🚫 SPAM (matched '{rule}')"),
        None => println!("✅ clean"),
    }
}

/// One line of a replay script.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplayStep {
    Wait { wait_ms: u64 },
    Command { command: chat_automod::Command },
    Message(MessageSpec),
}

fn parse_script(content: &str) -> anyhow::Result<Vec<ReplayStep>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| anyhow::anyhow!("line {}: {}", i + 1, e))
        })
        .collect()
}

async fn replay(config: &Config, script: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(script)?;
    let steps = parse_script(&content)?;
    log::info!("Replaying {} steps from {}", steps.len(), script);

    let page = Arc::new(MemoryPage::new());
    let store = Arc::new(MemorySettingsStore::new(config.settings.clone()));
    let endpoint: Option<Arc<dyn ModerationEndpoint>> = if config.host.network_configured() {
        Some(Arc::new(HttpModerationClient::new(&config.host)?))
    } else {
        None
    };

    let automod = AutoMod::new(
        page.clone(),
        store,
        endpoint,
        config.ban_reason_label.clone(),
        "cli-replay",
    )?;
    automod.start();

    for step in steps {
        match step {
            ReplayStep::Wait { wait_ms } => {
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            }
            ReplayStep::Command { command } => {
                let response = automod.handle_command(command);
                if let CommandResponse::Failed { error } = &response {
                    log::warn!("Command {command:?} failed: {error}");
                }
                println!("{}", serde_json::to_string(&response)?);
            }
            ReplayStep::Message(spec) => {
                page.push_message(spec);
            }
        }
        tokio::task::yield_now().await;
    }

    wait_for_drain(&automod).await;
    automod.shutdown();

    println!();
    automod.stats().print_stats();
    println!();
    println!("Messages left on page: {}", page.list_messages().len());
    println!("Removed: {}", page.removed().len());
    for (id, reason) in page.bans() {
        println!("  banned sender of {} ({})", id.as_str(), reason);
    }
    let hidden = page
        .list_messages()
        .iter()
        .filter(|id| page.is_hidden(id))
        .count();
    println!("Hidden: {hidden}");
    Ok(())
}

async fn wait_for_drain(automod: &Arc<AutoMod>) {
    let deadline = tokio::time::Instant::now() + REPLAY_DRAIN_LIMIT;
    // Let the debounce window elapse before the first idle check.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    while !automod.scheduler().is_idle() {
        if tokio::time::Instant::now() >= deadline {
            log::warn!(
                "Replay ended with {} messages still queued",
                automod.scheduler().pending_len()
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
