//! `graft run` command implementation
//!
//! Cold-starts the configured plugins, then reads one command per line from
//! stdin. Lines starting with `:` control the host itself.

use crate::config::GraftConfig;
use crate::error::CliError;
use colored::Colorize;
use graft_kernel::{CommandRegistry, PluginInfo, ReloadEvent};
use graft_plugins::HotReloadManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// One line of host input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Reload { plugin: String, path: PathBuf },
    Debug(bool),
    List,
    Quit,
    Command { name: String, args: Vec<String> },
    Invalid(String),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Input> {
    let mut words = line.split_whitespace();
    let head = words.next()?;
    let rest: Vec<String> = words.map(str::to_string).collect();

    let input = match head {
        ":reload" => match rest.as_slice() {
            [plugin, path] => Input::Reload {
                plugin: plugin.clone(),
                path: PathBuf::from(path),
            },
            _ => Input::Invalid("usage: :reload <plugin> <module>".to_string()),
        },
        ":debug" => match rest.as_slice() {
            [flag] if flag == "on" => Input::Debug(true),
            [flag] if flag == "off" => Input::Debug(false),
            _ => Input::Invalid("usage: :debug on|off".to_string()),
        },
        ":list" => Input::List,
        ":quit" | ":q" => Input::Quit,
        other if other.starts_with(':') => Input::Invalid(format!("unknown host command {other}")),
        name => Input::Command {
            name: name.to_string(),
            args: rest,
        },
    };
    Some(input)
}

/// Execute the `graft run` command
pub async fn run(config: GraftConfig) -> Result<(), CliError> {
    let registry = Arc::new(CommandRegistry::new());
    let manager = HotReloadManager::new(config.hot_reload.clone(), registry.clone());

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} reload events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for plugin in &config.plugins {
        let mut info = PluginInfo::new(&plugin.name);
        if let Some(description) = &plugin.description {
            info = info.with_description(description);
        }
        manager.add_plugin(info)?;
        if let Err(report) = manager.reload(&plugin.name, &plugin.module).await {
            println!("{} Failed to start '{}': {:?}", "✗".red(), plugin.name, report);
        }
    }

    println!(
        "{} {} plugins, {} commands. Type :quit to exit.",
        "→".green(),
        manager.list_plugins().len(),
        registry.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(input) = parse_line(&line) else {
            continue;
        };
        match input {
            Input::Quit => break,
            Input::Reload { plugin, path } => match manager.reload(&plugin, &path).await {
                Ok(outcome) => println!(
                    "{} '{}' {} in {:?}",
                    "✓".green(),
                    outcome.plugin,
                    outcome.kind,
                    outcome.duration
                ),
                Err(report) => println!("{} {:?}", "✗".red(), report),
            },
            Input::Debug(active) => {
                registry.set_debuggee_active(active);
                println!("debuggee {}", if active { "attached" } else { "detached" });
            }
            Input::List => list(&manager, &registry),
            Input::Command { name, args } => match registry.execute(&name, &args) {
                Ok(true) => println!("{}", "ok".green()),
                Ok(false) => println!("{}", "failed".yellow()),
                Err(err) => println!("{} {}", "✗".red(), err),
            },
            Input::Invalid(message) => println!("{} {}", "✗".red(), message),
        }
    }

    manager.shutdown().await;
    Ok(())
}

fn list(manager: &HotReloadManager, registry: &CommandRegistry) {
    for name in manager.list_plugins() {
        let Some(plugin) = manager.get_plugin(&name) else {
            continue;
        };
        let module = plugin
            .module_path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} v{} [{}] {} ({} reloads)",
            name.bold(),
            plugin.info().version,
            plugin.phase(),
            module.cyan(),
            plugin.reload_count()
        );
    }
    for name in registry.names() {
        let debug = registry.is_debug_only(&name).unwrap_or(false);
        println!("    {}{}", name, if debug { " (debug only)" } else { "" });
    }
}

fn print_event(event: &ReloadEvent) {
    match event {
        ReloadEvent::ReloadFailed {
            plugin,
            phase,
            error,
            ..
        } => println!(
            "{} reload of '{}' failed during {}: {}",
            "✗".red(),
            plugin,
            phase,
            error
        ),
        ReloadEvent::CleanupWarning { path, reason, .. } => println!(
            "{} could not remove {}: {}",
            "!".yellow(),
            path.display(),
            reason
        ),
        ReloadEvent::ModuleRetired {
            path, leaked: true, ..
        } => println!(
            "{} {} stays loaded, old objects are still referenced",
            "!".yellow(),
            path.display()
        ),
        _ => {}
    }
}
