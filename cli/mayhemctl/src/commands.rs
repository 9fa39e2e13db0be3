//! CLI commands.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};

use crate::client::ControlClient;
use crate::error::CliError;

/// mayhemctl - control a running mayhem proxy.
#[derive(Debug, Parser)]
#[command(name = "mayhemctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Base URL of the control API.
    #[arg(
        long,
        global = true,
        env = "MAYHEM_CONTROL_URL",
        default_value = "http://localhost:8080"
    )]
    url: String,

    /// Print raw JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the behaviors the proxy knows.
    Behaviors,

    /// Show the active behavior.
    Get,

    /// Switch the active behavior.
    Set {
        /// Behavior name.
        name: String,

        /// Behavior option, repeatable.
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let client = ControlClient::new(&self.url)?;

        match self.command {
            Commands::Behaviors => {
                let list = client.behaviors().await?;
                if self.json {
                    println!("{}", serde_json::json!({ "behaviors": list.behaviors }));
                } else {
                    for name in list.behaviors {
                        println!("{name}");
                    }
                }
            }
            Commands::Get => {
                let active = client.active_behavior().await?;
                if self.json {
                    println!("{}", serde_json::json!({ "behavior": active.behavior }));
                } else {
                    println!("{}", active.behavior);
                }
            }
            Commands::Set { name, options } => {
                let options = parse_options(&options)?;
                client.set_behavior(&name, options).await?;
                if self.json {
                    println!("{}", serde_json::json!({ "status": "ok" }));
                } else {
                    println!("{} active behavior is now {}", "Success:".green().bold(), name);
                }
            }
        }

        Ok(())
    }
}

/// Parse `KEY=VALUE` pairs. Values that read as JSON (numbers, booleans)
/// keep their type; anything else is sent as a string.
fn parse_options(raw: &[String]) -> Result<Map<String, Value>, CliError> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| CliError::InvalidOption(pair.clone()))?;
            let value = serde_json::from_str::<Value>(value)
                .ok()
                .filter(|v| !v.is_object() && !v.is_array())
                .unwrap_or_else(|| Value::String(value.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}
