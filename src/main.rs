/// economyflow: workflow orchestration engine with per-lane cron locks
///
/// `serve` runs the HTTP surface, lane workers and maintenance jobs.
/// `lane ...` commands are the setup and operator tooling for lock rows.

use anyhow::{Context, Result};
use clap::{error::ErrorKind, Parser, Subcommand};
use economyflow::{
    config::Config,
    database,
    lane::{gate::SequenceGate, storage::CronProcessStorage, types::LaneKey},
    server::start_server,
};
use serde_json::{json, Value};
use std::{process::ExitCode, time::Duration};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "economyflow", version, about = "Workflow orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server, lane workers and maintenance jobs
    Serve,

    /// Manage lane lock rows
    Lane {
        #[command(subcommand)]
        command: LaneCommand,
    },
}

#[derive(Debug, Subcommand)]
enum LaneCommand {
    /// Register a new lane (created stopped)
    Register {
        /// Process kind, e.g. workflowRouter
        #[arg(long)]
        kind: String,

        #[arg(long)]
        chain_id: u64,

        /// Optional split of a chain's work into groups
        #[arg(long)]
        group_id: Option<String>,

        /// Lane params as a JSON object, e.g. '{"prefetch": 5}'
        #[arg(long)]
        params: Option<String>,

        /// Last accepted sequence number to start from
        #[arg(long, default_value_t = 0)]
        initial_sequence: i64,
    },

    /// Force a lane to stopped, whoever holds it
    Stop {
        #[arg(long)]
        lane_key: String,
    },

    /// List all lanes
    List,

    /// List running lanes whose heartbeat is older than the threshold
    Stale {
        #[arg(long)]
        older_than_secs: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration (defaults to 0.0.0.0:3004 and a local SQLite file)
    let config = Config::default();

    match cli.command {
        Command::Serve => start_server(config).await,
        Command::Lane { command } => {
            let pool = database::connect(&config.database)
                .await
                .context("Failed to open database")?;
            let gate = SequenceGate::new(CronProcessStorage::new(pool));
            run_lane_command(&gate, command).await
        }
    }
}

async fn run_lane_command(gate: &SequenceGate, command: LaneCommand) -> Result<()> {
    match command {
        LaneCommand::Register {
            kind,
            chain_id,
            group_id,
            params,
            initial_sequence,
        } => {
            let mut lane_key = LaneKey::new(kind, chain_id);
            if let Some(group_id) = group_id {
                lane_key = lane_key.with_group(group_id);
            }
            let params = lane_params(params.as_deref(), chain_id)?;
            let process = gate.register(&lane_key, &params, initial_sequence).await?;
            print_json(&process)
        }
        LaneCommand::Stop { lane_key } => {
            let lane_key: LaneKey = lane_key.parse()?;
            let released = gate.force_release(&lane_key).await?;
            print_json(&json!({ "laneKey": lane_key.to_string(), "released": released }))
        }
        LaneCommand::List => print_json(&gate.lanes().await?),
        LaneCommand::Stale { older_than_secs } => {
            print_json(&gate.stale_locks(Duration::from_secs(older_than_secs)).await?)
        }
    }
}

/// Parse `--params`, defaulting `chainId` to the lane's chain
fn lane_params(raw: Option<&str>, chain_id: u64) -> Result<Value> {
    let mut params = match raw {
        Some(raw) => serde_json::from_str::<Value>(raw).context("--params is not valid JSON")?,
        None => json!({}),
    };
    let fields = params
        .as_object_mut()
        .context("--params must be a JSON object")?;
    fields.entry("chainId").or_insert_with(|| json!(chain_id));
    Ok(params)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_parses_all_flags() {
        let cli = Cli::try_parse_from([
            "economyflow",
            "lane",
            "register",
            "--kind",
            "workflowRouter",
            "--chain-id",
            "1409",
            "--group-id",
            "g1",
            "--params",
            r#"{"prefetch": 5}"#,
            "--initial-sequence",
            "5",
        ])
        .unwrap();

        match cli.command {
            Command::Lane {
                command:
                    LaneCommand::Register {
                        kind,
                        chain_id,
                        group_id,
                        initial_sequence,
                        ..
                    },
            } => {
                assert_eq!(kind, "workflowRouter");
                assert_eq!(chain_id, 1409);
                assert_eq!(group_id.as_deref(), Some("g1"));
                assert_eq!(initial_sequence, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn missing_required_flag_is_a_usage_error() {
        let error = Cli::try_parse_from(["economyflow", "lane", "register", "--kind", "x"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);

        let error = Cli::try_parse_from(["economyflow", "lane", "stop"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn help_is_not_a_failure() {
        let error = Cli::try_parse_from(["economyflow", "--help"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn lane_params_default_the_chain_id() {
        assert_eq!(lane_params(None, 7).unwrap(), json!({"chainId": 7}));
        assert_eq!(
            lane_params(Some(r#"{"chainId": 8, "prefetch": 2}"#), 7).unwrap(),
            json!({"chainId": 8, "prefetch": 2})
        );
        assert!(lane_params(Some("[1]"), 7).is_err());
        assert!(lane_params(Some("{"), 7).is_err());
    }
}
