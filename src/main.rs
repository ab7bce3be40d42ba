//! Flowguard - Flow Execution Control
//!
//! Demo binary: drives a simulated content flow through the full control
//! stack with configurable failure injection.

use clap::{Parser, Subcommand};
use colored::Colorize;
use flowguard::{
    FlowConfig, RetryPolicy, Stage, StageContext, StageExecutor, StageManager, StageOutcome,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "flowguard")]
#[command(version = "0.1.0")]
#[command(about = "Execution control for multi-stage content flows", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated flow through all stages
    Run {
        /// Topic for the simulated content flow
        #[arg(short, long, default_value = "distributed systems")]
        topic: String,

        /// Inject failures at this stage (validate, research, audience,
        /// draft, style, quality)
        #[arg(long, value_name = "STAGE")]
        fail_stage: Option<String>,

        /// How many consecutive attempts fail before the stage succeeds
        #[arg(long, default_value = "2", value_name = "N")]
        fail_times: u32,

        /// Make injected failures fatal instead of retryable
        #[arg(long)]
        fatal: bool,

        /// Simulated per-stage work duration in milliseconds
        #[arg(long, default_value = "50", value_name = "MS")]
        stage_delay: u64,

        /// Maximum retry attempts per stage
        #[arg(long, default_value = "3")]
        max_attempts: u32,

        /// Print the full health report as JSON after the flow ends
        #[arg(long)]
        report: bool,
    },

    /// Print the stage pipeline
    Stages,
}

/// Executor that sleeps a bit per stage and optionally fails on cue.
struct SimulatedExecutor {
    fail_stage: Option<Stage>,
    fail_times: u32,
    fatal: bool,
    stage_delay: Duration,
    failures_injected: AtomicU32,
}

#[async_trait::async_trait]
impl StageExecutor for SimulatedExecutor {
    async fn execute(&self, stage: Stage, input: &Value, ctx: &StageContext) -> StageOutcome {
        if let Err(e) = ctx.enter(&format!("simulate:{}", stage)) {
            return StageOutcome::fatal(e.to_string());
        }
        tokio::time::sleep(self.stage_delay).await;

        if self.fail_stage == Some(stage) {
            let injected = self.failures_injected.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return StageOutcome::fatal(format!("injected fatal failure at {}", stage));
            }
            if injected < self.fail_times {
                println!(
                    "  {} {} (attempt {} of the injected failures)",
                    "fail".red(),
                    stage,
                    injected + 1
                );
                return StageOutcome::retryable(format!("injected failure at {}", stage));
            }
        }

        println!("  {} {}", "ok".green(), stage);
        let mut output = input.clone();
        if let Some(map) = output.as_object_mut() {
            map.insert(format!("{}_done", stage), json!(true));
        }
        StageOutcome::success(output)
    }
}

fn parse_stage(name: &str) -> Option<Stage> {
    Stage::pipeline()
        .into_iter()
        .find(|s| s.to_string() == name.to_lowercase())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "flowguard=debug,info"
    } else {
        "flowguard=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            topic,
            fail_stage,
            fail_times,
            fatal,
            stage_delay,
            max_attempts,
            report,
        } => {
            let fail_stage = match fail_stage.as_deref() {
                Some(name) => match parse_stage(name) {
                    Some(stage) => Some(stage),
                    None => {
                        eprintln!(
                            "{} Unknown stage '{}'. Valid stages: validate, research, audience, draft, style, quality",
                            "Error:".red().bold(),
                            name
                        );
                        std::process::exit(1);
                    }
                },
                None => None,
            };

            // Short backoff so injected failures recover quickly in a demo.
            let config = FlowConfig::default().with_default_retry(RetryPolicy {
                max_attempts,
                base_delay_ms: 200,
                multiplier: 2.0,
                max_delay_ms: 2_000,
                jitter: 0.1,
            });

            let executor = Arc::new(SimulatedExecutor {
                fail_stage,
                fail_times,
                fatal,
                stage_delay: Duration::from_millis(stage_delay),
                failures_injected: AtomicU32::new(0),
            });

            let manager = match StageManager::new(config, executor) {
                Ok(manager) => manager,
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    std::process::exit(1);
                }
            };
            let state = manager.state();

            println!("{} flow for topic: {}", "Starting".cyan().bold(), topic);
            let result = manager.run(json!({ "topic": topic })).await;

            println!();
            if result.is_completed() {
                println!("{} flow {}", "Completed".green().bold(), result.flow_id);
                if let Some(output) = &result.output {
                    println!("Output: {}", output);
                }
            } else {
                println!("{} flow {}", "Failed".red().bold(), result.flow_id);
                if let Some(error) = &result.error {
                    println!("Reason: {}", error);
                }
            }
            println!(
                "Transitions: {}, events: {}",
                result.audit_trail.transitions.len(),
                result.audit_trail.events.len()
            );

            if report {
                match serde_json::to_string_pretty(&state.health_report()) {
                    Ok(rendered) => println!("{}", rendered),
                    Err(e) => eprintln!("{} could not render report: {}", "Error:".red().bold(), e),
                }
            }

            if !result.is_completed() {
                std::process::exit(1);
            }
        }

        Commands::Stages => {
            for stage in Stage::pipeline() {
                let terminal = match stage.successor() {
                    Ok(next) => format!("-> {}", next),
                    Err(_) => String::new(),
                };
                println!("{:<10} {}", stage.to_string().bold(), terminal);
            }
        }
    }
}
