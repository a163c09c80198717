//! Diagnostic CLI for flakeguard: inspect environment detection, mode
//! resolution, and the failure taxonomy from a shell.
#![forbid(unsafe_code)]

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use flakeguard_core::classify::classify;
use flakeguard_core::mode::{self, TestModeConfig};
use flakeguard_core::probe::{EnvSnapshot, EnvironmentInfo};
use flakeguard_core::tags::{extract_tags, skip_reason};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flakeguard", about = "Test orchestration diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and print the environment (CI provider, OS, resources)
    Doctor {
        /// Output format (json or pretty)
        #[arg(long, default_value = "pretty")]
        format: OutputFormat,
    },
    /// Resolve the active test mode and print its config
    Mode {
        #[arg(long, default_value = "pretty")]
        format: OutputFormat,

        /// Also write the resolved config's variables into the environment
        /// report (dry-run: nothing is applied)
        #[arg(long)]
        show_env: bool,
    },
    /// Classify an error message into the failure taxonomy
    Classify {
        /// The error message to classify
        message: String,

        /// Optional stack trace text
        #[arg(long, default_value = "")]
        stack: String,
    },
    /// Evaluate whether a test title would run under the active mode
    Check {
        /// Test title, including any @tags
        title: String,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Json,
    Pretty,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FLAKEGUARD_DEBUG")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let env = EnvSnapshot::from_process();

    match cli.command {
        Commands::Doctor { format } => {
            let info = EnvironmentInfo::detect(&env);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
                OutputFormat::Pretty => print_doctor(&info),
            }
        }
        Commands::Mode { format, show_env } => {
            let config = mode::resolve_config(&env);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Pretty => print_mode(&config, show_env),
            }
        }
        Commands::Classify { message, stack } => {
            let kind = classify(&message, &stack);
            println!("{}", kind.label());
            println!("hint: {}", kind.recovery_hint());
        }
        Commands::Check { title } => {
            let config = mode::resolve_config(&env);
            let tags = extract_tags(&title);
            match skip_reason(&tags, &config) {
                Some(reason) => println!("skip ({reason}) under mode {}", config.mode),
                None => println!("run under mode {}", config.mode),
            }
        }
    }

    Ok(())
}

fn print_doctor(info: &EnvironmentInfo) {
    println!("CI:          {} ({:?})", info.is_ci, info.ci_provider);
    println!("OS:          {:?} ({})", info.os, info.os.slug());
    println!("Run id:      {}", info.run_id);
    println!("Harness:     {}", info.harness_version);
    if let Some(cores) = info.resources.cpu_cores {
        println!("CPU cores:   {cores}");
    }
    if let Some(total) = info.resources.total_memory_bytes {
        println!("Memory:      {:.1} GiB total", total as f64 / (1 << 30) as f64);
    }
    if let Some(free) = info.resources.free_memory_bytes {
        println!("Available:   {:.1} GiB", free as f64 / (1 << 30) as f64);
    }
    if let Some([one, five, fifteen]) = info.resources.load_average {
        println!("Load:        {one:.2} {five:.2} {fifteen:.2}");
    }
}

fn print_mode(config: &TestModeConfig, show_env: bool) {
    println!("Mode:        {}", config.mode);
    println!("Retries:     {}", config.retries);
    println!(
        "Timeouts:    test {:?}, action {:?}, navigation {:?}",
        config.test_timeout, config.action_timeout, config.navigation_timeout
    );
    println!(
        "Visual:      {} (threshold {:.2}, preset {:?})",
        config.visual_testing_enabled, config.visual_test_threshold, config.threshold_preset
    );
    println!("Browsers:    {:?}", config.browsers);
    if !config.include_tags.is_empty() {
        println!("Include:     {:?}", config.include_tags);
    }
    if !config.exclude_tags.is_empty() {
        println!("Exclude:     {:?}", config.exclude_tags);
    }
    if show_env {
        println!("Environment variables the mode would apply:");
        for (key, value) in &config.environment_variables {
            println!("  {key}={value}");
        }
    }
}
