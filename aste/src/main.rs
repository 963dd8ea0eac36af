//! `aste` command line.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use aste::core::classifier::classify_with_return_code;
use aste::core::rot47::rot47;
use aste::core::rulesets::RuleBook;
use aste::exit_codes;
use aste::io::config::{load_config, sample_config, write_config};
use aste::logging;
use aste::run::{StartOptions, start};

#[derive(Parser)]
#[command(
    name = "aste",
    version,
    about = "Nightly build bot: runs build steps and classifies their output"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task, then print (and mail) its report.
    Start {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        task: String,
        /// Keep the run logs in memory.
        #[arg(long)]
        no_file_logging: bool,
        /// `key=value` template arguments; flag names override `[flags]`.
        #[arg(value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },
    /// Print the rot47 encoding of TEXT (for passwords in the config).
    Rot47 { text: String },
    /// List the tasks of a config file.
    Tasks {
        #[arg(long)]
        config: PathBuf,
    },
    /// Classify a saved log file and print the findings.
    Classify {
        /// Config declaring extra rule sets. Built-in rule sets only when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        ruleset: String,
        /// Comma-separated groups; the rule set defaults when omitted.
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
        /// Also feed return-code rules.
        #[arg(long)]
        return_code: Option<i32>,
        file: PathBuf,
    },
    /// Write a starter config file.
    Init {
        #[arg(long, default_value = "aste.toml")]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(cli.command));
}

fn run(command: Command) -> i32 {
    let result = match command {
        Command::Start {
            config,
            task,
            no_file_logging,
            args,
        } => cmd_start(StartOptions {
            config,
            task,
            no_file_logging,
            args: args.into_iter().collect(),
        }),
        Command::Rot47 { text } => {
            println!("{}", rot47(&text));
            Ok(exit_codes::OK)
        }
        Command::Tasks { config } => cmd_tasks(&config),
        Command::Classify {
            config,
            ruleset,
            groups,
            return_code,
            file,
        } => cmd_classify(config.as_deref(), &ruleset, &groups, return_code, &file),
        Command::Init { config, force } => cmd_init(&config, force),
    };
    result.unwrap_or_else(|err| {
        eprintln!("{err:#}");
        exit_codes::INVALID
    })
}

fn cmd_start(options: StartOptions) -> Result<i32> {
    let report = start(&options)?;
    println!("{}", report.subject);
    println!();
    print!("{}", report.body);
    Ok(report.exit_code)
}

fn cmd_tasks(config: &Path) -> Result<i32> {
    let cfg = load_config(config)?;
    for (name, task) in &cfg.tasks {
        if task.description.is_empty() {
            println!("{name}");
        } else {
            println!("{name}: {}", task.description);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_classify(
    config: Option<&Path>,
    ruleset: &str,
    groups: &[String],
    return_code: Option<i32>,
    file: &Path,
) -> Result<i32> {
    let book = match config {
        Some(path) => load_config(path)?.rule_book()?,
        None => RuleBook::builtin()?,
    };
    let rules = book.get(ruleset)?;
    let groups = if groups.is_empty() {
        rules.default_groups.clone()
    } else {
        groups.to_vec()
    };
    let bytes = fs::read(file).with_context(|| format!("read {}", file.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let session = classify_with_return_code(rules, &groups, &text, return_code)?;

    for finding in &session.accepted {
        println!("[{}] {}", finding.group, finding.value);
    }
    for escalation in &session.fatal_errors {
        println!("{}: {}", escalation.severity, escalation.message);
    }
    Ok(if session.is_fatal() {
        exit_codes::BUILD_ERROR
    } else {
        exit_codes::OK
    })
}

fn cmd_init(config: &Path, force: bool) -> Result<i32> {
    if config.exists() && !force {
        bail!("{} exists (use --force to overwrite)", config.display());
    }
    write_config(config, &sample_config())?;
    println!("wrote {}", config.display());
    Ok(exit_codes::OK)
}

fn parse_key_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got '{raw}'"))?;
    if key.trim().is_empty() {
        bail!("empty key in '{raw}'");
    }
    Ok((key.trim().to_string(), value.to_string()))
}
