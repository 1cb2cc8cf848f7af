//! `warden`: operator tooling for rule files and runtime configs.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use warden_core::{
    AuthorProfile, Decision, EngineConfig, Evaluation, EvaluationContext, Judgment,
    PatternSanitizer, Question, RuleEngine, RuleSet, Subject,
};
use warden_runtime::{ProviderRegistry, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "Warden content moderation tools")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true, help = "Output machine-readable JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a rules file and list rules in evaluation order
    ValidateRules {
        path: PathBuf,

        /// Runtime config whose engine settings apply
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check a runtime config file
    ValidateConfig { path: PathBuf },

    /// Decide a content event offline; AI rules get no judgment
    Evaluate {
        #[arg(long)]
        rules: PathBuf,

        /// Event file with `subject`, `profile` and optional `trust_score`
        event: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// One content event as captured for a dry run.
#[derive(Debug, Deserialize)]
struct Event {
    subject: Subject,
    profile: AuthorProfile,
    #[serde(default)]
    trust_score: Option<u8>,
    /// Evaluation time; defaults to now
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct RuleSummary {
    id: String,
    priority: i64,
    action: String,
    questions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ConfigSummary {
    providers: Vec<String>,
    daily_limit_usd: f64,
    monthly_limit_usd: Option<f64>,
    max_questions_per_batch: usize,
}

#[derive(Debug, Serialize)]
struct OfflineDecision {
    decision: Decision,
    /// Questions a live run would have asked
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unanswered: Vec<Question>,
}

const OFFLINE_REASON: &str = "offline evaluation";

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::ValidateRules { path, config } => {
            let engine = load_engine(&path, engine_config(config.as_deref())?)?;
            let rules: Vec<RuleSummary> = engine
                .rules()
                .iter()
                .map(|r| RuleSummary {
                    id: r.id().to_string(),
                    priority: r.priority(),
                    action: r.action().to_string(),
                    questions: r.questions().iter().map(|q| q.id.clone()).collect(),
                })
                .collect();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                println!("{} rule(s) OK", rules.len());
                for rule in &rules {
                    let ai = if rule.questions.is_empty() {
                        String::new()
                    } else {
                        format!(" asks [{}]", rule.questions.join(", "))
                    };
                    println!("  {:>5}  {} -> {}{}", rule.priority, rule.id, rule.action, ai);
                }
            }
        }

        Commands::ValidateConfig { path } => {
            let config = load_config(&path)?;
            let registry = ProviderRegistry::with_defaults();
            let mut problems = Vec::new();
            for provider in &config.providers {
                if let Err(e) = registry.validate(provider) {
                    problems.push(format!("provider '{}': {}", provider.instance_name(), e));
                }
            }
            if !problems.is_empty() {
                bail!("{}", problems.join("\n"));
            }
            // Settings may hold credentials; only the summary is printed
            let summary = ConfigSummary {
                providers: config
                    .providers
                    .iter()
                    .map(|p| p.instance_name().to_string())
                    .collect(),
                daily_limit_usd: config.budget.daily_limit_usd,
                monthly_limit_usd: config.budget.monthly_limit_usd,
                max_questions_per_batch: config.max_questions_per_batch,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Config OK");
                println!("  providers: {}", summary.providers.join(" > "));
                println!("  daily budget: ${:.2}", summary.daily_limit_usd);
                if let Some(monthly) = summary.monthly_limit_usd {
                    println!("  monthly budget: ${:.2}", monthly);
                }
                println!("  max questions per batch: {}", summary.max_questions_per_batch);
            }
        }

        Commands::Evaluate {
            rules,
            event,
            config,
        } => {
            let engine = load_engine(&rules, engine_config(config.as_deref())?)?;
            let event = load_event(&event)?;
            let outcome = evaluate_offline(&engine, &event)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                let d = &outcome.decision;
                println!("{} ({})", d.action, d.matched_rule_id);
                println!("  {}", d.reasoning);
                if let Some(message) = &d.message {
                    println!("  message: {}", message);
                }
                for q in &outcome.unanswered {
                    println!("  would ask {}: {}", q.id, q.text);
                }
            }
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let config = RuntimeConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    debug!(path = %path.display(), providers = config.providers.len(), "Loaded config");
    Ok(config)
}

fn engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => Ok(load_config(path)?.engine_config()),
        None => Ok(EngineConfig::default()),
    }
}

fn load_engine(path: &Path, config: EngineConfig) -> Result<RuleEngine> {
    let set = if is_json(path) {
        RuleSet::from_json_file(path)
    } else {
        RuleSet::from_yaml_file(path)
    }
    .with_context(|| format!("Failed to load rules {}", path.display()))?;
    let engine = RuleEngine::from_rule_set(&set, config)
        .with_context(|| format!("Invalid rules {}", path.display()))?;
    info!(path = %path.display(), rules = engine.rules().len(), "Rules compiled");
    Ok(engine)
}

fn load_event(path: &Path) -> Result<Event> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event {}", path.display()))?;
    let event = if is_json(path) {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(event)
}

/// Hard rules decide as usual; the first rule needing answers yields the
/// no-judgment action.
fn evaluate_offline(engine: &RuleEngine, event: &Event) -> Result<OfflineDecision> {
    let sanitizer = PatternSanitizer::new();
    let ctx = EvaluationContext::with_sanitizer(
        &event.subject,
        &event.profile,
        event.trust_score,
        &sanitizer,
    )
    .at(event.at.unwrap_or_else(Utc::now));

    let unanswered = match engine.evaluate(&ctx, Judgment::Pending) {
        Evaluation::Decided(decision) => {
            return Ok(OfflineDecision {
                decision,
                unanswered: Vec::new(),
            })
        }
        Evaluation::NeedsJudgment(questions) => questions,
    };
    match engine.evaluate(&ctx, Judgment::Unavailable { reason: OFFLINE_REASON }) {
        Evaluation::Decided(decision) => Ok(OfflineDecision {
            decision,
            unanswered,
        }),
        Evaluation::NeedsJudgment(_) => bail!("rules still need answers for {}", event.subject.id),
    }
}
