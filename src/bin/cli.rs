//! Agentry CLI
//!
//! Subcommands: `chat` (interactive), `run <task>` (one-shot),
//! `tools list|info`, `config init|show`. Exit code 0 on success,
//! 1 on any initialization or runtime failure.

use std::io::{BufRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;

use agentry::agent::{Agent, AgentConfig, ChatOptions, GenerationOptions, StreamCallbacks};
use agentry::config::{
    find_config, load_config, load_config_from_path, AgentFileConfig, CONFIG_FILENAME,
};
use agentry::guardrail::{Guardrail, Severity};
use agentry::memory::{CompactionConfig, MemoryManager};
use agentry::providers::{OpenAiCompatibleClient, OpenAiConfig};
use agentry::tools::{
    ConfirmDecision, ConfirmHandler, ConfirmRequest, MemorySaveTool, MemorySearchTool,
    PermissionLevel, PermissionPolicy, PermissionRule, ProfileSetTool, TaskCreateTool,
    TaskCurrentTool, TaskUpdateTool,
};

#[derive(Parser)]
#[command(name = "agentry", version, about = "Tool-using conversational agent")]
struct Cli {
    /// Path to agent.json (default: walk up from the working directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured model
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat session
    Chat,
    /// Run a single task and print the result
    Run {
        /// The task to perform
        task: String,
    },
    /// Inspect available tools
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ToolsCommand {
    /// List registered tools
    List,
    /// Show one tool's description and parameter schema
    Info { name: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a starter agent.json into the working directory
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        eprintln!("{} {:#}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => load_config_from_path(path)?,
        None => load_config()?,
    };
    if let Some(model) = cli.model {
        config.model = model;
    }

    match cli.command {
        Command::Chat => chat(config).await,
        Command::Run { task } => run_task(config, &task).await,
        Command::Tools { command } => tools(config, command).await,
        Command::Config { command } => config_command(command),
    }
}

/// Permission confirmations through the terminal
struct TerminalConfirm;

#[async_trait::async_trait]
impl ConfirmHandler for TerminalConfirm {
    async fn confirm(&self, request: &ConfirmRequest<'_>) -> ConfirmDecision {
        let prompt = format!(
            "Allow tool {} ({})?",
            style(request.tool_name).cyan(),
            request.description
        );
        let allowed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false);
        ConfirmDecision {
            allowed,
            remember: allowed,
            message: None,
        }
    }
}

async fn build_agent(config: &AgentFileConfig) -> anyhow::Result<Agent> {
    let api_key = config
        .api_key
        .as_ref()
        .context("no API key: set apiKey in agent.json or OPENAI_API_KEY")?;

    let base_url = config.base_url.clone().unwrap_or_else(|| match config.provider.as_str() {
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        "ollama" => "http://localhost:11434/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    });

    let llm = OpenAiCompatibleClient::new(OpenAiConfig::new(
        api_key.expose_secret().to_string().into(),
        base_url,
    ))?;

    let memory = MemoryManager::open(
        config
            .memory
            .path
            .to_str()
            .context("memory path is not valid UTF-8")?,
        None,
    )
    .await?;

    let rules: Vec<PermissionRule> = config
        .permission
        .rules
        .iter()
        .map(|r| {
            PermissionRule::new(
                r.tool_pattern.clone(),
                match r.level.as_str() {
                    "allow" => PermissionLevel::Allow,
                    "deny" => PermissionLevel::Deny,
                    _ => PermissionLevel::Confirm,
                },
            )
        })
        .collect();
    let mut permissions = PermissionPolicy::new(rules)
        .with_handler(Arc::new(TerminalConfirm))
        .with_session_memory(config.permission.session_memory);
    if let Some(ref level) = config.permission.default_level {
        permissions = permissions.with_default_level(match level.as_str() {
            "allow" => PermissionLevel::Allow,
            "deny" => PermissionLevel::Deny,
            _ => PermissionLevel::Confirm,
        });
    }

    let guardrail = Guardrail::new().with_block_threshold(
        match config.security.block_threshold.as_str() {
            "info" => Severity::Info,
            "warning" => Severity::Warning,
            _ => Severity::Critical,
        },
    );

    let agent_config = AgentConfig {
        system_prompt: config
            .system_prompt
            .clone()
            .unwrap_or_else(|| agentry::agent::DEFAULT_SYSTEM_PROMPT.to_string()),
        default_model: config.model.clone(),
        generation: GenerationOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            ..Default::default()
        },
        ..Default::default()
    };

    let compaction = CompactionConfig {
        max_context_tokens: config.memory.max_context_tokens.unwrap_or(128_000),
        ..Default::default()
    };

    let mut stop_config = agentry::agent::StopConfig::standard();
    if let Some(max) = config.max_iterations {
        stop_config.max_iterations = Some(max);
    }

    let agent = Agent::builder(Arc::new(llm))
        .with_config(agent_config)
        .with_memory(memory.clone())
        .with_compaction(compaction)
        .with_stop_config(stop_config)
        .with_permissions(permissions)
        .with_guardrail(guardrail)
        .build();

    // Memory and task tools ride along by default
    agent.add_tool(MemorySaveTool::new(memory.semantic.clone())).await;
    agent.add_tool(MemorySearchTool::new(memory.semantic.clone())).await;
    agent.add_tool(ProfileSetTool::new(memory.profile.clone())).await;
    agent.add_tool(TaskCreateTool::new(memory.tasks.clone())).await;
    agent.add_tool(TaskUpdateTool::new(memory.tasks.clone())).await;
    agent.add_tool(TaskCurrentTool::new(memory.tasks.clone())).await;

    Ok(agent)
}

async fn chat(config: AgentFileConfig) -> anyhow::Result<()> {
    let agent = build_agent(&config).await?;
    println!(
        "{} {} ({}). Type 'exit' to quit.",
        style("agentry").green().bold(),
        agentry::VERSION,
        config.model
    );

    let stdin = std::io::stdin();
    loop {
        print!("{} ", style(">").blue().bold());
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        let callbacks = StreamCallbacks {
            on_token: Some(Arc::new(|token: &str| {
                print!("{}", token);
                let _ = std::io::stdout().flush();
            })),
            on_tool_start: Some(Arc::new(|name: &str| {
                eprintln!("{} {}", style("tool:").dim(), name);
            })),
            ..Default::default()
        };

        match agent.stream(input, callbacks, ChatOptions::default()).await {
            Ok(_) => println!(),
            Err(e) => eprintln!("\n{} {}", style("error:").red(), e),
        }
    }
    Ok(())
}

async fn run_task(config: AgentFileConfig, task: &str) -> anyhow::Result<()> {
    let agent = build_agent(&config).await?;
    let response = agent.chat(task, ChatOptions::default()).await?;
    println!("{}", response.content);
    if let Some(tool_calls) = response.tool_calls {
        eprintln!(
            "{} {} tool call(s)",
            style("used:").dim(),
            tool_calls.len()
        );
    }
    Ok(())
}

async fn tools(config: AgentFileConfig, command: ToolsCommand) -> anyhow::Result<()> {
    // Registry inspection works without an API key
    let memory = MemoryManager::open_in_memory(None).await?;
    let mut registry = agentry::ToolRegistry::new();
    registry.register(MemorySaveTool::new(memory.semantic.clone()));
    registry.register(MemorySearchTool::new(memory.semantic.clone()));
    registry.register(ProfileSetTool::new(memory.profile.clone()));
    registry.register(TaskCreateTool::new(memory.tasks.clone()));
    registry.register(TaskUpdateTool::new(memory.tasks.clone()));
    registry.register(TaskCurrentTool::new(memory.tasks.clone()));
    let _ = config;

    match command {
        ToolsCommand::List => {
            for name in registry.names() {
                let tool = registry.get(name).unwrap();
                println!("{:<16} {}", style(name).cyan(), tool.description());
            }
        }
        ToolsCommand::Info { name } => {
            let Some(tool) = registry.get(&name) else {
                bail!("unknown tool \"{}\"", name);
            };
            println!("{}", style(tool.name()).cyan().bold());
            println!("{}", tool.description());
            println!(
                "{}",
                serde_json::to_string_pretty(&tool.parameters_schema())?
            );
        }
    }
    Ok(())
}

fn config_command(command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Init => {
            let path = PathBuf::from(CONFIG_FILENAME);
            if path.exists() {
                bail!("{} already exists", CONFIG_FILENAME);
            }
            let starter = serde_json::json!({
                "model": "gpt-4o-mini",
                "provider": "openai",
                "maxIterations": 10,
                "memory": { "path": "agentry.db" },
                "permission": {
                    "rules": [{ "toolPattern": "shell_*", "level": "confirm" }]
                }
            });
            std::fs::write(&path, serde_json::to_string_pretty(&starter)?)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Show => {
            let cwd = std::env::current_dir()?;
            match find_config(&cwd) {
                Some(path) => {
                    println!("{} {}", style("config:").dim(), path.display());
                    println!("{}", std::fs::read_to_string(&path)?);
                }
                None => println!("No {} found (defaults in effect)", CONFIG_FILENAME),
            }
        }
    }
    Ok(())
}
