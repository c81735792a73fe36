use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use botflow::flow::Keyboard;
use botflow::utils::LoggingConfig;
use botflow::{
    load_draft_from_file, validate_graph, ActionAdapter, AdapterError, EngineConfig,
    ExternalRequest, ExternalResponse, FlowDocument, FlowEngine, FlowStore, RecordingAdapter,
    SessionInfo, TimeoutSweeper, Trigger, TriggerOutcome,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

const CLI_PROJECT: &str = "cli";

#[derive(Parser)]
#[command(name = "botflow", version, about = "BotFlow CLI", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 校验 flow 文档并列出所有问题
    Validate { file: PathBuf },
    /// 在终端中交互运行 flow，`cb:<data>` 发送按钮回调
    Run {
        file: PathBuf,
        #[arg(long, default_value = "console")]
        session: String,
        /// 超时检查间隔（毫秒）
        #[arg(long, default_value_t = 1000)]
        sweep_ms: u64,
    },
}

/// 把消息打印到终端，其他能力交给内存 Adapter
struct ConsoleAdapter {
    inner: RecordingAdapter,
}

#[async_trait]
impl ActionAdapter for ConsoleAdapter {
    async fn send_message(
        &self,
        target: &str,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<String, AdapterError> {
        println!("bot> {text}");
        if let Some(keyboard) = keyboard {
            for row in &keyboard.rows {
                let labels: Vec<String> = row
                    .iter()
                    .map(|button| match &button.callback_data {
                        Some(data) => format!("[{}] (cb:{data})", button.text),
                        None => format!("[{}]", button.text),
                    })
                    .collect();
                println!("     {}", labels.join(" "));
            }
        }
        self.inner.send_message(target, text, keyboard).await
    }

    async fn call_external(&self, request: &ExternalRequest) -> Result<ExternalResponse, AdapterError> {
        println!("  -> {} {}", request.method, request.url);
        self.inner.call_external(request).await
    }

    async fn db_operation(&self, operation: &Value) -> Result<Value, AdapterError> {
        self.inner.db_operation(operation).await
    }

    async fn evaluate_expression(
        &self,
        expression: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<String, AdapterError> {
        self.inner.evaluate_expression(expression, variables).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { file } => handle_validate(file),
        Command::Run {
            file,
            session,
            sweep_ms,
        } => handle_run(file, session, sweep_ms).await,
    }
}

fn handle_validate(file: PathBuf) -> anyhow::Result<()> {
    let draft = load_draft_from_file(&file)?;
    let doc = FlowDocument::from_draft("cli-flow", CLI_PROJECT, 1, draft);
    match validate_graph(&doc) {
        Ok(()) => {
            println!("{}: ok ({} nodes, {} connections)", file.display(), doc.nodes.len(), doc.connections.len());
            Ok(())
        }
        Err(error) => {
            for problem in &error.problems {
                println!("{}: {problem}", file.display());
            }
            anyhow::bail!("{} problem(s) found", error.problems.len())
        }
    }
}

async fn handle_run(file: PathBuf, session: String, sweep_ms: u64) -> anyhow::Result<()> {
    let draft = load_draft_from_file(&file)?;
    let flows = Arc::new(FlowStore::new());
    let doc = flows.create(CLI_PROJECT, draft)?;
    flows.publish(&doc.flow_id, doc.version)?;

    let adapter = Arc::new(ConsoleAdapter {
        inner: RecordingAdapter::new(),
    });
    let engine = FlowEngine::new(flows, adapter).with_config(EngineConfig::from_env()?);
    let sweeper = TimeoutSweeper::new(engine.clone(), Duration::from_millis(sweep_ms)).spawn();

    let session = SessionInfo::new(session);
    let mut printed = 0u64;
    let mut execution_id: Option<String> = None;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            prompt()?;
            continue;
        }
        let trigger = match line.strip_prefix("cb:") {
            Some(data) => Trigger::callback(data),
            None => Trigger::message(line),
        };
        match engine
            .handle_trigger(CLI_PROJECT, session.clone(), trigger)
            .await
        {
            Ok(Some(outcome)) => {
                if execution_id.as_deref() != Some(outcome.state.id.as_str()) {
                    execution_id = Some(outcome.state.id.clone());
                    printed = 0;
                }
                for step in engine.executions().steps(&outcome.state.id).await? {
                    if step.step <= printed {
                        continue;
                    }
                    printed = step.step;
                    let message = step.message.as_deref().unwrap_or("");
                    println!(
                        "  #{:<3} {:<12} {:<10} {:?} {message}",
                        step.step,
                        step.node_id,
                        step.node_type.as_str(),
                        step.status
                    );
                }
                if outcome.trigger == TriggerOutcome::Rejected {
                    println!("  (input not accepted here)");
                }
                println!("  [{}] at `{}`", outcome.state.status, outcome.state.current_node_id);
                if let Some(error) = &outcome.state.error {
                    println!("  error: {error}");
                }
            }
            Ok(None) => println!("  (no execution accepts this input)"),
            Err(error) => println!("  error: {error}"),
        }
        prompt()?;
    }

    sweeper.shutdown().await;
    Ok(())
}

fn prompt() -> io::Result<()> {
    print!("you> ");
    io::stdout().flush()
}
