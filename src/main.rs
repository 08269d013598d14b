use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use graft_executor::{ExecutionMode, ExecutionRequest, ExecutorConfig, HostNode, IsolatedExecutor};
use graft_fragment::Fragment;
use graft_graph::builtin::{self, value_sink_settings};
use graft_graph::{PortValue, SandboxRegistry};

/// Graft - capture, ship and run dataflow graph fragments
#[derive(Parser)]
#[command(name = "graft")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the boundary of a fragment archive
  Inspect {
    /// Path to the fragment archive
    archive: PathBuf,
  },

  /// Run a fragment archive in a sandbox
  Run {
    /// Path to the fragment archive
    archive: PathBuf,

    /// Input value as JSON, one per connected input, in order
    #[arg(long = "input")]
    inputs: Vec<String>,

    /// Override a configuration node, as name=json
    #[arg(long = "param")]
    params: Vec<String>,

    #[arg(long, value_enum, default_value_t = Mode::Detached)]
    mode: Mode,

    /// Report node messages for successful runs too
    #[arg(long)]
    messages: bool,

    /// Run every node, not only what the outputs depend on
    #[arg(long)]
    execute_all: bool,

    /// Directory exposed to nodes as the data area (copied for the run)
    #[arg(long)]
    data_area: Option<PathBuf>,
  },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
  Debug,
  Default,
  Detached,
}

impl From<Mode> for ExecutionMode {
  fn from(mode: Mode) -> Self {
    match mode {
      Mode::Debug => ExecutionMode::Debug,
      Mode::Default => ExecutionMode::Default,
      Mode::Detached => ExecutionMode::Detached,
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();
  match cli.command {
    Some(Commands::Inspect { archive }) => inspect(&archive)?,
    Some(Commands::Run {
      archive,
      inputs,
      params,
      mode,
      messages,
      execute_all,
      data_area,
    }) => {
      let config = ExecutorConfig {
        mode: mode.into(),
        collect_messages: messages,
        execute_all,
        ..Default::default()
      };
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(async { run(&archive, inputs, params, config, data_area).await })?;
    }
    None => {
      println!("graft - use --help to see available commands");
    }
  }

  Ok(())
}

fn read_fragment(archive: &Path) -> Result<Fragment> {
  let file = fs::File::open(archive)
    .with_context(|| format!("failed to open fragment archive: {}", archive.display()))?;
  Fragment::read(io::BufReader::new(file))
    .with_context(|| format!("failed to read fragment archive: {}", archive.display()))
}

fn inspect(archive: &Path) -> Result<()> {
  let fragment = read_fragment(archive)?;
  let summary = serde_json::json!({
    "name": fragment.name(),
    "display_name": fragment.display_name(),
    "inputs": fragment.inputs(),
    "outputs": fragment.outputs(),
    "reference_nodes": fragment.reference_nodes(),
  });
  println!("{}", serde_json::to_string_pretty(&summary)?);
  Ok(())
}

async fn run(
  archive: &Path,
  inputs: Vec<String>,
  params: Vec<String>,
  config: ExecutorConfig,
  data_area: Option<PathBuf>,
) -> Result<()> {
  let mut fragment = read_fragment(archive)?;
  info!(fragment = %fragment.display_name(), "fragment_read");

  let mut values = inputs
    .iter()
    .map(|input| {
      serde_json::from_str(input)
        .map(PortValue::Json)
        .with_context(|| format!("failed to parse input JSON: {}", input))
    })
    .collect::<Result<Vec<_>>>()?;
  if values.is_empty() {
    values = read_inputs_from_stdin()?;
  }

  let mut parameters = BTreeMap::new();
  for param in &params {
    let Some((name, value)) = param.split_once('=') else {
      bail!("parameter '{}' is not of the form name=json", param);
    };
    let value = serde_json::from_str(value)
      .with_context(|| format!("failed to parse value of parameter '{}'", name))?;
    parameters.insert(name.to_string(), value);
  }

  // The copy lives until the run is over.
  let data_copy = data_area.as_deref().map(copy_data_area).transpose()?;
  let request = ExecutionRequest {
    parameters,
    data_area: data_copy.as_ref().map(|dir| dir.path().to_path_buf()),
    ..Default::default()
  };

  let registry = SandboxRegistry::new();
  let host = match config.mode {
    ExecutionMode::Detached => None,
    _ => {
      let project = registry.create_project("graft", None, None);
      let node = project
        .lock()
        .add_node("Host", builtin::VALUE_SINK, value_sink_settings(0))
        .context("failed to create the host node")?;
      Some(HostNode::new(project, node))
    }
  };
  let executor = IsolatedExecutor::new(registry.clone(), config, host)
    .context("invalid executor configuration")?
    .with_warning_consumer(std::sync::Arc::new(|warning| {
      warn!(warning = %warning, "fragment_load_warning")
    }));

  let cancel = CancellationToken::new();
  let ctrl_c = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      ctrl_c.cancel();
    }
  });

  let outcome = executor
    .execute(&mut fragment, values, request, cancel)
    .await
    .context("fragment execution failed");
  if let Err(e) = executor.dispose().await {
    warn!(error = %e, "executor_dispose_failed");
  }
  let result = outcome?;

  let report = serde_json::json!({
    "outputs": result.outputs,
    "flow_variables": result.flow_variables,
    "messages": result.node_messages,
  });
  println!("{}", serde_json::to_string_pretty(&report)?);

  result.into_success()?;
  Ok(())
}

fn read_inputs_from_stdin() -> Result<Vec<PortValue>> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    return Ok(Vec::new());
  }
  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read inputs from stdin")?;
  if input.trim().is_empty() {
    return Ok(Vec::new());
  }
  let values: Vec<serde_json::Value> =
    serde_json::from_str(&input).context("failed to parse input JSON array from stdin")?;
  Ok(values.into_iter().map(PortValue::Json).collect())
}

fn copy_data_area(source: &Path) -> Result<tempfile::TempDir> {
  let target = tempfile::Builder::new()
    .prefix("graft-data-area-")
    .tempdir()
    .context("failed to create a data area copy")?;
  copy_dir(source, target.path())
    .with_context(|| format!("failed to copy data area: {}", source.display()))?;
  Ok(target)
}

fn copy_dir(source: &Path, target: &Path) -> io::Result<()> {
  for entry in fs::read_dir(source)? {
    let entry = entry?;
    let destination = target.join(entry.file_name());
    if entry.file_type()?.is_dir() {
      fs::create_dir_all(&destination)?;
      copy_dir(&entry.path(), &destination)?;
    } else {
      fs::copy(entry.path(), &destination)?;
    }
  }
  Ok(())
}
