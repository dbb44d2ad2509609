//! Validator Sandbox CLI
//!
//! Build a snapshot:
//!   validator-sandbox snapshot ./dist/validator.js --output validator.snapshot
//!
//! One invocation:
//!   validator-sandbox invoke --snapshot validator.snapshot \
//!     --path stateTransition --function validate --args '[{"type":1}]' --timeout-ms 500
//!
//! Server mode (persistent process, reads from stdin):
//!   validator-sandbox serve --snapshot validator.snapshot
//!
//! Protocol (server mode):
//!   Request (stdin, one line):
//!     {"path":"stateTransition","function":"validate","args":[{"type":1}],"options":{"timeoutMillis":500}}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:4
//!
//!     true
//!
//!   Error response:
//!     Status:Error
//!     Length:77
//!
//!     {"kind":"Timeout","message":"Script execution timed out.","name":null,...}

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use validator_sandbox::{
    build_snapshot, create_sandbox, create_sandbox_cold, BridgeBindings, DataProvider, HostValue,
    InvocationOptions, JsonRpcClient, MemoryCache, ResourceLimits, Sandbox, SandboxError, Snapshot,
    TransferMode,
};

/// Validator Sandbox - preemptible V8 runtime for state-transition validation code.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a snapshot envelope from a bundle (stdin/stdout when omitted)
    Snapshot {
        /// Bootstrap bundle to evaluate
        bundle: Option<PathBuf>,

        /// Where to write the snapshot envelope
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a single invocation and print its result as JSON
    Invoke(InvokeArgs),

    /// Serve length-prefixed invocations on stdin/stdout
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct SandboxArgs {
    /// V8 heap ceiling per sandbox in MiB
    #[arg(long, env = "VALIDATOR_SANDBOX_MEMORY_MIB", default_value_t = 128)]
    memory_mib: usize,

    /// JSON-RPC endpoint backing fetchDataContract / fetchIdentity
    #[arg(long, env = "VALIDATOR_SANDBOX_RPC_URL")]
    rpc_url: Option<String>,
}

#[derive(Args, Debug)]
struct InvokeArgs {
    /// Bundle to run in a fresh isolate
    #[arg(long, conflicts_with = "snapshot", required_unless_present = "snapshot")]
    bundle: Option<PathBuf>,

    /// Snapshot envelope to restore
    #[arg(long, env = "VALIDATOR_SANDBOX_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    /// Dotted path of the object holding the function (empty = global)
    #[arg(long, default_value = "")]
    path: String,

    /// Function to call
    #[arg(long)]
    function: String,

    /// Arguments as a JSON array
    #[arg(long, default_value = "[]")]
    args: String,

    /// Wall-clock budget in milliseconds (0 = unbounded)
    #[arg(long, env = "VALIDATOR_SANDBOX_TIMEOUT_MS", default_value_t = 0)]
    timeout_ms: u64,

    /// Wait for the returned promise to settle
    #[arg(long, default_value = "false")]
    async_result: bool,

    #[command(flatten)]
    sandbox: SandboxArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Snapshot envelope to restore for every sandbox
    #[arg(long, env = "VALIDATOR_SANDBOX_SNAPSHOT")]
    snapshot: PathBuf,

    #[command(flatten)]
    sandbox: SandboxArgs,
}

/// One server-mode request line.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Request {
    #[serde(default)]
    path: String,
    function: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    options: InvocationOptions,
}

impl SandboxArgs {
    fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.memory_mib)
    }

    fn bindings(&self) -> Result<BridgeBindings> {
        let Some(url) = &self.rpc_url else {
            return Ok(BridgeBindings::new());
        };
        let client = JsonRpcClient::new(url)?;
        info!("Data-fetch bridge using {}", client.endpoint());
        let provider = DataProvider::new(
            Arc::new(client),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryCache::new()),
        );
        Ok(provider.bindings())
    }
}

/// Build a snapshot in this process. V8 runs in snapshot mode here, so this
/// command never creates sandboxes.
fn run_snapshot(bundle: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let source = match bundle {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bundle '{}'", path.display()))?,
        None => {
            let mut source = String::new();
            std::io::stdin().read_to_string(&mut source)?;
            source
        }
    };

    let snapshot = build_snapshot(&source)?;
    let bytes = snapshot.to_bytes();

    match output {
        Some(path) => std::fs::write(path, &bytes)
            .with_context(|| format!("Failed to write snapshot '{}'", path.display()))?,
        None => {
            let mut stdout = std::io::stdout();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }

    info!(
        "Snapshot built: {} bytes, sha256 {}",
        snapshot.len(),
        snapshot.digest()
    );
    Ok(())
}

/// Run in single-shot mode
async fn run_invoke(args: InvokeArgs) -> Result<ExitCode> {
    let call_args: Vec<Value> =
        serde_json::from_str(&args.args).map_err(|e| anyhow!("Invalid args JSON: {}", e))?;

    let limits = args.sandbox.limits();
    let bindings = args.sandbox.bindings()?;
    let sandbox = match (&args.snapshot, &args.bundle) {
        (Some(path), _) => {
            let snapshot = Snapshot::read_from(path).await?;
            create_sandbox(&snapshot, limits, bindings).await?
        }
        (None, Some(path)) => {
            let source = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read bundle '{}'", path.display()))?;
            create_sandbox_cold(source, limits, bindings).await?
        }
        (None, None) => return Err(anyhow!("Either --bundle or --snapshot is required")),
    };

    let mut options = InvocationOptions::default().with_timeout_millis(args.timeout_ms);
    options.result_is_async = args.async_result;

    let result = sandbox
        .invoke(
            &args.path,
            &args.function,
            call_args.into_iter().map(HostValue::from).collect(),
            options,
        )
        .await;
    sandbox.dispose();

    match result {
        Ok(value) => {
            println!("{}", render_value(value));
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("{}", failure_json(&err));
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(args: ServeArgs) -> Result<()> {
    let snapshot = Snapshot::read_from(&args.snapshot).await?;
    let limits = args.sandbox.limits();
    let bindings = args.sandbox.bindings()?;

    // Restore ONCE at startup; replaced only after a terminal failure
    let mut sandbox = create_sandbox(&snapshot, limits.clone(), bindings.clone()).await?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    info!("Server ready, reading from stdin...");

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                write_response(&mut stdout, false, &format!("Invalid request JSON: {}", e))?;
                continue;
            }
        };

        if sandbox.is_disposed() {
            warn!("Sandbox {} was disposed, restoring a fresh one", sandbox.id());
            sandbox = create_sandbox(&snapshot, limits.clone(), bindings.clone()).await?;
        }

        let mut options = request.options;
        options.argument_transfer = TransferMode::Copy;
        options.result_transfer = TransferMode::Copy;

        let result = sandbox
            .invoke(
                &request.path,
                &request.function,
                request.args.into_iter().map(HostValue::from).collect(),
                options,
            )
            .await;

        match result {
            Ok(value) => write_response(&mut stdout, true, &render_value(value))?,
            Err(err) => write_response(&mut stdout, false, &failure_json(&err).to_string())?,
        }
    }

    info!("Server shutting down");
    Ok(())
}

fn render_value(value: HostValue) -> String {
    match value {
        HostValue::Data(data) => data.to_string(),
        HostValue::Function(_) => "\"[host function]\"".to_string(),
        HostValue::Reference(reference) => {
            json!({ "sandboxReference": reference.sandbox_id() }).to_string()
        }
    }
}

fn failure_json(err: &SandboxError) -> Value {
    let (name, payload) = match err {
        SandboxError::Script { name, payload, .. } => (
            name.clone(),
            payload.as_ref().and_then(HostValue::as_data).cloned(),
        ),
        _ => (None, None),
    };
    json!({
        "kind": format!("{:?}", err.kind()),
        "message": err.to_string(),
        "name": name,
        "payload": payload,
    })
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };
    let length = body.len();

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", length)?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // stdout carries snapshots and responses; logs go to stderr
    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Command::Snapshot { bundle, output } => {
            run_snapshot(bundle.as_deref(), output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Invoke(args) => run_invoke(args).await,
        Command::Serve(args) => {
            run_server(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
