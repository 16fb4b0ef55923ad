//! Purpose: `nekobox-core` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, wires the engine factory into the
//! control service, and runs a transport.
//! Invariants: stdout belongs to the transport (`stdio`) or to command output
//! (`call`, `version`); logs always go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

use nekobox_core::client::RpcClient;
use nekobox_core::control::ControlService;
use nekobox_core::core::error::{Error, ErrorKind, to_exit_code};
use nekobox_core::engine::process::{ProcessEngineConfig, ProcessEngineFactory};

mod rpc_stdio;
mod serve;

const DEFAULT_BIND: &str = "127.0.0.1:9099";
const DEFAULT_MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Parser)]
#[command(
    name = "nekobox-core",
    version,
    about = "Control-plane RPC for a proxy/routing engine",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}{after-help}"#,
    after_help = r#"EXAMPLES
  $ nekobox-core serve --engine /usr/bin/sing-box
  $ nekobox-core stdio --engine ./sing-box
  $ nekobox-core call ListConnections"#
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Verbose logging; also logs Start configurations"
    )]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve the control RPC over HTTP (loopback by default)",
        long_about = r#"Serve JSON-RPC 2.0 on POST /rpc with a health probe on GET /healthz.

Methods: Start, Stop, Test, QueryStats, ListConnections, Exit, ping."#,
        after_help = r#"EXAMPLES
  $ nekobox-core serve
  $ nekobox-core serve --bind 127.0.0.1:9099 --token secret
  $ nekobox-core serve --bind 0.0.0.0:9099 --allow-non-loopback --token secret"#
    )]
    Serve {
        #[command(flatten)]
        engine: EngineArgs,
        #[command(flatten)]
        run: ServeRunArgs,
    },
    #[command(
        about = "Serve the control RPC over stdin/stdout",
        long_about = r#"Read one JSON-RPC request per line on stdin and write one response per line.

Exits on EOF or after an Exit call."#,
        after_help = r#"EXAMPLES
  $ echo '{"jsonrpc":"2.0","id":1,"method":"ping"}' | nekobox-core stdio"#
    )]
    Stdio {
        #[command(flatten)]
        engine: EngineArgs,
    },
    #[command(
        arg_required_else_help = true,
        about = "Call a method on a running server",
        long_about = r#"Send one JSON-RPC request to `nekobox-core serve` and print the result as JSON."#,
        after_help = r#"EXAMPLES
  $ nekobox-core call Start '{"core_config":"{...}","stats_outbounds":["proxy"]}'
  $ nekobox-core call QueryStats '{"tag":"proxy","direct":"downlink"}'
  $ nekobox-core call --server 127.0.0.1:9099 --token secret Stop"#
    )]
    Call {
        #[arg(long, default_value = DEFAULT_BIND, help = "Server address or base URL")]
        server: String,
        #[arg(long, help = "Bearer token")]
        token: Option<String>,
        #[arg(long, default_value_t = 60_000, help = "Request timeout in milliseconds")]
        timeout_ms: u64,
        #[arg(help = "Method name (Start, Stop, Test, QueryStats, ListConnections, Exit, ping)")]
        method: String,
        #[arg(help = "Params as a JSON object")]
        params: Option<String>,
    },
    #[command(
        about = "Print version info as JSON",
        after_help = r#"EXAMPLES
  $ nekobox-core version"#
    )]
    Version,
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ nekobox-core completion bash > ~/.local/share/bash-completion/completions/nekobox-core"#
    )]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct EngineArgs {
    #[arg(
        long,
        default_value = "sing-box",
        help = "Engine binary, invoked as `<engine> run -c <config>`",
        value_hint = ValueHint::ExecutablePath,
        help_heading = "Engine"
    )]
    engine: PathBuf,
    #[arg(
        long,
        value_name = "DIR",
        help = "Directory for engine configs (default: <tmp>/nekobox-core)",
        value_hint = ValueHint::DirPath,
        help_heading = "Engine"
    )]
    work_dir: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = 500,
        help = "How long a new engine must stay up before it counts as started",
        help_heading = "Engine"
    )]
    startup_grace_ms: u64,
}

#[derive(Args)]
struct ServeRunArgs {
    #[arg(
        long,
        default_value = DEFAULT_BIND,
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(long, help = "Require this bearer token", help_heading = "Authentication")]
    token: Option<String>,
    #[arg(
        long,
        help = "Allow non-loopback binds (use with --token)",
        help_heading = "Safety"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Max request body size in bytes",
        help_heading = "Safety"
    )]
    max_body_bytes: u64,
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                let rendered = err.render().to_string();
                let message = rendered
                    .lines()
                    .next()
                    .unwrap_or("invalid arguments")
                    .trim_start_matches("error: ")
                    .to_string();
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(message)
                    .with_hint("Run `nekobox-core --help` for usage."));
            }
        },
    };
    init_tracing(cli.debug);

    match cli.command {
        Command::Serve { engine, run } => {
            let service = Arc::new(control_service(engine, cli.debug));
            let config = serve::ServeConfig {
                bind: parse_bind(&run.bind)?,
                token: run.token,
                allow_non_loopback: run.allow_non_loopback,
                max_body_bytes: run.max_body_bytes,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config, service))?;
            Ok(0)
        }
        Command::Stdio { engine } => {
            let service = Arc::new(control_service(engine, cli.debug));
            rpc_stdio::serve(service)?;
            Ok(0)
        }
        Command::Call {
            server,
            token,
            timeout_ms,
            method,
            params,
        } => {
            let params = params.as_deref().map(parse_params).transpose()?;
            let mut client =
                RpcClient::new(server)?.with_timeout(Duration::from_millis(timeout_ms));
            if let Some(token) = token {
                client = client.with_token(token);
            }
            let result: Value = client.call(&method, params)?;
            emit_json(&result);
            Ok(0)
        }
        Command::Version => {
            if io::stdout().is_terminal() {
                println!("nekobox-core {}", env!("CARGO_PKG_VERSION"));
            } else {
                emit_json(&json!({
                    "name": "nekobox-core",
                    "version": env!("CARGO_PKG_VERSION"),
                }));
            }
            Ok(0)
        }
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "nekobox-core", &mut io::stdout());
            Ok(0)
        }
    }
}

fn control_service(args: EngineArgs, debug: bool) -> ControlService {
    let work_dir = args
        .work_dir
        .unwrap_or_else(|| std::env::temp_dir().join("nekobox-core"));
    let factory = ProcessEngineFactory::new(ProcessEngineConfig {
        program: args.engine,
        work_dir,
        startup_grace: Duration::from_millis(args.startup_grace_ms),
    });
    ControlService::new(Arc::new(factory)).with_debug(debug)
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn parse_bind(bind: &str) -> Result<SocketAddr, Error> {
    bind.parse().map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid bind address: {bind}"))
            .with_hint("Use host:port, e.g. 127.0.0.1:9099.")
            .with_source(err)
    })
}

fn parse_params(raw: &str) -> Result<Value, Error> {
    let value: Value = serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("params must be valid JSON")
            .with_source(err)
    })?;
    if !value.is_object() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("params must be a JSON object")
            .with_hint(r#"Wrap params in braces, e.g. '{"tag":"proxy","direct":"uplink"}'."#));
    }
    Ok(value)
}

fn emit_json(value: &Value) {
    let rendered = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::AlreadyRunning => "instance already started".to_string(),
        ErrorKind::EngineCreation => "engine creation failed".to_string(),
        ErrorKind::Engine => "engine error".to_string(),
        ErrorKind::TestFailed => "test failed".to_string(),
        ErrorKind::Cancelled => "cancelled".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
