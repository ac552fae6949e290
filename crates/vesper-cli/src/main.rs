//! # Vesper CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve a script on four shards
//! vesper serve -s handler.js -b 0.0.0.0:8080 --shards 4
//!
//! # Bind a memory-backed KV store as `cache`
//! vesper serve -s handler.js --kv cache=memory://
//!
//! # Push a new version of the script to a running server
//! vesper reload http://127.0.0.1:8080 -s handler.js --interrupt
//! ```

use anyhow::{Context as _, Result};
use argh::FromArgs;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use vesper_server::{HttpServer, KvRegistry, RuntimeBuilder, RuntimeConfig, ServerConfig, StopMode};

/// Validates that a URL string starts with http://
fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http://",
            description,
            url
        ))
    }
}

/// Splits a `name=uri` KV binding argument.
fn parse_kv_binding(arg: &str) -> Result<(&str, &str)> {
    arg.split_once('=')
        .filter(|(name, uri)| !name.is_empty() && !uri.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Invalid KV binding '{}': expected name=uri", arg))
}

#[derive(FromArgs)]
/// Vesper - hot-reloadable JavaScript function host
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Reload(ReloadArgs),
}

/// Arguments for serving a script.
///
/// The script registers exactly one handler with `registerMiddlewareHandler`
/// or `registerEventHandler`. Without `-s` the server starts unready and
/// answers `503` until a program is pushed with `vesper reload`.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// serve a JavaScript handler over HTTP
struct ServeArgs {
    /// path to the JavaScript file to load at startup
    #[argh(option, short = 's')]
    script: Option<String>,

    /// address to bind the HTTP server to
    #[argh(option, short = 'b', default = "\"0.0.0.0:8080\".into()")]
    bind: String,

    /// number of interpreter shards (defaults to available parallelism)
    #[argh(option)]
    shards: Option<usize>,

    /// concurrent outbound calls allowed per request
    #[argh(option, long = "outbound-limit", default = "10")]
    outbound_limit: usize,

    /// iterations a script loop may run before it aborts (default 1000000)
    #[argh(option, long = "max-loop-iterations")]
    max_loop_iterations: Option<u64>,

    /// let script loops run without an iteration limit
    #[argh(switch, long = "no-loop-limit")]
    no_loop_limit: bool,

    /// KV binding as name=uri, e.g. cache=memory:// (repeatable)
    #[argh(option, long = "kv")]
    kv: Vec<String>,

    /// disable the admin endpoints
    #[argh(switch, long = "no-admin")]
    no_admin: bool,
}

/// Arguments for pushing a program to a running server.
#[derive(FromArgs)]
#[argh(subcommand, name = "reload")]
/// push a new program to a running vesper server
struct ReloadArgs {
    /// address of the server, including the http:// prefix
    #[argh(positional)]
    server_address: String,

    /// path to the JavaScript file to push
    #[argh(option, short = 's')]
    script: String,

    /// name reported for the program (defaults to the file name)
    #[argh(option)]
    name: Option<String>,

    /// interrupt in-flight requests instead of letting them drain
    #[argh(switch)]
    interrupt: bool,

    /// admin path prefix of the server
    #[argh(option, long = "admin-prefix", default = "\"/_vesper\".into()")]
    admin_prefix: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Reload(args) => run_reload(args).await,
    }
}

fn runtime_config(args: &ServeArgs) -> RuntimeConfig {
    let mut config = RuntimeConfig::new().with_outbound_limit(args.outbound_limit);
    if let Some(shards) = args.shards {
        config = config.with_shards(shards);
    }
    if let Some(iterations) = args.max_loop_iterations {
        config = config.with_max_loop_iterations(iterations);
    }
    if args.no_loop_limit {
        config = config.without_loop_limit();
    }
    config
}

/// Admin reload URL with the program name form-encoded.
fn reload_uri(server: &str, admin_prefix: &str, name: &str, interrupt: bool) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("name", name)
        .append_pair("interrupt", if interrupt { "true" } else { "false" })
        .finish();
    format!("{}{}/reload?{}", server.trim_end_matches('/'), admin_prefix, query)
}

fn kv_registry(bindings: &[String]) -> Result<KvRegistry> {
    let mut registry = KvRegistry::new();
    for binding in bindings {
        let (name, uri) = parse_kv_binding(binding)?;
        registry.configure(name, uri)?;
    }
    Ok(registry)
}

/// Name reported for a program when `--name` is not given.
fn program_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn read_program(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read script {}", path))
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let bind: SocketAddr = args
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", args.bind, e))?;

    let runtime = RuntimeBuilder::new(runtime_config(&args))
        .with_kv(kv_registry(&args.kv)?)
        .build()?;
    let runtime = Arc::new(runtime);
    tracing::info!("Runtime created with {} shards", runtime.shard_count());

    if let Some(script) = &args.script {
        let source = read_program(script)?;
        runtime
            .reload(&program_name(script), &source, false)
            .await
            .with_context(|| format!("Failed to load {}", script))?;
    } else {
        tracing::warn!("No script given; the server answers 503 until one is pushed");
    }

    let mut server_config = ServerConfig::new(bind);
    if args.no_admin {
        server_config = server_config.without_admin();
    }

    let server = HttpServer::new(Arc::clone(&runtime), server_config);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    runtime.shutdown(StopMode::Graceful).await;
    Ok(())
}

async fn run_reload(args: ReloadArgs) -> Result<()> {
    validate_http_url(&args.server_address, "server address")?;
    let source = read_program(&args.script)?;
    let name = args.name.unwrap_or_else(|| program_name(&args.script));

    let uri = reload_uri(&args.server_address, &args.admin_prefix, &name, args.interrupt);

    let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let request = Request::builder()
        .method(Method::POST)
        .uri(&uri)
        .header(hyper::header::CONTENT_TYPE, "application/javascript")
        .body(Full::new(Bytes::from(source)))?;

    let response = client
        .request(request)
        .await
        .with_context(|| format!("Failed to reach {}", args.server_address))?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();

    if !status.is_success() {
        return Err(anyhow::anyhow!(
            "Reload rejected ({}): {}",
            status,
            String::from_utf8_lossy(&body)
        ));
    }

    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args: Cli = Cli::from_args(&["vesper"], &["serve", "-s", "app.js"]).unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(args.script.as_deref(), Some("app.js"));
                assert_eq!(args.bind, "0.0.0.0:8080");
                assert_eq!(args.outbound_limit, 10);
                assert!(args.shards.is_none());
                assert!(args.kv.is_empty());
                assert!(!args.no_admin);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_full() {
        let args: Cli = Cli::from_args(&["vesper"], &[
            "serve",
            "-s", "app.js",
            "-b", "127.0.0.1:9000",
            "--shards", "3",
            "--outbound-limit", "4",
            "--kv", "cache=memory://",
            "--kv", "sessions=memory://",
            "--no-admin",
        ]).unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(args.bind, "127.0.0.1:9000");
                assert_eq!(args.shards, Some(3));
                assert_eq!(args.outbound_limit, 4);
                assert_eq!(args.kv, vec!["cache=memory://", "sessions=memory://"]);
                assert!(args.no_admin);

                let config = runtime_config(&args);
                assert_eq!(config.shards, 3);
                assert_eq!(config.outbound_limit, 4);
                assert_eq!(kv_registry(&args.kv).unwrap().names(), vec!["cache", "sessions"]);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_reload() {
        let args: Cli = Cli::from_args(&["vesper"], &[
            "reload", "http://127.0.0.1:8080", "-s", "dir/app.js", "--interrupt",
        ]).unwrap();
        match args.command {
            Commands::Reload(ReloadArgs {
                server_address,
                script,
                name,
                interrupt,
                admin_prefix,
            }) => {
                assert_eq!(server_address, "http://127.0.0.1:8080");
                assert_eq!(script, "dir/app.js");
                assert!(name.is_none());
                assert!(interrupt);
                assert_eq!(admin_prefix, "/_vesper");
                assert_eq!(program_name(&script), "app.js");
            }
            _ => panic!("Expected Reload command"),
        }
    }

    #[test]
    fn test_cli_loop_limit_flags() {
        let args: Cli = Cli::from_args(&["vesper"], &["serve", "--no-loop-limit"]).unwrap();
        match args.command {
            Commands::Serve(args) => assert_eq!(runtime_config(&args).max_loop_iterations, None),
            _ => panic!("Expected Serve command"),
        }

        let args: Cli = Cli::from_args(&["vesper"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(runtime_config(&args).max_loop_iterations, Some(1_000_000));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_reload_uri_encodes_name() {
        assert_eq!(
            reload_uri("http://127.0.0.1:8080/", "/_vesper", "my app.js", true),
            "http://127.0.0.1:8080/_vesper/reload?name=my+app.js&interrupt=true"
        );
    }

    #[test]
    fn test_cli_reload_requires_script() {
        assert!(Cli::from_args(&["vesper"], &["reload", "http://127.0.0.1:8080"]).is_err());
    }

    #[test]
    fn test_parse_kv_binding() {
        assert_eq!(parse_kv_binding("cache=memory://").unwrap(), ("cache", "memory://"));
        assert!(parse_kv_binding("cache").is_err());
        assert!(parse_kv_binding("=memory://").is_err());
        assert!(parse_kv_binding("cache=").is_err());
    }

    #[test]
    fn test_kv_registry_rejects_unknown_backend() {
        let err = kv_registry(&["cache=redis://localhost".to_string()]).unwrap_err();
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn test_validate_http_url() {
        assert!(validate_http_url("http://127.0.0.1:8080", "server").is_ok());
        assert!(validate_http_url("127.0.0.1:8080", "server").is_err());
    }

    #[test]
    fn test_read_program() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js");
        std::fs::write(&path, "registerMiddlewareHandler(() => 1);").unwrap();

        let source = read_program(path.to_str().unwrap()).unwrap();
        assert_eq!(source, "registerMiddlewareHandler(() => 1);");
        assert!(read_program("/definitely/missing.js").is_err());
    }
}
