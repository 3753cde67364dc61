use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use compile_relay::{
    cli::Cli,
    client,
    config::{Config, Settings},
    handler::Handler,
    pipeline::Pipeline,
    printer::TextPrinter,
    process::ProcessRunner,
    server::Server,
    toolchain::Registry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut cfg = Config::load();
    args.apply(&mut cfg);
    let settings = Settings::from_config(&cfg);
    let printer = TextPrinter::default();
    let registry = Registry::builtin();

    if args.list_toolchains {
        println!("{}", printer.toolchains(&registry));
        return Ok(());
    }

    if let Some(path) = &args.send {
        let code = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file_name = path.file_name().and_then(|n| n.to_str());
        let filename = client::wire_filename(args.name.as_deref().or(file_name));
        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        let wait = settings.timeouts.compile + settings.timeouts.execute + settings.handler.write_timeout;

        let transcript = client::submit(&addr, &filename, &code, wait).await?;
        println!("{}", printer.transcript(&transcript));
        let flagged = client::error_lines(&transcript);
        if !flagged.is_empty() {
            println!("\n{}", printer.flagged_lines(&code, &flagged));
        }
        return Ok(());
    }

    let server = match Server::bind(&settings.server).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to start server");
            return Err(e);
        }
    };
    println!("{}", printer.banner(&server.local_addr()?.to_string(), &registry));
    info!(config = %cfg.config_path.display(), scratch = %settings.handler.scratch_root.display(), "configuration loaded");

    let pipeline = Pipeline::new(registry, ProcessRunner, settings.timeouts);
    let handler = Arc::new(Handler::new(pipeline, settings.handler));
    server
        .serve(handler, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "could not listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await
}
