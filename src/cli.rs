use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use crate::config::Config;

#[derive(Parser, Debug, Clone)]
#[command(name = "compile-relay", about = "Compile and run source files sent over TCP", version)]
#[command(group(ArgGroup::new("mode").args(["send", "list_toolchains"]).multiple(false)))]
pub struct Cli {
    /// Host to listen on (or to connect to with --send).
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (or to connect to with --send).
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Pending connection backlog.
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Compile step timeout in seconds.
    #[arg(long = "compile-timeout")]
    pub compile_timeout: Option<u64>,

    /// Execute step timeout in seconds.
    #[arg(long = "execute-timeout")]
    pub execute_timeout: Option<u64>,

    /// Socket read/write timeout per connection, in seconds.
    #[arg(long = "connection-timeout")]
    pub connection_timeout: Option<u64>,

    /// Directory under which per-request scratch directories are created.
    #[arg(long = "scratch-dir")]
    pub scratch_dir: Option<PathBuf>,

    /// Serve connections concurrently instead of one at a time.
    #[arg(long)]
    pub concurrent: bool,

    /// Print supported file types and exit.
    #[arg(short = 'l', long = "list-toolchains")]
    pub list_toolchains: bool,

    /// Submit FILE to a running server and print the result.
    #[arg(long, value_name = "FILE")]
    pub send: Option<PathBuf>,

    /// Filename reported to the server with --send (defaults to FILE's name).
    #[arg(long, requires = "send")]
    pub name: Option<String>,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Flags override rc file and environment.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(host) = &self.host {
            cfg.set("RELAY_HOST", host.clone());
        }
        let numbers = [
            ("RELAY_PORT", self.port.map(u64::from)),
            ("RELAY_BACKLOG", self.backlog.map(u64::from)),
            ("RELAY_COMPILE_TIMEOUT", self.compile_timeout),
            ("RELAY_EXECUTE_TIMEOUT", self.execute_timeout),
            ("RELAY_CONNECTION_TIMEOUT", self.connection_timeout),
        ];
        for (key, value) in numbers {
            if let Some(v) = value {
                cfg.set(key, v.to_string());
            }
        }
        if let Some(dir) = &self.scratch_dir {
            cfg.set("RELAY_SCRATCH_DIR", dir.to_string_lossy().into_owned());
        }
        if self.concurrent {
            cfg.set("RELAY_CONCURRENT", "true");
        }
    }
}
