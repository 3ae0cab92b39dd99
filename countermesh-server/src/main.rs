// Copyright 2025 CounterMesh Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use clap::Parser;
use countermesh_observability::{init_logging, LogFormat};
use countermesh_server::{config::NodeConfig, run_node};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config file)
    #[arg(long, env = "COUNTERMESH_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Enable bearer-token authentication
    #[arg(long, env = "COUNTERMESH_AUTH_ENABLED")]
    auth_enabled: bool,

    /// Comma-separated `host:port` seed peers to register with on startup
    #[arg(long, env = "COUNTERMESH_SEEDS")]
    seeds: Option<String>,

    /// Emit line-delimited JSON logs instead of the default human-readable format
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(if args.log_json { LogFormat::Json } else { LogFormat::Pretty });

    let mut config = NodeConfig::load(args.config)?;

    if let Some(addr) = args.listen_addr {
        config.server.listen_addr = addr;
    }
    if args.auth_enabled {
        config.auth.enabled = true;
    }
    if let Some(seeds) = args.seeds {
        config.registry.seeds = seeds.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    }

    run_node(config).await
}
