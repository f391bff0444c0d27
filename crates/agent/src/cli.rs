use anyhow::Context;

pub(crate) struct Args {
    pub server_url: String,
    pub device_id: String,
    pub tenant: Option<String>,
    pub token: Option<String>,
    pub agent_version: String,
    pub ping_interval_secs: u64,
    pub frame_interval_secs: u64,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut server_url = "ws://127.0.0.1:8080".to_string();
    let mut device_id = None;
    let mut tenant = None;
    let mut token = None;
    let mut agent_version = env!("CARGO_PKG_VERSION").to_string();
    let mut ping_interval_secs: u64 = 10;
    let mut frame_interval_secs: u64 = 2;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("lookout-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("lookout-agent - Lookout demo/test remote-desktop agent");
                println!();
                println!("USAGE:");
                println!("    lookout-agent --device-id <ID> [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --server-url <URL>           Hub WebSocket URL [default: ws://127.0.0.1:8080]");
                println!("    --device-id <ID>             Device identifier (required)");
                println!("    --tenant <TENANT>            Tenant ID (prefer LOOKOUT_AGENT_TOKEN's hub default if omitted)");
                println!("    --token <TOKEN>              Agent auth token (prefer LOOKOUT_AGENT_TOKEN env)");
                println!("    --agent-version <VERSION>    Reported agent version [default: crate version]");
                println!("    --ping-interval <SECS>       Heartbeat interval [default: 10]");
                println!("    --frame-interval <SECS>      Demo frame send interval [default: 2]");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                std::process::exit(0);
            }
            "--server-url" => {
                i += 1;
                server_url = args.get(i).context("Missing --server-url value")?.clone();
            }
            "--device-id" => {
                i += 1;
                device_id = Some(args.get(i).context("Missing --device-id value")?.clone());
            }
            "--tenant" => {
                i += 1;
                tenant = Some(args.get(i).context("Missing --tenant value")?.clone());
            }
            "--token" => {
                // Legacy CLI support (prefer LOOKOUT_AGENT_TOKEN env var)
                i += 1;
                token = Some(args.get(i).context("Missing --token value")?.clone());
            }
            "--agent-version" => {
                i += 1;
                agent_version = args.get(i).context("Missing --agent-version value")?.clone();
            }
            "--ping-interval" => {
                i += 1;
                ping_interval_secs = args
                    .get(i)
                    .context("Missing --ping-interval value")?
                    .parse()
                    .context("Invalid --ping-interval value")?;
            }
            "--frame-interval" => {
                i += 1;
                frame_interval_secs = args
                    .get(i)
                    .context("Missing --frame-interval value")?
                    .parse()
                    .context("Invalid --frame-interval value")?;
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    // Prefer env var for the auth token (CLI args are visible in /proc)
    if token.is_none() {
        token = std::env::var("LOOKOUT_AGENT_TOKEN").ok();
    }

    Ok(Args {
        server_url,
        device_id: device_id.context("--device-id is required")?,
        tenant,
        token,
        agent_version,
        ping_interval_secs,
        frame_interval_secs,
    })
}
