use clap::Parser;
use config::Config;
use hook::platform::{ProcfsEnumerator, UnixSocketProvider};
use hook::{AdapterEvents, Body, HookAdapter, Platform, ProtocolBlock};
use hookd::{
    cli::Cli,
    signals::{SignalEvent, wait_for_signal},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `HOOKD_LOG` can only tune the level per crate, e.g.
    // `HOOKD_LOG=hook=trace hookd -v` traces the pipeline and logs everything
    // else at debug.
    let env_filter = EnvFilter::builder()
        .with_env_var("HOOKD_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();

    // load config
    let mut config = match &cli.conffile {
        Some(path) => Config::load(path)?,
        _ => {
            let mut candidates = glob::glob("/etc/hookd/config.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.insert(0, "/etc/hookd/config.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    if let Some(process_name) = &cli.process_name {
        config.hook.process_name = process_name.clone();
    }
    debug!(?config, ?cli);

    // install signal handlers
    let (signals_tx, mut signals_rx) = mpsc::channel(8);
    let mut signal_handle = tokio::spawn(wait_for_signal(signals_tx));

    let platform = Platform {
        enumerator: Arc::new(ProcfsEnumerator),
        remote: Arc::new(UnixSocketProvider::new(&config.platform)),
    };
    let (adapter, events) = HookAdapter::start(&config, platform);
    let drain_handle = tokio::spawn(drain(events));

    loop {
        tokio::select! {
            // bubble up any errors from the signal handlers
            res = &mut signal_handle => {
                let res = res?;
                if let Err(err) = &res {
                    error!("error happened during handling signals: {}", err);
                }
                res?;
                break;
            }

            event = signals_rx.recv() => {
                let Some(event) = event else { break };
                debug!(?event, "Received signal event");

                match event {
                    SignalEvent::Shutdown => {
                        info!("shutdown requested");
                        break;
                    }
                    SignalEvent::DumpSessions => {
                        info!(sessions = ?adapter.sessions().ids(), "live sessions");
                    }
                }
            }
        }
    }

    adapter.stop().await;
    drain_handle.await?;
    info!("shutdown complete");
    Ok(())
}

/// Stand-in consumer: logs every decoded block.
async fn drain(mut events: AdapterEvents) {
    let mut up_open = true;
    let mut down_open = true;
    while up_open || down_open {
        tokio::select! {
            handle = events.session_up.recv(), if up_open => match handle {
                Some(handle) => {
                    let id = handle.id();
                    info!(session = id, "session up");
                    if let Some(blocks) = handle.subscribe_ingress() {
                        tokio::spawn(log_blocks(id, "ingress", blocks));
                    }
                    if let Some(blocks) = handle.subscribe_egress() {
                        tokio::spawn(log_blocks(id, "egress", blocks));
                    }
                }
                None => up_open = false,
            },
            id = events.session_down.recv(), if down_open => match id {
                Some(id) => info!(session = id, "session down"),
                None => down_open = false,
            },
        }
    }
}

async fn log_blocks(id: u32, direction: &'static str, mut blocks: mpsc::Receiver<ProtocolBlock>) {
    while let Some(block) = blocks.recv().await {
        match &block.body {
            Body::Raw(data) => trace!(
                session = id,
                direction,
                opcode = block.opcode,
                len = data.len(),
                "raw block"
            ),
            body => debug!(session = id, direction, opcode = block.opcode, ?body, "block"),
        }
    }
    debug!(session = id, direction, "block stream ended");
}
