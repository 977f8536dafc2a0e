use {
    anyhow::{anyhow, ensure, Context, Error},
    arguments::Arguments,
    clap::Parser,
    director::Director,
    futures::{sink::SinkExt, stream::StreamExt},
    job::{Job, SubJob},
    mining::StatusReply,
    options::Options,
    proxy::Proxy,
    serde::{Deserialize, Serialize},
    serde_json::{json, Value},
    settings::Settings,
    share::{Share, ShareError, ValidationLevel},
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        env,
        fmt::{self, Display, Formatter},
        io,
        net::SocketAddr,
        path::PathBuf,
        process,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex, Weak,
        },
        time::{Duration, Instant},
    },
    stratum::{Client, Notification, RpcError},
    tokio::{
        net::{TcpListener, TcpStream},
        runtime::Runtime,
        sync::{mpsc, oneshot, watch},
        task::JoinHandle,
        time::{sleep, timeout},
    },
    tokio_util::{
        codec::{FramedRead, FramedWrite, LinesCodec},
        sync::CancellationToken,
    },
    tracing::{debug, error, info, warn},
    tracing_appender::non_blocking,
    tracing_subscriber::EnvFilter,
    worker::Worker,
};

pub mod arguments;
pub mod director;
pub mod job;
pub mod mining;
pub mod options;
pub mod proxy;
pub mod settings;
mod signal;
pub mod share;
pub mod stratum;
pub mod tcp;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest accepted line on any stratum link, upstream or downstream.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

type Result<T = (), E = Error> = std::result::Result<T, E>;

fn logs_enabled() -> bool {
    env::var_os("RUST_LOG").is_some()
}

pub fn main() {
    let args = Arguments::parse();

    let (writer, _guard) = match args.options.log_file.as_deref() {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => non_blocking(file),
            Err(err) => {
                eprintln!("error: failed to open log file {}: {err}", path.display());
                process::exit(1);
            }
        },
        None => non_blocking(io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(if logs_enabled() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("info")
        })
        .with_target(false)
        .with_writer(writer)
        .init();

    Runtime::new()
        .expect("Failed to create tokio runtime")
        .block_on(async {
            let cancel_token = signal::setup_signal_handler();

            match args.run(cancel_token).await {
                Err(err) => {
                    error!("error: {err:#}");
                    process::exit(1);
                }
                Ok(_) => {
                    process::exit(0);
                }
            }
        });
}
