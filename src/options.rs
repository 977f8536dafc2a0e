use super::*;

#[derive(Clone, Debug, Parser)]
pub struct Options {
    #[arg(long, help = "Connect to upstream pool at <POOL> (host:port).")]
    pub pool: String,

    #[arg(long, help = "Authenticate to the pool with <LOGIN> (wallet address).")]
    pub login: String,

    #[arg(long, help = "Authenticate to the pool with <PASS>.")]
    pub pass: String,

    #[arg(long, help = "Bind listeners to <ADDRESS>. [default: 0.0.0.0]")]
    pub address: Option<String>,

    #[arg(
        long,
        help = "Accept stratum TCP miners on <STRATUM_PORT>. [default: 1111]"
    )]
    pub stratum_port: Option<u16>,

    #[arg(
        long,
        help = "Log a statistics summary every <STAT_INTERVAL> seconds. [default: 60]"
    )]
    pub stat_interval: Option<u64>,

    #[arg(
        long,
        help = "Donate <DONATE_LEVEL> percent of each hour to the donation pool. [default: 2]"
    )]
    pub donate_level: Option<u64>,

    #[arg(
        long,
        help = "Share validation level: 0 dedup only, 1 adds format checks, \
                2 adds the experimental difficulty check, 3 reserved. [default: 0]"
    )]
    pub share_validation: Option<u8>,

    #[arg(
        long,
        help = "Wait <RETRY_DELAY> seconds between pool login attempts (10-60). [default: 10]"
    )]
    pub retry_delay: Option<u64>,

    #[arg(long, help = "Write logs to <LOG_FILE> instead of stderr.")]
    pub log_file: Option<PathBuf>,

    #[arg(long, help = "Send donation cycles to <DONATE_ADDR> instead of the default endpoint.")]
    pub donate_addr: Option<String>,

    #[arg(long, hide = true, help = "Override the donation cycle period in seconds.")]
    pub donate_cycle: Option<u64>,
}
