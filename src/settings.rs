use super::*;

pub(crate) const DEFAULT_DONATE_ADDR: &str = "donate.xmrwasp.com:3333";

const DONATE_CYCLE: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct Settings {
    pool_addr: String,
    pool_login: String,
    pool_password: String,
    address: String,
    stratum_port: u16,
    stat_interval: Duration,
    donate_level: u64,
    donate_addr: String,
    donate_cycle: Duration,
    share_validation: ValidationLevel,
    retry_delay: Duration,
}

impl Settings {
    pub fn load(options: Options) -> Result<Self> {
        let settings = Self {
            pool_addr: options.pool,
            pool_login: options.login,
            pool_password: options.pass,
            address: options.address.unwrap_or_else(|| "0.0.0.0".into()),
            stratum_port: options.stratum_port.unwrap_or(1111),
            stat_interval: Duration::from_secs(options.stat_interval.unwrap_or(60)),
            donate_level: options.donate_level.unwrap_or(2).max(1),
            donate_addr: options
                .donate_addr
                .unwrap_or_else(|| DEFAULT_DONATE_ADDR.into()),
            donate_cycle: options
                .donate_cycle
                .map(Duration::from_secs)
                .unwrap_or(DONATE_CYCLE),
            share_validation: ValidationLevel::from(options.share_validation.unwrap_or(0)),
            retry_delay: Duration::from_secs(options.retry_delay.unwrap_or(10).clamp(10, 60)),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.pool_addr.contains(':'),
            "pool address `{}` must be host:port",
            self.pool_addr
        );

        ensure!(!self.pool_login.is_empty(), "pool login must not be empty");

        ensure!(
            self.donate_level <= 100,
            "donate level ({}) must be at most 100 percent",
            self.donate_level
        );

        ensure!(
            self.stat_interval >= Duration::from_secs(1),
            "stat interval must be at least one second"
        );

        ensure!(
            self.donate_cycle >= Duration::from_secs(2),
            "donation cycle must be at least two seconds"
        );

        Ok(())
    }

    pub fn pool_addr(&self) -> &str {
        &self.pool_addr
    }

    pub fn pool_login(&self) -> &str {
        &self.pool_login
    }

    pub fn pool_password(&self) -> &str {
        &self.pool_password
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stratum_port(&self) -> u16 {
        self.stratum_port
    }

    pub fn stat_interval(&self) -> Duration {
        self.stat_interval
    }

    pub fn donate_addr(&self) -> &str {
        &self.donate_addr
    }

    /// Seconds of each cycle spent mining for the donation pool,
    /// `floor(cycle * level / 100)`.
    pub fn donate_length(&self) -> Duration {
        Duration::from_secs(self.donate_cycle.as_secs() * self.donate_level / 100)
    }

    /// Seconds of each cycle spent mining for the primary pool.
    pub fn donate_interval(&self) -> Duration {
        self.donate_cycle - self.donate_length()
    }

    pub fn share_validation(&self) -> ValidationLevel {
        self.share_validation
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}
