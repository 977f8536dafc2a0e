use {
    super::*,
    clap::builder::styling::{AnsiColor, Effects, Styles},
};

#[derive(Debug, Parser)]
#[command(
  version,
  styles = Styles::styled()
    .error(AnsiColor::Red.on_default() | Effects::BOLD)
    .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .invalid(AnsiColor::Red.on_default())
    .literal(AnsiColor::Blue.on_default())
    .placeholder(AnsiColor::Cyan.on_default())
    .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
    .valid(AnsiColor::Green.on_default()),
)]
pub struct Arguments {
    #[command(flatten)]
    pub options: Options,
}

impl Arguments {
    pub async fn run(self, cancel_token: CancellationToken) -> Result {
        let settings = Arc::new(Settings::load(self.options)?);

        info!("hornet v{VERSION} - stratum fan-out proxy");
        info!(
            "Proxying workers to {} as {}",
            settings.pool_addr(),
            settings.pool_login()
        );
        info!(
            "Printing stats every {} seconds",
            settings.stat_interval().as_secs()
        );

        let director = Director::new(settings.clone());

        let stats_task = tokio::spawn(Director::run_stats(director.clone(), cancel_token.clone()));

        let listener = tcp::Listener::bind(&settings).await?;

        info!(
            "Accepting stratum TCP connections on {}",
            listener.local_addr()
        );

        let result = listener.serve(director, cancel_token).await;

        stats_task.abort();
        let _ = stats_task.await;

        result
    }
}
