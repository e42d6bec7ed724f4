mod logging;
mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mt5bot_brokers_metatrader::{MetaTraderBroker, MetaTraderConfig};
use mt5bot_core::*;
use mt5bot_engine::{
    connect_with_retry, ExecutionConfig, ExecutionService, LiveTrader, MarketWatch, OrderPlanner,
    ReconnectPolicy, Scheduler, SessionWindow, TraderConfig,
};
use mt5bot_risk::{PositionGuard, PositionSizer};
use mt5bot_strategies::{ThreeBarConfig, ThreeBarStrategy};
use settings::{LogFormat, Settings};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const HEALTHY: &str = "Bot is healthy!";

#[derive(Parser)]
#[command(name = "mt5bot")]
#[command(about = "MetaTrader 5 trading bot: three-bar continuation on EMA200 and MACD")]
#[command(version)]
struct Cli {
    /// Settings file (TOML). Defaults to ./mt5bot.toml when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warning, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Console log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Directory for app.log
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live bot
    Run,

    /// Report whether the bot process can start
    Healthcheck {
        /// Also connect to the MT5 bridge and check the terminal
        #[arg(long)]
        probe: bool,
    },

    /// Print metadata of the configured symbol
    Symbol,

    /// Stream live quotes of the configured symbol
    Watch,

    /// Print the effective settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Healthcheck { probe: false } = cli.command {
        println!("{}", HEALTHY);
        return Ok(());
    }

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    if let Some(format) = cli.log_format {
        settings.log_format = format;
    }
    if let Some(dir) = cli.log_dir {
        settings.log_dir = dir;
    }

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&settings.redacted())?);
        if let Err(e) = settings.validate() {
            eprintln!("warning: {}", e);
        }
        return Ok(());
    }
    settings.validate()?;

    logging::init(&settings.log_level, settings.log_format, &settings.log_dir)?;

    match cli.command {
        Commands::Run => run(&settings).await,
        Commands::Healthcheck { .. } => {
            let message = healthcheck(&mut broker(&settings), &ReconnectPolicy::default()).await?;
            println!("{}", message);
            Ok(())
        }
        Commands::Symbol => print_symbol(&settings).await,
        Commands::Watch => watch_quotes(&settings).await,
        Commands::Config => Ok(()),
    }
}

fn broker(settings: &Settings) -> MetaTraderBroker {
    MetaTraderBroker::new(MetaTraderConfig {
        host: settings.bridge_host.clone(),
        port: settings.bridge_port,
        login: settings.account_user,
        password: settings.account_pass.clone(),
        server: settings.server.clone(),
        terminal_path: Some(settings.terminal_path.clone()),
        ..MetaTraderConfig::default()
    })
}

async fn run(settings: &Settings) -> Result<()> {
    let timeframe = settings.timeframe()?;
    let window = SessionWindow::new(
        settings.session_start_hour,
        settings.session_end_hour,
        settings.utc_offset_hours,
    );

    let strategy = ThreeBarStrategy::new(ThreeBarConfig {
        doji_ratio: settings.doji_ratio,
        ..ThreeBarConfig::new(&settings.symbol, timeframe)
    });
    let execution = ExecutionService::new(
        ExecutionConfig {
            nudge_policy: settings.nudge_mode,
            nudge_factor: settings.nudge_factor,
            deviation: settings.deviation,
            magic: settings.magic,
            ..ExecutionConfig::default()
        },
        PositionSizer::new(settings.risk_percentage),
    );
    let trader_config = TraderConfig {
        warmup_bars: settings.warmup_bars,
        bootstrap_bars: settings.bootstrap_bars,
        ..TraderConfig::new(&settings.symbol, timeframe)
    };

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let mut trader = LiveTrader::new(
        trader_config,
        broker(settings),
        strategy,
        OrderPlanner::new(settings.rr, settings.atr_sl_multiplier),
        execution,
        PositionGuard::with_freeze_hours(settings.freeze_hours),
    )
    .with_events(events_tx);

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            tracing::debug!(?event, "Event");
        }
    });

    let scheduler = Scheduler::new(
        window,
        timeframe,
        Duration::from_secs(settings.close_buffer_sec),
    )?;
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = stop_tx.send(true);
        }
    });

    drive(&mut trader, &scheduler, stop_rx).await
}

/// Bootstrap and run the trader until shutdown. The broker is disconnected
/// on every exit path, including a failed bootstrap.
async fn drive<B, S>(
    trader: &mut LiveTrader<B, S>,
    scheduler: &Scheduler,
    stop: watch::Receiver<bool>,
) -> Result<()>
where
    B: Broker,
    S: Strategy,
{
    let result = match trader.bootstrap().await {
        Ok(_) => scheduler.run(&mut *trader, stop).await.context("Scheduler stopped"),
        Err(e) => Err(anyhow::Error::new(e).context("Fatal during bootstrap")),
    };
    match (result, trader.shutdown().await) {
        (Err(e), Err(stop_err)) => {
            tracing::warn!("Shutdown after failure also failed: {}", stop_err);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), stop_result) => Ok(stop_result?),
    }
}

/// Connect, run one health check and disconnect.
async fn healthcheck<C>(conn: &mut C, policy: &ReconnectPolicy) -> Result<String>
where
    C: ConnectionManager + ?Sized,
{
    connect_with_retry(conn, policy).await?;
    let info = conn.health_check().await;
    conn.disconnect().await?;
    let info = info?;
    tracing::info!(
        terminal = %info.name,
        company = %info.company,
        build = info.build,
        trade_allowed = info.trade_allowed,
        "Terminal reachable"
    );
    Ok(HEALTHY.to_string())
}

async fn print_symbol(settings: &Settings) -> Result<()> {
    let mut broker = broker(settings);
    connect_with_retry(&mut broker, &ReconnectPolicy::default()).await?;
    broker.ensure_symbol(&settings.symbol).await?;
    let meta = broker.symbol_meta(&settings.symbol).await?;
    broker.disconnect().await?;

    println!("Symbol:        {}", meta.name);
    println!("Digits:        {}", meta.digits);
    println!("Tick size:     {}", meta.tick_size);
    println!("Tick value:    {}", meta.tick_value);
    println!("Lot step:      {}", meta.lot_step);
    println!("Min lot:       {}", meta.min_lot);
    println!("Max lot:       {}", meta.max_lot);
    println!("Contract size: {}", meta.contract_size);
    println!("Stops level:   {}", meta.stops_level);
    println!("Freeze level:  {}", meta.freeze_level);
    Ok(())
}

async fn watch_quotes(settings: &Settings) -> Result<()> {
    let mut broker = broker(settings);
    connect_with_retry(&mut broker, &ReconnectPolicy::default()).await?;
    broker.ensure_symbol(&settings.symbol).await?;

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(true);
        }
    });
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Event::MarketData(MarketDataEvent::Tick(tick)) = event {
                println!(
                    "{} {} bid={} ask={} spread={}",
                    tick.time.format("%H:%M:%S"),
                    tick.symbol,
                    tick.bid,
                    tick.ask,
                    tick.spread()
                );
            }
        }
    });

    let mut market_watch = MarketWatch::new(
        &settings.symbol,
        Duration::from_secs(settings.rate_polling_sec),
    );
    let result = market_watch.run(&mut broker, events_tx, stop_rx).await;
    broker.disconnect().await?;
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mt5bot_brokers_common::SimulatedBroker;

    fn fast() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 2,
        }
    }

    #[test]
    fn test_healthcheck_without_probe_needs_no_settings() {
        let cli = Cli::try_parse_from(["mt5bot", "healthcheck"]).unwrap();
        assert!(matches!(cli.command, Commands::Healthcheck { probe: false }));
    }

    #[tokio::test]
    async fn test_healthcheck_probe_reports_healthy() {
        let mut broker = SimulatedBroker::default();
        let message = healthcheck(&mut broker, &fast()).await.unwrap();
        assert_eq!(message, "Bot is healthy!");
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_healthcheck_probe_fails_without_trade_server() {
        let mut broker = SimulatedBroker::default();
        broker.set_trade_server_down(true);
        assert!(healthcheck(&mut broker, &fast()).await.is_err());
    }

    #[tokio::test]
    async fn test_healthcheck_probe_fails_when_unreachable() {
        let mut broker = SimulatedBroker::default();
        broker.fail_next_connects(5);
        assert!(healthcheck(&mut broker, &fast()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_bootstrap_still_disconnects() {
        use mt5bot_engine::NudgePolicy;
        use rust_decimal_macros::dec;

        // No symbol registered, so ensure_symbol fails after connecting
        let broker = SimulatedBroker::default();
        let config = TraderConfig {
            reconnect: fast(),
            ..TraderConfig::new("XAUUSD", Timeframe::Minute(5))
        };
        let execution = ExecutionService::new(
            ExecutionConfig {
                nudge_policy: NudgePolicy::Off,
                ..ExecutionConfig::default()
            },
            PositionSizer::new(dec!(0.01)),
        );
        let mut trader = LiveTrader::new(
            config,
            broker,
            ThreeBarStrategy::new(ThreeBarConfig::new("XAUUSD", Timeframe::Minute(5))),
            OrderPlanner::new(dec!(1.5), dec!(0)),
            execution,
            PositionGuard::default(),
        );
        let scheduler =
            Scheduler::new(SessionWindow::default(), Timeframe::Minute(5), Duration::from_secs(1))
                .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = drive(&mut trader, &scheduler, stop_rx).await.unwrap_err();
        assert!(err.to_string().contains("bootstrap"));
        assert_eq!(trader.broker().connect_attempts(), 1);
        assert!(!trader.broker().is_connected());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mt5bot",
            "run",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "--config",
            "bot.toml",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert_eq!(cli.config, Some(PathBuf::from("bot.toml")));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
