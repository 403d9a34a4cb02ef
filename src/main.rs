use anyhow::Result;
use clap::Parser;
use sipedge::admin::{self, AdminState};
use sipedge::billing::{Ledger, MemoryLedger};
use sipedge::callcontrol::{CallControl, CallControlOptions};
use sipedge::config::{Cli, Config, LocationStoreConfig};
use sipedge::firewall::Firewall;
use sipedge::location::{Locator, MemoryLocator, RedisLocator};
use sipedge::proxy::SipServerBuilder;
use sipedge::routing::RoutingEngine;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match cli.conf {
        Some(ref path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config {}: {:#}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Err(e) = config.apply_env() {
        eprintln!("invalid environment configuration: {:#}", e);
        std::process::exit(1);
    }

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }
    let mut _log_guard = None;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _log_guard = Some(guard);
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    if let Err(e) = run(config).await {
        error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let metrics = sipedge::metrics::install_recorder()?;
    let cancel_token = CancellationToken::new();

    let locator: Arc<dyn Locator> = match config.location_store {
        LocationStoreConfig::Memory => Arc::new(MemoryLocator::new()),
        LocationStoreConfig::Redis { ref url } => Arc::new(RedisLocator::connect(url).await?),
    };
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    let firewall = Arc::new(Firewall::new(config.fw_threshold));
    let (call_control, terminations) = CallControl::new(
        ledger.clone(),
        CallControlOptions::from(&config),
        cancel_token.child_token(),
    );
    let routing = Arc::new(RoutingEngine::new(locator, ledger.clone(), &config));

    let admin_addr = SocketAddr::new(config.addr.parse()?, config.admin_port);
    let config = Arc::new(config);

    let server = SipServerBuilder::new(config.clone())
        .with_cancel_token(cancel_token.clone())
        .with_routing(routing)
        .with_firewall(firewall.clone())
        .with_call_control(call_control.clone(), terminations)
        .build()
        .await?;

    let admin_state = AdminState {
        call_control,
        ledger,
        firewall,
        metrics,
    };

    info!(
        "starting sipedge, SIP on {}:{} ({:?}), admin on {}",
        config.addr, config.sip_port, config.sip_protocol, admin_addr
    );

    select! {
        result = server.serve() => result?,
        result = admin::serve(admin_addr, admin_state, cancel_token.child_token()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            cancel_token.cancel();
            // drain in-flight handlers before the store connection drops
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
    Ok(())
}
