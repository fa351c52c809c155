// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! brokerloop - receive and publish broker messages
//!
//! # Usage
//!
//! ```bash
//! # Print every message published on the "test" fanout exchange
//! brokerloop recv --exchange test
//!
//! # Publish the current time
//! brokerloop publish --exchange test
//!
//! # Using a configuration file
//! brokerloop --config broker.toml recv
//! ```

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use brokerloop::{
    wait_for, BrokerConfig, ConsumeOptions, Dispatcher, ExchangeKind, FramedClient, LogicalContext,
    QueueOptions, Reactor, Scope, Session,
};
use chrono::Local;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Receive and publish broker messages
#[derive(Parser, Debug)]
#[command(name = "brokerloop")]
#[command(version)]
#[command(about = "Receive and publish broker messages from a single-threaded event loop")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker URL (overrides the configuration file)
    #[arg(long)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print messages published on an exchange until Ctrl+C
    Recv {
        /// Fanout exchange to listen on
        #[arg(short, long, default_value = "test")]
        exchange: String,

        /// Stop after this many messages (0 = unlimited)
        #[arg(short = 'n', long, default_value = "0")]
        count: u64,
    },

    /// Publish one message on an exchange
    Publish {
        /// Fanout exchange to publish on
        #[arg(short, long, default_value = "test")]
        exchange: String,

        /// Message body (default: current local time)
        message: Option<String>,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    if let Some(url) = &args.url {
        config.url = url.clone();
        config.validate()?;
    }

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match args.command {
        Commands::Recv { exchange, count } => cmd_recv(&config, &exchange, count),
        Commands::Publish { exchange, message } => cmd_publish(&config, &exchange, message),
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::Validate { config } => cmd_validate(config),
    }
}

/// Connect, open the virtual host and declare the fanout exchange.
fn open(config: &BrokerConfig, exchange: &str) -> Result<(Reactor, Rc<RefCell<Dispatcher>>)> {
    let reactor = Reactor::with_capacity(config.max_events)?;
    let client = FramedClient::connect(config)
        .with_context(|| format!("connecting to {}", config.url))?;
    let dispatcher = Dispatcher::attach(&reactor, Box::new(client))?;

    let stopper = reactor.clone();
    dispatcher.borrow_mut().set_close_hook(move |cause| {
        tracing::error!("broker connection lost: {}", cause);
        stopper.stop();
    });

    let vhost = config.broker_url()?.virtual_host;
    let opened = dispatcher
        .borrow_mut()
        .connect(&vhost, Scope::Detached, |_, _| Ok(()))?;
    wait_for(&reactor, &dispatcher, opened, config.connect_timeout())
        .context("opening connection")?;

    let declared = dispatcher.borrow_mut().declare_exchange(
        exchange,
        ExchangeKind::Fanout,
        Scope::Detached,
        |_, _| Ok(()),
    )?;
    wait_for(&reactor, &dispatcher, declared, config.connect_timeout())
        .with_context(|| format!("declaring exchange {}", exchange))?;

    tracing::info!("connected to {} (vhost {})", config.url, vhost);
    Ok((reactor, dispatcher))
}

fn cmd_recv(config: &BrokerConfig, exchange: &str, limit: u64) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let (reactor, dispatcher) = open(config, exchange)?;
    let session = Session::new();
    let received = Rc::new(Cell::new(0u64));

    // declare queue -> bind -> consume, each step from the previous callback
    let owner = Rc::clone(&session);
    let exchange_name = exchange.to_string();
    let counter = Rc::clone(&received);
    dispatcher.borrow_mut().declare_queue(
        QueueOptions::auto_delete(),
        session.scope(),
        move |ops, payload| {
            let queue = payload["queue"].as_str().unwrap_or_default().to_string();
            let bind_queue = queue.clone();
            let owner = Rc::clone(&owner);
            let counter = Rc::clone(&counter);
            let scope = owner.scope();
            ops.bind_queue(&bind_queue, &exchange_name, "", scope, move |ops, _| {
                tracing::info!("listening on queue {}", queue);
                let stop_owner = Rc::clone(&owner);
                let counter = Rc::clone(&counter);
                let options = ConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                };
                owner.subscribe(ops, &queue, options, move |ops, payload| {
                    print_message(&payload);
                    counter.set(counter.get() + 1);
                    if limit > 0 && counter.get() >= limit {
                        stop_owner.finish(ops)?;
                    }
                    Ok(())
                })?;
                Ok(())
            })?;
            Ok(())
        },
    )?;

    println!("Waiting for messages on '{}'. Press Ctrl+C to stop...", exchange);

    while running.load(Ordering::SeqCst) && session.is_alive() && !dispatcher.borrow().is_closed()
    {
        reactor.turn(Some(config.poll_timeout()))?;
        for e in dispatcher.borrow_mut().take_unhandled() {
            tracing::error!("{}", e);
        }
    }

    let lost = dispatcher
        .borrow()
        .connection()
        .close_reason()
        .map(str::to_string);

    // End of request: cancel the subscription and wait for the broker to agree
    if lost.is_none() {
        session.finish(&mut dispatcher.borrow_mut())?;
        let deadline = Instant::now() + config.connect_timeout();
        let settled = reactor.run_until(config.poll_timeout(), deadline, || {
            let d = dispatcher.borrow();
            d.is_closed() || d.pending_len() == 0
        })?;
        if !settled {
            tracing::warn!("subscription cancel not acknowledged before exit");
        }
        dispatcher.borrow_mut().shutdown("client exiting");
    }

    let stats = dispatcher.borrow().stats().clone();
    println!();
    println!("Received {} messages", received.get());
    tracing::debug!(
        "submitted={} delivered={} suppressed={} violations={}",
        stats.submitted,
        stats.delivered,
        stats.suppressed,
        stats.protocol_violations
    );

    if let Some(e) = session.take_error() {
        return Err(e).context("receive session ended by a broker error");
    }
    if let Some(reason) = lost {
        bail!("{}", reason);
    }
    Ok(())
}

fn cmd_publish(config: &BrokerConfig, exchange: &str, message: Option<String>) -> Result<()> {
    let (reactor, dispatcher) = open(config, exchange)?;
    let body = message.unwrap_or_else(|| Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string());

    let published = dispatcher.borrow_mut().publish(
        exchange,
        "",
        body.clone(),
        Scope::Detached,
        |_, _| Ok(()),
    )?;
    wait_for(&reactor, &dispatcher, published, config.connect_timeout())
        .with_context(|| format!("publishing on {}", exchange))?;

    println!("Published to '{}': {}", exchange, body);
    dispatcher.borrow_mut().shutdown("client exiting");
    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let rendered = BrokerConfig::default().to_toml()?;
    match output {
        Some(path) => {
            std::fs::write(&path, &rendered)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Generated configuration: {}", path.display());
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<()> {
    let config = BrokerConfig::from_file(&path)
        .with_context(|| format!("validating {}", path.display()))?;
    let url = config.broker_url()?;
    println!("Configuration is valid");
    println!("  Broker:       {}:{}", url.host, url.port);
    println!("  Virtual host: {}", url.virtual_host);
    println!("  Poll timeout: {:?}", Duration::from_millis(config.poll_timeout_ms));
    Ok(())
}

fn print_message(payload: &Value) {
    let timestamp = Local::now().format("%H:%M:%S%.3f");
    match payload.get("body").and_then(Value::as_str) {
        Some(body) => println!("[{}] {}", timestamp, body),
        None => println!("[{}] {}", timestamp, payload),
    }
}
