//! CLI for the broker
//!
//! Subcommands:
//! - `demo`: run a demonstration workload against an in-process broker and
//!   print the resulting metrics and dead letters as JSON

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::Parser;
use pubsub_broker::config::{Settings, load_config_from};
use pubsub_broker::utils::logging;
use pubsub_broker::{Broker, Delivery, HandlerError, SubscribeOptions};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pubsub-broker")]
enum Command {
    /// Publish a burst of messages to a healthy, a flaky and a broken subscriber
    Demo {
        /// Configuration file (defaults to config/default.* if present)
        #[arg(long)]
        config: Option<String>,
        /// Number of messages to publish
        #[arg(long, default_value_t = 50)]
        messages: u64,
        /// How long to let deliveries settle before shutting down, in ms
        #[arg(long, default_value_t = 2000)]
        settle_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cmd = Command::parse();

    match cmd {
        Command::Demo {
            config,
            messages,
            settle_ms,
        } => {
            let settings = match load_config_from(config.as_deref()) {
                Ok(settings) => settings,
                Err(e) => {
                    logging::init("info");
                    error!("Failed to load configuration: {}", e);
                    return;
                }
            };
            logging::init(&settings.logging.level);

            if let Err(e) = run_demo(settings, messages, Duration::from_millis(settle_ms)).await {
                error!("Demo failed: {}", e);
            }
        }
    }
}

async fn run_demo(
    settings: Settings,
    messages: u64,
    settle: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::new(settings.broker.to_broker_config());

    broker.subscribe(
        "orders.*",
        |delivery: Delivery| async move {
            info!(topic = %delivery.message.topic, payload = %delivery.message.payload, "audit");
            Ok::<(), HandlerError>(())
        },
        SubscribeOptions::new(),
    )?;

    // fails every third call, recovers on retry
    let calls = Arc::new(AtomicU64::new(0));
    broker.subscribe(
        "orders.created",
        move |_delivery: Delivery| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) % 3 == 0 {
                    Err::<(), HandlerError>("transient failure".into())
                } else {
                    Ok(())
                }
            }
        },
        SubscribeOptions::new().retry_backoff_base(Duration::from_millis(20)),
    )?;

    broker.subscribe(
        "*",
        |_delivery: Delivery| async move { Err::<(), HandlerError>("downstream unavailable".into()) },
        SubscribeOptions::new()
            .max_retries(1)
            .retry_backoff_base(Duration::from_millis(10))
            .failure_threshold(3),
    )?;

    for n in 0..messages {
        let topic = if n % 2 == 0 {
            "orders.created"
        } else {
            "orders.shipped"
        };
        broker.publish(topic, serde_json::json!({ "order": n }), HashMap::new())?;
    }
    info!(messages, "published");

    tokio::select! {
        _ = tokio::time::sleep(settle) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.close().await?;

    let summary: HashMap<String, usize> =
        broker
            .dead_letters()
            .iter()
            .fold(HashMap::new(), |mut acc, entry| {
                *acc.entry(entry.reason.to_string()).or_default() += 1;
                acc
            });
    let report = serde_json::json!({
        "metrics": broker.metrics(),
        "dead_letters_by_reason": summary,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
