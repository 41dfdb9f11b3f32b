use clap::Parser;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use vantiq_sdk_rs::{Config, Error, Result, SubscribeTarget, Vantiq};

/// Simple program to exercise the Vantiq API: authenticate, query, publish
/// to a reliable topic and acknowledge what arrives.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The URL of the Vantiq server (e.g., https://dev.vantiq.com).
    /// Falls back to VANTIQ_SERVER.
    #[arg(short, long)]
    url: Option<String>,

    /// Username for password authentication
    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// An access token issued by the server, used instead of a password
    #[arg(long, conflicts_with = "username")]
    token: Option<String>,

    /// Reliable topic to subscribe and publish to
    #[arg(long, default_value = "/demo/reliable")]
    topic: String,

    /// Resource to select from
    #[arg(long, default_value = "types")]
    resource: String,

    /// Seconds to wait for events
    #[arg(long, default_value_t = 10)]
    wait: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.url {
        Some(url) => Config::new(url).timeout(Duration::from_secs(30)),
        None => Config::from_env()
            .ok_or_else(|| Error::Validation("Provide --url or set VANTIQ_SERVER".into()))?,
    };
    let server = config.server.clone();
    let mut vantiq = Vantiq::with_config(config)?;
    match (&args.username, &args.password, &args.token) {
        (Some(username), Some(password), _) => {
            vantiq.authenticate(username, password).await?;
        }
        (_, _, Some(token)) => vantiq.set_access_token(Some(token.clone())),
        _ => {
            eprintln!("Provide --username/--password or --token");
            return Ok(());
        }
    }
    println!("Authenticated against {}.", server);

    let count = vantiq.count(&args.resource, None).await?;
    let records = vantiq.select(&args.resource, &["name"], None, Some(&json!({"name": 1}))).await?;
    println!("{} has {} records:", args.resource, count);
    for record in records.iter().take(10) {
        println!("  {}", record["name"]);
    }

    vantiq.on(|event| println!("Subscriber: {}", event));

    let (tx, mut rx) = mpsc::unbounded_channel();
    vantiq
        .subscribe(SubscribeTarget::reliable_topic(args.topic.as_str(), None), move |event| {
            let _ = tx.send(event);
        })
        .await?;
    println!("Subscribed to {}.", args.topic);

    vantiq
        .publish("topics", &args.topic, &json!({"message": "hello from Rust"}))
        .await?;

    let deadline = tokio::time::sleep(Duration::from_secs(args.wait));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                println!("Event [{}]: {}", event.status, event.body);
                // status 100 marks a delivery; anything else is a subscribe confirmation
                if event.status != 100 {
                    continue;
                }
                if let (Some(name), Some(request_id)) = (event.subscription_name(), event.request_id()) {
                    vantiq.acknowledge(name, request_id, &event.body).await?;
                    println!("Acknowledged sequence {:?}.", event.sequence_id());
                }
            }
        }
    }

    vantiq.unsubscribe_all().await;
    Ok(())
}
