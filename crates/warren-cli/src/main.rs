// Warren demo CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Drive the in-memory connection so the full dispatch
// lifecycle (crashes, failures, redelivery, drain) runs without a broker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warren::prelude::*;

#[derive(Parser)]
#[command(name = "warren")]
#[command(about = "Run a demo dispatcher against an in-memory queue")]
#[command(version)]
struct Cli {
    /// Queue name to consume from
    #[arg(long, default_value = "jobs")]
    queue: String,

    /// Number of messages to publish
    #[arg(long, short = 'n', default_value = "50")]
    messages: u64,

    /// Worker pool size
    #[arg(long, short, default_value = "4")]
    workers: usize,

    /// Broker prefetch window (0 = unlimited)
    #[arg(long, default_value = "10")]
    prefetch: u16,

    /// Simulated handler latency in milliseconds
    #[arg(long, default_value = "20")]
    latency_ms: u64,

    /// Reject every Nth message (0 = never)
    #[arg(long, default_value = "0")]
    fail_every: u64,

    /// Panic the worker on every Nth message (0 = never)
    #[arg(long, default_value = "0")]
    crash_every: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warren=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let conn = Arc::new(InMemoryConnection::new());
    for i in 1..=cli.messages {
        conn.publish(format!("job-{i}").into_bytes());
    }
    tracing::info!(count = cli.messages, queue = %cli.queue, "Published demo messages");

    let latency = Duration::from_millis(cli.latency_ms);
    let fail_every = cli.fail_every;
    let crash_every = cli.crash_every;
    let attempts = Arc::new(AtomicU64::new(0));

    let handler = {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |envelope: Envelope| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(latency).await;
                // Redeliveries count as fresh attempts, so a crashing
                // message succeeds the second time around.
                if crash_every > 0 && attempt % crash_every == 0 && !envelope.redelivered {
                    panic!("simulated crash on attempt {attempt}");
                }
                if fail_every > 0 && attempt % fail_every == 0 {
                    return HandlerOutcome::failed(format!("simulated failure on attempt {attempt}"));
                }
                HandlerOutcome::Done
            }
        })
    };

    let config = DispatcherConfig::new(vec![cli.queue.clone()])
        .with_num_workers(cli.workers)
        .with_prefetch(cli.prefetch);
    let mut dispatcher = Dispatcher::new(Arc::clone(&conn) as _, handler, config);

    // Stop once every published message is settled: processed, or
    // rejected and dropped under the default no-requeue failure policy.
    let total = cli.messages;
    let settled = Arc::new(AtomicU64::new(0));

    {
        let settled = Arc::clone(&settled);
        dispatcher.on(EventKind::Processed, move |event, ctx| {
            if let DispatcherEvent::Processed {
                worker_id,
                delivery_tag,
                redelivered,
                ..
            } = event
            {
                println!("[processed] worker={worker_id} tag={delivery_tag} redelivered={redelivered}");
            }
            if settled.fetch_add(1, Ordering::SeqCst) + 1 >= total {
                ctx.shutdown();
            }
        });
    }
    {
        let settled = Arc::clone(&settled);
        dispatcher.on(EventKind::Error, move |event, ctx| {
            if let DispatcherEvent::Error { reason, fatal, .. } = event {
                println!("[error] fatal={fatal} {reason}");
                if reason.contains("handler failed")
                    && settled.fetch_add(1, Ordering::SeqCst) + 1 >= total
                {
                    ctx.shutdown();
                }
            }
        });
    }
    dispatcher.on(EventKind::WorkerExit, |event, ctx| {
        if let DispatcherEvent::WorkerExit {
            worker_id,
            crashed,
            requeued,
            ..
        } = event
        {
            println!(
                "[workerExit] worker={worker_id} crashed={crashed} requeued={requeued} live={}",
                ctx.count_workers()
            );
        }
    });
    dispatcher.on(EventKind::Shutdown, |event, _| {
        if let DispatcherEvent::Shutdown { stats, .. } = event {
            println!("[shutdown] final stats:");
            println!("  consumed            {}", stats.consumed);
            println!("  processed           {}", stats.processed);
            println!("  peak_num_workers    {}", stats.peak_num_workers);
            println!("  peak_num_cached     {}", stats.peak_num_cached);
            println!("  max_message_length  {}", stats.max_message_length);
        }
    });

    for signal in [Signal::Interrupt, Signal::Terminate] {
        dispatcher.add_signal_handler(signal, |signal, control| {
            println!("[signal] {signal} received, draining");
            control.shutdown();
        });
    }

    let stats = dispatcher.run().await?;
    tracing::info!(
        processed = stats.processed,
        consumed = stats.consumed,
        "Demo run complete"
    );
    Ok(())
}
