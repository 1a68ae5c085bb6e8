//! Connection pooling with metrics example.
//!
//! This example runs the pool against an in-process echo server, drives it
//! with concurrent requests and prints pool status and metrics along the way.
//!
//! # Running
//!
//! ```bash
//! cargo run -p netpool --example connection_pool
//!
//! # Or against a real echo service
//! export NETPOOL_TARGET="Host=127.0.0.1:7;Min Connections=2;Max Connections=4"
//! cargo run -p netpool --example connection_pool
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use netpool::{Client, Pool, PoolConfig, PoolError};
use netpool_testing::MockServer;
use tokio::time::Instant;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let (_server, config) = match std::env::var("NETPOOL_TARGET") {
        Ok(conn_str) => (None, PoolConfig::from_connection_string(&conn_str)?),
        Err(_) => {
            let server = MockServer::builder().build().await?;
            let config = PoolConfig::new()
                .host(server.host())
                .port(server.port())
                .min_connections(2)
                .max_connections(4);
            (Some(server), config)
        }
    };
    let config = config
        .idle_timeout(Duration::from_secs(2))
        .health_check_interval(Duration::from_secs(1));

    println!("=== Connection Pool with Metrics Example ===\n");

    println!("Pool configuration:");
    println!("  Target: {}:{}", config.host, config.port);
    println!("  Min connections: {}", config.min_connections);
    println!("  Max connections: {}", config.max_connections);
    println!("  Idle timeout: {:?}", config.idle_timeout);
    println!();

    let pool = Arc::new(Pool::new(config)?);
    pool.start().await?;

    println!("Pool started, waiting for minimum connections...\n");
    tokio::time::sleep(Duration::from_millis(200)).await;
    print_pool_status(&pool);

    // Example 1: Basic request/response
    println!("\n1. Basic request:");
    let client = Client::with_pool(Arc::clone(&pool));
    let reply = client.send_request(b"hello").await?;
    println!("  Reply: {}", String::from_utf8_lossy(&reply));

    // Example 2: Concurrent usage beyond max_connections
    println!("\n2. Concurrent pool usage (16 parallel requests):");
    let start = Instant::now();
    let mut handles = vec![];

    for i in 0..16 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let reply = client.send_request(format!("request {i}").as_bytes()).await?;
            Ok::<_, PoolError>(reply.len())
        }));
    }

    let mut completed = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            completed += 1;
        }
    }

    println!("  Completed {} requests in {:?}", completed, start.elapsed());
    print_pool_metrics(&pool);

    // Example 3: Hold connections to show queueing
    println!("\n3. Pool saturation:");
    let max = pool.config().max_connections;
    let mut held = Vec::with_capacity(max);
    for _ in 0..max {
        held.push(pool.acquire().await?);
    }
    print_pool_status(&pool);
    println!("  try_acquire while saturated: {:?}", pool.try_acquire().await?.map(|c| c.id()));
    drop(held);

    // Example 4: Idle connections are swept back down to the minimum
    println!("\n4. Waiting for the health sweep to trim idle connections...");
    tokio::time::sleep(Duration::from_secs(4)).await;
    print_pool_status(&pool);
    print_pool_metrics(&pool);

    // Graceful shutdown
    println!("\n5. Graceful shutdown:");
    pool.stop().await;
    print_pool_status(&pool);

    Ok(())
}

fn print_pool_status(pool: &Pool) {
    let status = pool.status();
    println!(
        "  Status: {} in use, {} idle, {} total of {} ({} waiting, {:.1}% utilization)",
        status.in_use,
        status.available,
        status.total,
        status.max,
        status.waiting,
        status.utilization()
    );
}

fn print_pool_metrics(pool: &Pool) {
    let metrics = pool.metrics();
    println!("  Metrics:");
    println!("    Connections created: {}", metrics.connections_created);
    println!("    Connections closed: {}", metrics.connections_closed);
    println!("    Connections failed: {}", metrics.connections_failed);
    println!("    Checkouts served: {}", metrics.checkouts_served);
    println!("    Waits queued: {}", metrics.waits_queued);
    println!(
        "    Health checks: {} performed, {} failed",
        metrics.health_checks, metrics.health_checks_failed
    );
}
