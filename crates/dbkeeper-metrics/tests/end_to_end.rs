//! Full request path against a real TCP endpoint: acquire, consult the
//! cache, execute, report to the analyzer and monitor, release. The monitor
//! and health checker run on their own schedules alongside the traffic.
//!
//! The stack: handlers → `ConnectionPool` → `TcpConnectionFactory` → TCP → echo server

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dbkeeper_analyzer::{QueryExecution, QueryOptimizer};
use dbkeeper_cache::QueryCache;
use dbkeeper_core::DbKeeperConfig;
use dbkeeper_health::{HealthChecker, HealthStatus};
use dbkeeper_metrics::DatabaseMonitor;
use dbkeeper_pool::{ConnectionPool, TcpConnectionFactory};
use serde_json::{Value, json};

fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
    let addr = listener.local_addr().expect("local addr");
    std::thread::spawn(move || {
        while let Ok((mut stream, _)) = listener.accept() {
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

struct Stack {
    pool: ConnectionPool,
    cache: Arc<QueryCache>,
    optimizer: Arc<QueryOptimizer>,
    monitor: Arc<DatabaseMonitor>,
    health: Arc<HealthChecker>,
}

async fn build_stack(addr: SocketAddr) -> Stack {
    let mut config = DbKeeperConfig::default();
    config.pool.min_connections = 2;
    config.pool.max_connections = 4;
    config.pool.acquire_timeout_ms = 2_000;
    config.pool.health_check_interval_ms = 50;
    config.optimizer.slow_query_threshold_ms = 20.0;
    config.validate().unwrap();

    let factory = TcpConnectionFactory::new(
        addr.to_string(),
        Duration::from_secs(2),
        Duration::from_secs(2),
    );
    let pool = ConnectionPool::new(config.pool.clone(), Arc::new(factory));
    pool.initialize().await.unwrap();

    let cache = Arc::new(QueryCache::new(config.cache.clone()).unwrap());
    let optimizer = Arc::new(QueryOptimizer::new(config.optimizer.clone()).unwrap());
    let monitor = Arc::new(DatabaseMonitor::new(
        config.monitor.clone(),
        pool.clone(),
        Arc::clone(&cache),
        Arc::clone(&optimizer),
    ));
    let health = Arc::new(HealthChecker::new(config.health.clone(), pool.clone()));

    Stack {
        pool,
        cache,
        optimizer,
        monitor,
        health,
    }
}

/// One application request: cache lookup, else execute through the pool.
async fn run_query(stack: &Stack, sql: &str, params: &[Value], simulated: Duration) -> Value {
    if let Some(hit) = stack.cache.get(sql, params) {
        stack.monitor.record_query_latency(Duration::from_micros(10));
        return hit;
    }

    let handle = stack.pool.acquire().await.unwrap();
    let started = Instant::now();
    stack.pool.send(handle, sql.as_bytes()).await.unwrap();
    let echoed = stack.pool.recv(handle, 4096).await.unwrap();
    tokio::time::sleep(simulated).await;
    let elapsed = started.elapsed();

    stack.pool.record_query(handle, elapsed).await.unwrap();
    stack.monitor.record_query_latency(elapsed);
    stack.optimizer.analyze_query(
        &QueryExecution::new(sql, elapsed)
            .rows(1, 1)
            .with_index("pkey"),
    );
    stack.pool.release(handle).await.unwrap();

    let result = json!({ "echo": String::from_utf8_lossy(&echoed) });
    stack.cache.set(sql, params, result.clone(), None);
    result
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn request_path_feeds_every_component() {
    let stack = Arc::new(build_stack(start_echo_server()).await);
    stack.monitor.start(Duration::from_millis(40)).await;
    stack.health.start_periodic_check(Duration::from_millis(40)).await;

    let mut tasks = Vec::new();
    for i in 0..12 {
        let stack = Arc::clone(&stack);
        tasks.push(tokio::spawn(async move {
            let user = i % 3;
            run_query(
                &stack,
                &format!("SELECT name FROM users WHERE id = {user}"),
                &[json!(user)],
                Duration::from_millis(2),
            )
            .await
        }));
    }
    for task in tasks {
        let value = task.await.unwrap();
        assert!(value["echo"].as_str().unwrap().starts_with("SELECT name FROM users"));
    }

    // A slow statement shape for the analyzer.
    for id in [10, 11] {
        run_query(
            &stack,
            &format!("SELECT * FROM orders WHERE customer_id = {id}"),
            &[],
            Duration::from_millis(40),
        )
        .await;
    }

    // Writes bypass the cache.
    run_query(&stack, "UPDATE users SET name = 'x' WHERE id = 1", &[], Duration::ZERO).await;
    assert!(!stack.cache.is_cacheable("UPDATE users SET name = 'x' WHERE id = 1"));
    assert_eq!(stack.cache.invalidate_table("users"), 3);

    tokio::time::sleep(Duration::from_millis(120)).await;
    stack.monitor.stop().await;
    stack.health.stop_periodic_check().await;

    // Pool: bounded and fully released.
    let pool = stack.pool.stats().await;
    assert!(pool.total <= 4);
    assert_eq!(pool.busy, 0);
    assert_eq!(pool.waiting, 0);
    assert!(pool.total_queries >= 6, "at least one miss per shape + params");

    // Cache: three users were looked up repeatedly.
    let cache = stack.cache.stats();
    assert!(cache.hits + cache.misses >= 15);
    assert!(cache.misses >= 3);

    // Analyzer: the orders shape is slow and indexable.
    let slow = stack.optimizer.slow_queries(5);
    assert_eq!(slow[0].shape, "SELECT * FROM orders WHERE customer_id = ?");
    assert_eq!(slow[0].execution_count, 2);
    let indexes = stack.optimizer.suggest_indexes();
    assert!(
        indexes
            .iter()
            .any(|s| s.statement == "CREATE INDEX idx_orders_customer_id ON orders (customer_id)")
    );
    let frequent = stack.optimizer.most_frequent_queries(1);
    assert_eq!(frequent[0].shape, "SELECT name FROM users WHERE id = ?");

    // Monitor: the periodic loop produced snapshots.
    let history = stack.monitor.history();
    assert!(!history.is_empty());
    assert!(history.iter().any(|s| s.slow_query_count >= 1));
    let report = stack.monitor.export_report().await;
    assert!(report.contains("SELECT * FROM orders WHERE customer_id = ?"));

    // Health: the periodic loop recorded a verdict and the pool is healthy.
    let last = stack.health.last_health().unwrap();
    assert_eq!(last.status, HealthStatus::Healthy);
    assert!(stack.health.is_healthy().await);

    stack.pool.shutdown().await;
    assert_eq!(stack.health.check().await.status, HealthStatus::Unhealthy);
}
