use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use requeue::prelude::*;
use requeue_redis::RedisBackend;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1";
const REDIS_URL: &str = "REDIS_URL";

#[tokio::main]
pub async fn main() {
    let url = std::env::var(REDIS_URL).unwrap_or_else(|_| DEFAULT_REDIS_URL.to_owned());
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let backend = RedisBackend::from_url(&url, RedisBackend::DEFAULT_NAMESPACE)
        .await
        .unwrap();
    let client = Client::new(backend);

    let greet = client.register(GreetJob).unwrap();
    let flaky = client.register(FlakyJob::default()).unwrap();
    let tick = client.register(TickJob).unwrap();

    let job = greet
        .schedule(0, Utc::now(), "world".to_owned())
        .await
        .unwrap();
    println!("scheduled greet job {}", job.id());

    let job = greet
        .build()
        .with_priority(100)
        .run_in(TimeDelta::seconds(2))
        .schedule("again, urgently".to_owned())
        .await
        .unwrap();
    println!("scheduled delayed greet job {}", job.id());

    let job = flaky.schedule(0, Utc::now(), ()).await.unwrap();
    println!("scheduled flaky job {}", job.id());

    let job = tick
        .schedule_recurring(0, Utc::now(), TimeDelta::seconds(1), ())
        .await
        .unwrap();
    println!("scheduled recurring tick job {}", job.id());

    let pool = client.pool(PoolConfig {
        min_wait: Duration::from_millis(100),
        ..Default::default()
    });
    pool.start().unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    // The recurring job would otherwise run forever.
    job.cancel().await.unwrap();
    pool.close();
    pool.wait().await.unwrap();
}

struct GreetJob;

#[async_trait]
impl JobType for GreetJob {
    type Data = String;
    const NAME: &'static str = "greet";

    async fn perform(&self, name: String) -> Result<(), HandlerError> {
        println!("hello, {name}");
        Ok(())
    }
}

#[derive(Default)]
struct FlakyJob {
    attempts: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl JobType for FlakyJob {
    type Data = ();
    const NAME: &'static str = "flaky";
    const RETRIES: u32 = 3;

    async fn perform(&self, _data: ()) -> Result<(), HandlerError> {
        // Fails its first run; the pool retries it.
        if self
            .attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            == 0
        {
            return Err("not this time".into());
        }
        println!("flaky job made it through");
        Ok(())
    }
}

struct TickJob;

#[async_trait]
impl JobType for TickJob {
    type Data = ();
    const NAME: &'static str = "tick";

    async fn perform(&self, _data: ()) -> Result<(), HandlerError> {
        println!("tick at {}", Utc::now());
        Ok(())
    }
}
