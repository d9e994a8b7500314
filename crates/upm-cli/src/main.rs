use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use upm_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use upm_core::error::{AppError, ErrorCode, classify};
use upm_core::retry::{RetryConfig, RetryExecutor};

#[derive(Parser)]
#[command(name = "upm", version, about = "Error handling, retries and circuit breaking for UPM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk through error construction, wrapping, retrying and circuit breaking
    Demo,

    /// Run a flaky operation under the retry executor
    Retry {
        /// Number of leading attempts that fail with NETWORK_ERROR
        #[arg(long, default_value_t = 2)]
        fail_times: u32,

        /// Maximum number of attempts
        #[arg(long, env = "UPM_RETRY_MAX_ATTEMPTS", default_value_t = 3)]
        max_attempts: u32,

        /// Delay before the first retry, in milliseconds
        #[arg(long, env = "UPM_RETRY_INITIAL_DELAY_MS", default_value_t = 100)]
        initial_delay_ms: u64,

        /// Seed for the jitter source (random if omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Cancel the whole run after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Drive a circuit breaker with an operation that fails, then recovers
    Breaker {
        /// Consecutive failures before the circuit opens
        #[arg(long, env = "UPM_BREAKER_THRESHOLD", default_value_t = 3)]
        threshold: u32,

        /// How long the circuit stays open, in milliseconds
        #[arg(long, env = "UPM_BREAKER_RESET_TIMEOUT_MS", default_value_t = 1000)]
        reset_timeout_ms: u64,

        /// Total number of requests to send
        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Number of leading requests whose operation fails
        #[arg(long, default_value_t = 4)]
        failures: u32,

        /// Pause between requests, in milliseconds
        #[arg(long, default_value_t = 300)]
        interval_ms: u64,
    },

    /// Classify a free-form failure message
    Classify {
        /// The failure message
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("upm=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo => cmd_demo().await?,
        Commands::Retry {
            fail_times,
            max_attempts,
            initial_delay_ms,
            seed,
            timeout_ms,
        } => {
            let config = RetryConfig::default()
                .with_max_attempts(max_attempts)
                .with_initial_delay(Duration::from_millis(initial_delay_ms));
            cmd_retry(config, fail_times, seed, timeout_ms.map(Duration::from_millis)).await?;
        }
        Commands::Breaker {
            threshold,
            reset_timeout_ms,
            requests,
            failures,
            interval_ms,
        } => {
            let config = CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_timeout_ms),
                ..Default::default()
            };
            cmd_breaker(config, requests, failures, Duration::from_millis(interval_ms)).await?;
        }
        Commands::Classify { message } => cmd_classify(&message),
    }

    Ok(())
}

async fn cmd_demo() -> Result<()> {
    println!("== Construction");
    let err = AppError::new(ErrorCode::NotFound, "user 42 not found")
        .add_metadata("user_id", 42)
        .add_metadata("tenant", "acme");
    println!("  {}", err.render());
    println!("  status: {}", err.http_status());
    println!(
        "  public: {}",
        serde_json::to_string(&err.public_view()).context("Failed to render error")?
    );

    println!("\n== Wrapping");
    let wrapped = AppError::wrap(
        AppError::wrap(err, ErrorCode::InternalError, "lookup failed"),
        ErrorCode::ServiceUnavailable,
        "profile service degraded",
    );
    println!("  {}", wrapped.render());
    println!("  extract_code: {}", wrapped.extract_code());
    println!("  matches NOT_FOUND: {}", wrapped.matches(&[ErrorCode::NotFound]));
    println!("  root cause: {}", wrapped.root_cause());

    println!("\n== Helpers");
    let helpers = [
        AppError::validation("email", "must contain '@'"),
        AppError::already_exists("service", "billing"),
        AppError::unauthorized("token expired"),
        AppError::timeout("fetch config", Duration::from_secs(5)),
        AppError::network("register", "10.0.0.7:8500", "connection refused"),
    ];
    for helper in &helpers {
        println!("  [{}] {}", helper.http_status(), helper.render());
    }
    if let Some(combined) = AppError::combine(helpers) {
        println!("  combined:\n{}", combined.message());
    }

    println!("\n== Retry");
    let config = RetryConfig::default()
        .with_max_attempts(4)
        .with_initial_delay(Duration::from_millis(50));
    cmd_retry(config, 2, Some(7), None).await?;

    println!("\n== Circuit breaker");
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_millis(200),
        half_open_max_attempts: 1,
    };
    cmd_breaker(config, 6, 3, Duration::from_millis(100)).await?;

    Ok(())
}

async fn cmd_retry(
    config: RetryConfig,
    fail_times: u32,
    seed: Option<u64>,
    timeout: Option<Duration>,
) -> Result<()> {
    config.validate()?;

    let mut executor = RetryExecutor::new(config);
    if let Some(seed) = seed {
        executor = executor.with_seed(seed);
    }

    let cancel = CancellationToken::new();
    if let Some(timeout) = timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        });
    }

    let calls = AtomicU32::new(0);
    let result = executor
        .run(&cancel, |attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tracing::info!(attempt, "Calling flaky operation");
                if attempt <= fail_times {
                    Err(AppError::new(
                        ErrorCode::NetworkError,
                        format!("connection reset on attempt {attempt}"),
                    ))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

    let calls = calls.load(Ordering::SeqCst);
    match result {
        Ok(attempt) => println!("  succeeded on attempt {attempt} ({calls} calls)"),
        Err(err) => println!("  gave up after {calls} calls: {}", err.render()),
    }

    Ok(())
}

async fn cmd_breaker(
    config: CircuitBreakerConfig,
    requests: u32,
    failures: u32,
    interval: Duration,
) -> Result<()> {
    config.validate()?;

    let breaker = CircuitBreaker::new("demo", config);
    let invoked = Arc::new(AtomicU32::new(0));

    for request in 1..=requests {
        let invoked = Arc::clone(&invoked);
        let result = breaker
            .execute(|| async move {
                let n = invoked.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(AppError::new(ErrorCode::ConnectionLost, "backend dropped the connection"))
                } else {
                    Ok(n)
                }
            })
            .await;

        let outcome = match result {
            Ok(n) => format!("ok (invocation {n})"),
            Err(err) => err.render(),
        };
        println!("  request {request:>2} [{:<9}] {outcome}", breaker.state().to_string());

        if request < requests {
            tokio::time::sleep(interval).await;
        }
    }

    let stats = breaker.stats();
    println!(
        "  final state: {} (failures: {}, invocations: {})",
        stats.state,
        stats.failure_count,
        invoked.load(Ordering::SeqCst)
    );

    Ok(())
}

fn cmd_classify(message: &str) {
    let code = classify(message);
    println!(
        "{code} (status {}, {})",
        code.http_status(),
        code.category()
    );
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_retry_arguments() {
        let cli = Cli::try_parse_from([
            "upm",
            "retry",
            "--fail-times",
            "3",
            "--max-attempts",
            "5",
            "--seed",
            "9",
        ])
        .unwrap();

        match cli.command {
            Commands::Retry {
                fail_times,
                max_attempts,
                seed,
                timeout_ms,
                ..
            } => {
                assert_eq!(fail_times, 3);
                assert_eq!(max_attempts, 5);
                assert_eq!(seed, Some(9));
                assert_eq!(timeout_ms, None);
            }
            _ => panic!("expected retry subcommand"),
        }
    }

    #[test]
    fn test_classify_requires_message() {
        assert!(Cli::try_parse_from(["upm", "classify"]).is_err());
    }

    #[tokio::test]
    async fn test_breaker_command_runs() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(5),
            half_open_max_attempts: 1,
        };
        cmd_breaker(config, 4, 2, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retry_command_rejects_zero_attempts() {
        let config = RetryConfig::default().with_max_attempts(0);
        assert!(cmd_retry(config, 0, Some(1), None).await.is_err());
    }
}
