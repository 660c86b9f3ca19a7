use anyhow::Result;
use voltlink_stream::Config;

/// Show the rate limits every outbound call is held to.
pub fn show_limits(config: &Config) -> Result<()> {
    let limiter = config.rate_limiter()?;

    println!("Rate Limits");
    println!("===========\n");

    for rule in limiter.rules() {
        println!("  at most {}", rule);
    }

    println!("\nCall log capacity: {}", config.call_log_capacity);
    println!("Throttle backoff:  {}s", config.throttle_backoff_secs);
    println!("\nEvery rule must hold before a request is sent; throttled calls wait, they are never dropped.");

    Ok(())
}
