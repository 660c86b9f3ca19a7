use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use voltlink_stream::feed::DEFAULT_GIVE_UP_BACKOFF;
use voltlink_stream::{
    Config, FieldSet, SessionSettings, StreamFeed, StreamField, StreamRecord, StreamSession,
};

use super::Services;

fn parse_fields(names: &[String]) -> Result<FieldSet> {
    if names.is_empty() {
        return Ok(FieldSet::default());
    }
    let fields = names
        .iter()
        .map(|name| {
            StreamField::from_wire_name(name.trim())
                .with_context(|| format!("Unknown stream field: {name}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(FieldSet::new(fields))
}

fn format_record(record: &StreamRecord) -> String {
    let when = record
        .observed_at()
        .map_or_else(|| record.timestamp().to_string(), |t| t.to_rfc3339());
    let values = record
        .fields()
        .map(|(field, value)| {
            if field == StreamField::Speed {
                format!("{field}={}", record.speed())
            } else {
                format!("{field}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    format!("{when} {values}")
}

/// Stream telemetry until `count` records arrive or Ctrl-C is pressed.
pub async fn run_stream(
    config: &Config,
    count: Option<usize>,
    fields: &[String],
    json: bool,
) -> Result<()> {
    let services = Services::from_config(config)?;
    let session = StreamSession::new(
        config.vehicle_id()?,
        &config.stream_url,
        Arc::clone(&services.transport),
        Arc::new(services.authenticator(config)?),
        Arc::clone(&services.limiter),
    )
    .with_fields(parse_fields(fields)?)
    .with_settings(SessionSettings::from_config(config));

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, closing stream");
            interrupt.cancel();
        }
    });

    let mut feed = StreamFeed::spawn(session, DEFAULT_GIVE_UP_BACKOFF, &shutdown);
    let mut received = 0;

    while let Some(record) = feed.recv().await {
        if json {
            println!("{}", serde_json::to_string(&record)?);
        } else {
            println!("{}", format_record(&record));
        }
        received += 1;
        if count.is_some_and(|limit| received >= limit) {
            break;
        }
    }

    feed.shutdown().await;
    log::info!("Received {} records", received);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fields() {
        let fields = parse_fields(&["speed".to_string(), " soc".to_string()]).unwrap();
        assert_eq!(
            fields.fields(),
            &[StreamField::Timestamp, StreamField::Speed, StreamField::Soc]
        );
        assert!(parse_fields(&["warp".to_string()]).is_err());
        assert_eq!(parse_fields(&[]).unwrap(), FieldSet::default());
    }

    #[test]
    fn test_format_record() {
        let fields = FieldSet::new([StreamField::Speed, StreamField::Soc]);
        let record = fields.decode("1388534400000,,80").unwrap();
        assert_eq!(
            format_record(&record),
            "2014-01-01T00:00:00+00:00 speed=0 soc=80"
        );
    }
}
