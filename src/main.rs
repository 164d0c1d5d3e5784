use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use cabinet::{
    cache::{KeyState, ReadOptions, ReadResult, SwrCache},
    config::{self, LogFormat, Settings},
    error::AppError,
    infra::{rest::RestSource, telemetry},
};
use serde_json::{Value, json};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Some(config::Command::Probe(args)) => run_probe(settings, *args).await,
        Some(config::Command::Config(_)) | None => print_settings(&settings),
    }
}

async fn run_probe(settings: Settings, args: config::ProbeArgs) -> Result<(), AppError> {
    let readers = args.readers;
    let rounds = args.rounds.max(1);

    let source = RestSource::new(&settings.backend)?;
    let cache: SwrCache<Value> = SwrCache::new(settings.cache.clone());
    let key = RestSource::cache_key(args.resource, args.query.as_deref());
    let fetches = Arc::new(AtomicUsize::new(0));

    info!(
        target = "cabinet::probe",
        cache_key = %key,
        readers,
        rounds,
        "Starting probe"
    );

    let _subscription = cache.subscribe(key.clone(), |key, change| {
        info!(
            target = "cabinet::probe",
            cache_key = %key,
            change = change.kind(),
            "cache changed"
        );
    });

    for round in 1..=rounds {
        let reads: Vec<ReadResult<Value>> = (0..readers)
            .map(|_| {
                let fetch = source.fetcher(args.resource, args.query.clone());
                let fetches = Arc::clone(&fetches);
                cache.read(
                    key.clone(),
                    move || {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        fetch()
                    },
                    ReadOptions::default(),
                )
            })
            .collect();

        let cached = reads.iter().filter(|read| read.value.is_some()).count();
        let stale = reads.iter().filter(|read| read.is_stale).count();
        let loading = reads.iter().filter(|read| read.is_loading).count();

        let settled = futures::future::join_all(reads.into_iter().map(ReadResult::settled)).await;
        let mut rows = None;
        for outcome in settled.into_iter().flatten() {
            rows = Some(row_count(outcome?.as_ref()));
        }

        println!(
            "round {round}: readers={readers} cached={cached} stale={stale} loading={loading} rows={} state={}",
            rows.map_or_else(|| "-".to_string(), |rows| rows.to_string()),
            state_label(cache.state(&key)),
        );

        if round < rounds && args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    println!(
        "key={key} fetches={} entries={}",
        fetches.load(Ordering::SeqCst),
        cache.len()
    );
    Ok(())
}

fn row_count(value: &Value) -> usize {
    value.as_array().map_or(1, Vec::len)
}

fn state_label(state: KeyState) -> &'static str {
    match state {
        KeyState::Absent => "absent",
        KeyState::Loading => "loading",
        KeyState::Fresh => "fresh",
        KeyState::Stale => "stale",
    }
}

fn print_settings(settings: &Settings) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(&settings_json(settings))
        .map_err(|err| AppError::unexpected(format!("failed to render settings: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn settings_json(settings: &Settings) -> Value {
    json!({
        "logging": {
            "level": settings.logging.level.to_string(),
            "json": matches!(settings.logging.format, LogFormat::Json),
        },
        "cache": {
            "enabled": settings.cache.enabled,
            "stale_after_ms": settings.cache.stale_after_ms,
            "max_entries": settings.cache.max_entries,
        },
        "backend": {
            "url": settings.backend.base_url.as_ref().map(|url| url.as_str()),
            "api_key": settings.backend.api_key.as_ref().map(|_| "<redacted>"),
            "timeout_ms": u64::try_from(settings.backend.timeout.as_millis()).unwrap_or(u64::MAX),
        },
    })
}
