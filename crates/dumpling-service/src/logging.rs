use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::registry::LookupSpan;

/// Formats events as JSON lines, one object per event with the current span list attached.
///
/// Events are flattened so that structured fields such as `digest` or `dump_id` end up as
/// top-level keys, which keeps them queryable in log aggregation.
pub fn json_layer<S, W>(make_writer: W) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
}

/// Default filter directives for a given verbosity.
///
/// The binary parsers we depend on are noisy about malformed input, which is expected here since
/// every upload is probed against several formats.
pub fn default_filter(level: tracing::level_filters::LevelFilter) -> String {
    use tracing::level_filters::LevelFilter;

    match level {
        LevelFilter::OFF => String::new(),
        LevelFilter::ERROR => "ERROR".to_owned(),
        LevelFilter::WARN => "WARN,goblin=ERROR,minidump=ERROR".to_owned(),
        LevelFilter::INFO => "INFO,goblin=ERROR,minidump=ERROR,aws_config=WARN".to_owned(),
        level => format!(
            "INFO,aws_config=WARN,dumpling={level},dumpling_service={level}",
            level = level.to_string().to_lowercase()
        ),
    }
}
