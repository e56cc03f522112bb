use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// In debug builds our crate logs at debug level, everything else at info.
/// `RUST_LOG` overrides both. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("eddie_sync=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    // Embedders may have installed their own subscriber already
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn fmt_ms(d: std::time::Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        "<1ms".into()
    } else {
        format!("{}ms", ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fmt_ms() {
        assert_eq!(fmt_ms(Duration::from_micros(300)), "<1ms");
        assert_eq!(fmt_ms(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
    }
}
