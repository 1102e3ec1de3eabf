use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub trait TimeSource {
    /// Current wall-clock time as an RFC 3339 string.
    fn current_time(&self) -> String;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        let now = OffsetDateTime::now_utc();

        // Only fails for years outside 0..=9999.
        now.format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp().to_string())
    }
}
