use crate::manager::common::format_duration;
use std::time::Duration;

/// Format a duration as a PBS walltime string, e.g. 01:05:02
pub fn format_pbs_duration(duration: &Duration) -> String {
    format_duration(duration)
}

pub fn parse_pbs_datetime(datetime: &str) -> anyhow::Result<chrono::NaiveDateTime> {
    Ok(chrono::NaiveDateTime::parse_from_str(
        datetime,
        "%a %b %d %H:%M:%S %Y",
    )?)
}

#[cfg(test)]
mod test {
    use crate::manager::pbs::parse_pbs_datetime;

    #[test]
    fn test_parse_pbs_datetime() {
        let date = parse_pbs_datetime("Thu Aug 19 13:05:17 2021").unwrap();
        assert_eq!(
            date.format("%d.%m.%Y %H:%M:%S").to_string(),
            "19.08.2021 13:05:17"
        );
    }
}
